use std::collections::HashSet;

use anyhow::Result;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};

use super::http::HttpPusher;
use super::{Sink, SinkError};
use crate::config::MetricsSinkConfig;
use crate::stats::{LockStat, QueryStat, StatKind, StatRow, TransactionStat};

const NAMESPACE: &str = "stats_collector";

/// Records rows as Prometheus measurements, tagged by each kind's key
/// dimension, and optionally pushes them to a destination URL.
///
/// Each kind exports only the series of its newest batch. Series whose label
/// did not appear in that batch are removed, so the views' rolling top-N
/// does not accumulate in the registry.
pub struct MetricsSink {
    query: QueryMeasures,
    transaction: TransactionMeasures,
    lock: LockMeasures,
    push: Option<HttpPusher>,
}

/// Label values currently exported for one kind.
#[derive(Default)]
struct LiveLabels(parking_lot::Mutex<HashSet<String>>);

impl LiveLabels {
    /// Replaces the live set with `current` and returns the labels that
    /// dropped out.
    fn replace(&self, current: HashSet<String>) -> Vec<String> {
        let mut live = self.0.lock();
        let stale = live.difference(&current).cloned().collect();
        *live = current;
        stale
    }
}

struct QueryMeasures {
    live: LiveLabels,
    interval_end: GaugeVec,
    execution_count: CounterVec,
    avg_latency_seconds: GaugeVec,
    avg_rows: GaugeVec,
    avg_bytes: GaugeVec,
    avg_rows_scanned: GaugeVec,
    avg_cpu_seconds: GaugeVec,
}

struct TransactionMeasures {
    live: LiveLabels,
    interval_end: GaugeVec,
    commit_attempt_count: GaugeVec,
    commit_failed_precondition_count: GaugeVec,
    commit_abort_count: GaugeVec,
    avg_participants: GaugeVec,
    avg_total_latency_seconds: GaugeVec,
    avg_commit_latency_seconds: GaugeVec,
    avg_bytes: GaugeVec,
}

struct LockMeasures {
    live: LiveLabels,
    interval_end: GaugeVec,
    lock_wait_seconds: GaugeVec,
}

/// Creates and registers a gauge family labelled by `label`.
fn gauge(registry: &Registry, name: &str, help: &str, label: &str) -> Result<GaugeVec> {
    let g = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), &[label])?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

fn counter(registry: &Registry, name: &str, help: &str, label: &str) -> Result<CounterVec> {
    let c = CounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &[label])?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

/// Drops one label's series from every family. A label that was never
/// recorded in a family is not an error.
fn remove_series(gauges: &[&GaugeVec], counters: &[&CounterVec], label: &str) {
    for g in gauges {
        let _ = g.remove_label_values(&[label]);
    }
    for c in counters {
        let _ = c.remove_label_values(&[label]);
    }
}

impl QueryMeasures {
    fn new(r: &Registry) -> Result<Self> {
        const L: &str = "fingerprint";
        Ok(Self {
            live: LiveLabels::default(),
            interval_end: gauge(
                r,
                "query_interval_end_seconds",
                "Interval end of the latest query sample.",
                L,
            )?,
            execution_count: counter(
                r,
                "query_execution_count_total",
                "Query executions across collected intervals.",
                L,
            )?,
            avg_latency_seconds: gauge(
                r,
                "query_avg_latency_seconds",
                "Average query latency.",
                L,
            )?,
            avg_rows: gauge(r, "query_avg_rows", "Average rows returned per query.", L)?,
            avg_bytes: gauge(r, "query_avg_bytes", "Average bytes returned per query.", L)?,
            avg_rows_scanned: gauge(
                r,
                "query_avg_rows_scanned",
                "Average rows scanned per query.",
                L,
            )?,
            avg_cpu_seconds: gauge(
                r,
                "query_avg_cpu_seconds",
                "Average CPU time per query.",
                L,
            )?,
        })
    }

    fn label(s: &QueryStat) -> String {
        s.text_fingerprint.to_string()
    }

    fn record(&self, s: &QueryStat) {
        let fingerprint = Self::label(s);
        let labels = [fingerprint.as_str()];

        self.interval_end
            .with_label_values(&labels)
            .set(s.interval_end.timestamp() as f64);
        if s.execution_count > 0 {
            self.execution_count
                .with_label_values(&labels)
                .inc_by(s.execution_count as f64);
        }
        self.avg_latency_seconds
            .with_label_values(&labels)
            .set(s.avg_latency_seconds);
        self.avg_rows.with_label_values(&labels).set(s.avg_rows);
        self.avg_bytes.with_label_values(&labels).set(s.avg_bytes);
        self.avg_rows_scanned
            .with_label_values(&labels)
            .set(s.avg_rows_scanned);
        self.avg_cpu_seconds
            .with_label_values(&labels)
            .set(s.avg_cpu_seconds);
    }

    fn retain(&self, current: HashSet<String>) {
        for label in self.live.replace(current) {
            remove_series(
                &[
                    &self.interval_end,
                    &self.avg_latency_seconds,
                    &self.avg_rows,
                    &self.avg_bytes,
                    &self.avg_rows_scanned,
                    &self.avg_cpu_seconds,
                ],
                &[&self.execution_count],
                &label,
            );
        }
    }
}

impl TransactionMeasures {
    fn new(r: &Registry) -> Result<Self> {
        const L: &str = "fingerprint";
        Ok(Self {
            live: LiveLabels::default(),
            interval_end: gauge(
                r,
                "transaction_interval_end_seconds",
                "Interval end of the latest transaction sample.",
                L,
            )?,
            commit_attempt_count: gauge(
                r,
                "transaction_commit_attempt_count",
                "Commit attempts in the interval.",
                L,
            )?,
            commit_failed_precondition_count: gauge(
                r,
                "transaction_commit_failed_precondition_count",
                "Commits failed on precondition in the interval.",
                L,
            )?,
            commit_abort_count: gauge(
                r,
                "transaction_commit_abort_count",
                "Aborted commits in the interval.",
                L,
            )?,
            avg_participants: gauge(
                r,
                "transaction_avg_participants",
                "Average commit participants.",
                L,
            )?,
            avg_total_latency_seconds: gauge(
                r,
                "transaction_avg_total_latency_seconds",
                "Average transaction latency.",
                L,
            )?,
            avg_commit_latency_seconds: gauge(
                r,
                "transaction_avg_commit_latency_seconds",
                "Average commit latency.",
                L,
            )?,
            avg_bytes: gauge(
                r,
                "transaction_avg_bytes",
                "Average bytes written per transaction.",
                L,
            )?,
        })
    }

    fn label(s: &TransactionStat) -> String {
        s.fprint.to_string()
    }

    fn record(&self, s: &TransactionStat) {
        let fingerprint = Self::label(s);
        let labels = [fingerprint.as_str()];

        self.interval_end
            .with_label_values(&labels)
            .set(s.interval_end.timestamp() as f64);
        self.commit_attempt_count
            .with_label_values(&labels)
            .set(s.commit_attempt_count as f64);
        self.commit_failed_precondition_count
            .with_label_values(&labels)
            .set(s.commit_failed_precondition_count as f64);
        self.commit_abort_count
            .with_label_values(&labels)
            .set(s.commit_abort_count as f64);
        self.avg_participants
            .with_label_values(&labels)
            .set(s.avg_participants);
        self.avg_total_latency_seconds
            .with_label_values(&labels)
            .set(s.avg_total_latency_seconds);
        self.avg_commit_latency_seconds
            .with_label_values(&labels)
            .set(s.avg_commit_latency_seconds);
        self.avg_bytes.with_label_values(&labels).set(s.avg_bytes);
    }

    fn retain(&self, current: HashSet<String>) {
        for label in self.live.replace(current) {
            remove_series(
                &[
                    &self.interval_end,
                    &self.commit_attempt_count,
                    &self.commit_failed_precondition_count,
                    &self.commit_abort_count,
                    &self.avg_participants,
                    &self.avg_total_latency_seconds,
                    &self.avg_commit_latency_seconds,
                    &self.avg_bytes,
                ],
                &[],
                &label,
            );
        }
    }
}

impl LockMeasures {
    fn new(r: &Registry) -> Result<Self> {
        const L: &str = "row_range_start_key";
        Ok(Self {
            live: LiveLabels::default(),
            interval_end: gauge(
                r,
                "lock_interval_end_seconds",
                "Interval end of the latest lock sample.",
                L,
            )?,
            lock_wait_seconds: gauge(
                r,
                "lock_wait_seconds",
                "Lock wait time on the row range in the interval.",
                L,
            )?,
        })
    }

    fn label(s: &LockStat) -> String {
        s.start_key_label()
    }

    fn record(&self, s: &LockStat) {
        let key = Self::label(s);
        let labels = [key.as_str()];

        self.interval_end
            .with_label_values(&labels)
            .set(s.interval_end.timestamp() as f64);
        self.lock_wait_seconds
            .with_label_values(&labels)
            .set(s.lock_wait_seconds);
    }

    fn retain(&self, current: HashSet<String>) {
        for label in self.live.replace(current) {
            remove_series(&[&self.interval_end, &self.lock_wait_seconds], &[], &label);
        }
    }
}

impl MetricsSink {
    /// Registers all measurement families in `registry`.
    pub fn new(registry: &Registry, cfg: &MetricsSinkConfig) -> Result<Self> {
        let push = match &cfg.address {
            Some(address) => Some(HttpPusher::new(address, cfg)?),
            None => None,
        };

        Ok(Self {
            query: QueryMeasures::new(registry)?,
            transaction: TransactionMeasures::new(registry)?,
            lock: LockMeasures::new(registry)?,
            push,
        })
    }

    /// Destination URL, when pushing is enabled.
    pub fn push_address(&self) -> Option<&str> {
        self.push.as_ref().map(HttpPusher::address)
    }

    /// Records one batch and drops the series of labels it no longer holds.
    fn record_batch(&self, kind: StatKind, rows: &[StatRow]) {
        let mut current = HashSet::with_capacity(rows.len());
        for row in rows {
            match row {
                StatRow::Query(s) => {
                    self.query.record(s);
                    current.insert(QueryMeasures::label(s));
                }
                StatRow::Transaction(s) => {
                    self.transaction.record(s);
                    current.insert(TransactionMeasures::label(s));
                }
                StatRow::Lock(s) => {
                    self.lock.record(s);
                    current.insert(LockMeasures::label(s));
                }
            }
        }

        match kind {
            StatKind::Query => self.query.retain(current),
            StatKind::Transaction => self.transaction.retain(current),
            StatKind::Lock => self.lock.retain(current),
        }
    }
}

impl Sink for MetricsSink {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn write(&self, kind: StatKind, rows: &[StatRow]) -> Result<(), SinkError> {
        // Push before recording so a rejected batch does not inflate counters
        // when it is retried.
        if let Some(push) = &self.push {
            push.push(rows).await?;
        }

        self.record_batch(kind, rows);

        Ok(())
    }
}
