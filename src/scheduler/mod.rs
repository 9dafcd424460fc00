//! Periodic fan-out of fetch, filter and deliver across statistic kinds.
//!
//! Each tick spawns one task per kind and waits for all of them before the
//! next tick may begin. Tasks receive a copy of their kind's watermark and
//! report the interval end they delivered; the scheduler applies those
//! advances after the join, so every watermark has exactly one writer.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::dedup::select_new;
use crate::export::health::HealthMetrics;
use crate::sink::{Sink, SinkError};
use crate::source::{SourceError, StatSource};
use crate::stats::{Granularity, StatKind};
use crate::watermark::WatermarkTracker;

/// Errors surfaced by scheduler construction and lifecycle calls.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler was never started")]
    NotStarted,
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// What the scheduler polls and how often.
#[derive(Debug, Clone)]
pub struct Settings {
    pub kinds: Vec<StatKind>,
    pub granularity: Granularity,
    pub period: Duration,
}

impl From<&CollectorConfig> for Settings {
    fn from(cfg: &CollectorConfig) -> Self {
        Self {
            kinds: cfg.kinds.clone(),
            granularity: cfg.granularity,
            period: cfg.poll_interval,
        }
    }
}

impl Settings {
    fn validate(&self) -> Result<(), SchedulerError> {
        if self.kinds.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "at least one statistic kind is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for kind in &self.kinds {
            if !seen.insert(*kind) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "statistic kind {kind} listed more than once"
                )));
            }
        }

        if self.period.is_zero() {
            return Err(SchedulerError::InvalidConfig(
                "poll period must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Result of one kind's work within a tick.
#[derive(Debug)]
pub enum KindOutcome {
    /// A new interval was written and the watermark moved to `watermark`.
    Delivered {
        rows: usize,
        watermark: DateTime<Utc>,
    },
    /// Nothing newer than the watermark.
    UpToDate,
    SourceFailed(SourceError),
    SinkFailed(SinkError),
}

#[derive(Debug)]
pub struct KindReport {
    pub kind: StatKind,
    /// Rows the source skipped as undecodable.
    pub malformed: usize,
    pub outcome: KindOutcome,
}

/// Per-kind outcomes of one tick, ordered by kind.
#[derive(Debug, Default)]
pub struct TickReport {
    pub kinds: Vec<KindReport>,
    pub elapsed: Duration,
}

impl TickReport {
    pub fn outcome(&self, kind: StatKind) -> Option<&KindOutcome> {
        self.kinds
            .iter()
            .find(|report| report.kind == kind)
            .map(|report| &report.outcome)
    }

    /// Total rows handed to the sink during the tick.
    pub fn delivered_rows(&self) -> usize {
        self.kinds
            .iter()
            .map(|report| match report.outcome {
                KindOutcome::Delivered { rows, .. } => rows,
                _ => 0,
            })
            .sum()
    }
}

struct Lifecycle {
    state: SchedulerState,
    token: Option<CancellationToken>,
}

/// Polls a [`StatSource`] on a fixed period and forwards new rows to a [`Sink`].
pub struct Scheduler<S, K> {
    source: Arc<S>,
    sink: Arc<K>,
    settings: Settings,
    tracker: parking_lot::Mutex<WatermarkTracker>,
    lifecycle: parking_lot::Mutex<Lifecycle>,
    health: Option<Arc<HealthMetrics>>,
}

impl<S, K> Scheduler<S, K>
where
    S: StatSource + 'static,
    K: Sink + 'static,
{
    /// Creates an idle scheduler with every kind's watermark at
    /// `now - 2 * granularity period`.
    pub fn new(
        source: Arc<S>,
        sink: Arc<K>,
        settings: Settings,
        health: Option<Arc<HealthMetrics>>,
    ) -> Result<Self, SchedulerError> {
        settings.validate()?;

        let tracker = WatermarkTracker::starting_at(
            &settings.kinds,
            Utc::now(),
            settings.granularity.period(),
        );

        Ok(Self {
            source,
            sink,
            settings,
            tracker: parking_lot::Mutex::new(tracker),
            lifecycle: parking_lot::Mutex::new(Lifecycle {
                state: SchedulerState::Idle,
                token: None,
            }),
            health,
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.lifecycle.lock().state
    }

    /// Current watermark of `kind`, if it is scheduled.
    pub fn watermark(&self, kind: StatKind) -> Option<DateTime<Utc>> {
        self.tracker.lock().get(kind)
    }

    /// Runs ticks until `parent` is cancelled or [`Scheduler::stop`] is
    /// called. The first tick runs immediately.
    ///
    /// A tick in progress when cancellation arrives runs to completion.
    pub async fn start(&self, parent: CancellationToken) -> Result<(), SchedulerError> {
        let token = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != SchedulerState::Idle {
                return Err(SchedulerError::AlreadyStarted);
            }
            let token = parent.child_token();
            lifecycle.state = SchedulerState::Running;
            lifecycle.token = Some(token.clone());
            token
        };

        info!(
            source = self.source.name(),
            sink = self.sink.name(),
            kinds = ?self.settings.kinds,
            granularity = %self.settings.granularity,
            period = ?self.settings.period,
            "scheduler started",
        );

        if !token.is_cancelled() {
            self.run_tick().await;
        }

        let period = self.settings.period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
            }
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = SchedulerState::Stopped;
            lifecycle.token = None;
        }

        info!("scheduler stopped");

        Ok(())
    }

    /// Requests the loop to end at its next suspension point. Does not wait.
    ///
    /// Fails with [`SchedulerError::NotStarted`] on an idle scheduler; repeat
    /// calls after that are no-ops.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            SchedulerState::Idle => Err(SchedulerError::NotStarted),
            SchedulerState::Running => {
                if let Some(token) = &lifecycle.token {
                    token.cancel();
                }
                lifecycle.state = SchedulerState::Stopping;
                Ok(())
            }
            SchedulerState::Stopping | SchedulerState::Stopped => Ok(()),
        }
    }

    /// Fetches, filters and delivers every kind once, concurrently.
    pub async fn run_tick(&self) -> TickReport {
        let started = Instant::now();

        let marks: Vec<(StatKind, DateTime<Utc>)> = {
            let tracker = self.tracker.lock();
            self.settings
                .kinds
                .iter()
                .filter_map(|kind| tracker.get(*kind).map(|mark| (*kind, mark)))
                .collect()
        };

        let mut tasks = JoinSet::new();
        for (kind, watermark) in marks {
            let source = Arc::clone(&self.source);
            let sink = Arc::clone(&self.sink);
            let granularity = self.settings.granularity;

            tasks.spawn(async move {
                collect_kind(source.as_ref(), sink.as_ref(), kind, granularity, watermark).await
            });
        }

        let mut reports = Vec::with_capacity(self.settings.kinds.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => {
                    self.apply(&report);
                    reports.push(report);
                }
                Err(e) => error!(error = %e, "kind task panicked"),
            }
        }
        reports.sort_by_key(|report| report.kind);

        let elapsed = started.elapsed();
        if let Some(health) = &self.health {
            health.ticks.inc();
            health.tick_duration.observe(elapsed.as_secs_f64());
        }

        let report = TickReport {
            kinds: reports,
            elapsed,
        };
        debug!(
            rows = report.delivered_rows(),
            elapsed_ms = elapsed.as_millis() as u64,
            "tick complete",
        );

        report
    }

    /// Records one kind's outcome: advances its watermark on delivery and
    /// logs absorbed failures.
    fn apply(&self, report: &KindReport) {
        let kind = report.kind;
        let label = kind.as_str();

        if report.malformed > 0 {
            warn!(kind = %kind, rows = report.malformed, "skipped malformed rows");
            if let Some(health) = &self.health {
                health
                    .rows_malformed
                    .with_label_values(&[label])
                    .inc_by(report.malformed as f64);
            }
        }

        match &report.outcome {
            KindOutcome::Delivered { rows, watermark } => {
                self.tracker.lock().advance(kind, *watermark);
                debug!(kind = %kind, rows, watermark = %watermark, "delivered new interval");

                if let Some(health) = &self.health {
                    health
                        .rows_emitted
                        .with_label_values(&[label])
                        .inc_by(*rows as f64);
                    health
                        .watermark
                        .with_label_values(&[label])
                        .set(watermark.timestamp() as f64);
                }
            }
            KindOutcome::UpToDate => {
                debug!(kind = %kind, "no new interval");
            }
            KindOutcome::SourceFailed(e) => {
                warn!(
                    kind = %kind,
                    source = self.source.name(),
                    error = %e,
                    "fetch failed, retrying next tick",
                );
                if let Some(health) = &self.health {
                    health.fetch_errors.with_label_values(&[label]).inc();
                }
            }
            KindOutcome::SinkFailed(e) => {
                warn!(
                    kind = %kind,
                    sink = self.sink.name(),
                    error = %e,
                    "write failed, retrying next tick",
                );
                if let Some(health) = &self.health {
                    health.sink_errors.with_label_values(&[label]).inc();
                }
            }
        }
    }
}

/// One kind's unit of work: fetch since the watermark, keep the newest
/// unseen interval, deliver it.
async fn collect_kind<S: StatSource, K: Sink>(
    source: &S,
    sink: &K,
    kind: StatKind,
    granularity: Granularity,
    watermark: DateTime<Utc>,
) -> KindReport {
    let snapshot = match source.fetch(kind, granularity, watermark).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            return KindReport {
                kind,
                malformed: 0,
                outcome: KindOutcome::SourceFailed(e),
            }
        }
    };

    let malformed = snapshot.malformed;
    let selection = select_new(snapshot.rows, watermark);

    let outcome = match selection.advance_to {
        None => KindOutcome::UpToDate,
        Some(advance_to) => match sink.write(kind, &selection.rows).await {
            Ok(()) => KindOutcome::Delivered {
                rows: selection.rows.len(),
                watermark: advance_to,
            },
            Err(e) => KindOutcome::SinkFailed(e),
        },
    };

    KindReport {
        kind,
        malformed,
        outcome,
    }
}
