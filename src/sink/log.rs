use tracing::info;

use super::{Sink, SinkError};
use crate::stats::{LockRequest, StatKind, StatRow};

/// Emits one structured log record per row under the `stats` target.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }

    fn emit(row: &StatRow) {
        match row {
            StatRow::Query(s) => info!(
                target: "stats",
                kind = "query",
                interval_end = %s.interval_end.to_rfc3339(),
                text = %s.text,
                text_truncated = s.text_truncated,
                text_fingerprint = s.text_fingerprint,
                execution_count = s.execution_count,
                avg_latency_seconds = s.avg_latency_seconds,
                avg_rows = s.avg_rows,
                avg_bytes = s.avg_bytes,
                avg_rows_scanned = s.avg_rows_scanned,
                avg_cpu_seconds = s.avg_cpu_seconds,
                "database stats",
            ),
            StatRow::Transaction(s) => info!(
                target: "stats",
                kind = "transaction",
                interval_end = %s.interval_end.to_rfc3339(),
                fprint = s.fprint,
                read_columns = %s.read_columns.join(","),
                write_constructive_columns = %s.write_constructive_columns.join(","),
                write_delete_tables = %s.write_delete_tables.join(","),
                commit_attempt_count = s.commit_attempt_count,
                commit_failed_precondition_count = s.commit_failed_precondition_count,
                commit_abort_count = s.commit_abort_count,
                avg_participants = s.avg_participants,
                avg_total_latency_seconds = s.avg_total_latency_seconds,
                avg_commit_latency_seconds = s.avg_commit_latency_seconds,
                avg_bytes = s.avg_bytes,
                "database stats",
            ),
            StatRow::Lock(s) => info!(
                target: "stats",
                kind = "lock",
                interval_end = %s.interval_end.to_rfc3339(),
                row_range_start_key = %s.start_key_label(),
                lock_wait_seconds = s.lock_wait_seconds,
                sample_lock_requests = %format_lock_requests(&s.sample_lock_requests),
                "database stats",
            ),
        }
    }
}

/// Renders samples as `(column,mode),(column,mode)`.
pub(crate) fn format_lock_requests(requests: &[LockRequest]) -> String {
    requests
        .iter()
        .map(|r| format!("({},{})", r.column, r.lock_mode))
        .collect::<Vec<_>>()
        .join(",")
}

impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn write(&self, _kind: StatKind, rows: &[StatRow]) -> Result<(), SinkError> {
        for row in rows {
            Self::emit(row);
        }
        Ok(())
    }
}
