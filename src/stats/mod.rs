pub mod decode;

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// StatKind identifies one introspected statistic family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Query,
    Transaction,
    Lock,
}

impl StatKind {
    /// Returns the canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Transaction => "transaction",
            Self::Lock => "lock",
        }
    }

    /// Convert from the canonical label name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "query" => Some(Self::Query),
            "transaction" => Some(Self::Transaction),
            "lock" => Some(Self::Lock),
            _ => None,
        }
    }

    /// Return all kinds in a stable order.
    pub fn all() -> &'static [Self] {
        &[Self::Query, Self::Transaction, Self::Lock]
    }

    /// Name prefix of the introspection tables holding this kind.
    pub const fn table_prefix(self) -> &'static str {
        match self {
            Self::Query => "query_stats",
            Self::Transaction => "txn_stats",
            Self::Lock => "lock_stats",
        }
    }
}

impl fmt::Display for StatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation bucket width of the underlying view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Granularity {
    #[default]
    #[serde(rename = "minute")]
    Minute,
    #[serde(rename = "10minute")]
    TenMinutes,
    #[serde(rename = "hour")]
    Hour,
}

impl Granularity {
    /// Table suffix selecting the view, e.g. `query_stats_top_10minute`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::TenMinutes => "10minute",
            Self::Hour => "hour",
        }
    }

    /// Width of one aggregation interval.
    pub const fn period(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::TenMinutes => Duration::from_secs(10 * 60),
            Self::Hour => Duration::from_secs(60 * 60),
        }
    }

    /// Full table name for the given kind at this granularity.
    pub fn table(self, kind: StatKind) -> String {
        format!("{}_top_{}", kind.table_prefix(), self.as_str())
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top queries by CPU usage during one interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryStat {
    pub interval_end: DateTime<Utc>,
    pub text: String,
    pub text_truncated: bool,
    pub text_fingerprint: i64,
    pub execution_count: i64,
    pub avg_latency_seconds: f64,
    pub avg_rows: f64,
    pub avg_bytes: f64,
    pub avg_rows_scanned: f64,
    pub avg_cpu_seconds: f64,
}

/// Top transactions by latency during one interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionStat {
    pub interval_end: DateTime<Utc>,
    pub fprint: i64,
    pub read_columns: Vec<String>,
    pub write_constructive_columns: Vec<String>,
    pub write_delete_tables: Vec<String>,
    pub commit_attempt_count: i64,
    pub commit_failed_precondition_count: i64,
    pub commit_abort_count: i64,
    pub avg_participants: f64,
    pub avg_total_latency_seconds: f64,
    pub avg_commit_latency_seconds: f64,
    pub avg_bytes: f64,
}

/// One sampled lock request on a contended row range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockRequest {
    pub lock_mode: String,
    pub column: String,
}

/// Row ranges with the most lock wait time during one interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockStat {
    pub interval_end: DateTime<Utc>,
    #[serde(serialize_with = "serialize_base64")]
    pub row_range_start_key: Vec<u8>,
    pub lock_wait_seconds: f64,
    pub sample_lock_requests: Vec<LockRequest>,
}

impl LockStat {
    /// Lossy text form of the start key, used as a metric label.
    pub fn start_key_label(&self) -> String {
        String::from_utf8_lossy(&self.row_range_start_key).into_owned()
    }
}

/// A single statistics row as returned by a source, one variant per kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatRow {
    Query(QueryStat),
    Transaction(TransactionStat),
    Lock(LockStat),
}

impl StatRow {
    /// Closing time of the aggregation bucket this row belongs to.
    pub fn interval_end(&self) -> DateTime<Utc> {
        match self {
            Self::Query(s) => s.interval_end,
            Self::Transaction(s) => s.interval_end,
            Self::Lock(s) => s.interval_end,
        }
    }

    pub fn kind(&self) -> StatKind {
        match self {
            Self::Query(_) => StatKind::Query,
            Self::Transaction(_) => StatKind::Transaction,
            Self::Lock(_) => StatKind::Lock,
        }
    }
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_kind_name_roundtrip() {
        for kind in StatKind::all() {
            assert_eq!(StatKind::from_name(kind.as_str()), Some(*kind));
        }
        assert_eq!(StatKind::from_name("index"), None);
    }

    #[test]
    fn test_granularity_tables() {
        assert_eq!(
            Granularity::Minute.table(StatKind::Query),
            "query_stats_top_minute"
        );
        assert_eq!(
            Granularity::TenMinutes.table(StatKind::Transaction),
            "txn_stats_top_10minute"
        );
        assert_eq!(Granularity::Hour.table(StatKind::Lock), "lock_stats_top_hour");
    }

    #[test]
    fn test_granularity_periods() {
        assert_eq!(Granularity::Minute.period(), Duration::from_secs(60));
        assert_eq!(Granularity::TenMinutes.period(), Duration::from_secs(600));
        assert_eq!(Granularity::Hour.period(), Duration::from_secs(3600));
    }

    #[test]
    fn test_granularity_deserialize_labels() {
        let g: Granularity = serde_yaml::from_str("10minute").expect("valid label");
        assert_eq!(g, Granularity::TenMinutes);
        assert!(serde_yaml::from_str::<Granularity>("day").is_err());
    }

    #[test]
    fn test_lock_row_serializes_key_as_base64() {
        let row = StatRow::Lock(LockStat {
            interval_end: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            row_range_start_key: b"Users(1)".to_vec(),
            lock_wait_seconds: 0.5,
            sample_lock_requests: vec![LockRequest {
                lock_mode: "ReaderShared".to_string(),
                column: "Users._exists".to_string(),
            }],
        });

        let json = serde_json::to_value(&row).expect("serialize");
        assert_eq!(json["kind"], "lock");
        assert_eq!(json["row_range_start_key"], "VXNlcnMoMSk=");
        assert_eq!(json["sample_lock_requests"][0]["lock_mode"], "ReaderShared");
        assert_eq!(row.kind(), StatKind::Lock);
    }
}
