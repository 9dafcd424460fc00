pub mod rest;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::stats::decode::DecodeError;
use crate::stats::{Granularity, StatKind, StatRow};

/// One fetch result for a single kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Decoded rows, newest interval end first.
    pub rows: Vec<StatRow>,
    /// Rows the source returned but could not decode; they are skipped.
    pub malformed: usize,
}

/// Errors that make a kind's snapshot unavailable for the current tick.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{operation} request failed")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation} returned status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("unusable result set")]
    Decode(#[from] DecodeError),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to the aggregated statistics views.
pub trait StatSource: Send + Sync {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Fetch the current snapshot of `kind` at `granularity`, limited to rows
    /// whose interval end is after `since`, sorted newest first.
    fn fetch(
        &self,
        kind: StatKind,
        granularity: Granularity,
        since: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Snapshot, SourceError>> + Send;
}
