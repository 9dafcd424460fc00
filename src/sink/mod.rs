pub mod http;
pub mod log;
pub mod metrics;

use thiserror::Error;

use crate::stats::{StatKind, StatRow};

use self::log::LogSink;
use self::metrics::MetricsSink;

/// Errors raised while delivering a batch.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("encoding rows as JSON")]
    Encode(#[from] serde_json::Error),

    #[error("compressing payload with {algorithm}")]
    Compress {
        algorithm: String,
        #[source]
        source: std::io::Error,
    },

    #[error("push request failed")]
    Transport(#[from] reqwest::Error),

    #[error("push returned status {status}")]
    Status { status: u16 },

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Sink receives batches of newly observed rows.
///
/// Batches are non-empty and hold rows of a single kind. Different kinds may
/// be written concurrently.
pub trait Sink: Send + Sync {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Record one batch. Returns once the batch is delivered.
    fn write(
        &self,
        kind: StatKind,
        rows: &[StatRow],
    ) -> impl std::future::Future<Output = Result<(), SinkError>> + Send;
}

/// Writer dispatches batches to the configured output.
///
/// Uses enum dispatch rather than trait objects, since `Sink::write` returns
/// an anonymous future.
pub enum Writer {
    Log(LogSink),
    Metrics(MetricsSink),
}

impl Sink for Writer {
    fn name(&self) -> &str {
        match self {
            Self::Log(s) => s.name(),
            Self::Metrics(s) => s.name(),
        }
    }

    async fn write(&self, kind: StatKind, rows: &[StatRow]) -> Result<(), SinkError> {
        match self {
            Self::Log(s) => s.write(kind, rows).await,
            Self::Metrics(s) => s.write(kind, rows).await,
        }
    }
}
