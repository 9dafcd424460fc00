use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};

use super::SinkError;
use crate::config::MetricsSinkConfig;
use crate::stats::StatRow;

/// Pushes rows to an HTTP endpoint as newline-delimited JSON.
///
/// One request per batch; the call completes only after the endpoint
/// acknowledges the request, so a failed push leaves the batch undelivered.
pub struct HttpPusher {
    client: reqwest::Client,
    address: String,
    compression: String,
    headers: HashMap<String, String>,
}

impl HttpPusher {
    /// Creates a pusher targeting `address`.
    pub fn new(address: &str, cfg: &MetricsSinkConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            client,
            address: address.to_string(),
            compression: cfg.compression.clone(),
            headers: cfg.headers.clone(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sends one batch of rows.
    pub async fn push(&self, rows: &[StatRow]) -> Result<(), SinkError> {
        if rows.is_empty() {
            return Ok(());
        }

        let buf = encode_ndjson(rows)?;
        let raw_len = buf.len();

        let body = compress(&buf, &self.compression).map_err(|source| SinkError::Compress {
            algorithm: self.compression.clone(),
            source,
        })?;

        let mut request = self
            .client
            .post(&self.address)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        if let Some(encoding) = content_encoding(&self.compression) {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            return Err(SinkError::Status {
                status: status.as_u16(),
            });
        }

        tracing::debug!(rows = rows.len(), bytes = raw_len, "pushed stats batch");

        Ok(())
    }
}

/// Serializes rows as one JSON object per line.
fn encode_ndjson(rows: &[StatRow]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(rows.len() * 256);
    for row in rows {
        serde_json::to_writer(&mut buf, row)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

// --- Compression ---

/// Compresses data using the specified algorithm.
fn compress(data: &[u8], algorithm: &str) -> std::io::Result<Vec<u8>> {
    match algorithm {
        "gzip" => {
            use flate2::write::GzEncoder;
            use flate2::Compression;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        "zstd" => zstd::encode_all(data, 0),
        _ => Ok(data.to_vec()),
    }
}

/// Returns the Content-Encoding header value for the algorithm.
fn content_encoding(algorithm: &str) -> Option<&'static str> {
    match algorithm {
        "gzip" => Some("gzip"),
        "zstd" => Some("zstd"),
        _ => None,
    }
}
