use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::stats::{Granularity, StatKind};

/// Top-level configuration for the stats collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Target database location and access.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Polling loop configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Output configuration.
    #[serde(default)]
    pub sink: SinkConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Target database location and access.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Cloud project that owns the instance.
    #[serde(default)]
    pub project_id: String,

    /// Database instance ID.
    #[serde(default)]
    pub instance_id: String,

    /// Database ID within the instance.
    #[serde(default)]
    pub database_id: String,

    /// REST API base URL. Default: "https://spanner.googleapis.com".
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// File holding a bearer access token. Requests are unauthenticated
    /// when unset (e.g. against a local emulator).
    #[serde(default)]
    pub credential_file: Option<PathBuf>,

    /// Read staleness for statistics queries. Default: 60s.
    #[serde(default = "default_staleness", with = "humantime_serde")]
    pub staleness: Duration,

    /// Per-request timeout. Default: 30s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Polling loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Aggregation bucket width to read. Default: minute.
    #[serde(default)]
    pub granularity: Granularity,

    /// Statistic kinds to collect. Default: query, transaction, lock.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<StatKind>,

    /// Time between ticks. Default: 60s.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Where collected rows go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    /// One structured log record per row.
    #[default]
    Log,
    /// Prometheus measurements, optionally pushed to a destination URL.
    Metrics,
}

/// Output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinkConfig {
    /// Output selector. Default: log.
    #[serde(default)]
    pub mode: SinkMode,

    /// Metrics mode settings.
    #[serde(default)]
    pub metrics: MetricsSinkConfig,
}

/// Metrics mode settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSinkConfig {
    /// Destination URL for NDJSON pushes. Measurements are only exposed on
    /// the health server when unset.
    #[serde(default)]
    pub address: Option<String>,

    /// Compression algorithm (none, gzip, zstd). Default: gzip.
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Push request timeout. Default: 10s.
    #[serde(default = "default_push_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_endpoint() -> String {
    "https://spanner.googleapis.com".to_string()
}

fn default_staleness() -> Duration {
    Duration::from_secs(60)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_kinds() -> Vec<StatKind> {
    StatKind::all().to_vec()
}

fn default_poll_interval() -> Duration {
    Granularity::Minute.period()
}

fn default_compression() -> String {
    "gzip".to_string()
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            collector: CollectorConfig::default(),
            sink: SinkConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            instance_id: String::new(),
            database_id: String::new(),
            endpoint: default_endpoint(),
            credential_file: None,
            staleness: default_staleness(),
            timeout: default_request_timeout(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::default(),
            kinds: default_kinds(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for MetricsSinkConfig {
    fn default() -> Self {
        Self {
            address: None,
            compression: default_compression(),
            headers: HashMap::new(),
            timeout: default_push_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.database.project_id.is_empty() {
            bail!("database.project_id is required");
        }

        if self.database.instance_id.is_empty() {
            bail!("database.instance_id is required");
        }

        if self.database.database_id.is_empty() {
            bail!("database.database_id is required");
        }

        if self.database.endpoint.is_empty() {
            bail!("database.endpoint must not be empty");
        }

        if self.database.timeout.is_zero() {
            bail!("database.timeout must be positive");
        }

        if self.collector.kinds.is_empty() {
            bail!("collector.kinds must list at least one kind");
        }

        let mut seen = HashSet::new();
        for kind in &self.collector.kinds {
            if !seen.insert(*kind) {
                bail!("collector.kinds lists {kind} more than once");
            }
        }

        if self.collector.poll_interval.is_zero() {
            bail!("collector.poll_interval must be positive");
        }

        if self.sink.mode == SinkMode::Metrics {
            let metrics = &self.sink.metrics;

            if let Some(address) = &metrics.address {
                if address.is_empty() {
                    bail!("sink.metrics.address must not be empty when set");
                }
                if !address.starts_with("http://") && !address.starts_with("https://") {
                    bail!("sink.metrics.address must be an http(s) URL: {address}");
                }
            }

            match metrics.compression.as_str() {
                "none" | "gzip" | "zstd" => {}
                other => bail!("invalid compression type: {other}"),
            }

            if metrics.timeout.is_zero() {
                bail!("sink.metrics.timeout must be positive");
            }
        }

        Ok(())
    }
}

impl DatabaseConfig {
    /// Resource path of the target database.
    pub fn database_path(&self) -> String {
        format!(
            "projects/{}/instances/{}/databases/{}",
            self.project_id, self.instance_id, self.database_id
        )
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                project_id: "my-project".to_string(),
                instance_id: "my-instance".to_string(),
                database_id: "my-db".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.collector.granularity, Granularity::Minute);
        assert_eq!(cfg.collector.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.collector.kinds, StatKind::all().to_vec());
        assert_eq!(cfg.sink.mode, SinkMode::Log);
        assert_eq!(cfg.sink.metrics.compression, "gzip");
        assert_eq!(cfg.database.staleness, Duration::from_secs(60));
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_database_path() {
        assert_eq!(
            valid_config().database.database_path(),
            "projects/my-project/instances/my-instance/databases/my-db"
        );
    }

    #[test]
    fn test_validation_missing_project() {
        let mut cfg = valid_config();
        cfg.database.project_id.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("database.project_id"));
    }

    #[test]
    fn test_validation_missing_database_id() {
        let mut cfg = valid_config();
        cfg.database.database_id.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("database.database_id"));
    }

    #[test]
    fn test_validation_empty_kinds() {
        let mut cfg = valid_config();
        cfg.collector.kinds.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("collector.kinds"));
    }

    #[test]
    fn test_validation_duplicate_kind() {
        let mut cfg = valid_config();
        cfg.collector.kinds = vec![StatKind::Query, StatKind::Lock, StatKind::Query];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("query more than once"));
    }

    #[test]
    fn test_validation_zero_poll_interval() {
        let mut cfg = valid_config();
        cfg.collector.poll_interval = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn test_validation_metrics_address_scheme() {
        let mut cfg = valid_config();
        cfg.sink.mode = SinkMode::Metrics;
        cfg.sink.metrics.address = Some("collector:4318".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("http(s) URL"));

        cfg.sink.metrics.address = Some("http://collector:4318/v1/stats".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_metrics_compression() {
        let mut cfg = valid_config();
        cfg.sink.mode = SinkMode::Metrics;
        cfg.sink.metrics.compression = "snappy".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("invalid compression type"));
    }

    #[test]
    fn test_compression_ignored_in_log_mode() {
        let mut cfg = valid_config();
        cfg.sink.metrics.compression = "snappy".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
database:
  project_id: p
  instance_id: i
  database_id: d
  credential_file: /var/run/token
  staleness: 30s
collector:
  granularity: 10minute
  kinds: [query, lock]
  poll_interval: 2m
sink:
  mode: metrics
  metrics:
    address: http://localhost:8686
    compression: zstd
health:
  addr: "127.0.0.1:9100"
"#
        )
        .expect("write config");

        let cfg = Config::load(file.path()).expect("config loads");
        assert_eq!(cfg.collector.granularity, Granularity::TenMinutes);
        assert_eq!(cfg.collector.kinds, vec![StatKind::Query, StatKind::Lock]);
        assert_eq!(cfg.collector.poll_interval, Duration::from_secs(120));
        assert_eq!(cfg.database.staleness, Duration::from_secs(30));
        assert_eq!(
            cfg.database.credential_file,
            Some(PathBuf::from("/var/run/token"))
        );
        assert_eq!(cfg.sink.mode, SinkMode::Metrics);
        assert_eq!(
            cfg.sink.metrics.address.as_deref(),
            Some("http://localhost:8686")
        );
        assert_eq!(cfg.health.addr, "127.0.0.1:9100");
    }

    #[test]
    fn test_load_rejects_unknown_kind() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "database: {{project_id: p, instance_id: i, database_id: d}}\n\
             collector: {{kinds: [index]}}"
        )
        .expect("write config");

        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("parsing config file"));
    }
}
