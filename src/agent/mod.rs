use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, SinkConfig, SinkMode};
use crate::export::health::HealthMetrics;
use crate::scheduler::{Scheduler, SchedulerError, Settings};
use crate::sink::log::LogSink;
use crate::sink::metrics::MetricsSink;
use crate::sink::Writer;
use crate::source::rest::RestSource;

/// Agent wires the database source, the configured sink and the scheduler
/// together, and owns the health server.
pub struct Agent {
    health: Arc<HealthMetrics>,
    source: Arc<RestSource>,
    scheduler: Arc<Scheduler<RestSource, Writer>>,
    task: Option<JoinHandle<Result<(), SchedulerError>>>,
    cancel: CancellationToken,
}

/// Builds the sink selected by `cfg.mode`. Metrics register into the health
/// registry so they are served alongside the collector's own metrics.
fn build_writer(cfg: &SinkConfig, health: &HealthMetrics) -> Result<Writer> {
    let writer = match cfg.mode {
        SinkMode::Log => Writer::Log(LogSink::new()),
        SinkMode::Metrics => {
            let sink = MetricsSink::new(health.registry(), &cfg.metrics)
                .context("creating metrics sink")?;
            if let Some(address) = sink.push_address() {
                info!(address, "pushing collected stats");
            }
            Writer::Metrics(sink)
        }
    };

    Ok(writer)
}

impl Agent {
    /// Creates a new Agent. Configuration problems surface here, before
    /// anything is started.
    pub fn new(cfg: &Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let source =
            Arc::new(RestSource::new(&cfg.database).context("creating database source")?);
        let writer = build_writer(&cfg.sink, &health)?;

        let scheduler = Scheduler::new(
            Arc::clone(&source),
            Arc::new(writer),
            Settings::from(&cfg.collector),
            Some(Arc::clone(&health)),
        )
        .context("creating scheduler")?;

        Ok(Self {
            health,
            source,
            scheduler: Arc::new(scheduler),
            task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Health metrics shared by all components.
    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Starts the health server and spawns the polling loop.
    pub async fn start(&mut self) -> Result<()> {
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let scheduler = Arc::clone(&self.scheduler);
        let cancel = self.cancel.child_token();
        self.task = Some(tokio::spawn(async move { scheduler.start(cancel).await }));

        info!("agent started");

        Ok(())
    }

    /// Stops the polling loop, waits for the in-flight tick, releases the
    /// database session, then stops the health server.
    pub async fn stop(&mut self) -> Result<()> {
        if let Err(e) = self.scheduler.stop() {
            warn!(error = %e, "stopping scheduler");
        }
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "scheduler exited with error"),
                Err(e) => error!(error = %e, "scheduler task panicked"),
            }
        }

        if let Err(e) = self.source.close().await {
            warn!(error = %e, "closing database session");
        }

        self.health.stop().await?;

        info!("agent stopped");

        Ok(())
    }
}

/// Resolves on the first shutdown request and names its source.
///
/// When the terminate handler could not be registered, only `interrupt`
/// can end the wait.
pub async fn wait_for_shutdown<I, T, E>(interrupt: I, terminate: Result<T, E>) -> &'static str
where
    I: Future,
    T: Future,
    E: Display,
{
    let terminate = async move {
        match terminate {
            Ok(signal) => {
                signal.await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::DatabaseConfig;

    fn config(mode: SinkMode) -> Config {
        let mut cfg = Config {
            database: DatabaseConfig {
                project_id: "p".to_string(),
                instance_id: "i".to_string(),
                database_id: "d".to_string(),
                // Nothing listens here; every fetch fails fast.
                endpoint: "http://127.0.0.1:1".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.sink.mode = mode;
        cfg.health.addr = "127.0.0.1:0".to_string();
        cfg
    }

    #[tokio::test]
    async fn test_metrics_mode_registers_into_health_registry() {
        let agent = Agent::new(&config(SinkMode::Metrics)).expect("agent builds");
        let names: Vec<String> = agent
            .health()
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.iter().any(|n| n == "stats_collector_ticks_total"));
        // Families without any series are left out of gather.
        assert!(!names.iter().any(|n| n.starts_with("stats_collector_query_avg")));

        let registered = agent.health().registry().register(Box::new(
            prometheus::GaugeVec::new(
                prometheus::Opts::new("query_avg_latency_seconds", "dup")
                    .namespace("stats_collector"),
                &["fingerprint"],
            )
            .expect("gauge builds"),
        ));
        assert!(registered.is_err());
    }

    #[tokio::test]
    async fn test_start_absorbs_source_failures_and_stops() {
        let mut agent = Agent::new(&config(SinkMode::Log)).expect("agent builds");
        agent.start().await.expect("agent starts");

        let health = Arc::clone(agent.health());
        for _ in 0..200 {
            if health.ticks.get() >= 1.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert_eq!(health.ticks.get(), 1.0);
        assert_eq!(health.fetch_errors.with_label_values(&["query"]).get(), 1.0);

        agent.stop().await.expect("agent stops");
        agent.stop().await.expect("second stop is harmless");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_terminate_waits_for_interrupt() {
        let started = tokio::time::Instant::now();
        let terminate: Result<std::future::Ready<()>, String> =
            Err("signal driver unavailable".to_string());

        let signal =
            wait_for_shutdown(tokio::time::sleep(Duration::from_secs(30)), terminate).await;

        assert_eq!(signal, "SIGINT");
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_terminate_ends_wait() {
        let signal = wait_for_shutdown(
            std::future::pending::<()>(),
            Ok::<_, String>(std::future::ready(())),
        )
        .await;
        assert_eq!(signal, "SIGTERM");
    }
}
