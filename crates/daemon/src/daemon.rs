//! Daemon startup and main loop for the ingest daemon
//!
//! Provides the daemon entry point, startup sequence, and the polling control loop that
//! hands quiescent intake to the lane scheduler.

use crate::config::{Config, ConfigError};
use crate::debounce::IntakeDebouncer;
use crate::encode::{ProcessRunner, SystemRunner};
use crate::job_executor::JobExecutor;
use crate::metrics::{new_shared_metrics, SharedMetrics};
use crate::metrics_server::run_metrics_server;
use crate::probe::{FfprobeProber, MetadataProber};
use crate::scheduler::LaneScheduler;
use crate::stage::Stage;
use crate::startup::{prepare_layout, run_startup_checks, StartupError};
use crate::watcher::{IntakeWatcher, WatchError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check or directory preparation failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// The incoming root could not be watched
    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    executor: Arc<JobExecutor>,
    debouncer: Arc<IntakeDebouncer>,
}

impl Daemon {
    /// Initialize the daemon with production collaborators (ffprobe, real processes)
    ///
    /// Fails before anything touches the filesystem when a required threshold is missing.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        Self::with_collaborators(
            config,
            Arc::new(FfprobeProber::default()),
            Arc::new(SystemRunner),
        )
    }

    /// Initialize the daemon with the given prober and process runner
    pub fn with_collaborators(
        config: Config,
        prober: Arc<dyn MetadataProber>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let metrics = new_shared_metrics();
        let executor = Arc::new(JobExecutor::new(&config, prober, runner, metrics.clone())?);

        Ok(Self {
            config,
            metrics,
            executor,
            debouncer: Arc::new(IntakeDebouncer::new()),
        })
    }

    /// Run the external tool checks
    pub fn check_tools(&self) -> Result<(), DaemonError> {
        run_startup_checks(&self.config)?;
        Ok(())
    }

    /// Create stage directories and purge the scratch root
    pub fn prepare(&self) -> Result<usize, DaemonError> {
        Ok(prepare_layout(
            self.executor.layout(),
            &self.config.paths.categories,
        )?)
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn debouncer(&self) -> Arc<IntakeDebouncer> {
        self.debouncer.clone()
    }

    /// Start the metrics HTTP server when enabled
    ///
    /// Spawns the HTTP server as a background task.
    pub fn start_metrics_server(&self) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.metrics.enabled {
            return None;
        }
        let metrics = self.metrics.clone();
        let listen = self.config.metrics.listen.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(metrics, &listen).await {
                error!(error = %e, "Metrics server error");
            }
        }))
    }

    /// Run the daemon until `shutdown` resolves
    ///
    /// Prepares the directory layout, starts the watcher and the metrics server, then
    /// polls: every `poll_interval_secs` the scheduler ticks if the incoming tree has been
    /// quiet for `quiescence_secs`.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), DaemonError>
    where
        F: Future<Output = ()>,
    {
        self.prepare()?;

        let incoming = self.executor.layout().root(Stage::Incoming).map_err(StartupError::from)?;
        let _watcher = IntakeWatcher::start(incoming, self.debouncer.clone())?;
        let _server = self.start_metrics_server();

        let mut scheduler = LaneScheduler::new(
            self.executor.clone(),
            self.config.paths.categories.clone(),
            self.metrics.clone(),
        );

        let quiescence = Duration::from_secs(self.config.timing.quiescence_secs);
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.timing.poll_interval_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            incoming = %incoming.display(),
            poll_secs = self.config.timing.poll_interval_secs,
            quiescence_secs = self.config.timing.quiescence_secs,
            "Daemon running"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    if self.debouncer.quiescent_for(quiescence) {
                        scheduler.tick().await;
                    } else {
                        debug!("Intake still active, waiting for quiescence");
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the daemon until the process receives Ctrl-C
    pub async fn run(&self) -> Result<(), DaemonError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}
