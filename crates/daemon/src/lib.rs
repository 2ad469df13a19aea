//! Ingest Daemon
//!
//! Watch-folder media ingestion: debounced intake, metadata classification, a two-lane
//! scheduler and a directory-based staging pipeline around ffmpeg.

pub mod classify;
pub mod daemon;
pub mod debounce;
pub mod encode;
pub mod job_executor;
pub mod metrics;
pub mod metrics_server;
pub mod probe;
pub mod relocate;
pub mod retry;
pub mod scan;
pub mod scheduler;
pub mod stage;
pub mod startup;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use ingest_daemon_config as config;
pub use ingest_daemon_config::Config;
pub use classify::{classify, ClassificationVerdict, MediaItem, Policy, Reason, ReasonKind};
pub use daemon::{Daemon, DaemonError};
pub use debounce::IntakeDebouncer;
pub use encode::{Invocation, ProcessOutput, ProcessRunner, SystemRunner};
pub use job_executor::{Job, JobError, JobExecutor, JobReport};
pub use metrics::{new_shared_metrics, LaneMetrics, PipelineMetrics, SharedMetrics};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use probe::{FfprobeProber, MetadataProber, ProbeError, ProbeResult};
pub use scheduler::{predict_lane, Lane, LaneScheduler};
pub use stage::{Stage, StageError, StageLayout, StageWalk};
pub use startup::{prepare_layout, run_startup_checks, StartupError};
pub use watcher::{IntakeWatcher, WatchError};
