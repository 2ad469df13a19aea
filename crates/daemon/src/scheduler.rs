//! Two-lane job scheduler
//!
//! Jobs that only need stream copies or audio work go to the `Fast` lane; anything that
//! re-encodes video goes to `Long`, so a multi-hour encode never holds up quick remuxes.
//! Each lane runs at most one job, and a job stays on its lane until its worker signals
//! completion.

use crate::classify::classify;
use crate::job_executor::{Job, JobError, JobExecutor, JobReport};
use crate::metrics::{timestamp_ms, SharedMetrics};
use crate::scan::{list_job_entries, media_files_under, JobEntry};
use crate::stage::Stage;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Execution lane of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Fast,
    Long,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Fast => "fast",
            Lane::Long => "long",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct InFlight {
    job: Job,
    done: oneshot::Receiver<Result<JobReport, JobError>>,
    _handle: JoinHandle<()>,
}

/// Predict the lane of an entry without touching the filesystem beyond reads.
///
/// Any media file that would need a video re-encode makes the whole entry `Long`. Files
/// already past conversion are ignored, and a probe failure predicts `Long`.
pub async fn predict_lane(executor: Arc<JobExecutor>, entry: JobEntry) -> Lane {
    let relative_root = entry.relative.clone();
    let prediction = tokio::task::spawn_blocking(move || {
        let layout = executor.layout();
        let incoming = layout.root(Stage::Incoming).ok()?.to_path_buf();
        let prober = executor.prober();

        let sources: Vec<(PathBuf, PathBuf)> = media_files_under(&entry.absolute)
            .into_iter()
            .filter_map(|file| {
                let relative = file.strip_prefix(&incoming).ok()?.to_path_buf();
                Some((file, relative))
            })
            .collect();
        let relatives: Vec<PathBuf> = sources.iter().map(|(_, rel)| rel.clone()).collect();
        let Ok(outputs) = layout.output_names(&relatives) else {
            return Some(Lane::Long);
        };

        for ((file, relative), output) in sources.iter().zip(&outputs) {
            let finished = [Stage::Converted, layout.pre_publish_stage(), Stage::Published]
                .into_iter()
                .filter_map(|stage| layout.path_for(stage, output).ok())
                .any(|path| path.exists());
            if finished {
                continue;
            }

            match prober.probe(file) {
                Ok(probe) => {
                    let (_, verdict) = classify(relative, &probe, executor.policy());
                    if verdict.needs_video_convert() {
                        return Some(Lane::Long);
                    }
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Probe failed during lane prediction");
                    return Some(Lane::Long);
                }
            }
        }
        Some(Lane::Fast)
    })
    .await;

    match prediction {
        Ok(Some(lane)) => lane,
        Ok(None) => Lane::Long,
        Err(e) => {
            warn!(entry = %relative_root.display(), error = %e, "Lane prediction task failed");
            Lane::Long
        }
    }
}

/// Dispatches intake entries onto the two lanes
pub struct LaneScheduler {
    executor: Arc<JobExecutor>,
    incoming_root: PathBuf,
    categories: Vec<String>,
    metrics: SharedMetrics,
    fast: Option<InFlight>,
    long: Option<InFlight>,
}

impl LaneScheduler {
    pub fn new(executor: Arc<JobExecutor>, categories: Vec<String>, metrics: SharedMetrics) -> Self {
        let incoming_root = executor
            .layout()
            .root(Stage::Incoming)
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        Self {
            executor,
            incoming_root,
            categories,
            metrics,
            fast: None,
            long: None,
        }
    }

    fn slot(&self, lane: Lane) -> &Option<InFlight> {
        match lane {
            Lane::Fast => &self.fast,
            Lane::Long => &self.long,
        }
    }

    fn slot_mut(&mut self, lane: Lane) -> &mut Option<InFlight> {
        match lane {
            Lane::Fast => &mut self.fast,
            Lane::Long => &mut self.long,
        }
    }

    /// The job currently running on `lane`
    pub fn in_flight(&self, lane: Lane) -> Option<&Job> {
        self.slot(lane).as_ref().map(|f| &f.job)
    }

    pub fn is_busy(&self, lane: Lane) -> bool {
        self.slot(lane).is_some()
    }

    fn owns(&self, entry: &JobEntry) -> bool {
        [Lane::Fast, Lane::Long]
            .into_iter()
            .filter_map(|lane| self.in_flight(lane))
            .any(|job| job.entry.relative == entry.relative)
    }

    /// Free every lane whose worker has signalled completion. Returns the finished jobs.
    pub async fn reap(&mut self) -> Vec<Job> {
        let mut finished = Vec::new();
        for lane in [Lane::Fast, Lane::Long] {
            let slot = self.slot_mut(lane);
            let outcome = match slot.as_mut() {
                Some(in_flight) => in_flight.done.try_recv(),
                None => continue,
            };
            let result = match outcome {
                Err(TryRecvError::Empty) => continue,
                Ok(result) => Some(result),
                Err(TryRecvError::Closed) => None,
            };
            let Some(in_flight) = slot.take() else {
                continue;
            };
            let job = in_flight.job;

            match result {
                Some(Ok(report)) => info!(
                    job_id = %job.id,
                    lane = %lane,
                    entry = %job.entry.relative.display(),
                    converted = report.converted,
                    published = report.published,
                    "Lane freed"
                ),
                Some(Err(e)) => error!(
                    job_id = %job.id,
                    lane = %lane,
                    entry = %job.entry.relative.display(),
                    error = %e,
                    "Job failed, entry stays in intake"
                ),
                None => {
                    error!(job_id = %job.id, lane = %lane, "Worker exited without reporting");
                    self.metrics.write().await.job_finished(&job.id, false);
                }
            }
            finished.push(job);
        }
        finished
    }

    /// One scheduling pass. Returns the jobs dispatched.
    pub async fn tick(&mut self) -> Vec<Job> {
        self.reap().await;
        self.metrics.write().await.timestamp_unix_ms = timestamp_ms();

        if self.is_busy(Lane::Fast) && self.is_busy(Lane::Long) {
            debug!("Both lanes busy, skipping tick");
            return Vec::new();
        }

        let root = self.incoming_root.clone();
        let categories = self.categories.clone();
        let entries = match tokio::task::spawn_blocking(move || list_job_entries(&root, &categories)).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to list intake entries");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "Intake listing task failed");
                return Vec::new();
            }
        };

        let mut dispatched = Vec::new();
        for entry in entries {
            if self.is_busy(Lane::Fast) && self.is_busy(Lane::Long) {
                break;
            }
            if self.owns(&entry) {
                continue;
            }
            let lane = predict_lane(self.executor.clone(), entry.clone()).await;
            if self.is_busy(lane) {
                debug!(entry = %entry.relative.display(), lane = %lane, "Lane busy, deferring");
                continue;
            }
            let job = Job::new(entry, lane);
            self.dispatch(job.clone()).await;
            dispatched.push(job);
        }
        dispatched
    }

    async fn dispatch(&mut self, job: Job) {
        info!(
            job_id = %job.id,
            lane = %job.lane,
            entry = %job.entry.relative.display(),
            "Dispatching job"
        );
        self.metrics.write().await.lane_started(
            job.lane.as_str(),
            &job.id,
            &job.entry.relative.to_string_lossy(),
        );

        let (tx, rx) = oneshot::channel();
        let executor = self.executor.clone();
        let metrics = self.metrics.clone();
        let worker_job = job.clone();
        let handle = tokio::spawn(async move {
            let result = executor.execute(&worker_job).await;
            metrics
                .write()
                .await
                .job_finished(&worker_job.id, result.is_ok());
            let _ = tx.send(result);
        });

        let lane = job.lane;
        *self.slot_mut(lane) = Some(InFlight {
            job,
            done: rx,
            _handle: handle,
        });
    }
}
