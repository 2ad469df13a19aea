//! Job executor module for the ingest daemon
//!
//! Walks one intake entry through the staging pipeline: every media file is classified,
//! converted (stream copy or re-encode) into the converted stage, optionally normalized,
//! and published; non-media files ride along. The incoming entry is removed only after
//! everything beneath it has been published.

use crate::classify::{classify, Policy};
use crate::config::{Config, ConfigError};
use crate::encode::{
    build_normalize_invocation, build_transcode_invocation, NormalizeSettings, ProcessRunner,
    TranscodePlan, TranscodeSettings,
};
use crate::metrics::SharedMetrics;
use crate::probe::{MetadataProber, ProbeResult};
use crate::relocate::{
    copy_into_place, move_into_place, publish_file, remove_empty_dirs, remove_entry,
    PublishOutcome, RelocateError,
};
use crate::retry::{retry_forever, run_external, Attempt, RetryPolicy};
use crate::scan::{files_under, is_media_file, JobEntry};
use crate::scheduler::Lane;
use crate::stage::{Stage, StageError, StageLayout, StageWalk};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error type for job execution operations
#[derive(Debug, Error)]
pub enum JobError {
    /// A stage path could not be built, or a stage walk went backwards
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// Moving, copying or removing files failed
    #[error("Relocation failed: {0}")]
    Relocate(#[from] RelocateError),

    /// A file did not sit under the incoming root
    #[error("{0} is outside the incoming root")]
    OutsideIncoming(PathBuf),

    /// A blocking worker task panicked or was cancelled
    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// One top-level intake entry scheduled on a lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Unique job identifier
    pub id: String,
    pub entry: JobEntry,
    pub lane: Lane,
}

impl Job {
    /// Create a job with a fresh identifier
    pub fn new(entry: JobEntry, lane: Lane) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entry,
            lane,
        }
    }
}

/// What a finished job did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    /// Media files sent through the transcoder
    pub converted: usize,
    /// Media files found already converted, normalized or published
    pub skipped: usize,
    /// Non-media files carried along
    pub carried: usize,
    /// Files moved into the published tree
    pub published: usize,
    /// Extra attempts spent on external invocations
    pub retries: u32,
}

/// Result of taking one media file through the pre-publish stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaOutcome {
    Staged,
    AlreadyDone,
    Vanished,
}

/// Runs jobs through the staging pipeline
pub struct JobExecutor {
    layout: StageLayout,
    policy: Policy,
    transcode: TranscodeSettings,
    normalize: Option<NormalizeSettings>,
    prober: Arc<dyn MetadataProber>,
    runner: Arc<dyn ProcessRunner>,
    retry: RetryPolicy,
    metrics: SharedMetrics,
}

impl JobExecutor {
    /// Create a new JobExecutor
    ///
    /// # Arguments
    /// * `cfg` - Validated configuration
    /// * `prober` - Metadata source used for classification
    /// * `runner` - Runner for the transcoder and normalizer
    /// * `metrics` - Shared metrics state for stage updates
    pub fn new(
        cfg: &Config,
        prober: Arc<dyn MetadataProber>,
        runner: Arc<dyn ProcessRunner>,
        metrics: SharedMetrics,
    ) -> Result<Self, ConfigError> {
        let policy = Policy::from_config(cfg)?;
        let transcode = TranscodeSettings::from_config(cfg, &policy)?;
        let layout = StageLayout::from_config(cfg);
        let normalize = layout
            .normalization_enabled()
            .then(|| NormalizeSettings::from(&cfg.normalize));

        Ok(Self {
            layout,
            policy,
            transcode,
            normalize,
            prober,
            runner,
            retry: RetryPolicy::new(Duration::from_secs(cfg.timing.retry_backoff_secs)),
            metrics,
        })
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn prober(&self) -> Arc<dyn MetadataProber> {
        self.prober.clone()
    }

    /// Execute a job
    ///
    /// 1. Takes every media file to the pre-publish stage, skipping finished ones
    /// 2. Carries non-media files along unclassified
    /// 3. Publishes the pre-publish subtree and prunes empty directories
    /// 4. Removes the incoming entry
    pub async fn execute(&self, job: &Job) -> Result<JobReport, JobError> {
        info!(job_id = %job.id, lane = %job.lane, entry = %job.entry.relative.display(), "Job started");
        let mut report = JobReport::default();

        let root = job.entry.absolute.clone();
        let files = blocking(move || Ok(files_under(&root))).await?;
        let (media, extras): (Vec<PathBuf>, Vec<PathBuf>) =
            files.into_iter().partition(|f| is_media_file(f));

        // Output names are fixed up front so no two sources land on one artifact
        let relatives = media
            .iter()
            .map(|file| self.relative_to_incoming(file))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self.layout.output_names(&relatives)?;

        for ((file, relative), output) in media.iter().zip(&relatives).zip(&outputs) {
            match self.stage_media(job, file, relative, output, &mut report).await? {
                MediaOutcome::Staged => report.converted += 1,
                MediaOutcome::AlreadyDone => report.skipped += 1,
                MediaOutcome::Vanished => {}
            }
        }
        for file in extras {
            let relative = self.relative_to_incoming(&file)?;
            if self.carry_along(&file, &relative).await? {
                report.carried += 1;
            }
        }

        report.published = self.publish(job).await?;

        let entry = job.entry.absolute.clone();
        blocking(move || remove_entry(&entry).map_err(JobError::from)).await?;
        info!(
            job_id = %job.id,
            lane = %job.lane,
            entry = %job.entry.relative.display(),
            converted = report.converted,
            skipped = report.skipped,
            published = report.published,
            "Job finished, source removed"
        );

        Ok(report)
    }

    fn relative_to_incoming(&self, file: &Path) -> Result<PathBuf, JobError> {
        let root = self.layout.root(Stage::Incoming)?;
        file.strip_prefix(root)
            .map(Path::to_path_buf)
            .map_err(|_| JobError::OutsideIncoming(file.to_path_buf()))
    }

    /// Take one media file from Incoming to the pre-publish stage.
    ///
    /// `output` is the file's path relative to every later stage root.
    async fn stage_media(
        &self,
        job: &Job,
        source: &Path,
        relative: &Path,
        output: &Path,
        report: &mut JobReport,
    ) -> Result<MediaOutcome, JobError> {
        let converted = self.layout.path_for(Stage::Converted, output)?;
        let pre_publish = self.layout.path_for(self.layout.pre_publish_stage(), output)?;
        if self.layout.path_for(Stage::Published, output)?.exists() || pre_publish.exists() {
            info!(job_id = %job.id, file = %relative.display(), "Already processed, skipping");
            if self.layout.normalization_enabled() && converted.exists() {
                // Left behind when a run stopped between normalizing and cleanup
                debug!(job_id = %job.id, file = %converted.display(), "Removing converted twin");
                let twin = converted.clone();
                blocking(move || remove_entry(&twin).map_err(JobError::from)).await?;
            }
            return Ok(MediaOutcome::AlreadyDone);
        }

        let mut walk = StageWalk::new();

        if converted.exists() {
            info!(job_id = %job.id, file = %relative.display(), "Converted artifact present, skipping transcode");
            self.transition(job, &mut walk, relative, Stage::Converted).await?;
        } else {
            let Some(probe) = self.probe(source).await else {
                warn!(job_id = %job.id, file = %relative.display(), "Source vanished before probing, skipping");
                return Ok(MediaOutcome::Vanished);
            };

            let (item, verdict) = classify(relative, &probe, &self.policy);
            let plan = TranscodePlan::from_verdict(&item, &verdict, &self.transcode);
            info!(
                job_id = %job.id,
                file = %relative.display(),
                verdict = %verdict,
                stream_copy = plan.is_stream_copy(),
                "Classified"
            );

            let stage = self.layout.next_stage(Stage::Incoming)?;
            let scratch = self.layout.path_for(stage, output)?;
            self.transition(job, &mut walk, relative, stage).await?;
            let invocation = build_transcode_invocation(&plan, source, &scratch, &self.transcode);

            let stage = self.layout.next_stage(Stage::Converting)?;
            let destination = self.layout.path_for(stage, output)?;
            let attempts =
                run_external(self.runner.clone(), invocation, &destination, self.retry).await?;
            self.record_retries(attempts, report).await;
            self.transition(job, &mut walk, relative, stage).await?;
        }

        if let Some(settings) = &self.normalize {
            let stage = self.layout.next_stage(Stage::Converted)?;
            let destination = self.layout.path_for(stage, output)?;
            let scratch = self.layout.path_for(Stage::Temporary, output)?;
            let invocation = build_normalize_invocation(&converted, &scratch, settings);

            let attempts =
                run_external(self.runner.clone(), invocation, &destination, self.retry).await?;
            self.record_retries(attempts, report).await;
            blocking(move || remove_entry(&converted).map_err(JobError::from)).await?;
            self.transition(job, &mut walk, relative, stage).await?;
        }

        Ok(MediaOutcome::Staged)
    }

    /// Probe with unbounded retry. `None` when the file disappeared.
    async fn probe(&self, source: &Path) -> Option<ProbeResult> {
        let retried = retry_forever("probe", self.retry, |_| {
            let prober = self.prober.clone();
            let source = source.to_path_buf();
            async move {
                match tokio::task::spawn_blocking(move || prober.probe(&source)).await {
                    Ok(Ok(probe)) => Attempt::Done(Some(probe)),
                    Ok(Err(e)) if e.is_not_found() => Attempt::Done(None),
                    Ok(Err(e)) => Attempt::Retry(e.to_string()),
                    Err(e) => Attempt::Retry(format!("probe task failed: {}", e)),
                }
            }
        })
        .await;
        retried.value
    }

    /// Copy a non-media file into the converted stage, moving it on to the normalized
    /// stage when that stage is enabled. Returns false when it was already published.
    async fn carry_along(&self, source: &Path, relative: &Path) -> Result<bool, JobError> {
        if self.layout.path_for(Stage::Published, relative)?.exists() {
            return Ok(false);
        }
        let converted = self.layout.path_for(Stage::Converted, relative)?;
        let normalized = if self.layout.normalization_enabled() {
            Some(self.layout.path_for(Stage::Normalized, relative)?)
        } else {
            None
        };
        let source = source.to_path_buf();

        blocking(move || {
            copy_into_place(&source, &converted)?;
            if let Some(normalized) = normalized {
                move_into_place(&converted, &normalized)?;
            }
            Ok(())
        })
        .await?;
        debug!(file = %relative.display(), "Carried non-media file");
        Ok(true)
    }

    /// Move everything staged for this entry into the published tree
    async fn publish(&self, job: &Job) -> Result<usize, JobError> {
        let stage = self.layout.pre_publish_stage();
        self.metrics
            .write()
            .await
            .set_stage(&job.id, Stage::Published.as_str());

        // A single media file was staged under the target extension
        let single_media = job.entry.absolute.is_file() && is_media_file(&job.entry.absolute);
        let staged_path = |stage: Stage| {
            if single_media {
                self.layout.media_path_for(stage, &job.entry.relative)
            } else {
                self.layout.path_for(stage, &job.entry.relative)
            }
        };
        let staged_entry = staged_path(stage)?;
        let converted_entry = staged_path(Stage::Converted)?;
        let staged_root = self.layout.root(stage)?.to_path_buf();
        let published_root = self.layout.root(Stage::Published)?.to_path_buf();

        let job_id = job.id.clone();
        let published = blocking(move || {
            let mut published = 0;
            for file in files_under(&staged_entry) {
                let relative = file
                    .strip_prefix(&staged_root)
                    .map_err(|_| JobError::OutsideIncoming(file.clone()))?;
                let destination = published_root.join(relative);
                if publish_file(&file, &destination)? == PublishOutcome::Moved {
                    info!(job_id = %job_id, file = %relative.display(), stage = %Stage::Published, "Published");
                    published += 1;
                }
            }
            // Normalization leaves the converted side of a directory entry empty
            for dir in [&staged_entry, &converted_entry] {
                if dir.is_dir() {
                    remove_empty_dirs(dir);
                }
            }
            Ok(published)
        })
        .await?;

        self.metrics.write().await.published_files += published as u64;
        Ok(published)
    }

    async fn transition(
        &self,
        job: &Job,
        walk: &mut StageWalk,
        relative: &Path,
        next: Stage,
    ) -> Result<(), JobError> {
        let from = walk.advance(next)?;
        info!(
            job_id = %job.id,
            lane = %job.lane,
            file = %relative.display(),
            from = %from,
            stage = %next,
            "Stage transition"
        );
        self.metrics.write().await.set_stage(&job.id, next.as_str());
        Ok(())
    }

    async fn record_retries(&self, attempts: u32, report: &mut JobReport) {
        let extra = attempts.saturating_sub(1);
        if extra > 0 {
            report.retries += extra;
            self.metrics.write().await.retried_invocations += u64::from(extra);
        }
    }
}

/// Run blocking filesystem work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T, JobError>
where
    F: FnOnce() -> Result<T, JobError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| JobError::Worker(e.to_string()))?
}
