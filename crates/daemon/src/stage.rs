//! Directory-based stage layout
//!
//! Every stage of the pipeline owns one root directory and a file's location encodes its
//! stage. All paths are derived here from a stage and a path relative to the stage root,
//! which always starts with the category directory (e.g. `movies/Film/Film.mkv`).

use crate::config::Config;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Named position of a file in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Incoming,
    /// Transcode in flight; the artifact lives under the scratch root.
    Converting,
    Converted,
    Normalized,
    Published,
    /// Scratch area for in-flight external work (normalization output).
    Temporary,
}

impl Stage {
    /// Position in the forward walk. `Temporary` is not part of the walk.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Stage::Incoming => Some(0),
            Stage::Converting => Some(1),
            Stage::Converted => Some(2),
            Stage::Normalized => Some(3),
            Stage::Published => Some(4),
            Stage::Temporary => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Incoming => "incoming",
            Stage::Converting => "converting",
            Stage::Converted => "converted",
            Stage::Normalized => "normalized",
            Stage::Published => "published",
            Stage::Temporary => "temporary",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from stage path construction and stage walks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("Stage {0} is not configured")]
    NotConfigured(Stage),

    #[error("Stage {0} has no successor")]
    Terminal(Stage),

    #[error("Stage regression from {from} to {to}")]
    Regression { from: Stage, to: Stage },

    #[error("Stage {0} is not part of the pipeline walk")]
    NotAWalkStage(Stage),

    #[error("Invalid relative path: {0}")]
    InvalidPath(PathBuf),

    #[error("Two sources map to the same output {0}")]
    NameCollision(PathBuf),
}

/// Root directory of every stage plus the extension given to media outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageLayout {
    incoming: PathBuf,
    temporary: PathBuf,
    converted: PathBuf,
    normalized: Option<PathBuf>,
    published: PathBuf,
    target_extension: String,
}

impl StageLayout {
    pub fn new(
        incoming: PathBuf,
        temporary: PathBuf,
        converted: PathBuf,
        normalized: Option<PathBuf>,
        published: PathBuf,
        target_extension: impl Into<String>,
    ) -> Self {
        Self {
            incoming,
            temporary,
            converted,
            normalized,
            published,
            target_extension: target_extension.into(),
        }
    }

    /// Build the layout from the configured roots. The normalized root only takes part
    /// when normalization is enabled.
    pub fn from_config(cfg: &Config) -> Self {
        let normalized = if cfg.normalize.enabled {
            cfg.paths.normalized_root.clone()
        } else {
            None
        };
        Self::new(
            cfg.paths.incoming_root.clone(),
            cfg.paths.temporary_root.clone(),
            cfg.paths.converted_root.clone(),
            normalized,
            cfg.paths.published_root.clone(),
            cfg.container.extension.clone(),
        )
    }

    pub fn normalization_enabled(&self) -> bool {
        self.normalized.is_some()
    }

    pub fn target_extension(&self) -> &str {
        &self.target_extension
    }

    /// Root directory of a stage. `Converting` shares the scratch root with `Temporary`.
    pub fn root(&self, stage: Stage) -> Result<&Path, StageError> {
        match stage {
            Stage::Incoming => Ok(&self.incoming),
            Stage::Converting | Stage::Temporary => Ok(&self.temporary),
            Stage::Converted => Ok(&self.converted),
            Stage::Normalized => self
                .normalized
                .as_deref()
                .ok_or(StageError::NotConfigured(Stage::Normalized)),
            Stage::Published => Ok(&self.published),
        }
    }

    /// Every distinct root directory, for startup creation.
    pub fn roots(&self) -> Vec<&Path> {
        let mut roots: Vec<&Path> = vec![
            &self.incoming,
            &self.temporary,
            &self.converted,
            &self.published,
        ];
        if let Some(normalized) = &self.normalized {
            roots.push(normalized);
        }
        roots
    }

    /// Mirror `relative` under the root of `stage`, keeping its name unchanged.
    pub fn path_for(&self, stage: Stage, relative: &Path) -> Result<PathBuf, StageError> {
        check_relative(relative)?;
        Ok(self.root(stage)?.join(relative))
    }

    /// Like [`path_for`](Self::path_for), but outside `Incoming` the file gets the
    /// target container extension.
    pub fn media_path_for(&self, stage: Stage, relative: &Path) -> Result<PathBuf, StageError> {
        let path = self.path_for(stage, relative)?;
        if stage == Stage::Incoming {
            return Ok(path);
        }
        Ok(path.with_extension(&self.target_extension))
    }

    /// Relative output path of each media source, in order, under the target extension.
    ///
    /// Sources that would share an output (`Film.avi` and `Film.mp4`) keep their own
    /// extension in front of the target one (`Film.avi.mkv`), except a source that already
    /// has the target name. Fails when names still clash after that.
    pub fn output_names(&self, sources: &[PathBuf]) -> Result<Vec<PathBuf>, StageError> {
        let mut plain = Vec::with_capacity(sources.len());
        let mut counts: HashMap<PathBuf, usize> = HashMap::new();
        for source in sources {
            check_relative(source)?;
            let output = source.with_extension(&self.target_extension);
            *counts.entry(output.clone()).or_default() += 1;
            plain.push(output);
        }

        let outputs: Vec<PathBuf> = sources
            .iter()
            .zip(plain)
            .map(|(source, output)| {
                let shared = counts.get(&output).is_some_and(|&n| n > 1);
                if !shared || *source == output {
                    return output;
                }
                match source.extension().and_then(|e| e.to_str()) {
                    Some(ext) => source.with_extension(format!("{}.{}", ext, self.target_extension)),
                    None => output,
                }
            })
            .collect();

        let mut seen = HashSet::new();
        for output in &outputs {
            if !seen.insert(output) {
                return Err(StageError::NameCollision(output.clone()));
            }
        }
        Ok(outputs)
    }

    /// The stage that follows `stage` in the forward walk.
    pub fn next_stage(&self, stage: Stage) -> Result<Stage, StageError> {
        match stage {
            Stage::Incoming => Ok(Stage::Converting),
            Stage::Converting => Ok(Stage::Converted),
            Stage::Converted if self.normalization_enabled() => Ok(Stage::Normalized),
            Stage::Converted | Stage::Normalized => Ok(Stage::Published),
            Stage::Published => Err(StageError::Terminal(stage)),
            Stage::Temporary => Err(StageError::NotAWalkStage(stage)),
        }
    }

    /// Stage and media path a file at `stage` moves to next.
    pub fn next_path(&self, stage: Stage, relative: &Path) -> Result<(Stage, PathBuf), StageError> {
        let next = self.next_stage(stage)?;
        Ok((next, self.media_path_for(next, relative)?))
    }

    /// The stage whose content is moved into `Published`.
    pub fn pre_publish_stage(&self) -> Stage {
        if self.normalization_enabled() {
            Stage::Normalized
        } else {
            Stage::Converted
        }
    }
}

fn check_relative(relative: &Path) -> Result<(), StageError> {
    let mut components = relative.components().peekable();
    if components.peek().is_none() {
        return Err(StageError::InvalidPath(relative.to_path_buf()));
    }
    if components.all(|c| matches!(c, Component::Normal(_))) {
        Ok(())
    } else {
        Err(StageError::InvalidPath(relative.to_path_buf()))
    }
}

/// Tracks the stage of one file and rejects moves backwards through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageWalk {
    current: Stage,
}

impl StageWalk {
    pub fn new() -> Self {
        Self {
            current: Stage::Incoming,
        }
    }

    pub fn current(&self) -> Stage {
        self.current
    }

    /// Move forward to `next`. Skipping stages is allowed (e.g. an artifact found already
    /// converted); staying put or moving backwards is not.
    pub fn advance(&mut self, next: Stage) -> Result<Stage, StageError> {
        let to = next.rank().ok_or(StageError::NotAWalkStage(next))?;
        let from = self
            .current
            .rank()
            .ok_or(StageError::NotAWalkStage(self.current))?;
        if to <= from {
            return Err(StageError::Regression {
                from: self.current,
                to: next,
            });
        }
        let previous = self.current;
        self.current = next;
        Ok(previous)
    }
}

impl Default for StageWalk {
    fn default() -> Self {
        Self::new()
    }
}
