//! Startup checks module for the ingest daemon
//!
//! Provides preflight checks run before the watch loop starts:
//! - FFmpeg availability (major version is logged)
//! - FFprobe availability
//! - Loudness normalizer availability, when normalization is enabled
//!
//! and the directory preparation that makes restarts safe: stage roots are created and
//! the scratch root is purged of anything a crashed run left behind.

use crate::config::Config;
use crate::relocate::{purge_dir_contents, remove_partial_copies, RelocateError};
use crate::stage::{Stage, StageError, StageLayout};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{program} not available: {detail}")]
    ToolUnavailable { program: String, detail: String },

    #[error("Could not parse FFmpeg version from output: {0}")]
    FfmpegVersion(String),

    #[error("Failed to create {path}: {source}")]
    CreateDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to purge scratch directory: {0}")]
    Purge(#[from] RelocateError),

    #[error("Stage layout error: {0}")]
    Layout(#[from] StageError),
}

/// Run `program arg` and return its stdout, failing when it cannot run or exits non-zero.
fn tool_output(program: &str, arg: &str) -> Result<String, StartupError> {
    let output = Command::new(program)
        .arg(arg)
        .output()
        .map_err(|e| StartupError::ToolUnavailable {
            program: program.to_string(),
            detail: format!("{} {} failed; is it installed and in PATH? Error: {}", program, arg, e),
        })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            program: program.to_string(),
            detail: format!("{} {} exited with {}", program, arg, output.status),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    // Git builds report e.g. "n7.1-123-gabcdef"
    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Check that ffmpeg runs and report its major version
pub fn check_ffmpeg_available() -> Result<u32, StartupError> {
    let version_output = tool_output("ffmpeg", "-version")?;
    let major = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegVersion(
            version_output
                .lines()
                .next()
                .unwrap_or("(empty)")
                .to_string(),
        )
    })?;
    info!(major, "Found ffmpeg");
    Ok(major)
}

/// Check that ffprobe runs
pub fn check_ffprobe_available() -> Result<(), StartupError> {
    tool_output("ffprobe", "-version")?;
    Ok(())
}

/// Check that the loudness normalizer runs
pub fn check_normalizer_available(program: &str) -> Result<(), StartupError> {
    let version = tool_output(program, "--version")?;
    info!(program, version = %version.trim(), "Found loudness normalizer");
    Ok(())
}

/// Run all startup checks in order
///
/// 1. FFmpeg
/// 2. FFprobe
/// 3. Loudness normalizer (only when enabled)
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffmpeg_available()?;
    check_ffprobe_available()?;
    if cfg.normalize.enabled {
        check_normalizer_available(&cfg.normalize.program)?;
    }
    Ok(())
}

/// Create every stage root and category directory, purge the scratch root and drop
/// partial copies left in the other stage roots.
///
/// Returns the number of stale scratch entries removed.
pub fn prepare_layout(layout: &StageLayout, categories: &[String]) -> Result<usize, StartupError> {
    let incoming = layout.root(Stage::Incoming)?;
    let mut dirs: Vec<std::path::PathBuf> =
        layout.roots().into_iter().map(|p| p.to_path_buf()).collect();
    dirs.extend(categories.iter().map(|c| incoming.join(c)));

    for dir in &dirs {
        std::fs::create_dir_all(dir).map_err(|source| StartupError::CreateDir {
            path: dir.clone(),
            source,
        })?;
    }

    let purged = purge_dir_contents(layout.root(Stage::Temporary)?)?;
    if purged > 0 {
        warn!(purged, "Removed leftovers from the scratch directory");
    }

    for root in layout.roots() {
        if root == incoming || root == layout.root(Stage::Temporary)? {
            continue;
        }
        let partials = remove_partial_copies(root)?;
        if partials > 0 {
            warn!(root = %root.display(), partials, "Removed interrupted copies");
        }
    }
    Ok(purged)
}
