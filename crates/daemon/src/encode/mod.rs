//! External process invocations for the ingest daemon
//!
//! Builders in the submodules decide *what* to run; [`ProcessRunner`] decides *how*.
//! Production uses [`SystemRunner`]; tests substitute their own runner.

pub mod ffmpeg;
pub mod normalize;

pub use ffmpeg::{
    build_transcode_invocation, AudioAction, TranscodePlan, TranscodeSettings, VideoAction,
};
pub use normalize::{build_normalize_invocation, NormalizeSettings};

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Lines of stderr kept when reporting a failed invocation.
const STDERR_TAIL_LINES: usize = 20;

/// One fully specified external command and the file it is expected to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    /// Where the process writes its artifact (always inside the scratch root).
    pub output: PathBuf,
}

impl Invocation {
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Arguments as lossy strings, for logging and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Shell-like rendering used in log lines.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in self.args_lossy() {
            line.push(' ');
            if arg.contains(' ') {
                line.push('"');
                line.push_str(&arg);
                line.push('"');
            } else {
                line.push_str(&arg);
            }
        }
        line
    }
}

/// What a finished external process reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stderr: String,
}

impl ProcessOutput {
    /// Last lines of stderr, enough to diagnose without flooding the log.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self
            .stderr
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Runs external commands. Implementations block until the process exits.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput>;
}

/// Runner that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput> {
        let output = invocation
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;

        Ok(ProcessOutput {
            success: output.status.success(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
