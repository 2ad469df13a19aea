//! Shared fixtures and fakes for unit tests.

use crate::classify::Policy;
use crate::config::Config;
use crate::encode::{Invocation, ProcessOutput, ProcessRunner, TranscodeSettings};
use crate::probe::{
    AudioTrack, BitrateFields, MetadataProber, ProbeError, ProbeResult, SubtitleTrack, VideoTrack,
};
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// Configuration with every required threshold set and all roots under `root`.
pub(crate) fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.paths.incoming_root = root.join("incoming");
    cfg.paths.temporary_root = root.join("scratch");
    cfg.paths.converted_root = root.join("converted");
    cfg.paths.normalized_root = Some(root.join("normalized"));
    cfg.paths.published_root = root.join("published");
    cfg.video.crf = Some(22);
    cfg.video.max_bitrate_kbps = Some(8000);
    cfg.video.reference_width = Some(1920);
    cfg.video.reference_height = Some(1080);
    cfg.audio.max_bitrate_kbps = Some(256);
    cfg.timing.poll_interval_secs = 1;
    cfg.timing.quiescence_secs = 0;
    cfg.timing.retry_backoff_secs = 1;
    cfg.metrics.enabled = false;
    cfg
}

/// H.264 High / AAC LC stereo policy with an 8 Mbps ceiling at 1080p.
pub(crate) fn test_policy() -> Policy {
    Policy::from_config(&test_config(Path::new("/srv"))).expect("test config is complete")
}

pub(crate) fn test_transcode_settings() -> TranscodeSettings {
    TranscodeSettings::from_config(&test_config(Path::new("/srv")), &test_policy())
        .expect("test config is complete")
}

/// Probe of a file that already meets [`test_policy`].
pub(crate) fn compliant_probe() -> ProbeResult {
    ProbeResult {
        container: vec!["matroska".to_string(), "webm".to_string()],
        video_tracks: vec![VideoTrack {
            index: 0,
            codec: "h264".to_string(),
            profile: Some("High".to_string()),
            width: Some(1920),
            height: Some(1080),
            framerate: Some(23.976),
            bitrate: BitrateFields {
                declared: Some(5_000_000.0),
                ..Default::default()
            },
        }],
        audio_tracks: vec![AudioTrack {
            index: 1,
            codec: "aac".to_string(),
            profile: Some("LC".to_string()),
            channels: Some(2),
            bitrate: BitrateFields {
                declared: Some(128_000.0),
                ..Default::default()
            },
        }],
        subtitle_tracks: vec![SubtitleTrack {
            index: Some(2),
            format: "subrip".to_string(),
        }],
    }
}

/// Probe of a compliant file whose video codec forces a re-encode.
pub(crate) fn hevc_probe() -> ProbeResult {
    let mut probe = compliant_probe();
    probe.video_tracks[0].codec = "hevc".to_string();
    probe.video_tracks[0].profile = Some("Main 10".to_string());
    probe
}

/// Prober answering from a table keyed by file name; unknown names are compliant.
#[derive(Default)]
pub(crate) struct FakeProber {
    probes: HashMap<String, ProbeResult>,
    broken: Vec<String>,
    calls: AtomicUsize,
}

impl FakeProber {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(mut self, file_name: &str, probe: ProbeResult) -> Self {
        self.probes.insert(file_name.to_string(), probe);
        self
    }

    /// Every probe of `file_name` fails as if ffprobe rejected it.
    pub(crate) fn broken(mut self, file_name: &str) -> Self {
        self.broken.push(file_name.to_string());
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetadataProber for FakeProber {
    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.broken.contains(&name) {
            return Err(ProbeError::FfprobeFailed(format!("cannot read {}", name)));
        }
        Ok(self
            .probes
            .get(&name)
            .cloned()
            .unwrap_or_else(compliant_probe))
    }
}

/// Runner that records invocations and writes a placeholder output on success.
#[derive(Default)]
pub(crate) struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    failures_left: AtomicUsize,
    held: Mutex<bool>,
    released: Condvar,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The first `n` runs exit non-zero.
    pub(crate) fn failing_first(n: usize) -> Self {
        let runner = Self::default();
        runner.failures_left.store(n, Ordering::SeqCst);
        runner
    }

    /// Every run blocks until [`release`](Self::release) is called.
    pub(crate) fn holding() -> Self {
        let runner = Self::default();
        *runner.held.lock().unwrap() = true;
        runner
    }

    pub(crate) fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.released.notify_all();
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, invocation: &Invocation) -> io::Result<ProcessOutput> {
        self.calls.lock().unwrap().push(invocation.clone());

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Ok(ProcessOutput {
                success: false,
                code: Some(1),
                stderr: "simulated failure".to_string(),
            });
        }

        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.released.wait(held).unwrap();
        }
        drop(held);

        if let Some(parent) = invocation.output.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&invocation.output, format!("output of {}", invocation.program))?;
        Ok(ProcessOutput {
            success: true,
            code: Some(0),
            stderr: String::new(),
        })
    }
}
