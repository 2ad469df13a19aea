//! Transcode planning and ffmpeg command construction
//!
//! A [`TranscodePlan`] maps the classifier verdict onto per-stream actions: every
//! stream is either copied or re-encoded with policy parameters, and subtitle
//! tracks the verdict flagged are excluded explicitly.

use super::Invocation;
use crate::classify::{BitrateCeiling, ClassificationVerdict, MediaItem, Policy, ReasonKind};
use crate::config::{Config, ConfigError};
use std::ffi::OsString;
use std::path::Path;

/// Encoder parameters used when a stream has to be re-encoded
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeSettings {
    pub program: String,
    pub crf: u32,
    pub video_encoder: String,
    pub pixel_format: String,
    /// Encoder profile name (lowercase, e.g. "high")
    pub video_profile: String,
    pub video_level: String,
    pub ceiling: BitrateCeiling,
    pub max_framerate: Option<f64>,
    pub audio_encoder: String,
    pub audio_bitrate_kbps: u32,
    pub sample_rate: u32,
    pub max_channels: u32,
    /// Output muxer passed to `-f`
    pub muxer: String,
}

impl TranscodeSettings {
    pub fn from_config(cfg: &Config, policy: &Policy) -> Result<Self, ConfigError> {
        Ok(Self {
            program: "ffmpeg".to_string(),
            crf: cfg.video.crf.ok_or(ConfigError::Missing("video.crf"))?,
            video_encoder: cfg.video.encoder.clone(),
            pixel_format: cfg.video.pixel_format.clone(),
            video_profile: cfg.video.profile.to_lowercase(),
            video_level: cfg.video.level.clone(),
            ceiling: policy.video_bitrate,
            max_framerate: policy.max_framerate,
            audio_encoder: cfg.audio.codec.clone(),
            audio_bitrate_kbps: cfg.audio.encode_bitrate_kbps,
            sample_rate: cfg.audio.sample_rate,
            max_channels: cfg.audio.max_channels,
            muxer: cfg.container.format.clone(),
        })
    }
}

/// What happens to the video streams
#[derive(Debug, Clone, PartialEq)]
pub enum VideoAction {
    Copy,
    Encode {
        crf: u32,
        /// VBV ceiling in kbps, when the resolution allows computing one
        maxrate_kbps: Option<u32>,
        /// Output framerate cap
        framerate: Option<f64>,
    },
}

/// What happens to the audio streams
#[derive(Debug, Clone, PartialEq)]
pub enum AudioAction {
    Copy,
    Encode { channels: u32 },
}

/// Per-stream decisions for one file
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodePlan {
    pub video: VideoAction,
    pub audio: AudioAction,
    /// Stream indexes dropped from the output
    pub excluded_subtitles: Vec<u32>,
}

impl TranscodePlan {
    pub fn from_verdict(
        item: &MediaItem,
        verdict: &ClassificationVerdict,
        settings: &TranscodeSettings,
    ) -> Self {
        let video = if verdict.needs_video_convert() {
            let limit_bps = match (settings.ceiling, item.resolution()) {
                (BitrateCeiling::Absolute { bits_per_sec }, _) => Some(bits_per_sec),
                (ceiling, Some(resolution)) => Some(ceiling.limit_for(resolution)),
                _ => None,
            };
            VideoAction::Encode {
                crf: settings.crf,
                maxrate_kbps: limit_bps
                    .map(|bps| (bps / 1000.0).round())
                    .filter(|kbps| kbps.is_finite() && *kbps >= 1.0)
                    .map(|kbps| kbps as u32),
                framerate: if verdict.has(ReasonKind::Framerate) {
                    settings.max_framerate
                } else {
                    None
                },
            }
        } else {
            VideoAction::Copy
        };

        let audio = if verdict.needs_audio_convert() {
            AudioAction::Encode {
                channels: item.audio_channels().clamp(1, settings.max_channels.max(1)),
            }
        } else {
            AudioAction::Copy
        };

        Self {
            video,
            audio,
            excluded_subtitles: verdict.excluded_subtitles(),
        }
    }

    /// True when nothing is re-encoded (a pure remux).
    pub fn is_stream_copy(&self) -> bool {
        self.video == VideoAction::Copy && self.audio == AudioAction::Copy
    }
}

/// Build the ffmpeg invocation for a plan
///
/// Creates an invocation configured with:
/// - Input path and an explicit map for every stream kind
/// - Copy or re-encode options per stream kind
/// - Exclusions for flagged subtitle tracks
/// - Output muxer and faststart flag
pub fn build_transcode_invocation(
    plan: &TranscodePlan,
    input: &Path,
    output: &Path,
    settings: &TranscodeSettings,
) -> Invocation {
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |values: &[&str]| args.extend(values.iter().map(OsString::from));

    push(&["-nostdin", "-y", "-v", "warning", "-fflags", "+genpts", "-i"]);
    args.push(input.as_os_str().to_owned());

    let mut push = |values: &[String]| args.extend(values.iter().map(OsString::from));

    push(&["-map".into(), "0:V?".into()]);
    match &plan.video {
        VideoAction::Copy => push(&["-c:v".into(), "copy".into()]),
        VideoAction::Encode {
            crf,
            maxrate_kbps,
            framerate,
        } => {
            push(&[
                "-c:v".into(),
                settings.video_encoder.clone(),
                "-crf".into(),
                crf.to_string(),
                "-pix_fmt".into(),
                settings.pixel_format.clone(),
                "-profile:v".into(),
                settings.video_profile.clone(),
                "-level:v".into(),
                settings.video_level.clone(),
            ]);
            if let Some(kbps) = maxrate_kbps {
                push(&[
                    "-maxrate".into(),
                    format!("{}k", kbps),
                    "-bufsize".into(),
                    format!("{}k", kbps.saturating_mul(2)),
                ]);
            }
            if let Some(fps) = framerate {
                push(&["-r".into(), format!("{}", fps)]);
            }
        }
    }

    push(&["-map".into(), "0:a?".into()]);
    match &plan.audio {
        AudioAction::Copy => push(&["-c:a".into(), "copy".into()]),
        AudioAction::Encode { channels } => push(&[
            "-c:a".into(),
            settings.audio_encoder.clone(),
            "-ar".into(),
            settings.sample_rate.to_string(),
            "-b:a".into(),
            format!("{}k", settings.audio_bitrate_kbps),
            "-ac".into(),
            channels.to_string(),
        ]),
    }

    push(&[
        "-map".into(),
        "0:s?".into(),
        "-c:s".into(),
        "copy".into(),
    ]);
    for index in &plan.excluded_subtitles {
        push(&["-map".into(), format!("-0:{}", index)]);
    }

    push(&[
        "-movflags".into(),
        "+faststart".into(),
        "-f".into(),
        settings.muxer.clone(),
    ]);
    args.push(output.as_os_str().to_owned());

    Invocation {
        program: settings.program.clone(),
        args,
        output: output.to_path_buf(),
    }
}
