//! Probe module for reading container and per-track metadata.
//!
//! This module runs ffprobe against a media file and turns its JSON report into
//! a [`ProbeResult`]. Absent fields stay absent: deciding what a missing bitrate
//! or channel count means is the classifier's job, not the prober's.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// True when the probed file no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProbeError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Every bitrate-bearing field a track may report, in bits per second.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BitrateFields {
    /// Bitrate declared by the stream itself.
    pub declared: Option<f64>,
    /// Overall bitrate of the container.
    pub container_overall: Option<f64>,
    /// Nominal (maximum) bitrate.
    pub nominal: Option<f64>,
    /// Size of the stream payload in bytes.
    pub stream_size_bytes: Option<u64>,
    /// Stream duration in milliseconds.
    pub duration_ms: Option<f64>,
}

/// Information about a video track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoTrack {
    /// Stream index inside the container.
    pub index: u32,
    /// Codec name (e.g., "h264", "hevc").
    pub codec: String,
    /// Codec profile (e.g., "High", "Main 10").
    pub profile: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Frames per second.
    pub framerate: Option<f64>,
    pub bitrate: BitrateFields,
}

/// Information about an audio track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioTrack {
    pub index: u32,
    /// Codec name (e.g., "aac", "truehd", "dts").
    pub codec: String,
    /// Codec profile (e.g., "LC", "HE-AAC").
    pub profile: Option<String>,
    pub channels: Option<u32>,
    pub bitrate: BitrateFields,
}

/// Information about a subtitle track.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleTrack {
    /// Track identifier, when the container exposes one.
    pub index: Option<u32>,
    /// Subtitle format (e.g., "subrip", "hdmv_pgs_subtitle").
    pub format: String,
}

/// Result of probing a media file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    /// Container kinds reported for the file (e.g., ["matroska", "webm"]).
    pub container: Vec<String>,
    pub video_tracks: Vec<VideoTrack>,
    pub audio_tracks: Vec<AudioTrack>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
}

/// Source of media metadata.
///
/// Implementations block; callers on the async runtime go through `spawn_blocking`.
pub trait MetadataProber: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError>;
}

/// Prober backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: String,
}

impl FfprobeProber {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self::new("ffprobe")
    }
}

impl MetadataProber for FfprobeProber {
    /// Runs `ffprobe -v quiet -print_format json -show_streams -show_format <path>`
    /// and parses the JSON output.
    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError> {
        // ffprobe is silenced, so surface a vanished file as NotFound ourselves
        std::fs::metadata(path)?;

        let output = Command::new(&self.program)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-show_format",
            ])
            .arg(path)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub index: Option<u32>,
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub profile: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub avg_frame_rate: Option<String>,
        pub r_frame_rate: Option<String>,
        pub bit_rate: Option<String>,
        pub max_bit_rate: Option<String>,
        pub channels: Option<u32>,
        pub duration: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub format_name: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Look up a Matroska statistics tag, which may carry a language suffix (`BPS-eng`).
fn stat_tag<'a>(tags: &'a std::collections::HashMap<String, String>, name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|(k, _)| {
            let upper = k.to_uppercase();
            upper == name || upper.starts_with(&format!("{}-", name))
        })
        .map(|(_, v)| v.as_str())
}

fn parse_number(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
}

/// Parse "num/den" frame rates; a zero denominator means unknown.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let (num, den) = value.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

/// Parse Matroska `DURATION` tags of the form `HH:MM:SS.fffffffff` into milliseconds.
pub fn parse_tag_duration_ms(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(((hours * 60.0 + minutes) * 60.0 + seconds) * 1000.0)
}

fn bitrate_fields(stream: &ffprobe_json::Stream, container_overall: Option<f64>) -> BitrateFields {
    let declared = parse_number(stream.bit_rate.as_deref())
        .or_else(|| parse_number(stat_tag(&stream.tags, "BPS")));

    let duration_ms = parse_number(stream.duration.as_deref())
        .map(|secs| secs * 1000.0)
        .or_else(|| stat_tag(&stream.tags, "DURATION").and_then(parse_tag_duration_ms))
        .filter(|ms| *ms > 0.0);

    BitrateFields {
        declared,
        container_overall,
        nominal: parse_number(stream.max_bit_rate.as_deref()),
        stream_size_bytes: stat_tag(&stream.tags, "NUMBER_OF_BYTES")
            .and_then(|v| v.trim().parse::<u64>().ok()),
        duration_ms,
    }
}

/// Parses ffprobe JSON output into a ProbeResult.
///
/// The container's overall bitrate is offered as a fallback to video tracks only;
/// it says nothing useful about an audio track sharing the file with video.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let (container, overall) = match ffprobe.format {
        Some(format) => (
            format
                .format_name
                .map(|names| names.split(',').map(|n| n.trim().to_string()).collect())
                .unwrap_or_default(),
            parse_number(format.bit_rate.as_deref()),
        ),
        None => (Vec::new(), None),
    };

    let mut result = ProbeResult {
        container,
        ..ProbeResult::default()
    };

    for (position, stream) in streams.iter().enumerate() {
        let codec_type = stream.codec_type.as_deref().unwrap_or("");
        let codec = stream.codec_name.clone().unwrap_or_default();
        let index = stream.index.unwrap_or(position as u32);

        match codec_type {
            "video" => {
                let framerate = stream
                    .avg_frame_rate
                    .as_deref()
                    .and_then(parse_frame_rate)
                    .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate));

                result.video_tracks.push(VideoTrack {
                    index,
                    codec,
                    profile: stream.profile.clone(),
                    width: stream.width.filter(|w| *w > 0),
                    height: stream.height.filter(|h| *h > 0),
                    framerate,
                    bitrate: bitrate_fields(stream, overall),
                });
            }
            "audio" => {
                result.audio_tracks.push(AudioTrack {
                    index,
                    codec,
                    profile: stream.profile.clone(),
                    channels: stream.channels.filter(|c| *c > 0),
                    bitrate: bitrate_fields(stream, None),
                });
            }
            "subtitle" => {
                result.subtitle_tracks.push(SubtitleTrack {
                    index: stream.index,
                    format: codec,
                });
            }
            _ => {}
        }
    }

    Ok(result)
}
