//! Classifier module for deciding what a media file needs before delivery.
//!
//! A probed file becomes an immutable [`MediaItem`]; a [`Policy`] turns that item
//! into a [`ClassificationVerdict`], the set of reasons it fails the delivery
//! profile. Classification never touches the filesystem.
//!
//! Unknown values fail closed: a missing bitrate is treated as infinite and a
//! missing resolution as maximally over budget, so an under-described file is
//! always converted rather than published as-is.

use crate::config::{BitrateMode, Config, ConfigError};
use crate::probe::{BitrateFields, ProbeResult};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

/// Channel count assumed when the prober reports none.
const UNKNOWN_CHANNEL_COUNT: u32 = 6;

/// How the video bitrate ceiling is computed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BitrateCeiling {
    /// Ceiling scales with the pixel count of the track.
    PerPixel { bits_per_pixel: f64 },
    /// One ceiling for every resolution.
    Absolute { bits_per_sec: f64 },
}

impl BitrateCeiling {
    /// Ceiling in bits/sec for a `(height, width)` resolution.
    pub fn limit_for(&self, resolution: (u32, u32)) -> f64 {
        match *self {
            BitrateCeiling::PerPixel { bits_per_pixel } => {
                bits_per_pixel * resolution.0 as f64 * resolution.1 as f64
            }
            BitrateCeiling::Absolute { bits_per_sec } => bits_per_sec,
        }
    }
}

/// Delivery profile thresholds.
///
/// The rule shapes are fixed; the values come from configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub video_codec: String,
    /// Accepted profile prefix ("High" accepts "High 10").
    pub video_profile: String,
    pub video_bitrate: BitrateCeiling,
    /// Framerate ceiling; `None` disables the framerate rule.
    pub max_framerate: Option<f64>,
    pub audio_codec: String,
    pub audio_profile: String,
    /// Audio ceiling in bits/sec.
    pub audio_max_bitrate: f64,
    pub max_channels: u32,
    pub container_format: String,
    pub container_extension: String,
    pub accepted_subtitle_formats: Vec<String>,
}

impl Policy {
    /// Build the policy from a configuration, failing on missing thresholds.
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let max_video_bps = cfg
            .video
            .max_bitrate_kbps
            .ok_or(ConfigError::Missing("video.max_bitrate_kbps"))? as f64
            * 1000.0;

        let video_bitrate = match cfg.video.bitrate_mode {
            BitrateMode::PerPixel => {
                let width = cfg
                    .video
                    .reference_width
                    .ok_or(ConfigError::Missing("video.reference_width"))?;
                let height = cfg
                    .video
                    .reference_height
                    .ok_or(ConfigError::Missing("video.reference_height"))?;
                if width == 0 || height == 0 {
                    return Err(ConfigError::Invalid {
                        field: "video.reference_width",
                        value: format!("{}x{}", width, height),
                    });
                }
                BitrateCeiling::PerPixel {
                    bits_per_pixel: max_video_bps / (width as f64 * height as f64),
                }
            }
            BitrateMode::Absolute => BitrateCeiling::Absolute {
                bits_per_sec: max_video_bps,
            },
        };

        let audio_max_bitrate = cfg
            .audio
            .max_bitrate_kbps
            .ok_or(ConfigError::Missing("audio.max_bitrate_kbps"))? as f64
            * 1000.0;

        Ok(Self {
            video_codec: cfg.video.codec.clone(),
            video_profile: cfg.video.profile.clone(),
            video_bitrate,
            max_framerate: cfg.video.max_framerate,
            audio_codec: cfg.audio.codec.clone(),
            audio_profile: cfg.audio.profile.clone(),
            audio_max_bitrate,
            max_channels: cfg.audio.max_channels,
            container_format: cfg.container.format.clone(),
            container_extension: cfg.container.extension.clone(),
            accepted_subtitle_formats: cfg.subtitles.accepted_formats.clone(),
        })
    }

    /// Compute the verdict for an item. Pure: same item, same verdict.
    pub fn evaluate(&self, item: &MediaItem) -> ClassificationVerdict {
        let mut reasons = Vec::new();

        let codec_ok = item
            .video_codec
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(&self.video_codec));
        let profile_ok = item
            .video_profile
            .as_deref()
            .is_some_and(|p| starts_with_ignore_case(p, &self.video_profile));
        if !codec_ok || !profile_ok {
            reasons.push(Reason::VideoCodec {
                codec: item.video_codec.clone(),
                profile: item.video_profile.clone(),
            });
        }

        match item.resolution {
            Some(resolution) => {
                let limit = self.video_bitrate.limit_for(resolution);
                if item.video_bitrate > limit {
                    reasons.push(Reason::VideoBitrate {
                        measured_bps: item.video_bitrate,
                        limit_bps: limit,
                        resolution: Some(resolution),
                    });
                }
            }
            None => reasons.push(Reason::VideoBitrate {
                measured_bps: item.video_bitrate,
                limit_bps: 0.0,
                resolution: None,
            }),
        }

        if let (Some(max), Some(fps)) = (self.max_framerate, item.framerate) {
            if fps > max {
                reasons.push(Reason::Framerate { measured: fps, max });
            }
        }

        // A file without audio has nothing to convert on the audio side
        if item.has_audio() {
            let codec_ok = item
                .audio_codec
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(&self.audio_codec));
            let profile_ok = item
                .audio_profile
                .as_deref()
                .is_some_and(|p| p.eq_ignore_ascii_case(&self.audio_profile));
            if !codec_ok || !profile_ok {
                reasons.push(Reason::AudioCodec {
                    codec: item.audio_codec.clone(),
                    profile: item.audio_profile.clone(),
                });
            }

            if item.audio_bitrate > self.audio_max_bitrate {
                reasons.push(Reason::AudioBitrate {
                    measured_bps: item.audio_bitrate,
                    limit_bps: self.audio_max_bitrate,
                });
            }

            if item.audio_channels > self.max_channels {
                reasons.push(Reason::AudioChannels {
                    channels: item.audio_channels,
                    max: self.max_channels,
                });
            }
        }

        let container_ok = item
            .container
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&self.container_format));
        let extension = item.extension();
        let extension_ok = extension
            .as_deref()
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.container_extension));
        if !container_ok || !extension_ok {
            reasons.push(Reason::Container {
                container: item.container.clone(),
                extension,
            });
        }

        let bad_tracks: Vec<BadSubtitle> = item
            .subtitles
            .iter()
            .filter(|s| {
                !self
                    .accepted_subtitle_formats
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(&s.format))
            })
            .filter_map(|s| {
                s.index.map(|index| BadSubtitle {
                    index,
                    format: s.format.clone(),
                })
            })
            .collect();
        if !bad_tracks.is_empty() {
            reasons.push(Reason::BadSubtitle { tracks: bad_tracks });
        }

        ClassificationVerdict { reasons }
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Best-known bitrate in bits/sec, infinite when nothing usable was reported.
///
/// Fallback order: stream-declared, container-overall, nominal, then
/// `stream_size_bytes * 8000 / duration_ms`.
pub fn estimate_bitrate(fields: &BitrateFields) -> f64 {
    let usable = |v: Option<f64>| v.filter(|b| b.is_finite() && *b > 0.0);

    usable(fields.declared)
        .or_else(|| usable(fields.container_overall))
        .or_else(|| usable(fields.nominal))
        .or_else(|| match (fields.stream_size_bytes, fields.duration_ms) {
            (Some(size), Some(duration)) if duration > 0.0 => {
                usable(Some(size as f64 * 8000.0 / duration))
            }
            _ => None,
        })
        .unwrap_or(f64::INFINITY)
}

/// A subtitle track as seen by the classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleInfo {
    pub index: Option<u32>,
    pub format: String,
}

/// Immutable description of one probed media file.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    relative_path: PathBuf,
    container: Vec<String>,
    video_codec: Option<String>,
    video_profile: Option<String>,
    resolution: Option<(u32, u32)>,
    video_bitrate: f64,
    framerate: Option<f64>,
    audio_codec: Option<String>,
    audio_profile: Option<String>,
    audio_bitrate: f64,
    audio_channels: u32,
    audio_tracks: usize,
    subtitles: Vec<SubtitleInfo>,
}

impl MediaItem {
    /// Derive every attribute from probe output. The first video and first audio
    /// track decide the item's attributes.
    pub fn from_probe(relative_path: &Path, probe: &ProbeResult) -> Self {
        let video = probe.video_tracks.first();
        let audio = probe.audio_tracks.first();

        let resolution = video.and_then(|v| match (v.height, v.width) {
            (Some(h), Some(w)) if h > 0 && w > 0 => Some((h, w)),
            _ => None,
        });

        Self {
            relative_path: relative_path.to_path_buf(),
            container: probe.container.clone(),
            video_codec: video.map(|v| v.codec.clone()).filter(|c| !c.is_empty()),
            video_profile: video.and_then(|v| v.profile.clone()),
            resolution,
            video_bitrate: video
                .map(|v| estimate_bitrate(&v.bitrate))
                .unwrap_or(f64::INFINITY),
            framerate: video.and_then(|v| v.framerate),
            audio_codec: audio.map(|a| a.codec.clone()),
            audio_profile: audio.and_then(|a| a.profile.clone()),
            audio_bitrate: audio
                .map(|a| estimate_bitrate(&a.bitrate))
                .unwrap_or(f64::INFINITY),
            audio_channels: audio
                .map(|a| a.channels.unwrap_or(UNKNOWN_CHANNEL_COUNT))
                .unwrap_or(0),
            audio_tracks: probe.audio_tracks.len(),
            subtitles: probe
                .subtitle_tracks
                .iter()
                .map(|s| SubtitleInfo {
                    index: s.index,
                    format: s.format.clone(),
                })
                .collect(),
        }
    }

    /// Path relative to the incoming root.
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    pub fn container(&self) -> &[String] {
        &self.container
    }

    pub fn extension(&self) -> Option<String> {
        self.relative_path
            .extension()
            .and_then(|e| e.to_str())
            .map(String::from)
    }

    pub fn video_codec(&self) -> Option<&str> {
        self.video_codec.as_deref()
    }

    pub fn video_profile(&self) -> Option<&str> {
        self.video_profile.as_deref()
    }

    /// `(height, width)` of the first video track.
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.resolution
    }

    /// Video bitrate in bits/sec, infinite when unknown.
    pub fn video_bitrate(&self) -> f64 {
        self.video_bitrate
    }

    pub fn framerate(&self) -> Option<f64> {
        self.framerate
    }

    pub fn audio_codec(&self) -> Option<&str> {
        self.audio_codec.as_deref()
    }

    pub fn audio_profile(&self) -> Option<&str> {
        self.audio_profile.as_deref()
    }

    /// Audio bitrate in bits/sec, infinite when unknown.
    pub fn audio_bitrate(&self) -> f64 {
        self.audio_bitrate
    }

    pub fn audio_channels(&self) -> u32 {
        self.audio_channels
    }

    pub fn has_audio(&self) -> bool {
        self.audio_tracks > 0
    }

    pub fn subtitles(&self) -> &[SubtitleInfo] {
        &self.subtitles
    }
}

/// Discriminant of a [`Reason`], ordered the way verdicts list them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReasonKind {
    VideoCodec,
    VideoBitrate,
    Framerate,
    AudioCodec,
    AudioBitrate,
    AudioChannels,
    Container,
    BadSubtitle,
}

impl ReasonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonKind::VideoCodec => "video_codec",
            ReasonKind::VideoBitrate => "video_bitrate",
            ReasonKind::Framerate => "framerate",
            ReasonKind::AudioCodec => "audio_codec",
            ReasonKind::AudioBitrate => "audio_bitrate",
            ReasonKind::AudioChannels => "audio_channels",
            ReasonKind::Container => "container",
            ReasonKind::BadSubtitle => "bad_subtitle",
        }
    }
}

impl fmt::Display for ReasonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subtitle track to drop at convert time.
#[derive(Debug, Clone, PartialEq)]
pub struct BadSubtitle {
    pub index: u32,
    pub format: String,
}

/// One policy violation, with the measured values that caused it.
#[derive(Debug, Clone, PartialEq)]
pub enum Reason {
    VideoCodec {
        codec: Option<String>,
        profile: Option<String>,
    },
    VideoBitrate {
        measured_bps: f64,
        limit_bps: f64,
        resolution: Option<(u32, u32)>,
    },
    Framerate {
        measured: f64,
        max: f64,
    },
    AudioCodec {
        codec: Option<String>,
        profile: Option<String>,
    },
    AudioBitrate {
        measured_bps: f64,
        limit_bps: f64,
    },
    AudioChannels {
        channels: u32,
        max: u32,
    },
    Container {
        container: Vec<String>,
        extension: Option<String>,
    },
    BadSubtitle {
        tracks: Vec<BadSubtitle>,
    },
}

impl Reason {
    pub fn kind(&self) -> ReasonKind {
        match self {
            Reason::VideoCodec { .. } => ReasonKind::VideoCodec,
            Reason::VideoBitrate { .. } => ReasonKind::VideoBitrate,
            Reason::Framerate { .. } => ReasonKind::Framerate,
            Reason::AudioCodec { .. } => ReasonKind::AudioCodec,
            Reason::AudioBitrate { .. } => ReasonKind::AudioBitrate,
            Reason::AudioChannels { .. } => ReasonKind::AudioChannels,
            Reason::Container { .. } => ReasonKind::Container,
            Reason::BadSubtitle { .. } => ReasonKind::BadSubtitle,
        }
    }
}

fn kbps(bps: f64) -> String {
    if bps.is_finite() {
        format!("{:.0} kbps", bps / 1000.0)
    } else {
        "unknown".to_string()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::VideoCodec { codec, profile } | Reason::AudioCodec { codec, profile } => write!(
                f,
                "{}: {}/{}",
                self.kind(),
                codec.as_deref().unwrap_or("none"),
                profile.as_deref().unwrap_or("none")
            ),
            Reason::VideoBitrate {
                measured_bps,
                limit_bps,
                resolution,
            } => match resolution {
                Some((h, w)) => write!(
                    f,
                    "video_bitrate: {} > {} at {}x{}",
                    kbps(*measured_bps),
                    kbps(*limit_bps),
                    w,
                    h
                ),
                None => write!(f, "video_bitrate: {} at unknown resolution", kbps(*measured_bps)),
            },
            Reason::Framerate { measured, max } => {
                write!(f, "framerate: {:.3} > {:.3}", measured, max)
            }
            Reason::AudioBitrate {
                measured_bps,
                limit_bps,
            } => write!(f, "audio_bitrate: {} > {}", kbps(*measured_bps), kbps(*limit_bps)),
            Reason::AudioChannels { channels, max } => {
                write!(f, "audio_channels: {} > {}", channels, max)
            }
            Reason::Container {
                container,
                extension,
            } => write!(
                f,
                "container: {} (.{})",
                container.join(","),
                extension.as_deref().unwrap_or("")
            ),
            Reason::BadSubtitle { tracks } => {
                let ids: Vec<String> = tracks
                    .iter()
                    .map(|t| format!("#{} {}", t.index, t.format))
                    .collect();
                write!(f, "bad_subtitle: {}", ids.join(", "))
            }
        }
    }
}

/// The set of reasons an item fails the policy, at most one per kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationVerdict {
    reasons: Vec<Reason>,
}

impl ClassificationVerdict {
    pub fn reasons(&self) -> &[Reason] {
        &self.reasons
    }

    pub fn kinds(&self) -> BTreeSet<ReasonKind> {
        self.reasons.iter().map(Reason::kind).collect()
    }

    pub fn has(&self, kind: ReasonKind) -> bool {
        self.reasons.iter().any(|r| r.kind() == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }

    pub fn needs_video_convert(&self) -> bool {
        self.has(ReasonKind::VideoCodec)
            || self.has(ReasonKind::VideoBitrate)
            || self.has(ReasonKind::Framerate)
    }

    pub fn needs_audio_convert(&self) -> bool {
        self.has(ReasonKind::AudioCodec)
            || self.has(ReasonKind::AudioBitrate)
            || self.has(ReasonKind::AudioChannels)
    }

    /// Stream indexes of subtitle tracks to exclude from the output.
    pub fn excluded_subtitles(&self) -> Vec<u32> {
        self.reasons
            .iter()
            .filter_map(|r| match r {
                Reason::BadSubtitle { tracks } => Some(tracks.iter().map(|t| t.index)),
                _ => None,
            })
            .flatten()
            .collect()
    }
}

impl fmt::Display for ClassificationVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reasons.is_empty() {
            return f.write_str("compliant");
        }
        let parts: Vec<String> = self.reasons.iter().map(|r| r.to_string()).collect();
        f.write_str(&parts.join("; "))
    }
}

/// Build the item for a probed file and evaluate it against the policy.
pub fn classify(
    relative_path: &Path,
    probe: &ProbeResult,
    policy: &Policy,
) -> (MediaItem, ClassificationVerdict) {
    let item = MediaItem::from_probe(relative_path, probe);
    let verdict = policy.evaluate(&item);
    (item, verdict)
}
