//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A required value was neither in the file nor in the environment
    Missing(&'static str),
    /// A value was present but could not be used
    Invalid { field: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Missing(field) => write!(f, "Missing required setting: {}", field),
            ConfigError::Invalid { field, value } => {
                write!(f, "Invalid value for {}: {:?}", field, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Directory roles of the staging pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root the upstream downloader writes into (one subdirectory per category)
    #[serde(default = "default_incoming_root")]
    pub incoming_root: PathBuf,
    /// Scratch root for in-flight external work, purged on startup
    #[serde(default = "default_temporary_root")]
    pub temporary_root: PathBuf,
    /// Finished conversions waiting for publication
    #[serde(default = "default_converted_root")]
    pub converted_root: PathBuf,
    /// Loudness-normalized artifacts (only used when normalization is enabled)
    #[serde(default)]
    pub normalized_root: Option<PathBuf>,
    /// Output root watched by the downstream consumer
    #[serde(default = "default_published_root")]
    pub published_root: PathBuf,
    /// Delivery categories, each a subdirectory of every root
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
}

fn default_incoming_root() -> PathBuf {
    PathBuf::from("/downloads/complete")
}

fn default_temporary_root() -> PathBuf {
    PathBuf::from("/downloads/converting")
}

fn default_converted_root() -> PathBuf {
    PathBuf::from("/downloads/converted")
}

fn default_published_root() -> PathBuf {
    PathBuf::from("/downloads/optimized")
}

fn default_categories() -> Vec<String> {
    vec!["movies".to_string(), "tv".to_string()]
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            incoming_root: default_incoming_root(),
            temporary_root: default_temporary_root(),
            converted_root: default_converted_root(),
            normalized_root: None,
            published_root: default_published_root(),
            categories: default_categories(),
        }
    }
}

/// How the video bitrate ceiling is derived
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BitrateMode {
    /// `max_bitrate_kbps` applies at the reference resolution and scales with pixel count
    #[default]
    PerPixel,
    /// `max_bitrate_kbps` applies to every resolution
    Absolute,
}

/// Target video profile and encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoConfig {
    /// Accepted codec as reported by the prober (default "h264")
    #[serde(default = "default_video_codec")]
    pub codec: String,
    /// Accepted profile prefix (default "High")
    #[serde(default = "default_video_profile")]
    pub profile: String,
    /// Constant rate factor for re-encodes (required)
    #[serde(default)]
    pub crf: Option<u32>,
    /// Bitrate ceiling in kbps (required)
    #[serde(default)]
    pub max_bitrate_kbps: Option<u32>,
    /// Width the ceiling is expressed for (required in per-pixel mode)
    #[serde(default)]
    pub reference_width: Option<u32>,
    /// Height the ceiling is expressed for (required in per-pixel mode)
    #[serde(default)]
    pub reference_height: Option<u32>,
    #[serde(default)]
    pub bitrate_mode: BitrateMode,
    /// Framerate ceiling; unset disables the framerate rule
    #[serde(default)]
    pub max_framerate: Option<f64>,
    #[serde(default = "default_video_encoder")]
    pub encoder: String,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    #[serde(default = "default_video_level")]
    pub level: String,
}

fn default_video_codec() -> String {
    "h264".to_string()
}

fn default_video_profile() -> String {
    "High".to_string()
}

fn default_video_encoder() -> String {
    "libx264".to_string()
}

fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

fn default_video_level() -> String {
    "4.1".to_string()
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: default_video_codec(),
            profile: default_video_profile(),
            crf: None,
            max_bitrate_kbps: None,
            reference_width: None,
            reference_height: None,
            bitrate_mode: BitrateMode::default(),
            max_framerate: None,
            encoder: default_video_encoder(),
            pixel_format: default_pixel_format(),
            level: default_video_level(),
        }
    }
}

/// Target audio profile and encoder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    #[serde(default = "default_audio_codec")]
    pub codec: String,
    #[serde(default = "default_audio_profile")]
    pub profile: String,
    /// Bitrate ceiling in kbps (required)
    #[serde(default)]
    pub max_bitrate_kbps: Option<u32>,
    #[serde(default = "default_max_channels")]
    pub max_channels: u32,
    /// Bitrate used when audio is re-encoded
    #[serde(default = "default_encode_bitrate_kbps")]
    pub encode_bitrate_kbps: u32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_profile() -> String {
    "LC".to_string()
}

fn default_max_channels() -> u32 {
    2
}

fn default_encode_bitrate_kbps() -> u32 {
    128
}

fn default_sample_rate() -> u32 {
    44100
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            codec: default_audio_codec(),
            profile: default_audio_profile(),
            max_bitrate_kbps: None,
            max_channels: default_max_channels(),
            encode_bitrate_kbps: default_encode_bitrate_kbps(),
            sample_rate: default_sample_rate(),
        }
    }
}

/// Target container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    /// Container kind as reported by the prober (default "matroska")
    #[serde(default = "default_container_format")]
    pub format: String,
    /// File extension without the dot (default "mkv")
    #[serde(default = "default_container_extension")]
    pub extension: String,
}

fn default_container_format() -> String {
    "matroska".to_string()
}

fn default_container_extension() -> String {
    "mkv".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            format: default_container_format(),
            extension: default_container_extension(),
        }
    }
}

/// Subtitle acceptance rules
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtitleConfig {
    #[serde(default = "default_accepted_subtitle_formats")]
    pub accepted_formats: Vec<String>,
}

fn default_accepted_subtitle_formats() -> Vec<String> {
    vec!["subrip".to_string()]
}

impl Default for SubtitleConfig {
    fn default() -> Self {
        Self {
            accepted_formats: default_accepted_subtitle_formats(),
        }
    }
}

/// Polling, debounce and retry cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Idle window required before the intake is scanned
    #[serde(default = "default_quiescence_secs")]
    pub quiescence_secs: u64,
    /// Sleep between attempts of a failed external invocation
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_quiescence_secs() -> u64 {
    30
}

fn default_retry_backoff_secs() -> u64 {
    150
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            quiescence_secs: default_quiescence_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
        }
    }
}

/// Optional loudness normalization stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_normalize_program")]
    pub program: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_encode_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
}

fn default_normalize_program() -> String {
    "ffmpeg-normalize".to_string()
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_normalize_program(),
            audio_codec: default_audio_codec(),
            audio_bitrate_kbps: default_encode_bitrate_kbps(),
        }
    }
}

/// Status endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> String {
    "127.0.0.1:7979".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub subtitles: SubtitleConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Read and parse one environment variable, `Ok(None)` when unset.
fn env_parse<T: FromStr>(key: &str, field: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { field, value: val }),
        Err(_) => Ok(None),
    }
}

fn parse_bool(field: &'static str, val: &str) -> Result<bool, ConfigError> {
    // Accept "true", "1", "yes" as true; "false", "0", "no" as false
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            field,
            value: val.to_string(),
        }),
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - INGEST_VIDEO_CRF -> video.crf
    /// - INGEST_VIDEO_MAX_BITRATE -> video.max_bitrate_kbps
    /// - INGEST_REFERENCE_WIDTH / INGEST_REFERENCE_HEIGHT -> video.reference_*
    /// - INGEST_AUDIO_MAX_BITRATE -> audio.max_bitrate_kbps
    /// - INGEST_CATEGORIES (comma separated) -> paths.categories
    /// - INGEST_INCOMING_ROOT / INGEST_PUBLISHED_ROOT -> paths.*
    /// - INGEST_NORMALIZE_ENABLED -> normalize.enabled
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(crf) = env_parse::<u32>("INGEST_VIDEO_CRF", "video.crf")? {
            self.video.crf = Some(crf);
        }

        if let Some(kbps) = env_parse::<u32>("INGEST_VIDEO_MAX_BITRATE", "video.max_bitrate_kbps")? {
            self.video.max_bitrate_kbps = Some(kbps);
        }

        if let Some(w) = env_parse::<u32>("INGEST_REFERENCE_WIDTH", "video.reference_width")? {
            self.video.reference_width = Some(w);
        }

        if let Some(h) = env_parse::<u32>("INGEST_REFERENCE_HEIGHT", "video.reference_height")? {
            self.video.reference_height = Some(h);
        }

        if let Some(kbps) = env_parse::<u32>("INGEST_AUDIO_MAX_BITRATE", "audio.max_bitrate_kbps")? {
            self.audio.max_bitrate_kbps = Some(kbps);
        }

        if let Ok(val) = env::var("INGEST_CATEGORIES") {
            self.paths.categories = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(val) = env::var("INGEST_INCOMING_ROOT") {
            self.paths.incoming_root = PathBuf::from(val);
        }

        if let Ok(val) = env::var("INGEST_PUBLISHED_ROOT") {
            self.paths.published_root = PathBuf::from(val);
        }

        if let Ok(val) = env::var("INGEST_NORMALIZE_ENABLED") {
            self.normalize.enabled = parse_bool("normalize.enabled", &val)?;
        }

        Ok(())
    }

    /// Check that every value the pipeline needs at runtime is present and usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let crf = self.video.crf.ok_or(ConfigError::Missing("video.crf"))?;
        if crf > 51 {
            return Err(ConfigError::Invalid {
                field: "video.crf",
                value: crf.to_string(),
            });
        }

        let max_kbps = self
            .video
            .max_bitrate_kbps
            .ok_or(ConfigError::Missing("video.max_bitrate_kbps"))?;
        if max_kbps == 0 {
            return Err(ConfigError::Invalid {
                field: "video.max_bitrate_kbps",
                value: "0".to_string(),
            });
        }

        if self.video.bitrate_mode == BitrateMode::PerPixel {
            let width = self
                .video
                .reference_width
                .ok_or(ConfigError::Missing("video.reference_width"))?;
            let height = self
                .video
                .reference_height
                .ok_or(ConfigError::Missing("video.reference_height"))?;
            if width == 0 || height == 0 {
                return Err(ConfigError::Invalid {
                    field: "video.reference_width",
                    value: format!("{}x{}", width, height),
                });
            }
        }

        self.audio
            .max_bitrate_kbps
            .ok_or(ConfigError::Missing("audio.max_bitrate_kbps"))?;

        if self.paths.categories.is_empty() {
            return Err(ConfigError::Missing("paths.categories"));
        }

        if self.normalize.enabled && self.paths.normalized_root.is_none() {
            return Err(ConfigError::Missing("paths.normalized_root"));
        }

        if self.timing.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "timing.poll_interval_secs",
                value: "0".to_string(),
            });
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "INGEST_VIDEO_CRF",
            "INGEST_VIDEO_MAX_BITRATE",
            "INGEST_REFERENCE_WIDTH",
            "INGEST_REFERENCE_HEIGHT",
            "INGEST_AUDIO_MAX_BITRATE",
            "INGEST_CATEGORIES",
            "INGEST_INCOMING_ROOT",
            "INGEST_PUBLISHED_ROOT",
            "INGEST_NORMALIZE_ENABLED",
        ] {
            env::remove_var(key);
        }
    }

    const REQUIRED: &str = r#"
[video]
crf = 22
max_bitrate_kbps = 8000
reference_width = 1920
reference_height = 1080

[audio]
max_bitrate_kbps = 256
"#;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_thresholds(
            crf in 0u32..52,
            video_kbps in 1u32..100_000,
            width in 1u32..8000,
            height in 1u32..4500,
            audio_kbps in 1u32..2000,
            max_channels in 1u32..9,
            normalize in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[paths]
normalized_root = "/downloads/normalized"

[video]
crf = {}
max_bitrate_kbps = {}
reference_width = {}
reference_height = {}

[audio]
max_bitrate_kbps = {}
max_channels = {}

[normalize]
enabled = {}
"#,
                crf, video_kbps, width, height, audio_kbps, max_channels, normalize
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.video.crf, Some(crf));
            prop_assert_eq!(config.video.max_bitrate_kbps, Some(video_kbps));
            prop_assert_eq!(config.video.reference_width, Some(width));
            prop_assert_eq!(config.video.reference_height, Some(height));
            prop_assert_eq!(config.audio.max_bitrate_kbps, Some(audio_kbps));
            prop_assert_eq!(config.audio.max_channels, max_channels);
            prop_assert_eq!(config.normalize.enabled, normalize);
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_video_crf(
            initial in 0u32..52,
            override_crf in 0u32..52,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[video]\ncrf = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("INGEST_VIDEO_CRF", override_crf.to_string());
            let result = config.apply_env_overrides();
            clear_env_vars();

            prop_assert!(result.is_ok());
            prop_assert_eq!(config.video.crf, Some(override_crf));
        }

        #[test]
        fn prop_env_overrides_categories(
            categories in prop::collection::vec("[a-z]{1,8}", 1..4),
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();
            env::set_var("INGEST_CATEGORIES", categories.join(", "));
            let result = config.apply_env_overrides();
            clear_env_vars();

            prop_assert!(result.is_ok());
            prop_assert_eq!(config.paths.categories, categories);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.paths.incoming_root, PathBuf::from("/downloads/complete"));
        assert_eq!(config.paths.categories, vec!["movies", "tv"]);
        assert_eq!(config.paths.normalized_root, None);
        assert_eq!(config.video.codec, "h264");
        assert_eq!(config.video.profile, "High");
        assert_eq!(config.video.bitrate_mode, BitrateMode::PerPixel);
        assert_eq!(config.audio.max_channels, 2);
        assert_eq!(config.container.extension, "mkv");
        assert_eq!(config.timing.poll_interval_secs, 10);
        assert_eq!(config.timing.quiescence_secs, 30);
        assert_eq!(config.timing.retry_backoff_secs, 150);
        assert!(!config.normalize.enabled);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_missing_thresholds_are_fatal() {
        let config = Config::parse_toml("").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Missing("video.crf"))));

        let config = Config::parse_toml("[video]\ncrf = 20\nmax_bitrate_kbps = 8000\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("video.reference_width"))
        ));

        let config = Config::parse_toml(
            "[video]\ncrf = 20\nmax_bitrate_kbps = 8000\nreference_width = 1920\nreference_height = 1080\n",
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("audio.max_bitrate_kbps"))
        ));
    }

    #[test]
    fn test_absolute_mode_needs_no_reference_resolution() {
        let toml_str = r#"
[video]
crf = 20
max_bitrate_kbps = 8000
bitrate_mode = "absolute"

[audio]
max_bitrate_kbps = 256
"#;
        let config = Config::parse_toml(toml_str).unwrap();
        assert_eq!(config.video.bitrate_mode, BitrateMode::Absolute);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_normalize_requires_normalized_root() {
        let toml_str = format!("{}\n[normalize]\nenabled = true\n", REQUIRED);
        let config = Config::parse_toml(&toml_str).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("paths.normalized_root"))
        ));
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::parse_toml(REQUIRED).unwrap();
        env::set_var("INGEST_AUDIO_MAX_BITRATE", "lots");
        let result = config.apply_env_overrides();
        clear_env_vars();

        match result {
            Err(ConfigError::Invalid { field, value }) => {
                assert_eq!(field, "audio.max_bitrate_kbps");
                assert_eq!(value, "lots");
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_env_fills_required_thresholds() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("INGEST_VIDEO_CRF", "23");
        env::set_var("INGEST_VIDEO_MAX_BITRATE", "6000");
        env::set_var("INGEST_REFERENCE_WIDTH", "1920");
        env::set_var("INGEST_REFERENCE_HEIGHT", "1080");
        env::set_var("INGEST_AUDIO_MAX_BITRATE", "192");
        env::set_var("INGEST_NORMALIZE_ENABLED", "no");
        let result = config.apply_env_overrides();
        clear_env_vars();

        assert!(result.is_ok());
        assert!(config.validate().is_ok());
        assert_eq!(config.video.crf, Some(23));
        assert_eq!(config.audio.max_bitrate_kbps, Some(192));
        assert!(!config.normalize.enabled);
    }
}
