//! Loudness normalization command construction

use super::Invocation;
use crate::config::NormalizeConfig;
use std::ffi::OsString;
use std::path::Path;

/// Settings for the external loudness normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeSettings {
    pub program: String,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
}

impl From<&NormalizeConfig> for NormalizeSettings {
    fn from(cfg: &NormalizeConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            audio_codec: cfg.audio_codec.clone(),
            audio_bitrate_kbps: cfg.audio_bitrate_kbps,
        }
    }
}

/// Build a normalizer invocation reading `input` and writing `output`.
///
/// Video and subtitle streams are passed through by the normalizer; only audio
/// is re-encoded with the configured codec and bitrate.
pub fn build_normalize_invocation(
    input: &Path,
    output: &Path,
    settings: &NormalizeSettings,
) -> Invocation {
    let mut args: Vec<OsString> = vec![input.as_os_str().to_owned(), "-o".into()];
    args.push(output.as_os_str().to_owned());
    args.extend(
        [
            "-f".to_string(),
            "-c:a".to_string(),
            settings.audio_codec.clone(),
            "-b:a".to_string(),
            format!("{}k", settings.audio_bitrate_kbps),
        ]
        .into_iter()
        .map(OsString::from),
    );

    Invocation {
        program: settings.program.clone(),
        args,
        output: output.to_path_buf(),
    }
}
