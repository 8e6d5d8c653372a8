//! Settings: tuning constants and service endpoints, loaded from TOML.
//!
//! Every field has a default, so a missing file or a partial file both
//! work. Lookup order: `$LULLABY_CONFIG`, then `settings.toml` in the
//! platform config directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "LULLABY_CONFIG";

/// Default cap on a composed segment's span, in seconds.
pub const MAX_SEGMENT_SECONDS: f64 = 600.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub audio: AudioSettings,
    pub scheduler: SchedulerSettings,
    pub adaptive: AdaptiveSettings,
    pub service: ServiceSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: f64,
    /// Time constant for every user-driven gain change, in seconds.
    pub ramp_time_constant: f64,
    /// Master fade length when everything stops, in seconds.
    pub stop_fade: f64,
    /// Fade applied to a binaural pair or noise source being replaced or
    /// stopped on its own.
    pub handoff_fade: f64,
    pub noise_buffer_seconds: f64,
    /// How far ahead of the audio clock a new segment is scheduled.
    pub schedule_lead: f64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        AudioSettings {
            sample_rate: 48000.0,
            ramp_time_constant: 0.1,
            stop_fade: 0.5,
            handoff_fade: 0.02,
            noise_buffer_seconds: 2.0,
            schedule_lead: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Segment length used when a composition has no notes, or a span
    /// that cannot be waited on.
    pub fallback_segment_seconds: f64,
    /// Longest segment span accepted from the composer.
    pub max_segment_seconds: f64,
    pub retry_backoff_ms: u64,
}

impl SchedulerSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            fallback_segment_seconds: 15.0,
            max_segment_seconds: MAX_SEGMENT_SECONDS,
            retry_backoff_ms: 1000,
        }
    }
}

/// Ambient loudness → noise boost mapping. Loudness is the mean of the
/// analyser's byte spectrum, `0..=255`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSettings {
    pub poll_interval_ms: u64,
    /// Loudness at or below this adds no boost.
    pub floor: f64,
    /// Loudness above the floor that maps to a boost of 1.0 before capping.
    pub span: f64,
    pub max_boost: f64,
    /// Upper bound on base volume plus boost.
    pub ceiling: f64,
    pub time_constant: f64,
    pub fft_size: usize,
}

impl AdaptiveSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for AdaptiveSettings {
    fn default() -> Self {
        AdaptiveSettings {
            poll_interval_ms: 500,
            floor: 20.0,
            span: 200.0,
            max_boost: 0.3,
            ceiling: 0.8,
            time_constant: 0.5,
            fft_size: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Load from `$LULLABY_CONFIG` or the platform config directory.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn load_default() -> Result<Self, ConfigError> {
        match default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

/// Where settings are read from when no explicit path is given.
#[cfg(not(target_arch = "wasm32"))]
pub fn default_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    ProjectDirs::from("", "", "lullaby").map(|dirs| dirs.config_dir().join("settings.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let s = Settings::from_toml(
            r#"
[adaptive]
ceiling = 0.7

[scheduler]
retry_backoff_ms = 250
"#,
        )
        .unwrap();
        assert_eq!(s.adaptive.ceiling, 0.7);
        assert_eq!(s.adaptive.floor, 20.0);
        assert_eq!(s.scheduler.retry_backoff(), Duration::from_millis(250));
        assert_eq!(s.audio, AudioSettings::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(matches!(
            Settings::from_toml("[audio\nsample_rate = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[audio]\nsample_rate = 44100.0\n").unwrap();
        assert_eq!(Settings::load(&path).unwrap().audio.sample_rate, 44100.0);
    }
}
