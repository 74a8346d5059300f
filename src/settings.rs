//! Read-only settings snapshot consumed from the external settings store.
//!
//! Only the keys this crate reads are modelled; persistence is somebody
//! else's job. Field names on the wire follow the settings store
//! (`tts_device`, `tts_kokoro_voice`, ...).

use std::path::Path;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TtsError};

/// Default primary voice.
pub const DEFAULT_VOICE: &str = "am_puck";

/// Default speech speed multiplier.
pub const DEFAULT_SPEED: f32 = 1.1;

/// Default remote worker timeout in seconds.
pub const DEFAULT_REMOTE_TIMEOUT_SECS: f64 = 60.0;

/// Settings that drive device selection, voice choice and remote delegation.
///
/// ```rust
/// use tts_dispatch::settings::TtsSettingsBuilder;
///
/// let settings = TtsSettingsBuilder::default()
///     .device_policy("remote")
///     .remote_url("http://gpu-box:8891")
///     .build()?;
/// assert!(settings.is_remote());
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(default, setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct TtsSettings {
    /// Device policy: `auto`, `cpu`, `accelerator:auto`, `accelerator:<n>` or `remote`.
    #[serde(rename = "tts_device")]
    pub device_policy: String,
    #[serde(rename = "tts_kokoro_voice")]
    pub voice: String,
    /// Secondary voice to blend with; empty means no blending.
    #[serde(rename = "tts_kokoro_voice_secondary")]
    pub voice_secondary: String,
    #[serde(rename = "tts_kokoro_speed")]
    pub speed: f32,
    #[serde(rename = "tts_kokoro_remote_url")]
    pub remote_url: String,
    #[serde(rename = "tts_kokoro_remote_token")]
    pub remote_token: String,
    /// Remote request timeout in seconds.
    #[serde(rename = "tts_kokoro_remote_timeout")]
    pub remote_timeout: f64,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            device_policy: "auto".to_string(),
            voice: DEFAULT_VOICE.to_string(),
            voice_secondary: String::new(),
            speed: DEFAULT_SPEED,
            remote_url: String::new(),
            remote_token: String::new(),
            remote_timeout: DEFAULT_REMOTE_TIMEOUT_SECS,
        }
    }
}

impl TtsSettingsBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(speed) = self.speed {
            if !(speed.is_finite() && speed > 0.0) {
                return Err(format!("speed must be positive, got {speed}"));
            }
        }
        if let Some(timeout) = self.remote_timeout {
            if !(timeout > 0.0 && Duration::try_from_secs_f64(timeout).is_ok()) {
                return Err(format!("remote timeout must be a positive number of seconds, got {timeout}"));
            }
        }
        Ok(())
    }
}

impl TtsSettings {
    /// Parse settings from the JSON document kept by the settings store.
    ///
    /// Unknown keys are ignored and missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TtsError::Configuration(format!("invalid settings JSON: {e}")))
    }

    /// Load settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// True when synthesis must be delegated to a remote worker.
    pub fn is_remote(&self) -> bool {
        crate::device::is_remote_policy(&self.device_policy)
    }

    pub fn secondary_voice(&self) -> Option<&str> {
        let voice = self.voice_secondary.trim();
        (!voice.is_empty()).then_some(voice)
    }

    pub fn remote_token(&self) -> Option<&str> {
        let token = self.remote_token.trim();
        (!token.is_empty()).then_some(token)
    }

    /// Remote timeout, falling back to the default for values that are not
    /// a positive, representable number of seconds.
    pub fn remote_timeout(&self) -> Duration {
        let fallback = Duration::from_secs_f64(DEFAULT_REMOTE_TIMEOUT_SECS);
        if self.remote_timeout > 0.0 {
            Duration::try_from_secs_f64(self.remote_timeout).unwrap_or(fallback)
        } else {
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let settings = TtsSettings::from_json("{}").unwrap();
        assert_eq!(settings, TtsSettings::default());
        assert_eq!(settings.voice, "am_puck");
        assert!(!settings.is_remote());
        assert_eq!(settings.remote_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_store_keys() {
        let json = r#"{
            "tts_device": "remote",
            "tts_kokoro_voice": "af_heart",
            "tts_kokoro_voice_secondary": "  ",
            "tts_kokoro_speed": 0.9,
            "tts_kokoro_remote_url": "http://worker:8891/",
            "tts_kokoro_remote_token": "secret",
            "tts_kokoro_remote_timeout": 12.5,
            "unrelated_key": true
        }"#;
        let settings = TtsSettings::from_json(json).unwrap();
        assert!(settings.is_remote());
        assert_eq!(settings.voice, "af_heart");
        assert_eq!(settings.secondary_voice(), None);
        assert_eq!(settings.remote_token(), Some("secret"));
        assert_eq!(settings.remote_timeout(), Duration::from_secs_f64(12.5));
    }

    #[test]
    fn test_builder_rejects_bad_speed() {
        assert!(TtsSettingsBuilder::default().speed(0.0).build().is_err());
        assert!(TtsSettingsBuilder::default().speed(-1.0).build().is_err());
        let settings = TtsSettingsBuilder::default()
            .voice_secondary("bf_emma")
            .build()
            .unwrap();
        assert_eq!(settings.secondary_voice(), Some("bf_emma"));
        assert_eq!(settings.device_policy, "auto");
    }

    #[test]
    fn test_out_of_range_timeout_falls_back() {
        for timeout in [1e30, f64::INFINITY, f64::NAN, -5.0, 0.0] {
            let settings = TtsSettings {
                remote_timeout: timeout,
                ..Default::default()
            };
            assert_eq!(settings.remote_timeout(), Duration::from_secs(60), "{timeout}");
        }

        let settings = TtsSettings::from_json(r#"{"tts_kokoro_remote_timeout": 1e30}"#).unwrap();
        assert_eq!(settings.remote_timeout(), Duration::from_secs(60));
        assert!(TtsSettingsBuilder::default().remote_timeout(1e30).build().is_err());
        assert!(TtsSettingsBuilder::default().remote_timeout(f64::NAN).build().is_err());
    }

    #[test]
    fn test_invalid_json_is_configuration_error() {
        let err = TtsSettings::from_json("[1, 2").unwrap_err();
        assert!(matches!(err, TtsError::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"tts_device": "cpu"}"#).unwrap();
        let settings = TtsSettings::load(&path).unwrap();
        assert_eq!(settings.device_policy, "cpu");
    }
}
