//! Persisted user settings.
//!
//! Settings are stored as JSON. Durations are written as human strings
//! (`"500ms"`, `"2s"`, `"1m"`); bare numbers are milliseconds.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KsrError, Result};
use crate::hotkey;
use crate::player::{PlaybackSettings, RepeatMode};

const SETTINGS_FILE: &str = "settings.json";
const SEQUENCES_DIR: &str = "sequences";
const FALLBACK_DIR: &str = ".ksr";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "keystroke-recorder", "ksr")
}

fn default_start_stop_hotkey() -> String {
    "F1".to_string()
}

fn default_play_hotkey() -> String {
    "F2".to_string()
}

fn default_inter_key_delay() -> Duration {
    Duration::from_millis(crate::player::DEFAULT_INTER_KEY_DELAY_MS)
}

fn default_repeat_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_start_stop_hotkey")]
    pub start_stop_hotkey: String,

    #[serde(default = "default_play_hotkey")]
    pub play_hotkey: String,

    /// Automatic spacing between presses and between repetitions.
    #[serde(default = "default_inter_key_delay", with = "duration_str")]
    pub inter_key_delay: Duration,

    #[serde(default = "default_repeat_count")]
    pub repeat_count: u32,

    #[serde(default)]
    pub repeat_forever: bool,

    /// Pause before command-line playback begins.
    #[serde(default, with = "duration_str")]
    pub countdown: Duration,

    /// Where saved sequences live. Defaults to the platform data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            start_stop_hotkey: default_start_stop_hotkey(),
            play_hotkey: default_play_hotkey(),
            inter_key_delay: default_inter_key_delay(),
            repeat_count: default_repeat_count(),
            repeat_forever: false,
            countdown: Duration::ZERO,
            storage_dir: None,
        }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| KsrError::config_load(path.display().to_string(), e.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|e| KsrError::config_load(path.display().to_string(), e.to_string()))
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Load from `path` (or [`Settings::default_path`]) when the file
    /// exists, otherwise return the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::default_path(),
        };
        match path {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    pub fn storage_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage_dir {
            return dir.clone();
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join(SEQUENCES_DIR))
            .unwrap_or_else(|| PathBuf::from(FALLBACK_DIR).join(SEQUENCES_DIR))
    }

    pub fn validate(&self) -> Result<()> {
        let start_stop = hotkey::normalize_hotkey(&self.start_stop_hotkey)?;
        let play = hotkey::normalize_hotkey(&self.play_hotkey)?;
        if let (Some(a), Some(b)) = (&start_stop, &play) {
            if a == b {
                return Err(KsrError::config_validation(format!(
                    "start/stop and play hotkeys are both {a}"
                )));
            }
        }

        if self.repeat_count == 0 {
            return Err(KsrError::config_validation(
                "repeat_count must be at least 1",
            ));
        }

        if self.inter_key_delay < Duration::from_millis(1) {
            return Err(KsrError::config_validation(
                "inter_key_delay must be at least 1ms",
            ));
        }

        Ok(())
    }

    pub fn playback_settings(&self) -> PlaybackSettings {
        let repeat = if self.repeat_forever {
            RepeatMode::Forever
        } else {
            RepeatMode::Count(self.repeat_count)
        };
        let millis = u64::try_from(self.inter_key_delay.as_millis()).unwrap_or(u64::MAX);
        PlaybackSettings::new(millis, repeat)
    }
}

/// Parse a duration such as `500ms`, `2s`, `1.5m` or a bare number of
/// milliseconds. Case-insensitive; surrounding whitespace is ignored.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let trimmed = text.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err(KsrError::invalid_duration(text, "empty duration"));
    }

    // Milliseconds per unit.
    let (number, unit_ms) = if let Some(n) = trimmed.strip_suffix("ms") {
        (n.trim(), 1_u64)
    } else if let Some(n) = trimmed.strip_suffix('s') {
        (n.trim(), 1_000)
    } else if let Some(n) = trimmed.strip_suffix('m') {
        (n.trim(), 60_000)
    } else {
        (trimmed.as_str(), 1)
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(unit_ms)
            .map(Duration::from_millis)
            .ok_or_else(|| KsrError::invalid_duration(text, "too large"));
    }

    let value: f64 = number
        .parse()
        .map_err(|_| KsrError::invalid_duration(text, "expected a number with ms, s or m"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(KsrError::invalid_duration(
            text,
            "must be a non-negative number",
        ));
    }

    Duration::try_from_secs_f64(value * unit_ms as f64 / 1000.0)
        .map_err(|e| KsrError::invalid_duration(text, e.to_string()))
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}
