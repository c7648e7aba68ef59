//! Custom error types for keystroke-recorder.
//!
//! This module provides structured error types using `thiserror` for better
//! error handling and more informative error messages.

use std::fmt;
use std::io;
use thiserror::Error;

/// Category of a script parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseErrorKind {
    /// `KEY:` line without an operand.
    EmptyKey,
    /// `DELAY:` operand that is not a non-negative integer.
    InvalidDelay,
    /// Line that starts with neither `KEY:` nor `DELAY:`.
    UnknownCommand,
    /// Key combination with unknown modifiers or no single terminal key.
    InvalidCombo,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ParseErrorKind::EmptyKey => "empty key specification",
            ParseErrorKind::InvalidDelay => "invalid delay",
            ParseErrorKind::UnknownCommand => "unknown command",
            ParseErrorKind::InvalidCombo => "invalid key combination",
        };
        f.write_str(text)
    }
}

/// Main error type for keystroke-recorder operations.
#[derive(Error, Debug)]
pub enum KsrError {
    /// `Recorder::start` was called while a recording is in progress.
    #[error("a recording is already in progress")]
    AlreadyRecording,

    /// `Player::start` was called while a playback is in progress.
    #[error("a playback is already in progress")]
    AlreadyPlaying,

    /// The sequence handed to the player has no key presses.
    #[error("sequence contains no key presses")]
    EmptySequence,

    /// A key code could not be decoded into a platform key.
    #[error("unknown key '{key}': {reason}")]
    UnknownKey { key: String, reason: String },

    /// A canonical `combo:` code is malformed.
    #[error("invalid key combination '{combo}': {reason}")]
    InvalidKeyCombination { combo: String, reason: String },

    /// Script grammar violation, reported with its 1-based line number.
    #[error("line {line}: {kind}")]
    Parse { kind: ParseErrorKind, line: usize },

    /// Hotkey spec failed validation.
    #[error("invalid hotkey '{hotkey}': {reason}")]
    InvalidHotkey { hotkey: String, reason: String },

    /// Both hotkey slots would resolve to the same combination.
    #[error("hotkey '{0}' is already bound to the other action")]
    HotkeyConflict(String),

    /// The OS refused to install the global hotkeys.
    #[error("hotkey registration failed: {0}")]
    RegistrationFailed(String),

    /// Named sequence does not exist in storage.
    #[error("sequence '{0}' not found")]
    NotFound(String),

    /// The OS key listener could not be opened.
    #[error("failed to open key listener: {0}")]
    ListenerFailed(String),

    /// A single key event could not be injected.
    #[error("failed to inject key '{key}': {reason}")]
    InjectionFailed { key: String, reason: String },

    /// The playback thread could not be started.
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(String),

    /// Configuration validation error.
    #[error("configuration error: {0}")]
    ConfigValidation(String),

    /// Error reading or parsing configuration file.
    #[error("failed to load config from '{path}': {reason}")]
    ConfigLoad { path: String, reason: String },

    /// Error parsing duration string.
    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for keystroke-recorder operations.
pub type Result<T> = std::result::Result<T, KsrError>;

impl KsrError {
    /// Create a new UnknownKey error.
    pub fn unknown_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnknownKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a new InvalidKeyCombination error.
    pub fn invalid_key_combination(combo: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKeyCombination {
            combo: combo.into(),
            reason: reason.into(),
        }
    }

    /// Create a new Parse error.
    pub fn parse(kind: ParseErrorKind, line: usize) -> Self {
        Self::Parse { kind, line }
    }

    /// Create a new InvalidHotkey error.
    pub fn invalid_hotkey(hotkey: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHotkey {
            hotkey: hotkey.into(),
            reason: reason.into(),
        }
    }

    /// Create a new RegistrationFailed error.
    pub fn registration_failed(message: impl Into<String>) -> Self {
        Self::RegistrationFailed(message.into())
    }

    /// Create a new NotFound error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a new ListenerFailed error.
    pub fn listener_failed(message: impl Into<String>) -> Self {
        Self::ListenerFailed(message.into())
    }

    /// Create a new InjectionFailed error.
    pub fn injection_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InjectionFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a new ConfigValidation error.
    pub fn config_validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation(message.into())
    }

    /// Create a new ConfigLoad error.
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new InvalidDuration error.
    pub fn invalid_duration(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Parse kind and line, if this is a script grammar error.
    pub fn parse_kind(&self) -> Option<(ParseErrorKind, usize)> {
        match self {
            Self::Parse { kind, line } => Some((*kind, *line)),
            _ => None,
        }
    }
}
