//! # Keystroke Recorder
//!
//! Record keyboard input as timed sequences and play them back, with
//! global hotkeys for start/stop and play.
//!
//! ## Features
//!
//! - Capture key presses and releases with hold durations
//! - Replay with configurable key spacing, repeat count or repeat forever
//! - Stop playback at any point, including during long delays
//! - Save sequences as JSON records, or edit them as `KEY:`/`DELAY:` scripts
//! - Global hotkeys that work regardless of window focus
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keystroke_recorder::input::RdevInjector;
//! use keystroke_recorder::{script, EventBus, Player};
//!
//! let sequence = script::parse_script("KEY: ctrl+a\nDELAY: 250\nKEY: Delete", "clear").unwrap();
//! let player = Player::new(Arc::new(RdevInjector), EventBus::default());
//! player.start(&sequence).unwrap();
//! ```
//!
//! ## Script files
//!
//! ```text
//! # comments and blank lines are ignored
//! KEY: h
//! KEY: i
//! DELAY: 500
//! KEY: Enter
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hotkey;
pub mod input;
pub mod keycode;
pub mod player;
pub mod recorder;
pub mod script;
pub mod sequence;
pub mod storage;

pub use config::Settings;
pub use engine::Engine;
pub use error::{KsrError, ParseErrorKind, Result};
pub use events::{EngineEvent, EventBus};
pub use hotkey::{HotkeyDispatcher, HotkeySpec};
pub use keycode::KeyCode;
pub use player::{PlaybackSettings, Player, RepeatMode};
pub use recorder::Recorder;
pub use sequence::{ActionKind, KeyAction, Sequence};
pub use storage::{JsonFileStore, SequenceStore, SequenceSummary};
