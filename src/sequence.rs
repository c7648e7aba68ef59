//! Timestamped key actions and the sequences that hold them.
//!
//! A [`Sequence`] is append-only: actions are added in temporal order by the
//! recorder or the script parser and never removed or reordered. Edits go
//! through a full rebuild from script text.
//!
//! The structured form wraps a sequence in a versioned record:
//!
//! ```json
//! {
//!   "version": "1.0",
//!   "created": "2026-10-16T09:30:00Z",
//!   "sequence": {
//!     "name": "login",
//!     "actions": [
//!       {"action_type": "key_press", "key": "char:a", "timestamp": 0.0, "duration": 0.12}
//!     ],
//!     "created_at": "...",
//!     "modified_at": "..."
//!   }
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::keycode::KeyCode;

/// Version tag written into every structured record.
pub const FORMAT_VERSION: &str = "1.0";

/// What a [`KeyAction`] does when replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    KeyPress,
    KeyRelease,
    Delay,
}

/// One discrete event in a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyAction {
    #[serde(rename = "action_type")]
    pub kind: ActionKind,
    /// `None` for delays.
    #[serde(with = "optional_key")]
    pub key: Option<KeyCode>,
    /// Seconds since the start of the sequence.
    pub timestamp: f64,
    /// Hold time of a press (filled in on release), or the wait of a delay.
    #[serde(rename = "duration", default)]
    pub hold_duration: f64,
}

impl KeyAction {
    pub fn press(key: KeyCode, timestamp: f64) -> Self {
        Self {
            kind: ActionKind::KeyPress,
            key: Some(key),
            timestamp,
            hold_duration: 0.0,
        }
    }

    pub fn release(key: KeyCode, timestamp: f64) -> Self {
        Self {
            kind: ActionKind::KeyRelease,
            key: Some(key),
            timestamp,
            hold_duration: 0.0,
        }
    }

    pub fn delay(seconds: f64, timestamp: f64) -> Self {
        Self {
            kind: ActionKind::Delay,
            key: None,
            timestamp,
            hold_duration: seconds,
        }
    }

    pub fn is_press(&self) -> bool {
        self.kind == ActionKind::KeyPress
    }
}

/// Ordered recording of key actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    actions: Vec<KeyAction>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new("")
    }
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            actions: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    pub fn append(&mut self, action: KeyAction) {
        self.actions.push(action);
        self.touch();
    }

    pub fn clear(&mut self) {
        self.actions.clear();
        self.touch();
    }

    pub fn actions(&self) -> &[KeyAction] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Seconds between the first and the last action.
    pub fn duration(&self) -> f64 {
        match (self.actions.first(), self.actions.last()) {
            (Some(first), Some(last)) if self.actions.len() > 1 => last.timestamp - first.timestamp,
            _ => 0.0,
        }
    }

    pub fn key_press_count(&self) -> usize {
        self.actions.iter().filter(|a| a.is_press()).count()
    }

    /// Attribute a release at `timestamp` to the most recent unreleased press
    /// of `key`. Returns whether a press was found.
    ///
    /// A press counts as released once a later `KeyRelease` of the same key
    /// pairs with it or its hold has been set, so a zero-length hold is never
    /// overwritten.
    pub fn complete_press(&mut self, key: &KeyCode, timestamp: f64) -> bool {
        let mut later_releases = 0usize;
        let mut press = None;
        for action in self.actions.iter_mut().rev() {
            if action.key.as_ref() != Some(key) {
                continue;
            }
            match action.kind {
                ActionKind::KeyRelease => later_releases += 1,
                ActionKind::KeyPress if later_releases > 0 => later_releases -= 1,
                ActionKind::KeyPress => {
                    press = Some(action);
                    break;
                }
                ActionKind::Delay => {}
            }
        }

        match press {
            Some(action) if action.hold_duration == 0.0 => {
                action.hold_duration = (timestamp - action.timestamp).max(0.0);
                self.touch();
                true
            }
            _ => false,
        }
    }

    fn touch(&mut self) {
        self.modified_at = Utc::now();
    }
}

/// Versioned envelope used for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceRecord {
    pub version: String,
    pub created: DateTime<Utc>,
    pub sequence: Sequence,
}

impl SequenceRecord {
    pub fn new(sequence: Sequence) -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            created: Utc::now(),
            sequence,
        }
    }
}

/// Serialize a sequence to its structured JSON form.
pub fn serialize(sequence: &Sequence) -> Result<String> {
    Ok(serde_json::to_string_pretty(&SequenceRecord::new(
        sequence.clone(),
    ))?)
}

/// Parse a structured JSON record back into a sequence.
pub fn parse(json: &str) -> Result<Sequence> {
    let record: SequenceRecord = serde_json::from_str(json)?;
    if record.version != FORMAT_VERSION {
        tracing::warn!(version = %record.version, "Loading sequence record with unexpected version");
    }
    Ok(record.sequence)
}

// Delays carry an empty key string on disk.
mod optional_key {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::keycode::KeyCode;

    pub fn serialize<S: Serializer>(key: &Option<KeyCode>, serializer: S) -> Result<S::Ok, S::Error> {
        match key {
            Some(code) => serializer.serialize_str(&code.to_string()),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<KeyCode>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: &str) -> KeyCode {
        code.parse().unwrap()
    }

    #[test]
    fn test_new_sequence_is_empty() {
        let seq = Sequence::new("empty");
        assert!(seq.is_empty());
        assert_eq!(seq.duration(), 0.0);
        assert_eq!(seq.key_press_count(), 0);
        assert_eq!(seq.created_at, seq.modified_at);
    }

    #[test]
    fn test_duration_and_press_count() {
        let mut seq = Sequence::new("two keys");
        seq.append(KeyAction::press(key("char:a"), 0.5));
        assert_eq!(seq.duration(), 0.0);
        seq.append(KeyAction::release(key("char:a"), 0.6));
        seq.append(KeyAction::delay(1.0, 1.6));
        seq.append(KeyAction::press(key("key:enter"), 2.0));

        assert_eq!(seq.len(), 4);
        assert!((seq.duration() - 1.5).abs() < 1e-9);
        assert_eq!(seq.key_press_count(), 2);
    }

    #[test]
    fn test_mutations_update_modified_at() {
        let mut seq = Sequence::new("touch");
        let before = seq.modified_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        seq.append(KeyAction::press(key("char:x"), 0.0));
        assert!(seq.modified_at > before);

        let after_append = seq.modified_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        seq.clear();
        assert!(seq.modified_at > after_append);
        assert!(seq.is_empty());
    }

    #[test]
    fn test_complete_press_targets_matching_key() {
        let mut seq = Sequence::new("overlap");
        seq.append(KeyAction::press(key("char:a"), 0.0));
        seq.append(KeyAction::press(key("char:b"), 0.1));
        assert!(seq.complete_press(&key("char:a"), 0.3));
        assert!(seq.complete_press(&key("char:b"), 0.5));

        assert!((seq.actions()[0].hold_duration - 0.3).abs() < 1e-9);
        assert!((seq.actions()[1].hold_duration - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_complete_press_sets_hold_once() {
        let mut seq = Sequence::new("once");
        seq.append(KeyAction::press(key("char:a"), 0.0));
        assert!(seq.complete_press(&key("char:a"), 0.2));
        assert!(!seq.complete_press(&key("char:a"), 0.9));
        assert!((seq.actions()[0].hold_duration - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_zero_hold_is_not_overwritten() {
        let mut seq = Sequence::new("instant");
        seq.append(KeyAction::press(key("char:a"), 0.5));
        assert!(seq.complete_press(&key("char:a"), 0.5));
        seq.append(KeyAction::release(key("char:a"), 0.5));

        assert!(!seq.complete_press(&key("char:a"), 1.5));
        assert_eq!(seq.actions()[0].hold_duration, 0.0);
    }

    #[test]
    fn test_release_pairs_with_latest_open_press() {
        let mut seq = Sequence::new("twice");
        seq.append(KeyAction::press(key("char:a"), 0.0));
        assert!(seq.complete_press(&key("char:a"), 0.0));
        seq.append(KeyAction::release(key("char:a"), 0.0));
        seq.append(KeyAction::press(key("char:a"), 1.0));

        assert!(seq.complete_press(&key("char:a"), 1.25));
        assert_eq!(seq.actions()[0].hold_duration, 0.0);
        assert!((seq.actions()[3].hold_duration - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_structured_roundtrip() {
        let mut seq = Sequence::new("roundtrip");
        seq.append(KeyAction::press(key("combo:ctrl+c"), 0.0));
        seq.append(KeyAction::release(key("combo:ctrl+c"), 0.05));
        seq.append(KeyAction::delay(0.25, 0.3));
        seq.append(KeyAction::press(key("key:f5"), 0.31));

        let json = serialize(&seq).unwrap();
        let parsed = parse(&json).unwrap();
        assert_eq!(parsed, seq);
    }

    #[test]
    fn test_structured_shape() {
        let mut seq = Sequence::new("shape");
        seq.append(KeyAction::delay(0.5, 0.5));
        let value: serde_json::Value = serde_json::from_str(&serialize(&seq).unwrap()).unwrap();

        assert_eq!(value["version"], "1.0");
        assert!(value["created"].is_string());
        let action = &value["sequence"]["actions"][0];
        assert_eq!(action["action_type"], "delay");
        assert_eq!(action["key"], "");
        assert_eq!(action["duration"], 0.5);
    }

    #[test]
    fn test_parse_rejects_bad_key_code() {
        let json = r#"{
            "version": "1.0",
            "created": "2026-01-01T00:00:00Z",
            "sequence": {"name": "bad", "actions": [
                {"action_type": "key_press", "key": "nonsense", "timestamp": 0.0}
            ]}
        }"#;
        assert!(parse(json).is_err());
    }
}
