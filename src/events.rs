//! Engine notifications.
//!
//! Components publish [`EngineEvent`]s on a broadcast channel; front ends
//! subscribe and poll or await them. Publishing never blocks the publisher,
//! and having no subscribers is fine.

use tokio::sync::broadcast;

use crate::sequence::KeyAction;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RecordingStarted,
    KeyRecorded(KeyAction),
    RecordingStopped { actions: usize },
    /// `repetitions` is `None` when repeating forever.
    PlaybackStarted { repetitions: Option<u32> },
    PlaybackProgress { current: u32, total: u32 },
    PlaybackStopped { completed: bool },
    HotkeysChanged { active: bool },
    Error(String),
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        // Err only means nobody is subscribed.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
