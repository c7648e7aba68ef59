//! Live capture of key events into a [`Sequence`].
//!
//! The recorder is `Idle` until [`Recorder::start`] opens a listener on its
//! [`KeySource`]; events then arrive on the listener thread and are appended
//! to the working sequence. [`Recorder::stop`] closes the listener and hands
//! back the finished sequence.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Local;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{KsrError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::input::{KeyEvent, KeyEventKind, KeyHandler, KeySource, ListenerGuard};
use crate::keycode::{self, KeyCode};
use crate::sequence::{KeyAction, Sequence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderState::Idle => write!(f, "Idle"),
            RecorderState::Recording => write!(f, "Recording"),
        }
    }
}

/// State touched by the listener thread.
struct Capture {
    sequence: Sequence,
    held: HashSet<KeyCode>,
    started: Instant,
    recording: bool,
}

impl Capture {
    fn handle(&mut self, event: KeyEvent) -> Option<KeyAction> {
        if !self.recording {
            return None;
        }
        let code = keycode::encode(event.key);
        let now = self.started.elapsed().as_secs_f64();

        match event.kind {
            KeyEventKind::Down => {
                // OS auto-repeat delivers repeated downs while held.
                if !self.held.insert(code.clone()) {
                    return None;
                }
                let action = KeyAction::press(code, now);
                self.sequence.append(action.clone());
                Some(action)
            }
            KeyEventKind::Up => {
                self.held.remove(&code);
                if !self.sequence.complete_press(&code, now) {
                    debug!(key = %code, "Release without a recorded press");
                }
                self.sequence.append(KeyAction::release(code, now));
                None
            }
        }
    }
}

/// Records key events from a [`KeySource`].
pub struct Recorder {
    source: Arc<dyn KeySource>,
    capture: Arc<Mutex<Capture>>,
    listener: Mutex<Option<ListenerGuard>>,
    events: EventBus,
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("state", &self.state())
            .field("actions", &self.action_count())
            .finish()
    }
}

impl Recorder {
    pub fn new(source: Arc<dyn KeySource>, events: EventBus) -> Self {
        Self {
            source,
            capture: Arc::new(Mutex::new(Capture {
                sequence: Sequence::default(),
                held: HashSet::new(),
                started: Instant::now(),
                recording: false,
            })),
            listener: Mutex::new(None),
            events,
        }
    }

    /// Begin a new recording.
    ///
    /// Fails with [`KsrError::AlreadyRecording`] while recording. If the
    /// listener cannot be opened the recorder stays `Idle` and the previous
    /// sequence is left untouched.
    pub fn start(&self) -> Result<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() || self.capture.lock().recording {
            return Err(KsrError::AlreadyRecording);
        }

        let guard = self.source.open(self.handler()).inspect_err(|e| {
            warn!(error = %e, "Could not open key listener");
        })?;

        {
            let mut capture = self.capture.lock();
            capture.sequence = Sequence::new(format!(
                "Recording {}",
                Local::now().format("%Y-%m-%d %H:%M:%S")
            ));
            capture.held.clear();
            capture.started = Instant::now();
            capture.recording = true;
        }
        *listener = Some(guard);

        info!("Recording started");
        self.events.emit(EngineEvent::RecordingStarted);
        Ok(())
    }

    /// Finish the recording and return the sequence.
    ///
    /// While `Idle` this is a no-op returning the last sequence.
    pub fn stop(&self) -> Sequence {
        let mut listener = self.listener.lock();
        let sequence = {
            let mut capture = self.capture.lock();
            if !capture.recording {
                return capture.sequence.clone();
            }
            capture.recording = false;
            capture.held.clear();
            capture.sequence.clone()
        };
        if let Some(guard) = listener.take() {
            guard.close();
        }

        info!(
            actions = sequence.len(),
            key_presses = sequence.key_press_count(),
            "Recording stopped"
        );
        self.events.emit(EngineEvent::RecordingStopped {
            actions: sequence.len(),
        });
        sequence
    }

    pub fn state(&self) -> RecorderState {
        if self.capture.lock().recording {
            RecorderState::Recording
        } else {
            RecorderState::Idle
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    /// Snapshot of the working sequence.
    pub fn sequence(&self) -> Sequence {
        self.capture.lock().sequence.clone()
    }

    pub fn action_count(&self) -> usize {
        self.capture.lock().sequence.len()
    }

    /// Seconds since `start`, or 0 while idle.
    pub fn recording_duration(&self) -> f64 {
        let capture = self.capture.lock();
        if capture.recording {
            capture.started.elapsed().as_secs_f64()
        } else {
            0.0
        }
    }

    fn handler(&self) -> KeyHandler {
        let capture = Arc::clone(&self.capture);
        let events = self.events.clone();
        Arc::new(move |event: KeyEvent| {
            let recorded = capture.lock().handle(event);
            if let Some(action) = recorded {
                debug!(key = ?action.key, timestamp = action.timestamp, "Key recorded");
                events.emit(EngineEvent::KeyRecorded(action));
            }
        })
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.is_recording() {
            self.stop();
        }
    }
}
