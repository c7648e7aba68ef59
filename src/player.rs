//! Replays sequences on a dedicated playback thread.
//!
//! Timing comes from three places: explicit `Delay` actions, the automatic
//! inter-key delay inserted between consecutive presses, and the same delay
//! between repetitions. Every wait goes through a [`StopSignal`], so
//! [`Player::stop`] cuts it short. A keystroke that is already being
//! injected always completes first.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{KsrError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::input::KeyInjector;
use crate::keycode::KeyCode;
use crate::sequence::{ActionKind, KeyAction, Sequence};

/// Pause between the individual down/up transitions of one keystroke.
pub const KEY_SETTLE: Duration = Duration::from_millis(10);

/// Upper bound on how long [`Player::stop`] waits for the thread to exit.
pub const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_INTER_KEY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatMode {
    Count(u32),
    Forever,
}

/// Spacing and repetition for a playback run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSettings {
    inter_key_delay_ms: u64,
    repeat: RepeatMode,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            inter_key_delay_ms: DEFAULT_INTER_KEY_DELAY_MS,
            repeat: RepeatMode::Count(1),
        }
    }
}

impl PlaybackSettings {
    pub fn new(inter_key_delay_ms: u64, repeat: RepeatMode) -> Self {
        let mut settings = Self::default();
        settings.set_inter_key_delay_ms(inter_key_delay_ms);
        match repeat {
            RepeatMode::Count(n) => settings.set_repeat_count(n),
            RepeatMode::Forever => settings.set_repeat_forever(true),
        }
        settings
    }

    /// Clamped to at least 1ms.
    pub fn set_inter_key_delay_ms(&mut self, millis: u64) {
        self.inter_key_delay_ms = millis.max(1);
    }

    /// Clamped to at least 1; turns off repeat-forever.
    pub fn set_repeat_count(&mut self, count: u32) {
        self.repeat = RepeatMode::Count(count.max(1));
    }

    /// Turning this off falls back to a single repetition.
    pub fn set_repeat_forever(&mut self, forever: bool) {
        if forever {
            self.repeat = RepeatMode::Forever;
        } else if self.repeat == RepeatMode::Forever {
            self.repeat = RepeatMode::Count(1);
        }
    }

    pub fn inter_key_delay_ms(&self) -> u64 {
        self.inter_key_delay_ms
    }

    pub fn inter_key_delay(&self) -> Duration {
        Duration::from_millis(self.inter_key_delay_ms)
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    /// `None` when repeating forever.
    pub fn repeat_count(&self) -> Option<u32> {
        match self.repeat {
            RepeatMode::Count(n) => Some(n),
            RepeatMode::Forever => None,
        }
    }

    pub fn repeat_forever(&self) -> bool {
        self.repeat == RepeatMode::Forever
    }
}

/// Shared, idempotent cancellation flag with interruptible waits.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock() = true;
        cvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for `timeout` unless the signal fires first. Returns whether
    /// the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut stopped = flag.lock();
        while !*stopped {
            if cvar.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
    /// Stop was requested but the thread has not exited yet.
    Stopping,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerState::Idle => write!(f, "Idle"),
            PlayerState::Playing => write!(f, "Playing"),
            PlayerState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Handle on a running (or finished, not yet reaped) playback thread.
struct Session {
    stop: StopSignal,
    // Disconnects when the thread exits.
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

fn wait_done(done: &Receiver<()>, timeout: Duration) -> bool {
    matches!(
        done.recv_timeout(timeout),
        Err(RecvTimeoutError::Disconnected) | Ok(())
    )
}

/// Plays sequences through a [`KeyInjector`].
pub struct Player {
    injector: Arc<dyn KeyInjector>,
    settings: Mutex<PlaybackSettings>,
    session: Mutex<Option<Session>>,
    playing: Arc<AtomicBool>,
    events: EventBus,
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("state", &self.state())
            .field("settings", &*self.settings.lock())
            .finish()
    }
}

impl Player {
    pub fn new(injector: Arc<dyn KeyInjector>, events: EventBus) -> Self {
        Self {
            injector,
            settings: Mutex::new(PlaybackSettings::default()),
            session: Mutex::new(None),
            playing: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn settings(&self) -> PlaybackSettings {
        *self.settings.lock()
    }

    /// Applies to the next `start`; a running playback keeps its settings.
    pub fn set_settings(&self, settings: PlaybackSettings) {
        *self.settings.lock() = settings;
    }

    pub fn set_inter_key_delay_ms(&self, millis: u64) {
        self.settings.lock().set_inter_key_delay_ms(millis);
    }

    pub fn set_repeat_count(&self, count: u32) {
        self.settings.lock().set_repeat_count(count);
    }

    pub fn set_repeat_forever(&self, forever: bool) {
        self.settings.lock().set_repeat_forever(forever);
    }

    pub fn state(&self) -> PlayerState {
        if !self.playing.load(Ordering::SeqCst) {
            return PlayerState::Idle;
        }
        match self.session.lock().as_ref() {
            Some(session) if session.stop.is_set() => PlayerState::Stopping,
            _ => PlayerState::Playing,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Start replaying `sequence` on the playback thread and return
    /// immediately.
    pub fn start(&self, sequence: &Sequence) -> Result<()> {
        let mut session = self.session.lock();
        if self.playing.load(Ordering::SeqCst) {
            return Err(KsrError::AlreadyPlaying);
        }
        if sequence.key_press_count() == 0 {
            return Err(KsrError::EmptySequence);
        }
        if let Some(mut finished) = session.take() {
            if let Some(handle) = finished.handle.take() {
                let _ = handle.join();
            }
        }

        let stop = StopSignal::new();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let worker = Worker {
            injector: Arc::clone(&self.injector),
            actions: sequence.actions().to_vec(),
            settings: self.settings(),
            stop: stop.clone(),
            playing: Arc::clone(&self.playing),
            events: self.events.clone(),
        };

        self.playing.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                worker.run();
                drop(done_tx);
            })
            .map_err(|e| {
                self.playing.store(false, Ordering::SeqCst);
                KsrError::ThreadSpawn(e.to_string())
            })?;

        info!(name = %sequence.name, actions = sequence.len(), "Playback started");
        *session = Some(Session {
            stop,
            done: done_rx,
            handle: Some(handle),
        });
        Ok(())
    }

    /// Signal the playback thread to stop and wait up to
    /// [`STOP_JOIN_TIMEOUT`] for it to exit.
    ///
    /// Returns `false` if the thread was still running when the wait gave
    /// up; the caller is never blocked longer than that.
    pub fn stop(&self) -> bool {
        let (stop, done) = match self.session.lock().as_ref() {
            Some(session) => (session.stop.clone(), session.done.clone()),
            None => return true,
        };
        stop.set();

        if !wait_done(&done, STOP_JOIN_TIMEOUT) {
            warn!(
                timeout_ms = STOP_JOIN_TIMEOUT.as_millis() as u64,
                "Playback thread did not exit in time"
            );
            return false;
        }

        let mut session = self.session.lock();
        if let Some(mut finished) = session.take() {
            if let Some(handle) = finished.handle.take() {
                let _ = handle.join();
            }
        }
        debug!("Playback thread joined");
        true
    }

    /// Block until the current playback finishes or `timeout` elapses.
    /// Returns whether the player is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let done = match self.session.lock().as_ref() {
            Some(session) => session.done.clone(),
            None => return true,
        };
        wait_done(&done, timeout)
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the playback thread owns.
struct Worker {
    injector: Arc<dyn KeyInjector>,
    actions: Vec<KeyAction>,
    settings: PlaybackSettings,
    stop: StopSignal,
    playing: Arc<AtomicBool>,
    events: EventBus,
}

impl Worker {
    fn run(self) {
        let total = self.settings.repeat_count();
        self.events.emit(EngineEvent::PlaybackStarted { repetitions: total });

        let mut finished_reps: u32 = 0;
        while !self.stop.is_set() && total.is_none_or(|t| finished_reps < t) {
            if !self.play_once() {
                break;
            }
            finished_reps += 1;

            if let Some(total) = total {
                debug!(repetition = finished_reps, total, "Repetition finished");
                self.events.emit(EngineEvent::PlaybackProgress {
                    current: finished_reps,
                    total,
                });
            }

            let more = total.is_none_or(|t| finished_reps < t);
            if more && !self.stop.is_set() {
                self.stop.wait_timeout(self.settings.inter_key_delay());
            }
        }

        let completed = total.is_some_and(|t| finished_reps == t);
        info!(repetitions = finished_reps, completed, "Playback finished");
        self.playing.store(false, Ordering::SeqCst);
        self.events.emit(EngineEvent::PlaybackStopped { completed });
    }

    /// One pass over the actions. Returns `false` if a stop cut it short.
    fn play_once(&self) -> bool {
        for (index, action) in self.actions.iter().enumerate() {
            if self.stop.is_set() {
                return false;
            }
            match action.kind {
                ActionKind::KeyPress => {
                    if let Some(key) = &action.key {
                        if let Err(e) = self.tap(key) {
                            warn!(key = %key, error = %e, "Skipping key");
                        }
                    }
                    if auto_spacing_after(&self.actions, index) {
                        self.stop.wait_timeout(self.settings.inter_key_delay());
                    }
                }
                ActionKind::Delay => {
                    if action.hold_duration > 0.0 {
                        let wait = Duration::try_from_secs_f64(action.hold_duration)
                            .unwrap_or(Duration::ZERO);
                        self.stop.wait_timeout(wait);
                    }
                }
                // Releases are implied by the press.
                ActionKind::KeyRelease => {}
            }
        }
        !self.stop.is_set()
    }

    /// Press modifiers in order, tap the key, release modifiers in reverse.
    fn tap(&self, key: &KeyCode) -> Result<()> {
        let stroke = key.keystroke()?;
        let mut held = Vec::with_capacity(stroke.modifiers.len());

        let result = (|| -> Result<()> {
            for modifier in &stroke.modifiers {
                self.injector.press(*modifier)?;
                held.push(*modifier);
                thread::sleep(KEY_SETTLE);
            }
            self.injector.press(stroke.key)?;
            thread::sleep(KEY_SETTLE);
            self.injector.release(stroke.key)
        })();

        for modifier in held.iter().rev() {
            thread::sleep(KEY_SETTLE);
            if let Err(e) = self.injector.release(*modifier) {
                warn!(error = %e, "Failed to release modifier");
            }
        }
        result
    }
}

/// Whether the automatic inter-key delay follows the press at `index`:
/// only when the next replayed action is another press. Releases are not
/// replayed, and nothing is inserted after the last press.
fn auto_spacing_after(actions: &[KeyAction], index: usize) -> bool {
    actions[index + 1..]
        .iter()
        .find(|a| a.kind != ActionKind::KeyRelease)
        .is_some_and(|next| next.kind == ActionKind::KeyPress)
}
