//! Recorder, player and hotkeys wired together.
//!
//! The engine keeps the current sequence: the last finished recording or
//! whatever was loaded. Hotkey callbacks toggle recording and playback;
//! since nobody is waiting on them, their failures are logged and published
//! as [`EngineEvent::Error`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::{KsrError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::hotkey::HotkeyDispatcher;
use crate::input::{KeyInjector, KeySource};
use crate::player::Player;
use crate::recorder::Recorder;
use crate::sequence::Sequence;

struct Core {
    recorder: Recorder,
    player: Player,
    current: Mutex<Option<Sequence>>,
    events: EventBus,
}

impl Core {
    fn toggle_recording(&self) -> Result<bool> {
        if self.recorder.is_recording() {
            let sequence = self.recorder.stop();
            *self.current.lock() = Some(sequence);
            return Ok(false);
        }
        if self.player.is_playing() {
            self.player.stop();
        }
        self.recorder.start()?;
        Ok(true)
    }

    fn toggle_playback(&self) -> Result<bool> {
        if self.player.is_playing() {
            self.player.stop();
            return Ok(false);
        }
        if self.recorder.is_recording() {
            let sequence = self.recorder.stop();
            *self.current.lock() = Some(sequence);
        }
        let sequence = self
            .current
            .lock()
            .clone()
            .ok_or(KsrError::EmptySequence)?;
        self.player.start(&sequence)?;
        Ok(true)
    }

    fn report(&self, action: &str, error: &KsrError) {
        warn!(action, error = %error, "Hotkey action failed");
        self.events
            .emit(EngineEvent::Error(format!("{action}: {error}")));
    }
}

pub struct Engine {
    core: Arc<Core>,
    hotkeys: Option<HotkeyDispatcher>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("recorder", &self.core.recorder)
            .field("player", &self.core.player)
            .field("hotkeys", &self.hotkeys)
            .finish()
    }
}

impl Engine {
    pub fn new(
        source: Arc<dyn KeySource>,
        injector: Arc<dyn KeyInjector>,
        events: EventBus,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                recorder: Recorder::new(source, events.clone()),
                player: Player::new(injector, events.clone()),
                current: Mutex::new(None),
                events,
            }),
            hotkeys: None,
        }
    }

    pub fn apply_settings(&self, settings: &Settings) {
        self.core.player.set_settings(settings.playback_settings());
    }

    /// Bind the configured hotkeys to the toggles and install them.
    ///
    /// The dispatcher is kept even when installation fails, so bindings can
    /// be changed and retried through [`Engine::hotkeys`].
    pub fn attach_hotkeys(&mut self, dispatcher: HotkeyDispatcher, settings: &Settings) -> Result<()> {
        let core = Arc::clone(&self.core);
        dispatcher.on_start_stop(move || {
            if let Err(e) = core.toggle_recording() {
                core.report("toggle recording", &e);
            }
        })?;
        let core = Arc::clone(&self.core);
        dispatcher.on_play(move || {
            if let Err(e) = core.toggle_playback() {
                core.report("toggle playback", &e);
            }
        })?;

        dispatcher.set_start_stop(&settings.start_stop_hotkey)?;
        dispatcher.set_play(&settings.play_hotkey)?;
        let dispatcher = self.hotkeys.insert(dispatcher);
        dispatcher.start()?;

        info!(
            start_stop = ?dispatcher.start_stop_binding(),
            play = ?dispatcher.play_binding(),
            "Hotkeys ready"
        );
        Ok(())
    }

    /// Start recording, or stop it and keep the result as the current
    /// sequence. Returns whether the engine is now recording.
    pub fn toggle_recording(&self) -> Result<bool> {
        self.core.toggle_recording()
    }

    /// Play the current sequence, or stop an ongoing playback. Returns
    /// whether the engine is now playing.
    pub fn toggle_playback(&self) -> Result<bool> {
        self.core.toggle_playback()
    }

    pub fn load_sequence(&self, sequence: Sequence) {
        info!(name = %sequence.name, actions = sequence.len(), "Sequence loaded");
        *self.core.current.lock() = Some(sequence);
    }

    pub fn current_sequence(&self) -> Option<Sequence> {
        self.core.current.lock().clone()
    }

    pub fn recorder(&self) -> &Recorder {
        &self.core.recorder
    }

    pub fn player(&self) -> &Player {
        &self.core.player
    }

    pub fn hotkeys(&self) -> Option<&HotkeyDispatcher> {
        self.hotkeys.as_ref()
    }

    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    /// Stop recording and playback and uninstall hotkeys.
    pub fn shutdown(&self) {
        if let Some(hotkeys) = &self.hotkeys {
            hotkeys.stop();
        }
        if self.core.recorder.is_recording() {
            let sequence = self.core.recorder.stop();
            *self.core.current.lock() = Some(sequence);
        }
        self.core.player.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotkey::{HotkeyBackend, HotkeySpec, TriggerSink};
    use crate::input::VirtualKeyboard;
    use global_hotkey::hotkey::HotKey;
    use rdev::Key;
    use std::time::{Duration, Instant};

    struct NullBackend;

    impl HotkeyBackend for NullBackend {
        fn attach(&mut self, _sink: TriggerSink) {}

        fn install(&mut self, _hotkeys: &[HotKey]) -> Result<()> {
            Ok(())
        }
    }

    fn engine() -> (Engine, VirtualKeyboard, VirtualKeyboard) {
        let typist = VirtualKeyboard::new();
        let output = VirtualKeyboard::new();
        let engine = Engine::new(
            Arc::new(typist.clone()),
            Arc::new(output.clone()),
            EventBus::default(),
        );
        engine.player().set_inter_key_delay_ms(1);
        (engine, typist, output)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_record_then_play() {
        let (engine, typist, output) = engine();
        assert!(engine.toggle_recording().unwrap());
        typist.tap(Key::KeyH);
        typist.tap(Key::KeyI);
        assert!(!engine.toggle_recording().unwrap());
        assert_eq!(engine.current_sequence().unwrap().key_press_count(), 2);

        assert!(engine.toggle_playback().unwrap());
        assert!(engine.player().wait_idle(Duration::from_secs(5)));
        assert_eq!(output.injected().len(), 4);
    }

    #[test]
    fn test_play_without_sequence_fails() {
        let (engine, _typist, _output) = engine();
        assert!(matches!(
            engine.toggle_playback(),
            Err(KsrError::EmptySequence)
        ));
    }

    #[test]
    fn test_toggle_playback_stops_running_playback() {
        let (engine, _typist, _output) = engine();
        engine.player().set_repeat_forever(true);
        let mut seq = Sequence::new("loop");
        seq.append(crate::sequence::KeyAction::press("char:q".parse().unwrap(), 0.0));
        engine.load_sequence(seq);

        assert!(engine.toggle_playback().unwrap());
        assert!(!engine.toggle_playback().unwrap());
        assert!(!engine.player().is_playing());
    }

    #[test]
    fn test_hotkeys_drive_recording() {
        let (mut engine, typist, _output) = engine();
        let dispatcher = HotkeyDispatcher::new(Box::new(NullBackend), engine.events().clone());
        engine
            .attach_hotkeys(dispatcher, &Settings::default())
            .unwrap();

        let hotkeys = engine.hotkeys().unwrap();
        assert!(hotkeys.is_active());
        let start_stop = "F1".parse::<HotkeySpec>().unwrap().id();

        assert!(hotkeys.dispatch(start_stop));
        assert!(wait_for(|| engine.recorder().is_recording()));
        typist.tap(Key::KeyK);
        assert!(hotkeys.dispatch(start_stop));
        assert!(wait_for(|| !engine.recorder().is_recording()));
        assert!(wait_for(|| engine.current_sequence().is_some()));
        assert_eq!(engine.current_sequence().unwrap().key_press_count(), 1);
    }

    #[test]
    fn test_hotkey_failures_become_error_events() {
        let (mut engine, _typist, _output) = engine();
        let mut rx = engine.events().subscribe();
        let dispatcher = HotkeyDispatcher::new(Box::new(NullBackend), engine.events().clone());
        engine
            .attach_hotkeys(dispatcher, &Settings::default())
            .unwrap();

        let play = "F2".parse::<HotkeySpec>().unwrap().id();
        assert!(engine.hotkeys().unwrap().dispatch(play));

        let mut errors = Vec::new();
        assert!(wait_for(|| {
            while let Ok(event) = rx.try_recv() {
                if let EngineEvent::Error(message) = event {
                    errors.push(message);
                }
            }
            !errors.is_empty()
        }));
        assert!(errors[0].contains("toggle playback"));
    }
}
