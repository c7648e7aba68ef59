//! Global hotkeys: spec parsing and the two-slot dispatcher.
//!
//! A hotkey spec is `[Modifier+]*Key`, case-insensitive on input and
//! normalized to title case with modifiers in a fixed order
//! (`shift+ctrl+f5` becomes `Ctrl+Shift+F5`).
//!
//! The [`HotkeyDispatcher`] holds the start/stop and play bindings and
//! installs them through a [`HotkeyBackend`]. Triggered callbacks run on
//! their own thread so the backend's delivery loop never waits on
//! application code.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{KsrError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::keycode::Modifier;

const MAX_MODIFIERS: usize = 3;
const UNBOUND: &str = "none";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const LETTER_CODES: [Code; 26] = [
    Code::KeyA, Code::KeyB, Code::KeyC, Code::KeyD, Code::KeyE, Code::KeyF, Code::KeyG,
    Code::KeyH, Code::KeyI, Code::KeyJ, Code::KeyK, Code::KeyL, Code::KeyM, Code::KeyN,
    Code::KeyO, Code::KeyP, Code::KeyQ, Code::KeyR, Code::KeyS, Code::KeyT, Code::KeyU,
    Code::KeyV, Code::KeyW, Code::KeyX, Code::KeyY, Code::KeyZ,
];

const DIGIT_CODES: [Code; 10] = [
    Code::Digit0, Code::Digit1, Code::Digit2, Code::Digit3, Code::Digit4,
    Code::Digit5, Code::Digit6, Code::Digit7, Code::Digit8, Code::Digit9,
];

const FUNCTION_CODES: [Code; 24] = [
    Code::F1, Code::F2, Code::F3, Code::F4, Code::F5, Code::F6, Code::F7, Code::F8,
    Code::F9, Code::F10, Code::F11, Code::F12, Code::F13, Code::F14, Code::F15, Code::F16,
    Code::F17, Code::F18, Code::F19, Code::F20, Code::F21, Code::F22, Code::F23, Code::F24,
];

// (accepted spellings, canonical name, code)
const SPECIAL_KEYS: &[(&[&str], &str, Code)] = &[
    (&["space"], "Space", Code::Space),
    (&["tab"], "Tab", Code::Tab),
    (&["enter", "return"], "Enter", Code::Enter),
    (&["escape", "esc"], "Escape", Code::Escape),
    (&["backspace"], "Backspace", Code::Backspace),
    (&["delete", "del"], "Delete", Code::Delete),
    (&["home"], "Home", Code::Home),
    (&["end"], "End", Code::End),
    (&["pageup", "page-up", "page_up", "pgup"], "PageUp", Code::PageUp),
    (&["pagedown", "page-down", "page_down", "pgdn"], "PageDown", Code::PageDown),
    (&["up", "arrowup"], "Up", Code::ArrowUp),
    (&["down", "arrowdown"], "Down", Code::ArrowDown),
    (&["left", "arrowleft"], "Left", Code::ArrowLeft),
    (&["right", "arrowright"], "Right", Code::ArrowRight),
];

/// A validated, normalized hotkey.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HotkeySpec {
    modifiers: Vec<Modifier>,
    key: String,
    code: Code,
}

impl HotkeySpec {
    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    /// Canonical name of the terminal key (`A`, `F5`, `PageUp`).
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn to_hotkey(&self) -> HotKey {
        let mut mods = Modifiers::empty();
        for modifier in &self.modifiers {
            mods |= match modifier {
                Modifier::Alt => Modifiers::ALT,
                Modifier::Cmd => Modifiers::SUPER,
                Modifier::Ctrl => Modifiers::CONTROL,
                Modifier::Shift => Modifiers::SHIFT,
            };
        }
        HotKey::new((!mods.is_empty()).then_some(mods), self.code)
    }

    /// Identifier the OS reports when this hotkey fires.
    pub fn id(&self) -> u32 {
        self.to_hotkey().id()
    }
}

impl fmt::Display for HotkeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for modifier in &self.modifiers {
            write!(f, "{}+", modifier.title())?;
        }
        f.write_str(&self.key)
    }
}

impl FromStr for HotkeySpec {
    type Err = KsrError;

    fn from_str(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| KsrError::invalid_hotkey(spec, reason);

        let mut modifiers = Vec::new();
        let mut terminal: Option<(String, Code)> = None;

        for part in spec.split('+').map(str::trim) {
            if part.is_empty() {
                return Err(invalid("empty part"));
            }
            if let Some(modifier) = Modifier::parse(part) {
                if modifiers.contains(&modifier) {
                    return Err(invalid(&format!("duplicate modifier '{part}'")));
                }
                modifiers.push(modifier);
                continue;
            }
            if terminal.is_some() {
                return Err(invalid("more than one non-modifier key"));
            }
            terminal = Some(
                terminal_key(part).ok_or_else(|| invalid(&format!("unsupported key '{part}'")))?,
            );
        }

        if modifiers.len() > MAX_MODIFIERS {
            return Err(invalid(&format!("at most {MAX_MODIFIERS} modifiers")));
        }
        let (key, code) = terminal.ok_or_else(|| invalid("no key"))?;
        modifiers.sort();

        Ok(Self {
            modifiers,
            key,
            code,
        })
    }
}

fn terminal_key(part: &str) -> Option<(String, Code)> {
    let lower = part.to_lowercase();

    let mut chars = lower.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        let code = match c {
            'a'..='z' => LETTER_CODES[(c as u8 - b'a') as usize],
            '0'..='9' => DIGIT_CODES[(c as u8 - b'0') as usize],
            _ => return None,
        };
        return Some((c.to_ascii_uppercase().to_string(), code));
    }

    if let Some(n) = lower.strip_prefix('f').and_then(|n| n.parse::<usize>().ok()) {
        return (1..=FUNCTION_CODES.len())
            .contains(&n)
            .then(|| (format!("F{n}"), FUNCTION_CODES[n - 1]));
    }

    SPECIAL_KEYS
        .iter()
        .find(|(aliases, _, _)| aliases.contains(&lower.as_str()))
        .map(|(_, name, code)| ((*name).to_string(), *code))
}

/// Parse a binding string. Empty and `None` mean unbound.
pub fn parse_binding(spec: &str) -> Result<Option<HotkeySpec>> {
    let trimmed = spec.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNBOUND) {
        return Ok(None);
    }
    trimmed.parse().map(Some)
}

/// Normalized form of a binding string, `None` when unbound.
pub fn normalize_hotkey(spec: &str) -> Result<Option<String>> {
    Ok(parse_binding(spec)?.map(|s| s.to_string()))
}

/// Called with the id of a hotkey that fired.
pub type TriggerSink = Arc<dyn Fn(u32) + Send + Sync>;

/// Action run when a hotkey fires.
pub type HotkeyCallback = Arc<dyn Fn() + Send + Sync>;

/// Installs hotkeys with the OS and reports triggers.
pub trait HotkeyBackend: Send {
    /// Route triggers to `sink` from now on.
    fn attach(&mut self, sink: TriggerSink);

    /// Replace the installed set. An empty slice uninstalls everything.
    fn install(&mut self, hotkeys: &[HotKey]) -> Result<()>;
}

enum HostCommand {
    Install(Vec<HotKey>, Sender<Result<()>>),
    Shutdown,
}

/// [`HotkeyBackend`] over `global-hotkey`.
///
/// The `GlobalHotKeyManager` lives on a dedicated thread that applies
/// install requests and drains the global event receiver. On Windows that
/// thread also pumps its message queue, since `WM_HOTKEY` is delivered to a
/// window it owns.
///
/// On macOS, `global-hotkey` only delivers events to a manager driven by
/// the main thread's run loop, which this backend does not provide, so
/// hotkeys install but never fire there.
pub struct GlobalHotkeyBackend {
    commands: Sender<HostCommand>,
    sink: Arc<Mutex<Option<TriggerSink>>>,
    handle: Option<JoinHandle<()>>,
}

impl GlobalHotkeyBackend {
    pub fn new() -> Result<Self> {
        let (commands, command_rx) = crossbeam_channel::unbounded::<HostCommand>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let sink: Arc<Mutex<Option<TriggerSink>>> = Arc::new(Mutex::new(None));
        let host_sink = Arc::clone(&sink);

        let handle = thread::Builder::new()
            .name("hotkey-host".into())
            .spawn(move || {
                #[cfg(target_os = "macos")]
                warn!("Global hotkeys need the main thread run loop on macOS and will not fire");

                let manager = match GlobalHotKeyManager::new() {
                    Ok(manager) => {
                        let _ = ready_tx.send(Ok(()));
                        manager
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(KsrError::registration_failed(format!(
                            "failed to create hotkey manager: {e}"
                        ))));
                        return;
                    }
                };
                host_loop(&manager, &command_rx, &host_sink);
            })
            .map_err(|e| KsrError::ThreadSpawn(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                sink,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(KsrError::registration_failed("hotkey host exited"))
            }
        }
    }
}

fn host_loop(
    manager: &GlobalHotKeyManager,
    commands: &Receiver<HostCommand>,
    sink: &Mutex<Option<TriggerSink>>,
) {
    let events = GlobalHotKeyEvent::receiver();
    let mut installed: Vec<HotKey> = Vec::new();

    loop {
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(HostCommand::Install(hotkeys, reply)) => {
                if !installed.is_empty() {
                    if let Err(e) = manager.unregister_all(&installed) {
                        warn!(error = %e, "Failed to unregister hotkeys");
                    }
                    installed.clear();
                }
                let result = if hotkeys.is_empty() {
                    Ok(())
                } else {
                    match manager.register_all(&hotkeys) {
                        Ok(()) => {
                            installed = hotkeys;
                            Ok(())
                        }
                        Err(e) => {
                            // Drop whatever part of the set did register.
                            let _ = manager.unregister_all(&hotkeys);
                            Err(KsrError::registration_failed(e.to_string()))
                        }
                    }
                };
                let _ = reply.send(result);
            }
            Ok(HostCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        #[cfg(windows)]
        pump_messages();

        while let Ok(event) = events.try_recv() {
            if event.state != HotKeyState::Pressed {
                continue;
            }
            let current = sink.lock().clone();
            if let Some(sink) = current {
                sink(event.id);
            }
        }
    }

    if !installed.is_empty() {
        let _ = manager.unregister_all(&installed);
    }
    debug!("Hotkey host stopped");
}

/// Dispatch pending window messages for this thread.
///
/// `WM_HOTKEY` goes to the hidden window the manager created on the host
/// thread, and only reaches `global-hotkey` through `DispatchMessageW`.
#[cfg(windows)]
fn pump_messages() {
    use winapi::um::winuser::{DispatchMessageW, PeekMessageW, TranslateMessage, MSG, PM_REMOVE};

    unsafe {
        let mut msg: MSG = std::mem::zeroed();
        while PeekMessageW(&mut msg, std::ptr::null_mut(), 0, 0, PM_REMOVE) != 0 {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }
}

impl HotkeyBackend for GlobalHotkeyBackend {
    fn attach(&mut self, sink: TriggerSink) {
        *self.sink.lock() = Some(sink);
    }

    fn install(&mut self, hotkeys: &[HotKey]) -> Result<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(HostCommand::Install(hotkeys.to_vec(), reply_tx))
            .map_err(|_| KsrError::registration_failed("hotkey host is not running"))?;
        reply_rx
            .recv()
            .map_err(|_| KsrError::registration_failed("hotkey host is not running"))?
    }
}

impl Drop for GlobalHotkeyBackend {
    fn drop(&mut self) {
        let _ = self.commands.send(HostCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HotkeySlot {
    StartStop,
    Play,
}

impl fmt::Display for HotkeySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HotkeySlot::StartStop => write!(f, "start/stop"),
            HotkeySlot::Play => write!(f, "play"),
        }
    }
}

type Routes = Arc<Mutex<HashMap<u32, (HotkeySlot, HotkeyCallback)>>>;

struct DispatcherState {
    start_stop: Option<HotkeySpec>,
    play: Option<HotkeySpec>,
    on_start_stop: Option<HotkeyCallback>,
    on_play: Option<HotkeyCallback>,
    backend: Box<dyn HotkeyBackend>,
    running: bool,
    active: bool,
}

impl DispatcherState {
    fn binding(&self, slot: HotkeySlot) -> Option<&HotkeySpec> {
        match slot {
            HotkeySlot::StartStop => self.start_stop.as_ref(),
            HotkeySlot::Play => self.play.as_ref(),
        }
    }

    fn binding_mut(&mut self, slot: HotkeySlot) -> &mut Option<HotkeySpec> {
        match slot {
            HotkeySlot::StartStop => &mut self.start_stop,
            HotkeySlot::Play => &mut self.play,
        }
    }

    fn callback(&self, slot: HotkeySlot) -> Option<&HotkeyCallback> {
        match slot {
            HotkeySlot::StartStop => self.on_start_stop.as_ref(),
            HotkeySlot::Play => self.on_play.as_ref(),
        }
    }
}

/// Two global hotkey slots bound to callbacks.
///
/// All changes to the installed set happen under one lock, so
/// re-registrations never interleave. Routes are cleared before the backend
/// is touched and filled in only after it succeeds, so a trigger never
/// resolves against a half-replaced set.
pub struct HotkeyDispatcher {
    state: Mutex<DispatcherState>,
    routes: Routes,
    events: EventBus,
}

impl fmt::Debug for HotkeyDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HotkeyDispatcher")
            .field("start_stop", &state.start_stop.as_ref().map(|s| s.to_string()))
            .field("play", &state.play.as_ref().map(|s| s.to_string()))
            .field("active", &state.active)
            .finish()
    }
}

impl HotkeyDispatcher {
    pub fn new(mut backend: Box<dyn HotkeyBackend>, events: EventBus) -> Self {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let sink_routes = Arc::clone(&routes);
        backend.attach(Arc::new(move |id| {
            dispatch_route(&sink_routes, id);
        }));

        Self {
            state: Mutex::new(DispatcherState {
                start_stop: None,
                play: None,
                on_start_stop: None,
                on_play: None,
                backend,
                running: false,
                active: false,
            }),
            routes,
            events,
        }
    }

    /// Dispatcher backed by the OS hotkey service.
    pub fn with_global_hotkeys(events: EventBus) -> Result<Self> {
        Ok(Self::new(Box::new(GlobalHotkeyBackend::new()?), events))
    }

    pub fn on_start_stop(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.set_callback(HotkeySlot::StartStop, Arc::new(callback))
    }

    pub fn on_play(&self, callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
        self.set_callback(HotkeySlot::Play, Arc::new(callback))
    }

    fn set_callback(&self, slot: HotkeySlot, callback: HotkeyCallback) -> Result<()> {
        let mut state = self.state.lock();
        match slot {
            HotkeySlot::StartStop => state.on_start_stop = Some(callback),
            HotkeySlot::Play => state.on_play = Some(callback),
        }
        if state.running {
            self.reinstall(&mut state)?;
        }
        Ok(())
    }

    pub fn set_start_stop(&self, spec: &str) -> Result<()> {
        self.set_binding(HotkeySlot::StartStop, spec)
    }

    pub fn set_play(&self, spec: &str) -> Result<()> {
        self.set_binding(HotkeySlot::Play, spec)
    }

    /// Validate and store a binding, then re-register if running.
    ///
    /// Invalid or conflicting specs leave the binding unchanged. If the OS
    /// refuses the new set, the binding is kept but the dispatcher becomes
    /// inactive.
    fn set_binding(&self, slot: HotkeySlot, spec: &str) -> Result<()> {
        let binding = parse_binding(spec)?;
        let mut state = self.state.lock();

        let other = match slot {
            HotkeySlot::StartStop => HotkeySlot::Play,
            HotkeySlot::Play => HotkeySlot::StartStop,
        };
        if let (Some(new), Some(existing)) = (&binding, state.binding(other)) {
            if new == existing {
                return Err(KsrError::HotkeyConflict(new.to_string()));
            }
        }

        info!(slot = %slot, hotkey = ?binding.as_ref().map(|b| b.to_string()), "Hotkey binding changed");
        *state.binding_mut(slot) = binding;
        if state.running {
            self.reinstall(&mut state)?;
        }
        Ok(())
    }

    /// Install the current bindings.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.running = true;
        self.reinstall(&mut state)
    }

    /// Uninstall everything.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }
        state.running = false;
        self.routes.lock().clear();
        if let Err(e) = state.backend.install(&[]) {
            warn!(error = %e, "Failed to uninstall hotkeys");
        }
        state.active = false;
        info!("Hotkeys stopped");
        self.events.emit(EngineEvent::HotkeysChanged { active: false });
    }

    fn reinstall(&self, state: &mut DispatcherState) -> Result<()> {
        self.routes.lock().clear();

        let mut hotkeys = Vec::new();
        let mut routes = HashMap::new();
        for slot in [HotkeySlot::StartStop, HotkeySlot::Play] {
            if let (Some(spec), Some(callback)) = (state.binding(slot), state.callback(slot)) {
                let hotkey = spec.to_hotkey();
                routes.insert(hotkey.id(), (slot, Arc::clone(callback)));
                hotkeys.push(hotkey);
            }
        }

        match state.backend.install(&hotkeys) {
            Ok(()) => {
                *self.routes.lock() = routes;
                state.active = true;
                info!(count = hotkeys.len(), "Hotkeys installed");
                self.events.emit(EngineEvent::HotkeysChanged { active: true });
                Ok(())
            }
            Err(e) => {
                state.active = false;
                warn!(error = %e, "Hotkey registration failed");
                self.events.emit(EngineEvent::HotkeysChanged { active: false });
                Err(match e {
                    KsrError::RegistrationFailed(_) => e,
                    other => KsrError::registration_failed(other.to_string()),
                })
            }
        }
    }

    /// Fire the callback routed to `id`, if any. Returns whether one was
    /// found.
    pub fn dispatch(&self, id: u32) -> bool {
        dispatch_route(&self.routes, id)
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    pub fn start_stop_binding(&self) -> Option<String> {
        self.state.lock().start_stop.as_ref().map(|s| s.to_string())
    }

    pub fn play_binding(&self) -> Option<String> {
        self.state.lock().play.as_ref().map(|s| s.to_string())
    }
}

impl Drop for HotkeyDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_route(routes: &Routes, id: u32) -> bool {
    let route = routes.lock().get(&id).cloned();
    let Some((slot, callback)) = route else {
        return false;
    };
    debug!(slot = %slot, "Hotkey triggered");
    let spawned = thread::Builder::new()
        .name("hotkey-callback".into())
        .spawn(move || callback());
    if let Err(e) = spawned {
        warn!(slot = %slot, error = %e, "Could not run hotkey callback");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Default)]
    struct MockBackend {
        installs: Arc<Mutex<Vec<Vec<u32>>>>,
        refuse: Arc<AtomicBool>,
    }

    impl HotkeyBackend for MockBackend {
        fn attach(&mut self, _sink: TriggerSink) {}

        fn install(&mut self, hotkeys: &[HotKey]) -> Result<()> {
            if self.refuse.load(Ordering::SeqCst) && !hotkeys.is_empty() {
                return Err(KsrError::registration_failed("refused"));
            }
            self.installs
                .lock()
                .push(hotkeys.iter().map(HotKey::id).collect());
            Ok(())
        }
    }

    fn dispatcher() -> (HotkeyDispatcher, MockBackend) {
        let backend = MockBackend::default();
        let dispatcher = HotkeyDispatcher::new(Box::new(backend.clone()), EventBus::default());
        (dispatcher, backend)
    }

    fn spec(text: &str) -> HotkeySpec {
        text.parse().unwrap()
    }

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_hotkey("f1").unwrap().as_deref(), Some("F1"));
        assert_eq!(
            normalize_hotkey("shift+CTRL+f5").unwrap().as_deref(),
            Some("Ctrl+Shift+F5")
        );
        assert_eq!(normalize_hotkey("win+e").unwrap().as_deref(), Some("Cmd+E"));
        assert_eq!(
            normalize_hotkey(" alt + page-down ").unwrap().as_deref(),
            Some("Alt+PageDown")
        );
        assert_eq!(normalize_hotkey("return").unwrap().as_deref(), Some("Enter"));
        assert_eq!(normalize_hotkey("ctrl+7").unwrap().as_deref(), Some("Ctrl+7"));
        assert_eq!(normalize_hotkey("F24").unwrap().as_deref(), Some("F24"));
        assert_eq!(normalize_hotkey("").unwrap(), None);
        assert_eq!(normalize_hotkey("None").unwrap(), None);
    }

    #[test]
    fn test_validation_rejects() {
        for bad in [
            "ctrl+alt+shift+cmd+a",
            "ctrl+ctrl+a",
            "ctrl+",
            "a+b",
            "ctrl",
            "F25",
            "F0",
            "ctrl+é",
            "ctrl+insert",
        ] {
            assert!(
                matches!(bad.parse::<HotkeySpec>(), Err(KsrError::InvalidHotkey { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_equivalent_specs_share_an_id() {
        assert_eq!(spec("ctrl+shift+a").id(), spec("Shift+Ctrl+A").id());
        assert_ne!(spec("ctrl+a").id(), spec("alt+a").id());
    }

    #[test]
    fn test_conflicting_binding_is_rejected() {
        let (dispatcher, _backend) = dispatcher();
        dispatcher.set_start_stop("ctrl+shift+r").unwrap();
        let err = dispatcher.set_play("Shift+Ctrl+R").unwrap_err();
        assert!(matches!(err, KsrError::HotkeyConflict(_)));
        assert_eq!(dispatcher.play_binding(), None);
    }

    #[test]
    fn test_invalid_binding_leaves_previous() {
        let (dispatcher, _backend) = dispatcher();
        dispatcher.set_play("F2").unwrap();
        assert!(dispatcher.set_play("ctrl+bogus").is_err());
        assert_eq!(dispatcher.play_binding().as_deref(), Some("F2"));
    }

    #[test]
    fn test_installs_only_bound_slots_with_callbacks() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.set_start_stop("F1").unwrap();
        dispatcher.set_play("F2").unwrap();
        dispatcher.on_start_stop(|| {}).unwrap();
        dispatcher.start().unwrap();

        assert!(dispatcher.is_active());
        assert_eq!(backend.installs.lock().last().unwrap(), &vec![spec("F1").id()]);

        dispatcher.on_play(|| {}).unwrap();
        assert_eq!(
            backend.installs.lock().last().unwrap(),
            &vec![spec("F1").id(), spec("F2").id()]
        );

        dispatcher.set_play("").unwrap();
        assert_eq!(backend.installs.lock().last().unwrap(), &vec![spec("F1").id()]);
    }

    #[test]
    fn test_refused_registration_reports_inactive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let backend = MockBackend::default();
        backend.refuse.store(true, Ordering::SeqCst);
        let dispatcher = HotkeyDispatcher::new(Box::new(backend.clone()), bus);

        dispatcher.on_start_stop(|| {}).unwrap();
        dispatcher.set_start_stop("F9").unwrap();
        let err = dispatcher.start().unwrap_err();
        assert!(matches!(err, KsrError::RegistrationFailed(_)));
        assert!(!dispatcher.is_active());
        assert_eq!(dispatcher.start_stop_binding().as_deref(), Some("F9"));
        assert!(!dispatcher.dispatch(spec("F9").id()));
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::HotkeysChanged { active: false }
        );
    }

    #[test]
    fn test_trigger_runs_callback_on_its_own_thread() {
        let (dispatcher, _backend) = dispatcher();
        let (tx, rx) = crossbeam_channel::bounded(1);
        dispatcher
            .on_play(move || {
                let name = thread::current().name().map(str::to_string);
                let _ = tx.send(name);
            })
            .unwrap();
        dispatcher.set_play("ctrl+p").unwrap();
        dispatcher.start().unwrap();

        assert!(dispatcher.dispatch(spec("ctrl+p").id()));
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some("hotkey-callback"));
        assert!(!dispatcher.dispatch(spec("ctrl+o").id()));
    }

    /// Backend whose installs can be held open from the test.
    #[derive(Clone)]
    struct GatedBackend {
        hold: Arc<AtomicBool>,
        entered: Sender<()>,
        release: Receiver<()>,
        log: Arc<Mutex<Vec<&'static str>>>,
        installed: Arc<Mutex<Vec<u32>>>,
    }

    impl GatedBackend {
        fn new() -> (Self, Receiver<()>, Sender<()>) {
            let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
            let (release_tx, release_rx) = crossbeam_channel::unbounded();
            let backend = Self {
                hold: Arc::new(AtomicBool::new(false)),
                entered: entered_tx,
                release: release_rx,
                log: Arc::new(Mutex::new(Vec::new())),
                installed: Arc::new(Mutex::new(Vec::new())),
            };
            (backend, entered_rx, release_tx)
        }
    }

    impl HotkeyBackend for GatedBackend {
        fn attach(&mut self, _sink: TriggerSink) {}

        fn install(&mut self, hotkeys: &[HotKey]) -> Result<()> {
            self.log.lock().push("begin");
            if self.hold.load(Ordering::SeqCst) {
                let _ = self.entered.send(());
                let _ = self.release.recv_timeout(Duration::from_secs(5));
            } else {
                thread::sleep(Duration::from_millis(20));
            }
            *self.installed.lock() = hotkeys.iter().map(HotKey::id).collect();
            self.log.lock().push("end");
            Ok(())
        }
    }

    #[test]
    fn test_trigger_during_replacement_fires_nothing() {
        let (backend, entered, release) = GatedBackend::new();
        let dispatcher = Arc::new(HotkeyDispatcher::new(
            Box::new(backend.clone()),
            EventBus::default(),
        ));
        let (fired_tx, fired_rx) = crossbeam_channel::unbounded();
        dispatcher
            .on_start_stop(move || {
                let _ = fired_tx.send(());
            })
            .unwrap();
        dispatcher.set_start_stop("F1").unwrap();
        dispatcher.start().unwrap();
        assert!(dispatcher.dispatch(spec("F1").id()));
        fired_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        backend.hold.store(true, Ordering::SeqCst);
        let rebinder = {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || dispatcher.set_start_stop("F3"))
        };
        entered.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(!dispatcher.dispatch(spec("F1").id()));
        assert!(!dispatcher.dispatch(spec("F3").id()));

        release.send(()).unwrap();
        rebinder.join().unwrap().unwrap();
        assert!(fired_rx.try_recv().is_err());

        assert!(!dispatcher.dispatch(spec("F1").id()));
        assert!(dispatcher.dispatch(spec("F3").id()));
        fired_rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_concurrent_rebinds_do_not_interleave() {
        let (backend, _entered, _release) = GatedBackend::new();
        let dispatcher = Arc::new(HotkeyDispatcher::new(
            Box::new(backend.clone()),
            EventBus::default(),
        ));
        dispatcher.on_start_stop(|| {}).unwrap();
        dispatcher.on_play(|| {}).unwrap();
        dispatcher.start().unwrap();
        backend.log.lock().clear();

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let workers: Vec<_> = [(HotkeySlot::StartStop, "ctrl+r"), (HotkeySlot::Play, "ctrl+p")]
            .into_iter()
            .map(|(slot, binding)| {
                let dispatcher = Arc::clone(&dispatcher);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    match slot {
                        HotkeySlot::StartStop => dispatcher.set_start_stop(binding),
                        HotkeySlot::Play => dispatcher.set_play(binding),
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        assert_eq!(*backend.log.lock(), vec!["begin", "end", "begin", "end"]);
        let mut installed = backend.installed.lock().clone();
        installed.sort();
        let mut expected = vec![spec("ctrl+r").id(), spec("ctrl+p").id()];
        expected.sort();
        assert_eq!(installed, expected);
    }

    #[cfg(windows)]
    #[test]
    fn test_pump_drains_thread_queue() {
        use winapi::um::processthreadsapi::GetCurrentThreadId;
        use winapi::um::winuser::{PeekMessageW, PostThreadMessageW, MSG, PM_NOREMOVE, WM_USER};

        unsafe {
            let mut msg: MSG = std::mem::zeroed();
            // Creates the message queue for this thread.
            PeekMessageW(&mut msg, std::ptr::null_mut(), 0, 0, PM_NOREMOVE);
            assert_ne!(PostThreadMessageW(GetCurrentThreadId(), WM_USER, 0, 0), 0);

            pump_messages();
            assert_eq!(
                PeekMessageW(&mut msg, std::ptr::null_mut(), 0, 0, PM_NOREMOVE),
                0
            );
        }
    }

    #[test]
    fn test_stop_clears_routes() {
        let (dispatcher, backend) = dispatcher();
        dispatcher.on_start_stop(|| {}).unwrap();
        dispatcher.set_start_stop("F1").unwrap();
        dispatcher.start().unwrap();
        dispatcher.stop();

        assert!(!dispatcher.is_active());
        assert!(!dispatcher.dispatch(spec("F1").id()));
        assert_eq!(backend.installs.lock().last().unwrap(), &Vec::<u32>::new());
    }
}
