//! Keyboard input plumbing: where key events come from and where injected
//! keystrokes go.
//!
//! [`KeySource`] opens a subscription to key events; the returned
//! [`ListenerGuard`] closes it when dropped. [`KeyInjector`] emits key-down
//! and key-up events. The `rdev` implementations talk to the OS; the
//! [`VirtualKeyboard`] loops injected keys back to its own subscriber and
//! keeps a log of them, which is what dry runs and tests use.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rdev::{EventType, Key};
use tracing::{debug, info, warn};

use crate::error::{KsrError, Result};

/// How long a fresh `rdev::listen` thread gets to report a startup failure.
const LISTEN_STARTUP_GRACE: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventKind {
    Down,
    Up,
}

/// A key transition reported by a [`KeySource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyEvent {
    pub kind: KeyEventKind,
    pub key: Key,
}

impl KeyEvent {
    pub fn down(key: Key) -> Self {
        Self {
            kind: KeyEventKind::Down,
            key,
        }
    }

    pub fn up(key: Key) -> Self {
        Self {
            kind: KeyEventKind::Up,
            key,
        }
    }
}

/// Callback invoked on the listener thread for every key event.
pub type KeyHandler = Arc<dyn Fn(KeyEvent) + Send + Sync>;

/// Open subscription to a [`KeySource`]. Closing happens exactly once,
/// on [`ListenerGuard::close`] or on drop.
pub struct ListenerGuard {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerGuard {
    pub fn new(close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            close: Some(Box::new(close)),
        }
    }

    pub fn close(mut self) {
        self.run_close();
    }

    fn run_close(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.run_close();
    }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("open", &self.close.is_some())
            .finish()
    }
}

/// Source of key-down/key-up events.
pub trait KeySource: Send + Sync {
    /// Start delivering events to `handler` until the guard is dropped.
    fn open(&self, handler: KeyHandler) -> Result<ListenerGuard>;
}

/// Sink for synthetic key events.
pub trait KeyInjector: Send + Sync {
    fn press(&self, key: Key) -> Result<()>;
    fn release(&self, key: Key) -> Result<()>;
}

/// Routes events from the single process-wide `rdev::listen` thread to the
/// current subscriber.
struct HookRouter {
    subscriber: Mutex<Option<(u64, KeyHandler)>>,
    running: AtomicBool,
    start_lock: Mutex<()>,
    next_id: AtomicU64,
}

fn router() -> &'static Arc<HookRouter> {
    static ROUTER: OnceLock<Arc<HookRouter>> = OnceLock::new();
    ROUTER.get_or_init(|| {
        Arc::new(HookRouter {
            subscriber: Mutex::new(None),
            running: AtomicBool::new(false),
            start_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        })
    })
}

impl HookRouter {
    fn ensure_running(self: &Arc<Self>) -> Result<()> {
        let _guard = self.start_lock.lock();
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (err_tx, err_rx) = crossbeam_channel::bounded::<String>(1);
        let router = Arc::clone(self);
        self.running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name("key-listener".into())
            .spawn(move || {
                let dispatcher = Arc::clone(&router);
                if let Err(e) = rdev::listen(move |event| dispatcher.dispatch(event.event_type)) {
                    router.running.store(false, Ordering::SeqCst);
                    let _ = err_tx.send(format!("{e:?}"));
                }
            });
        if let Err(e) = spawned {
            self.running.store(false, Ordering::SeqCst);
            return Err(KsrError::listener_failed(e.to_string()));
        }

        match err_rx.recv_timeout(LISTEN_STARTUP_GRACE) {
            Ok(reason) => Err(KsrError::listener_failed(reason)),
            Err(_) => {
                info!("OS key listener started");
                Ok(())
            }
        }
    }

    fn dispatch(&self, event_type: EventType) {
        let event = match event_type {
            EventType::KeyPress(key) => KeyEvent::down(key),
            EventType::KeyRelease(key) => KeyEvent::up(key),
            _ => return,
        };
        let handler = self.subscriber.lock().as_ref().map(|(_, h)| Arc::clone(h));
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn install(&self, handler: KeyHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self.subscriber.lock().replace((id, handler));
        if previous.is_some() {
            warn!("Replacing an open key listener subscription");
        }
        id
    }

    fn remove(&self, id: u64) {
        let mut subscriber = self.subscriber.lock();
        if subscriber.as_ref().is_some_and(|(current, _)| *current == id) {
            *subscriber = None;
            debug!("Key listener subscription closed");
        }
    }
}

/// OS key events via `rdev::listen`.
///
/// `rdev` cannot stop a listener once started, so the OS hook is installed
/// on first use and kept for the life of the process; opening and closing
/// only attaches and detaches the subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct RdevKeySource;

impl KeySource for RdevKeySource {
    fn open(&self, handler: KeyHandler) -> Result<ListenerGuard> {
        let router = router();
        router.ensure_running()?;
        let id = router.install(handler);
        Ok(ListenerGuard::new(move || router.remove(id)))
    }
}

/// Injects keys into the OS input stream via `rdev::simulate`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RdevInjector;

impl RdevInjector {
    fn simulate(&self, event: EventType, key: Key) -> Result<()> {
        rdev::simulate(&event)
            .map_err(|e| KsrError::injection_failed(format!("{key:?}"), format!("{e:?}")))
    }
}

impl KeyInjector for RdevInjector {
    fn press(&self, key: Key) -> Result<()> {
        self.simulate(EventType::KeyPress(key), key)
    }

    fn release(&self, key: Key) -> Result<()> {
        self.simulate(EventType::KeyRelease(key), key)
    }
}

#[derive(Default)]
struct VirtualInner {
    handler: Mutex<Option<KeyHandler>>,
    log: Mutex<Vec<KeyEvent>>,
}

/// In-process keyboard: acts as both a [`KeySource`] and a [`KeyInjector`].
///
/// Injected events are appended to a log and delivered to the open
/// subscriber, if any. `key_down`/`key_up` simulate a user typing without
/// touching the log.
#[derive(Clone, Default)]
pub struct VirtualKeyboard {
    inner: Arc<VirtualInner>,
}

impl VirtualKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_down(&self, key: Key) {
        self.deliver(KeyEvent::down(key));
    }

    pub fn key_up(&self, key: Key) {
        self.deliver(KeyEvent::up(key));
    }

    pub fn tap(&self, key: Key) {
        self.key_down(key);
        self.key_up(key);
    }

    /// Events received through the [`KeyInjector`] side, oldest first.
    pub fn injected(&self) -> Vec<KeyEvent> {
        self.inner.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.inner.log.lock().clear();
    }

    pub fn is_listening(&self) -> bool {
        self.inner.handler.lock().is_some()
    }

    fn deliver(&self, event: KeyEvent) {
        let handler = self.inner.handler.lock().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn inject(&self, event: KeyEvent) {
        self.inner.log.lock().push(event);
        self.deliver(event);
    }
}

impl std::fmt::Debug for VirtualKeyboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualKeyboard")
            .field("listening", &self.is_listening())
            .field("injected", &self.inner.log.lock().len())
            .finish()
    }
}

impl KeySource for VirtualKeyboard {
    fn open(&self, handler: KeyHandler) -> Result<ListenerGuard> {
        *self.inner.handler.lock() = Some(handler);
        let inner = Arc::clone(&self.inner);
        Ok(ListenerGuard::new(move || {
            inner.handler.lock().take();
        }))
    }
}

impl KeyInjector for VirtualKeyboard {
    fn press(&self, key: Key) -> Result<()> {
        self.inject(KeyEvent::down(key));
        Ok(())
    }

    fn release(&self, key: Key) -> Result<()> {
        self.inject(KeyEvent::up(key));
        Ok(())
    }
}
