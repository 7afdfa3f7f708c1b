//! Per-session shared state.
//!
//! Every thread operating on one session (the I/O thread and at most one
//! control thread) shares a single [`SessionState`]. The liveness lock only
//! guards `alive` and `waiting_threads`; it is never held across an engine
//! call or a transport wait.

use crate::callbacks::{CallbackContext, HandshakeInfo};
use crate::error::CallbackError;
use interlock_wakeup::{open_channel, WakeupChannel, WakeupKind};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Number of signals sent when a session dies: one per possible waiter
/// (one reader and one writer)
pub const DEATH_SIGNALS: usize = 2;

#[derive(Debug)]
struct Liveness {
    alive: bool,
    waiting_threads: usize,
}

/// State shared by every thread referencing one session
pub struct SessionState {
    id: Uuid,
    liveness: Mutex<Liveness>,
    wakeup: Option<Box<dyn WakeupChannel>>,
    callbacks: Mutex<Option<CallbackContext>>,
    pending_callback_error: Mutex<Option<CallbackError>>,
    protocols: Vec<Vec<u8>>,
    handshake_info: OnceCell<HandshakeInfo>,
}

impl SessionState {
    /// Create a live session with a fresh wakeup channel
    pub fn new(kind: WakeupKind, protocols: Vec<Vec<u8>>) -> io::Result<Arc<Self>> {
        let wakeup = open_channel(kind)?;
        let state = Self::build(Some(wakeup), protocols);
        debug!("Created session {} with {:?} wakeup", state.id, state.wakeup);
        Ok(Arc::new(state))
    }

    /// Create a live session that never waits on a transport.
    ///
    /// No wakeup channel is opened; [`SessionState::wakeup`] returns `None`.
    pub fn without_wakeup(protocols: Vec<Vec<u8>>) -> Arc<Self> {
        let state = Self::build(None, protocols);
        debug!("Created session {} without wakeup channel", state.id);
        Arc::new(state)
    }

    fn build(wakeup: Option<Box<dyn WakeupChannel>>, protocols: Vec<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            liveness: Mutex::new(Liveness {
                alive: true,
                waiting_threads: 0,
            }),
            wakeup,
            callbacks: Mutex::new(None),
            pending_callback_error: Mutex::new(None),
            protocols,
            handshake_info: OnceCell::new(),
        }
    }

    /// Session identifier used in log fields
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the session may still perform I/O
    pub fn is_alive(&self) -> bool {
        self.liveness.lock().alive
    }

    /// Threads currently suspended waiting for the transport
    pub fn waiting_threads(&self) -> usize {
        self.liveness.lock().waiting_threads
    }

    /// Mark the session dead and wake every waiter.
    ///
    /// Returns `true` for the call that actually flipped liveness. Later calls
    /// are no-ops.
    pub fn mark_dead(&self) -> bool {
        {
            let mut liveness = self.liveness.lock();
            if !liveness.alive {
                return false;
            }
            liveness.alive = false;
            debug!(
                "Session {} marked dead with {} waiting thread(s)",
                self.id, liveness.waiting_threads
            );
        }

        if let Some(wakeup) = &self.wakeup {
            for _ in 0..DEATH_SIGNALS {
                if let Err(e) = wakeup.signal() {
                    warn!("Failed to signal wakeup for session {}: {}", self.id, e);
                }
            }
        }
        true
    }

    /// Register the calling thread as a transport waiter.
    ///
    /// Returns `None` when the session is already dead; the caller must not
    /// wait in that case.
    pub fn register_waiter(&self) -> Option<WaiterGuard<'_>> {
        let mut liveness = self.liveness.lock();
        if !liveness.alive {
            return None;
        }
        liveness.waiting_threads += 1;
        Some(WaiterGuard { state: self })
    }

    /// Wake a waiter after ciphertext moved, if anyone is waiting
    pub fn notify_progress(&self) {
        let Some(wakeup) = &self.wakeup else {
            return;
        };
        if self.waiting_threads() == 0 {
            return;
        }
        trace!("Session {} signalling progress to waiters", self.id);
        if let Err(e) = wakeup.signal() {
            warn!("Failed to signal progress for session {}: {}", self.id, e);
        }
    }

    /// The session's wakeup channel; `None` for sessions that never wait
    pub fn wakeup(&self) -> Option<&dyn WakeupChannel> {
        self.wakeup.as_deref()
    }

    /// Install the callback context for the duration of one engine call
    pub fn enter_callbacks(&self, context: Option<&CallbackContext>) -> CallbackScope<'_> {
        *self.callbacks.lock() = context.cloned();
        CallbackScope { state: self }
    }

    /// Callback context of the engine call in progress
    pub fn callbacks(&self) -> Option<CallbackContext> {
        self.callbacks.lock().clone()
    }

    /// Drop any callback error left over from an earlier engine call
    pub fn clear_pending_callback_error(&self) {
        if let Some(stale) = self.pending_callback_error.lock().take() {
            debug!("Session {} discarding stale callback error: {}", self.id, stale);
        }
    }

    /// Record the error raised by a callback inside the engine
    pub fn set_pending_callback_error(&self, err: CallbackError) {
        let mut pending = self.pending_callback_error.lock();
        if pending.is_none() {
            *pending = Some(err);
        }
    }

    /// Whether a callback failed during the current engine call
    pub fn has_pending_callback_error(&self) -> bool {
        self.pending_callback_error.lock().is_some()
    }

    /// Take the error raised by a callback, if any
    pub fn take_pending_callback_error(&self) -> Option<CallbackError> {
        self.pending_callback_error.lock().take()
    }

    /// ALPN protocols configured for this session
    pub fn protocols(&self) -> &[Vec<u8>] {
        &self.protocols
    }

    /// Parameters of the completed handshake
    pub fn handshake_info(&self) -> Option<&HandshakeInfo> {
        self.handshake_info.get()
    }

    /// Store handshake parameters; the first recorded value wins
    pub fn record_handshake(&self, info: HandshakeInfo) -> &HandshakeInfo {
        self.handshake_info.get_or_init(|| info)
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let liveness = self.liveness.lock();
        f.debug_struct("SessionState")
            .field("id", &self.id)
            .field("alive", &liveness.alive)
            .field("waiting_threads", &liveness.waiting_threads)
            .field("wakeup", &self.wakeup)
            .finish()
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        let liveness = self.liveness.get_mut();
        if liveness.waiting_threads != 0 {
            error!(
                "Session {} torn down with {} waiting thread(s)",
                self.id, liveness.waiting_threads
            );
        }
        debug_assert_eq!(liveness.waiting_threads, 0);
        if liveness.alive {
            warn!("Session {} torn down while still alive", self.id);
        }
    }
}

/// Keeps the waiter count raised while a thread is suspended
#[derive(Debug)]
pub struct WaiterGuard<'a> {
    state: &'a SessionState,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut liveness = self.state.liveness.lock();
        liveness.waiting_threads -= 1;
    }
}

/// Clears the callback context when the engine call returns
#[derive(Debug)]
pub struct CallbackScope<'a> {
    state: &'a SessionState,
}

impl Drop for CallbackScope<'_> {
    fn drop(&mut self) {
        *self.state.callbacks.lock() = None;
    }
}
