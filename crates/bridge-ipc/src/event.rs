//! Shared wait handle and the cross-process event built on it.
//!
//! [`WaitHandle`] is a condition variable: waiters park until the next
//! [`pulse`](WaitHandle::pulse). The generation counter is only read or
//! written under its mutex, so a pulse that lands between a waiter's check
//! and its park is never lost.
//!
//! [`CrossProcessEvent`] pairs a handle with a one-shot flag. One process
//! parks in [`wait`](CrossProcessEvent::wait) (typically inside a long-running
//! operation handler) until the other process calls an operation whose handler
//! [`signal`](CrossProcessEvent::signal)s the event. Any other pulse of the
//! handle, such as a client reporting that its peer vanished, also ends the
//! wait so a parked task never outlives the connection it depends on.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::trace;

use crate::error::{IpcError, Result};

#[derive(Debug, Default)]
struct WaitInner {
    generation: Mutex<u64>,
    notify: Notify,
}

/// Cloneable condition variable shared between a consumer and a client.
#[derive(Debug, Clone, Default)]
pub struct WaitHandle {
    inner: Arc<WaitInner>,
}

impl WaitHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.inner
            .generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of pulses so far.
    pub fn generation(&self) -> u64 {
        *self.lock()
    }

    /// Wake every current waiter.
    pub fn pulse(&self) {
        let mut generation = self.lock();
        *generation = generation.wrapping_add(1);
        trace!("WaitHandle pulsed (generation {})", *generation);
        self.inner.notify.notify_waiters();
    }

    /// Park until the generation moves past `seen`; returns the new value.
    pub async fn wait_past(&self, seen: u64) -> u64 {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.generation();
            if current != seen {
                return current;
            }
            notified.await;
        }
    }

    /// Park until the next pulse.
    pub async fn wait(&self) {
        let seen = self.generation();
        self.wait_past(seen).await;
    }

    /// Two handles are the same condition variable.
    pub fn same_as(&self, other: &WaitHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// How a wait on a [`CrossProcessEvent`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The peer signalled completion with this flag.
    Signaled(bool),
    /// The handle was pulsed without a signal (e.g. the peer went away).
    Interrupted,
}

impl Completion {
    pub fn flag(self) -> Option<bool> {
        match self {
            Completion::Signaled(flag) => Some(flag),
            Completion::Interrupted => None,
        }
    }
}

#[derive(Debug, Default)]
struct EventState {
    waiting: bool,
    signaled: Option<bool>,
}

/// "Wait until the other side says so."
///
/// Owned by a service instance (or injected into one), never global, so
/// independent hosts in one process don't share it. Only one wait may be
/// outstanding at a time; a second concurrent wait is rejected.
#[derive(Debug, Clone, Default)]
pub struct CrossProcessEvent {
    handle: WaitHandle,
    state: Arc<Mutex<EventState>>,
}

impl CrossProcessEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the event on an existing handle, so pulses from a client sharing
    /// that handle also end the wait.
    pub fn with_handle(handle: WaitHandle) -> Self {
        Self {
            handle,
            state: Arc::default(),
        }
    }

    pub fn wait_handle(&self) -> WaitHandle {
        self.handle.clone()
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record completion and wake the waiter. A signal with nobody waiting is
    /// kept until the next wait.
    pub fn signal(&self, flag: bool) {
        self.lock().signaled = Some(flag);
        self.handle.pulse();
    }

    /// True if a signal is pending and no wait has consumed it yet.
    pub fn is_signaled(&self) -> bool {
        self.lock().signaled.is_some()
    }

    /// True while a wait is parked.
    pub fn is_waiting(&self) -> bool {
        self.lock().waiting
    }

    /// Drop any pending signal.
    pub fn reset(&self) {
        self.lock().signaled = None;
    }

    /// Park until signalled or until the handle is pulsed.
    pub async fn wait(&self) -> Result<Completion> {
        self.wait_since(self.handle.generation()).await
    }

    /// Like [`wait`](Self::wait), but a pulse after handle generation `seen`
    /// ends the wait even if it happened before this call.
    pub async fn wait_since(&self, seen: u64) -> Result<Completion> {
        {
            let mut state = self.lock();
            if state.waiting {
                return Err(IpcError::OverlappingWait);
            }
            if let Some(flag) = state.signaled.take() {
                return Ok(Completion::Signaled(flag));
            }
            state.waiting = true;
        }
        let _waiting = WaitingGuard { event: self };

        self.handle.wait_past(seen).await;

        let signaled = self.lock().signaled.take();
        Ok(match signaled {
            Some(flag) => Completion::Signaled(flag),
            None => Completion::Interrupted,
        })
    }

    /// [`wait`](Self::wait) for threads outside the async runtime.
    pub fn wait_blocking(&self) -> Result<Completion> {
        futures::executor::block_on(self.wait())
    }
}

/// Clears the waiting flag even if the wait future is dropped mid-park.
struct WaitingGuard<'a> {
    event: &'a CrossProcessEvent,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.event.lock().waiting = false;
    }
}
