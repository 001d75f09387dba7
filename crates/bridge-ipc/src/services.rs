//! The two services a duplex bridge session exposes.
//!
//! The main application hosts [`BridgeEvents`] so the bridge can report on
//! its progress; the bridge hosts [`BridgeWork`] so the application can park
//! a call until the bridge is done.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::event::{Completion, CrossProcessEvent, WaitHandle};
use crate::service::{DispatchTableBuilder, Service};

/// Operation names on the wire.
pub struct Operations;

impl Operations {
    pub const READY: &'static str = "ready";
    pub const WORK_COMPLETE: &'static str = "workComplete";
    pub const SET_PROJECT_NAME: &'static str = "setProjectName";
    pub const SENT_JUMP_URL: &'static str = "sentJumpUrl";
    pub const WORK_ONGOING: &'static str = "workOngoing";
}

/// What the bridge has reported so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeRecord {
    pub ready: bool,
    /// Set by `workComplete`.
    pub changes_received: Option<bool>,
    /// Last project chosen; an empty name clears it.
    pub project_name: Option<String>,
    pub jump_urls: Vec<String>,
}

/// Service the main application hosts for the bridge.
///
/// Every call pulses [`activity`](Self::activity). `workComplete` is terminal
/// and also signals [`completion`](Self::completion).
#[derive(Debug, Default)]
pub struct BridgeEvents {
    record: Mutex<BridgeRecord>,
    activity: WaitHandle,
    completion: CrossProcessEvent,
}

impl BridgeEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self) -> MutexGuard<'_, BridgeRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut BridgeRecord)) {
        f(&mut self.record());
        self.activity.pulse();
    }

    pub fn snapshot(&self) -> BridgeRecord {
        self.record().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.record().ready
    }

    pub fn activity(&self) -> WaitHandle {
        self.activity.clone()
    }

    pub fn completion(&self) -> &CrossProcessEvent {
        &self.completion
    }

    fn ready(&self) {
        debug!("Bridge reported ready");
        self.update(|r| r.ready = true);
    }

    fn work_complete(&self, changes_received: bool) {
        info!("Bridge finished its work (changes received: {})", changes_received);
        self.update(|r| r.changes_received = Some(changes_received));
        self.completion.signal(changes_received);
    }

    fn set_project_name(&self, path: String) {
        debug!("Bridge chose project {:?}", path);
        self.update(|r| r.project_name = (!path.is_empty()).then_some(path));
    }

    fn sent_jump_url(&self, url: String) {
        debug!("Bridge sent jump url {}", url);
        self.update(|r| r.jump_urls.push(url));
    }
}

impl Service for BridgeEvents {
    fn register(self: Arc<Self>, ops: &mut DispatchTableBuilder) {
        let svc = self.clone();
        ops.operation(Operations::READY, move |_: ()| {
            svc.ready();
            async {}
        });
        let svc = self.clone();
        ops.terminal(Operations::WORK_COMPLETE, move |(changes,): (bool,)| {
            svc.work_complete(changes);
            async {}
        });
        let svc = self.clone();
        ops.operation(Operations::SET_PROJECT_NAME, move |(path,): (String,)| {
            svc.set_project_name(path);
            async {}
        });
        let svc = self;
        ops.operation(Operations::SENT_JUMP_URL, move |(url,): (String,)| {
            svc.sent_jump_url(url);
            async {}
        });
    }
}

/// Service the bridge hosts for the main application.
///
/// `workOngoing` parks until the bridge signals [`event`](Self::event), so
/// the application's call only completes once the bridge is done.
#[derive(Debug, Default)]
pub struct BridgeWork {
    event: CrossProcessEvent,
    outcome: Mutex<Option<Completion>>,
}

impl BridgeWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park on an event the caller also signals.
    pub fn with_event(event: CrossProcessEvent) -> Self {
        Self {
            event,
            outcome: Mutex::default(),
        }
    }

    pub fn event(&self) -> &CrossProcessEvent {
        &self.event
    }

    /// How the last `workOngoing` wait ended.
    pub fn outcome(&self) -> Option<Completion> {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn work_ongoing(&self) {
        debug!("Application is waiting for the bridge to finish");
        match self.event.wait().await {
            Ok(completion) => {
                debug!("Bridge work wait ended: {:?}", completion);
                *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(completion);
            }
            // A second workOngoing while one is parked just returns.
            Err(e) => debug!("workOngoing not parked: {}", e),
        }
    }
}

impl Service for BridgeWork {
    fn register(self: Arc<Self>, ops: &mut DispatchTableBuilder) {
        let svc = self;
        ops.terminal(Operations::WORK_ONGOING, move |_: ()| {
            let svc = svc.clone();
            async move { svc.work_ongoing().await }
        });
    }
}
