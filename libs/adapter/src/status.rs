//! Status Poller
//!
//! Keeps one status watch outstanding on the transport. Each completion
//! updates the media state, forwards the indication upward and reposts the
//! watch from a tracked deferred task. Reposts take the post gate so halt's
//! cancel cannot miss a freshly posted watch.

use crate::adapter::AdapterCore;
use crate::completion::{CompletionLock, LockState};
use crate::error::InvariantViolation;
use crate::metrics::bump;
use crate::transport::{IoStatus, StatusCompletion, StatusIndication};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) struct StatusPoller {
    active: AtomicBool,
    lock: CompletionLock,
    request_id: AtomicU64,
    post_gate: Mutex<()>,
}

impl StatusPoller {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            lock: CompletionLock::new(),
            request_id: AtomicU64::new(0),
            post_gate: Mutex::new(()),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Post the first watch. No-op if already running.
    pub(crate) fn start(&self, core: &Arc<AdapterCore>) {
        if self.active.swap(true, Ordering::AcqRel) {
            return;
        }
        self.post(core);
    }

    fn post(&self, core: &Arc<AdapterCore>) {
        let _gate = self.post_gate.lock();
        if core.lifecycle.is_halting() || !self.is_active() {
            self.active.store(false, Ordering::Release);
            return;
        }
        let Some(transport) = core.transport() else {
            self.active.store(false, Ordering::Release);
            return;
        };
        if !core.lifecycle.try_add_ref() {
            self.active.store(false, Ordering::Release);
            return;
        }

        let id = core.next_request_id();
        self.request_id.store(id, Ordering::Release);
        self.lock.begin();

        let completion_core = Arc::clone(core);
        transport.post_status_watch(
            id,
            Box::new(move |completion| {
                completion_core
                    .status
                    .on_complete(&completion_core, completion)
            }),
        );
    }

    fn on_complete(&self, core: &Arc<AdapterCore>, completion: StatusCompletion) {
        match self.lock.try_complete() {
            // Halt is cancelling; it drops the reference
            LockState::CancelStarted => return,
            LockState::Cancelable | LockState::CancelComplete => {}
            state => InvariantViolation::DisposalConflict {
                operation: "status completion",
                state,
            }
            .fatal(),
        }

        match completion.status {
            IoStatus::Success => {
                if let Some(indication) = completion.indication {
                    self.handle_indication(core, indication);
                }
                self.schedule_repost(core);
            }
            IoStatus::Warning(code) => {
                debug!(adapter = %core.name(), code, "Status watch completed with warning");
                self.schedule_repost(core);
            }
            IoStatus::Cancelled => {
                self.active.store(false, Ordering::Release);
            }
            status => {
                warn!(adapter = %core.name(), ?status, "Status watch failed, polling stopped");
                self.active.store(false, Ordering::Release);
            }
        }
        core.lifecycle.release_ref();
    }

    fn handle_indication(&self, core: &Arc<AdapterCore>, indication: StatusIndication) {
        bump(&core.counters.status_indications);
        match &indication {
            StatusIndication::MediaConnect => {
                info!(adapter = %core.name(), "Media connected");
                core.lifecycle.set_disconnected(false);
            }
            StatusIndication::MediaDisconnect => {
                info!(adapter = %core.name(), "Media disconnected");
                core.lifecycle.set_disconnected(true);
            }
            StatusIndication::ResetStart => info!(adapter = %core.name(), "Transport reset started"),
            StatusIndication::ResetEnd => info!(adapter = %core.name(), "Transport reset finished"),
            StatusIndication::Other { code, payload } => {
                debug!(adapter = %core.name(), code, len = payload.len(), "Status indication")
            }
        }
        core.upper.indicate_status(indication);
    }

    fn schedule_repost(&self, core: &Arc<AdapterCore>) {
        if core.lifecycle.is_halting() {
            self.active.store(false, Ordering::Release);
            return;
        }
        let task_core = Arc::clone(core);
        let spawned = core.lifecycle.try_spawn_tracked(async move {
            task_core.status.post(&task_core);
        });
        if !spawned {
            self.active.store(false, Ordering::Release);
        }
    }

    /// Stop polling and cancel the outstanding watch
    pub(crate) fn cancel(&self, core: &Arc<AdapterCore>) {
        self.active.store(false, Ordering::Release);
        let _gate = self.post_gate.lock();

        if self.lock.try_cancel() != LockState::Cancelable {
            return;
        }
        if let Some(transport) = core.transport() {
            transport.cancel(self.request_id.load(Ordering::Acquire));
        }
        match self.lock.finish_cancel() {
            // Completion yielded; its reference is ours to drop
            LockState::Completed => core.lifecycle.release_ref(),
            LockState::CancelStarted => {}
            state => InvariantViolation::DisposalConflict {
                operation: "status cancel",
                state,
            }
            .fatal(),
        }
    }
}
