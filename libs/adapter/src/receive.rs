//! Receive Pipeline
//!
//! Keeps up to `target` reads posted to the transport. Replenishment runs as
//! a tracked deferred task guarded by a single `scheduled` flag, so any
//! number of triggers collapse into one pass. Released blocks re-trigger it
//! once the busy count drops below the low watermark.
//!
//! Accepted frames go upward as [`ReceivedFrame`] handles. The block stays
//! busy, and the adapter reference taken by its read stays held, until the
//! last handle is dropped.

use crate::adapter::AdapterCore;
use crate::completion::LockState;
use crate::error::InvariantViolation;
use crate::metrics::bump;
use crate::pool::{PoolKind, PoolStats, SlotId, TransferPool};
use crate::transport::{IoCompletion, IoStatus, Transport};
use bytes::{Bytes, BytesMut};
use parking_lot::{MappedRwLockReadGuard, Mutex};
use relay_config::defaults::ethernet::HEADER_SIZE;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub(crate) struct ReceivePipeline {
    pool: TransferPool,
    target: usize,
    scheduled: AtomicBool,
    post_gate: Mutex<()>,
    consecutive_errors: AtomicU32,
    max_consecutive_errors: u32,
}

impl ReceivePipeline {
    pub(crate) fn new(
        capacity: usize,
        buffer_size: usize,
        low_watermark: usize,
        max_consecutive_errors: u32,
    ) -> Self {
        Self {
            pool: TransferPool::new(PoolKind::Receive, capacity, buffer_size, low_watermark),
            target: capacity,
            scheduled: AtomicBool::new(false),
            post_gate: Mutex::new(()),
            consecutive_errors: AtomicU32::new(0),
            max_consecutive_errors,
        }
    }

    pub(crate) fn pool(&self) -> &TransferPool {
        &self.pool
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Schedule a replenishment pass unless one is already pending
    pub(crate) fn schedule_replenish(&self, core: &Arc<AdapterCore>) {
        if !core.lifecycle.posting_reads() {
            return;
        }
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let task_core = Arc::clone(core);
        let spawned = core.lifecycle.try_spawn_tracked(async move {
            task_core.receive.replenish(&task_core);
        });
        if !spawned {
            self.scheduled.store(false, Ordering::Release);
        }
    }

    fn replenish(&self, core: &Arc<AdapterCore>) {
        loop {
            {
                let _gate = self.post_gate.lock();
                self.post_until_target(core);
            }
            self.scheduled.store(false, Ordering::Release);

            // Work may have arrived between the last post and clearing the flag
            if !core.lifecycle.posting_reads() || self.pool.busy() >= self.target {
                return;
            }
            if self
                .scheduled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    /// Post gate held
    fn post_until_target(&self, core: &Arc<AdapterCore>) {
        let Some(transport) = core.transport() else {
            return;
        };

        while core.lifecycle.posting_reads() && self.pool.busy() < self.target {
            if !core.lifecycle.try_add_ref() {
                break;
            }
            let Some(slot) = self.pool.acquire() else {
                core.lifecycle.release_ref();
                break;
            };
            self.post(core, &transport, slot);
        }
    }

    /// Caller holds the adapter reference for this read
    fn post(&self, core: &Arc<AdapterCore>, transport: &Arc<dyn Transport>, slot: SlotId) {
        let block = self.pool.block(slot);
        let mut buffer = block
            .take_buffer()
            .unwrap_or_else(|| BytesMut::zeroed(self.pool.buffer_size()));
        buffer.resize(self.pool.buffer_size(), 0);

        let id = core.next_request_id();
        block.set_request_id(id);
        block.lock().begin();

        trace!(adapter = %core.name(), slot, id, "Posting read");
        let completion_core = Arc::clone(core);
        transport.post_read(
            id,
            buffer,
            Box::new(move |completion| {
                completion_core
                    .receive
                    .on_read_complete(&completion_core, slot, completion)
            }),
        );
    }

    fn on_read_complete(&self, core: &Arc<AdapterCore>, slot: SlotId, completion: IoCompletion) {
        let block = self.pool.block(slot);
        block.park(completion);
        match block.lock().try_complete() {
            LockState::CancelStarted => {}
            LockState::Cancelable | LockState::CancelComplete => self.dispose(core, slot),
            state => InvariantViolation::DisposalConflict {
                operation: "read completion",
                state,
            }
            .fatal(),
        }
    }

    /// Handle a finished read. Runs on exactly one of the completion and
    /// cancellation paths.
    fn dispose(&self, core: &Arc<AdapterCore>, slot: SlotId) {
        let block = self.pool.block(slot);
        match block.take_status() {
            IoStatus::Success | IoStatus::Warning(_) => {
                self.consecutive_errors.store(0, Ordering::Release);

                if block.data_len() < HEADER_SIZE {
                    bump(&core.counters.runt_frames);
                    self.recycle(core, slot);
                    return;
                }

                let station = core.current_address();
                if !core.filter.read().accepts(&block.data(), station) {
                    bump(&core.counters.filtered_frames);
                    self.recycle(core, slot);
                    return;
                }

                bump(&core.counters.good_receives);
                block.init_refs(1);
                // The read's adapter reference moves into the handle
                core.upper.indicate_receive(ReceivedFrame {
                    core: Arc::clone(core),
                    slot,
                });
            }
            IoStatus::Cancelled => {
                bump(&core.counters.cancelled_transfers);
                self.recycle(core, slot);
            }
            IoStatus::DeviceRemoved => {
                bump(&core.counters.receive_errors);
                warn!(adapter = %core.name(), "Transport device removed, no further reads");
                core.lifecycle.stop_reads();
                self.recycle(core, slot);
            }
            IoStatus::Error(code) => {
                bump(&core.counters.receive_errors);
                let consecutive = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
                if consecutive > self.max_consecutive_errors {
                    warn!(
                        adapter = %core.name(),
                        code,
                        consecutive,
                        "Persistent read errors, no further reads"
                    );
                    core.lifecycle.stop_reads();
                } else {
                    debug!(adapter = %core.name(), code, consecutive, "Read failed");
                }
                self.recycle(core, slot);
            }
        }
    }

    /// Return a block, maybe trigger replenishment, drop the read's reference
    fn recycle(&self, core: &Arc<AdapterCore>, slot: SlotId) {
        match self.pool.release(slot) {
            Ok(true) => self.schedule_replenish(core),
            Ok(false) => {}
            Err(violation) => violation.fatal(),
        }
        core.lifecycle.release_ref();
    }

    /// Stop replenishment and cancel posted reads. Posting must already be off.
    pub(crate) fn shutdown(&self, core: &Arc<AdapterCore>) {
        self.pool.set_replenish(false);
        drop(self.post_gate.lock());

        let Some(transport) = core.transport() else {
            return;
        };
        for slot in self.pool.busy_slots() {
            let block = self.pool.block(slot);
            if block.lock().try_cancel() != LockState::Cancelable {
                continue;
            }
            transport.cancel(block.request_id());
            match block.lock().finish_cancel() {
                LockState::Completed => self.dispose(core, slot),
                LockState::CancelStarted => {}
                state => InvariantViolation::DisposalConflict {
                    operation: "read cancel",
                    state,
                }
                .fatal(),
            }
        }
    }
}

/// Handle to a received frame lent upward.
///
/// Clones share the underlying transfer block; the block returns to the
/// pool when the last handle is dropped.
pub struct ReceivedFrame {
    core: Arc<AdapterCore>,
    slot: SlotId,
}

impl ReceivedFrame {
    /// Frame bytes, header included
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        self.core.receive.pool.block(self.slot).data()
    }

    pub fn len(&self) -> usize {
        self.core.receive.pool.block(self.slot).data_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the frame out so the block can be returned early
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data())
    }

    /// Name of the adapter that received the frame
    pub fn adapter(&self) -> &str {
        self.core.name()
    }
}

impl Clone for ReceivedFrame {
    fn clone(&self) -> Self {
        self.core.receive.pool.block(self.slot).add_ref();
        Self {
            core: Arc::clone(&self.core),
            slot: self.slot,
        }
    }
}

impl Drop for ReceivedFrame {
    fn drop(&mut self) {
        let receive = &self.core.receive;
        if receive.pool.block(self.slot).drop_ref() == 0 {
            receive.recycle(&self.core, self.slot);
        }
    }
}

impl fmt::Debug for ReceivedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedFrame")
            .field("adapter", &self.core.name())
            .field("slot", &self.slot)
            .field("len", &self.len())
            .finish()
    }
}
