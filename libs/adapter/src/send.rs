//! Send Pipeline
//!
//! Every submitted frame enters a FIFO pending queue. A single drainer
//! moves frames from the queue into free transfer blocks and posts them,
//! so submission order is preserved even when the pool is exhausted.
//!
//! The drainer is guarded by a try-lock gate plus a "drain requested" flag:
//! a caller that finds the gate taken leaves the flag set and the current
//! holder loops once more before leaving. Completions that arrive inline
//! while the drainer is posting never recurse into it.
//!
//! Teardown takes the gate as a barrier, fails queued frames as aborted and
//! cancels posted blocks through their completion locks.

use crate::adapter::AdapterCore;
use crate::completion::LockState;
use crate::error::InvariantViolation;
use crate::metrics::bump;
use crate::pool::{PoolKind, PoolStats, SlotId, TransferPool};
use crate::transport::{IoCompletion, IoStatus, Transport};
use crate::upper::{RejectReason, SendStatus, SendToken, SubmitOutcome};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

struct PendingFrame {
    token: SendToken,
    data: Bytes,
}

struct PendingQueue {
    frames: VecDeque<PendingFrame>,
    accepting: bool,
}

pub(crate) struct SendPipeline {
    pool: TransferPool,
    pending: Mutex<PendingQueue>,
    gate: Mutex<()>,
    drain_requested: AtomicBool,
    next_token: AtomicU64,
}

impl SendPipeline {
    pub(crate) fn new(capacity: usize, buffer_size: usize) -> Self {
        Self {
            pool: TransferPool::new(PoolKind::Send, capacity, buffer_size, 0),
            pending: Mutex::new(PendingQueue {
                frames: VecDeque::new(),
                accepting: true,
            }),
            gate: Mutex::new(()),
            drain_requested: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
        }
    }

    pub(crate) fn pool(&self) -> &TransferPool {
        &self.pool
    }

    pub(crate) fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().frames.len()
    }

    pub(crate) fn submit(&self, core: &Arc<AdapterCore>, frame: Bytes) -> SubmitOutcome {
        if core.lifecycle.is_halting() {
            return SubmitOutcome::Rejected(RejectReason::Halting);
        }
        if frame.is_empty() {
            return SubmitOutcome::Rejected(RejectReason::EmptyFrame);
        }
        if frame.len() > self.pool.buffer_size() {
            return SubmitOutcome::Rejected(RejectReason::FrameTooLarge);
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let pending = {
            let mut queue = self.pending.lock();
            // Checked under the queue lock so teardown cannot strand a frame
            if !queue.accepting {
                return SubmitOutcome::Rejected(RejectReason::Halting);
            }
            queue.frames.push_back(PendingFrame { token, data: frame });
            queue.frames.len()
        };

        if pending > self.pool.capacity().saturating_sub(self.pool.busy()) {
            bump(&core.counters.queued_sends);
        }
        trace!(adapter = %core.name(), token, pending, "Frame queued");

        self.kick(core);
        SubmitOutcome::Accepted { token, pending }
    }

    /// Request a drain; runs it here unless another thread holds the gate
    pub(crate) fn kick(&self, core: &Arc<AdapterCore>) {
        self.drain_requested.store(true, Ordering::Release);
        loop {
            let Some(guard) = self.gate.try_lock() else {
                return;
            };
            if self.drain_requested.swap(false, Ordering::AcqRel) {
                self.drain(core);
            }
            drop(guard);
            if !self.drain_requested.load(Ordering::Acquire) {
                return;
            }
        }
    }

    /// Move queued frames into free blocks and post them. Gate held.
    fn drain(&self, core: &Arc<AdapterCore>) {
        if !core.lifecycle.posting_sends() {
            return;
        }
        let Some(transport) = core.transport() else {
            return;
        };

        // The reference is taken before the block so halt never sees one appear
        while core.lifecycle.try_add_ref() {
            let Some(slot) = self.pool.acquire() else {
                core.lifecycle.release_ref();
                break;
            };
            let Some(frame) = self.pending.lock().frames.pop_front() else {
                if let Err(violation) = self.pool.release(slot) {
                    violation.fatal();
                }
                core.lifecycle.release_ref();
                break;
            };
            self.post(core, &transport, slot, frame);
        }
    }

    /// Caller holds the adapter reference for this write
    fn post(
        &self,
        core: &Arc<AdapterCore>,
        transport: &Arc<dyn Transport>,
        slot: SlotId,
        frame: PendingFrame,
    ) {
        let block = self.pool.block(slot);
        let mut buffer = block
            .take_buffer()
            .unwrap_or_else(|| BytesMut::with_capacity(self.pool.buffer_size()));
        buffer.clear();
        buffer.extend_from_slice(&frame.data);

        let id = core.next_request_id();
        block.set_token(frame.token);
        block.set_request_id(id);
        block.lock().begin();

        trace!(adapter = %core.name(), slot, id, token = frame.token, "Posting write");
        let completion_core = Arc::clone(core);
        transport.post_write(
            id,
            buffer,
            Box::new(move |completion| {
                completion_core
                    .send
                    .on_write_complete(&completion_core, slot, completion)
            }),
        );
    }

    fn on_write_complete(&self, core: &Arc<AdapterCore>, slot: SlotId, completion: IoCompletion) {
        let block = self.pool.block(slot);
        block.park(completion);
        match block.lock().try_complete() {
            // Canceller is mid-flight and now owns disposal
            LockState::CancelStarted => {}
            LockState::Cancelable | LockState::CancelComplete => self.finalize(core, slot),
            state => InvariantViolation::DisposalConflict {
                operation: "write completion",
                state,
            }
            .fatal(),
        }
    }

    /// Dispose of a finished write. Runs on exactly one of the completion
    /// and cancellation paths.
    fn finalize(&self, core: &Arc<AdapterCore>, slot: SlotId) {
        let block = self.pool.block(slot);
        let status = block.take_status();
        let token = block.token();
        if let Err(violation) = self.pool.release(slot) {
            violation.fatal();
        }

        let send_status = match status {
            IoStatus::Success | IoStatus::Warning(_) => {
                bump(&core.counters.good_transmits);
                SendStatus::Success
            }
            IoStatus::Cancelled => {
                bump(&core.counters.cancelled_transfers);
                bump(&core.counters.aborted_sends);
                SendStatus::Aborted
            }
            failure => {
                bump(&core.counters.transmit_failures);
                debug!(adapter = %core.name(), token, status = ?failure, "Write failed");
                SendStatus::Failed(failure)
            }
        };

        core.upper.send_complete(token, send_status);
        self.kick(core);
        core.lifecycle.release_ref();
    }

    /// Stop accepting, abort queued frames and cancel posted writes
    pub(crate) fn shutdown(&self, core: &Arc<AdapterCore>) {
        let aborted = {
            let _barrier = self.gate.lock();
            let mut queue = self.pending.lock();
            queue.accepting = false;
            std::mem::take(&mut queue.frames)
        };

        if !aborted.is_empty() {
            debug!(adapter = %core.name(), count = aborted.len(), "Aborting queued frames");
        }
        for frame in aborted {
            bump(&core.counters.aborted_sends);
            core.upper.send_complete(frame.token, SendStatus::Aborted);
        }

        if let Some(transport) = core.transport() {
            self.cancel_posted(core, &transport);
        }
    }

    fn cancel_posted(&self, core: &Arc<AdapterCore>, transport: &Arc<dyn Transport>) {
        for slot in self.pool.busy_slots() {
            let block = self.pool.block(slot);
            if block.lock().try_cancel() != LockState::Cancelable {
                continue;
            }
            transport.cancel(block.request_id());
            match block.lock().finish_cancel() {
                // Completion ran during the cancel and yielded
                LockState::Completed => self.finalize(core, slot),
                // Completion still to come; it disposes
                LockState::CancelStarted => {}
                state => InvariantViolation::DisposalConflict {
                    operation: "write cancel",
                    state,
                }
                .fatal(),
            }
        }
    }
}
