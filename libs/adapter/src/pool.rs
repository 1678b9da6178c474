//! Transfer Pool
//!
//! Fixed arena of pre-allocated transfer blocks. Blocks are addressed by
//! slot index and move between the free list and the busy set under a
//! short-held list lock; the busy counter is atomic so the hot path can
//! read it without locking.
//!
//! A block is in exactly one place at a time: free, busy with the adapter,
//! or lent to the transport (busy, buffer absent). Releasing a block marks it
//! `Releasing` under the list lock, resets it with the lock dropped and then
//! splices it back, so buffer work never runs under the list lock.

use crate::completion::CompletionLock;
use crate::error::InvariantViolation;
use crate::transport::{IoCompletion, IoStatus, RequestId};
use bytes::BytesMut;
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Index of a block within its pool
pub type SlotId = usize;

/// Which direction a pool serves, for logging and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Send,
    Receive,
}

impl PoolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolKind::Send => "send",
            PoolKind::Receive => "receive",
        }
    }
}

/// One pre-allocated transfer context
#[derive(Debug)]
pub struct TransferBlock {
    slot: SlotId,
    lock: CompletionLock,
    /// Absent while lent to the transport
    buffer: RwLock<Option<BytesMut>>,
    /// Transport request id of the current operation, 0 when idle
    request_id: AtomicU64,
    /// Upward send token of the current operation
    token: AtomicU64,
    /// Completion outcome parked for whichever path disposes
    parked: Mutex<Option<IoStatus>>,
    /// Live upward handles to the received frame in this block
    refs: AtomicU32,
}

impl TransferBlock {
    fn new(slot: SlotId) -> Self {
        Self {
            slot,
            lock: CompletionLock::new(),
            buffer: RwLock::new(None),
            request_id: AtomicU64::new(0),
            token: AtomicU64::new(0),
            parked: Mutex::new(None),
            refs: AtomicU32::new(0),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn lock(&self) -> &CompletionLock {
        &self.lock
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id.load(Ordering::Acquire)
    }

    pub fn set_request_id(&self, id: RequestId) {
        self.request_id.store(id, Ordering::Release);
    }

    pub fn token(&self) -> u64 {
        self.token.load(Ordering::Acquire)
    }

    pub fn set_token(&self, token: u64) {
        self.token.store(token, Ordering::Release);
    }

    /// Take the buffer out to lend it to the transport
    pub fn take_buffer(&self) -> Option<BytesMut> {
        self.buffer.write().take()
    }

    /// Park a completion: the buffer comes home and the status waits for
    /// whichever path ends up disposing
    pub fn park(&self, completion: IoCompletion) {
        *self.buffer.write() = Some(completion.buffer);
        *self.parked.lock() = Some(completion.status);
    }

    /// Take the parked status; `Cancelled` when nothing was parked
    pub fn take_status(&self) -> IoStatus {
        self.parked.lock().take().unwrap_or(IoStatus::Cancelled)
    }

    /// Bytes currently held by the block
    pub fn data_len(&self) -> usize {
        self.buffer.read().as_ref().map_or(0, |b| b.len())
    }

    /// Read access to the data held by the block
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.buffer.read(), |b| b.as_deref().unwrap_or(&[]))
    }

    pub(crate) fn init_refs(&self, count: u32) {
        self.refs.store(count, Ordering::Release);
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one handle reference; returns the remaining count
    pub(crate) fn drop_ref(&self) -> u32 {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prior) => prior - 1,
            Err(_) => InvariantViolation::FrameRefUnderflow { slot: self.slot }.fatal(),
        }
    }

    /// Clear per-operation state and restore the buffer to full length
    fn reset(&self, buffer_size: usize) {
        self.request_id.store(0, Ordering::Release);
        self.token.store(0, Ordering::Release);
        self.parked.lock().take();
        self.refs.store(0, Ordering::Release);

        let mut buffer = self.buffer.write();
        match buffer.as_mut() {
            Some(buf) => buf.resize(buffer_size, 0),
            // The transport dropped our buffer; replace it
            None => *buffer = Some(BytesMut::zeroed(buffer_size)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Busy,
    /// Being reset on its way back to the free list
    Releasing,
}

struct Lists {
    free: VecDeque<SlotId>,
    slots: Vec<SlotState>,
    provisioned: bool,
}

/// Point-in-time pool usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub kind: PoolKind,
    pub capacity: usize,
    pub free: usize,
    pub busy: usize,
}

/// Fixed pool of transfer blocks
pub struct TransferPool {
    kind: PoolKind,
    blocks: Vec<TransferBlock>,
    lists: Mutex<Lists>,
    busy: AtomicUsize,
    buffer_size: usize,
    low_watermark: usize,
    replenish_enabled: AtomicBool,
}

impl TransferPool {
    /// Create a pool of `capacity` blocks. Buffers are allocated by
    /// [`provision`](Self::provision).
    pub fn new(kind: PoolKind, capacity: usize, buffer_size: usize, low_watermark: usize) -> Self {
        Self {
            kind,
            blocks: (0..capacity).map(TransferBlock::new).collect(),
            lists: Mutex::new(Lists {
                free: VecDeque::with_capacity(capacity),
                slots: vec![SlotState::Free; capacity],
                provisioned: false,
            }),
            busy: AtomicUsize::new(0),
            buffer_size,
            low_watermark,
            replenish_enabled: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.blocks.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn block(&self, slot: SlotId) -> &TransferBlock {
        &self.blocks[slot]
    }

    /// Blocks currently out of the free list
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    pub fn set_replenish(&self, enabled: bool) {
        self.replenish_enabled.store(enabled, Ordering::Release);
    }

    /// Allocate every block's buffer and fill the free list. Idempotent.
    pub fn provision(&self) {
        let mut lists = self.lists.lock();
        if lists.provisioned {
            return;
        }
        for block in &self.blocks {
            *block.buffer.write() = Some(BytesMut::zeroed(self.buffer_size));
        }
        lists.free.clear();
        lists.free.extend(0..self.blocks.len());
        lists.provisioned = true;
        debug!(
            pool = self.kind.as_str(),
            capacity = self.blocks.len(),
            buffer_size = self.buffer_size,
            "Provisioned transfer pool"
        );
    }

    /// Take a free block without blocking
    pub fn acquire(&self) -> Option<SlotId> {
        let mut lists = self.lists.lock();
        let slot = lists.free.pop_front()?;
        lists.slots[slot] = SlotState::Busy;
        self.busy.fetch_add(1, Ordering::AcqRel);
        Some(slot)
    }

    /// Return a busy block to the free list.
    ///
    /// Returns whether replenishment is enabled and the busy count is now
    /// below the low watermark. An empty pool always reports, so a zero
    /// watermark still refills once every block has come back.
    pub fn release(&self, slot: SlotId) -> Result<bool, InvariantViolation> {
        {
            let mut lists = self.lists.lock();
            match lists.slots.get(slot) {
                Some(SlotState::Busy) => lists.slots[slot] = SlotState::Releasing,
                _ => return Err(InvariantViolation::DoubleRelease { slot }),
            }
        }

        self.blocks[slot].reset(self.buffer_size);

        let now_busy = {
            let mut lists = self.lists.lock();
            lists.slots[slot] = SlotState::Free;
            lists.free.push_back(slot);
            self.busy.fetch_sub(1, Ordering::AcqRel) - 1
        };

        Ok(self.replenish_enabled.load(Ordering::Acquire)
            && now_busy < self.low_watermark.max(1))
    }

    /// Snapshot of busy slots, for cancellation sweeps
    pub fn busy_slots(&self) -> Vec<SlotId> {
        let lists = self.lists.lock();
        lists
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, state)| (*state == SlotState::Busy).then_some(slot))
            .collect()
    }

    /// Free every buffer. Only legal once every block is back in the free list.
    pub fn teardown(&self) -> Result<(), InvariantViolation> {
        let mut lists = self.lists.lock();
        let busy = self.busy.load(Ordering::Acquire);
        if busy != 0 {
            return Err(InvariantViolation::TeardownWhileBusy {
                pool: self.kind.as_str(),
                busy,
            });
        }
        for block in &self.blocks {
            block.buffer.write().take();
        }
        lists.free.clear();
        lists.provisioned = false;
        self.replenish_enabled.store(false, Ordering::Release);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let lists = self.lists.lock();
        PoolStats {
            kind: self.kind,
            capacity: self.blocks.len(),
            free: lists.free.len(),
            busy: self.busy.load(Ordering::Acquire),
        }
    }
}
