//! Adapter Lifecycle
//!
//! Phase machine, posting flags and the adapter reference count.
//!
//! ```text
//! Uninitialized → Initializing → Ready (⇄ Disconnected flag) → Halting → Halted
//! ```
//!
//! The count starts at one (the base reference held from attach). Every
//! asynchronous operation takes a reference when issued and drops it when it
//! completes. Once halt begins no new reference may be taken, so the count
//! only falls from then on. Halt drops the base reference and waits for the
//! count to reach zero.

use crate::error::InvariantViolation;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Set in the reference word once halt begins; the remaining bits count
const HALT_BIT: usize = 1 << (usize::BITS - 1);
const COUNT_MASK: usize = !HALT_BIT;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    Halting = 3,
    Halted = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Uninitialized,
            1 => Phase::Initializing,
            2 => Phase::Ready,
            3 => Phase::Halting,
            _ => Phase::Halted,
        }
    }
}

/// Media state as reported upward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaState {
    Connected,
    Disconnected,
}

pub struct Lifecycle {
    name: String,
    phase: AtomicU8,
    disconnected: AtomicBool,
    post_sends: AtomicBool,
    post_reads: AtomicBool,
    init_in_progress: AtomicBool,
    removal_requested: AtomicBool,
    refs: AtomicUsize,
    quiescent: watch::Sender<bool>,
    runtime: Handle,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>, runtime: Handle) -> Self {
        let (quiescent, _) = watch::channel(false);
        Self {
            name: name.into(),
            phase: AtomicU8::new(Phase::Uninitialized as u8),
            disconnected: AtomicBool::new(true),
            post_sends: AtomicBool::new(false),
            post_reads: AtomicBool::new(false),
            init_in_progress: AtomicBool::new(true),
            removal_requested: AtomicBool::new(false),
            refs: AtomicUsize::new(1),
            quiescent,
            runtime,
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let prior = Phase::from_u8(self.phase.swap(phase as u8, Ordering::AcqRel));
        if prior != phase {
            debug!(adapter = %self.name, from = ?prior, to = ?phase, "Phase change");
        }
    }

    /// Move from `Uninitialized` to `Initializing`. Leaves any later phase,
    /// a halt included, untouched.
    pub(crate) fn begin_init(&self) -> bool {
        let moved = self
            .phase
            .compare_exchange(
                Phase::Uninitialized as u8,
                Phase::Initializing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            debug!(adapter = %self.name, "Initializing");
        }
        moved
    }

    /// Move to `Halting` unless already there and close the reference count
    /// to new takers. Returns false if another caller started the halt.
    pub(crate) fn begin_halt(&self) -> bool {
        self.refs.fetch_or(HALT_BIT, Ordering::AcqRel);
        let prior = self.phase.fetch_max(Phase::Halting as u8, Ordering::AcqRel);
        prior < Phase::Halting as u8
    }

    pub fn is_halting(&self) -> bool {
        self.phase() >= Phase::Halting
    }

    pub fn media_state(&self) -> MediaState {
        if self.phase() == Phase::Ready && !self.disconnected.load(Ordering::Acquire) {
            MediaState::Connected
        } else {
            MediaState::Disconnected
        }
    }

    pub(crate) fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::Release);
    }

    pub fn posting_sends(&self) -> bool {
        self.post_sends.load(Ordering::Acquire)
    }

    pub fn posting_reads(&self) -> bool {
        self.post_reads.load(Ordering::Acquire)
    }

    pub(crate) fn enable_posting(&self) {
        self.post_sends.store(true, Ordering::Release);
        self.post_reads.store(true, Ordering::Release);
    }

    pub(crate) fn stop_reads(&self) {
        self.post_reads.store(false, Ordering::Release);
    }

    pub(crate) fn stop_posting(&self) {
        self.post_sends.store(false, Ordering::Release);
        self.post_reads.store(false, Ordering::Release);
    }

    pub fn init_in_progress(&self) -> bool {
        self.init_in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn finish_init(&self) {
        self.init_in_progress.store(false, Ordering::Release);
    }

    pub fn removal_requested(&self) -> bool {
        self.removal_requested.load(Ordering::Acquire)
    }

    pub(crate) fn request_removal(&self) {
        self.removal_requested.store(true, Ordering::Release);
    }

    /// Current reference count
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire) & COUNT_MASK
    }

    /// Take a reference unless halt has begun or the adapter quiesced
    pub fn try_add_ref(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & HALT_BIT == 0 && word != 0).then_some(word + 1)
            })
            .is_ok()
    }

    pub fn release_ref(&self) {
        match self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                (word & COUNT_MASK != 0).then(|| word - 1)
            })
        {
            Ok(word) if word & COUNT_MASK == 1 => {
                debug!(adapter = %self.name, "Adapter quiescent");
                self.quiescent.send_replace(true);
            }
            Ok(_) => {}
            Err(_) => InvariantViolation::RefUnderflow.fatal(),
        }
    }

    pub fn is_quiescent(&self) -> bool {
        *self.quiescent.borrow()
    }

    /// Wait for the count to reach zero, logging every `check_interval`
    pub async fn wait_quiescent(&self, check_interval: Duration) {
        let mut rx = self.quiescent.subscribe();
        loop {
            match tokio::time::timeout(check_interval, rx.wait_for(|q| *q)).await {
                Ok(_) => return,
                Err(_) => warn!(
                    adapter = %self.name,
                    outstanding = self.refs(),
                    "Halt still waiting for outstanding operations"
                ),
            }
        }
    }

    /// Spawn deferred work holding a reference for the task's lifetime.
    /// Declines once halt has begun; returns whether the task was spawned.
    pub fn try_spawn_tracked<F>(self: &Arc<Self>, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.try_add_ref() {
            return false;
        }
        let guard = RefGuard(Arc::clone(self));
        self.runtime.spawn(async move {
            let _guard = guard;
            task.await;
        });
        true
    }
}

/// Drops an already-taken reference when the owning task ends, even by panic
struct RefGuard(Arc<Lifecycle>);

impl Drop for RefGuard {
    fn drop(&mut self) {
        self.0.release_ref();
    }
}
