//! Completion Lock
//!
//! Decides, per posted transfer, whether the completion path or the
//! cancellation path owns disposal of the transfer block. Every transition
//! is a single atomic swap or compare-and-set.
//!
//! ```text
//! Cancelable ──complete──► Completed ──finish_cancel──► CancelComplete
//!     │                        ▲                           (canceller disposes)
//!   try_cancel                 │ complete (yields)
//!     ▼                        │
//! CancelStarted ───────────────┘
//!     │
//!   finish_cancel
//!     ▼
//! CancelComplete ──complete──► Completed (completion disposes)
//! ```
//!
//! Completion side: park the result, then [`CompletionLock::try_complete`].
//! A prior `CancelStarted` means the canceller is mid-flight and will dispose.
//!
//! Cancel side: [`CompletionLock::try_cancel`]; if that did not win, do
//! nothing. Otherwise issue the transport cancel, then
//! [`CompletionLock::finish_cancel`]. A prior `Completed` means the
//! completion already ran and yielded, so the canceller disposes.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lock states. Idle locks (no transfer posted) read as `Completed`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    Cancelable = 0,
    CancelStarted = 1,
    CancelComplete = 2,
    Completed = 3,
}

impl LockState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Cancelable,
            1 => Self::CancelStarted,
            2 => Self::CancelComplete,
            _ => Self::Completed,
        }
    }
}

/// Four-state ownership transfer primitive shared by a transfer's
/// completion and cancellation paths
#[derive(Debug)]
pub struct CompletionLock {
    state: AtomicU8,
}

impl Default for CompletionLock {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionLock {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(LockState::Completed as u8),
        }
    }

    /// Arm the lock for a new transfer. Call before handing the transfer down.
    #[inline]
    pub fn begin(&self) {
        self.state
            .store(LockState::Cancelable as u8, Ordering::Release);
    }

    /// Publish completion. Returns the prior state.
    #[inline]
    pub fn try_complete(&self) -> LockState {
        LockState::from_u8(
            self.state
                .swap(LockState::Completed as u8, Ordering::AcqRel),
        )
    }

    /// Start cancelling. Returns the prior state; only `Cancelable` means
    /// the caller won and must go on to [`finish_cancel`](Self::finish_cancel).
    #[inline]
    pub fn try_cancel(&self) -> LockState {
        match self.state.compare_exchange(
            LockState::Cancelable as u8,
            LockState::CancelStarted as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prior) | Err(prior) => LockState::from_u8(prior),
        }
    }

    /// Finish cancelling. Returns the prior state; `Completed` hands
    /// disposal to the canceller.
    #[inline]
    pub fn finish_cancel(&self) -> LockState {
        LockState::from_u8(
            self.state
                .swap(LockState::CancelComplete as u8, Ordering::AcqRel),
        )
    }

    pub fn state(&self) -> LockState {
        LockState::from_u8(self.state.load(Ordering::Acquire))
    }
}
