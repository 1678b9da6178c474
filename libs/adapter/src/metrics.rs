//! Adapter Counters
//!
//! Lock-free statistics updated from completion callbacks, plus a
//! serializable snapshot for queries.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$doc:meta])* $field:ident),* $(,)?) => {
        /// Atomic adapter counters
        #[derive(Debug, Default)]
        pub struct Counters {
            $($(#[$doc])* pub $field: AtomicU64,)*
        }

        /// Point-in-time copy of [`Counters`]
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct CountersSnapshot {
            $($(#[$doc])* pub $field: u64,)*
        }

        impl Counters {
            pub fn snapshot(&self) -> CountersSnapshot {
                CountersSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Writes completed successfully
    good_transmits,
    /// Reads completed successfully and indicated upward
    good_receives,
    /// Writes completed with an error status
    transmit_failures,
    /// Frames failed without being written (halt, cancellation)
    aborted_sends,
    /// Frames that had to wait for a free transfer block
    queued_sends,
    /// Reads completed with an error status
    receive_errors,
    /// Reads shorter than an Ethernet header
    runt_frames,
    /// Reads dropped by the acceptance filter
    filtered_frames,
    /// Transfers that completed as cancelled
    cancelled_transfers,
    /// Status indications received from the transport
    status_indications,
    /// Attempts to open the transport
    bring_up_attempts,
    /// Transport-ready notifications acted on
    retry_notifications,
}

/// Increment a counter
#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
