//! Upward Protocol Binding
//!
//! Callbacks into the protocol layer above the adapter. They run on
//! submitting threads, transport completion threads or runtime workers and
//! must not block.

use crate::receive::ReceivedFrame;
use crate::transport::{IoStatus, StatusIndication};

/// Identifies a submitted frame in its send completion
pub type SendToken = u64;

/// Outcome of a submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    /// The transport reported an error for the write
    Failed(IoStatus),
    /// Never written, or cancelled in flight
    Aborted,
}

/// Result of [`Adapter::submit_frame`](crate::Adapter::submit_frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Queued; `pending` is the queue depth including this frame at the
    /// time it was queued. Completion is reported through `send_complete`.
    Accepted { token: SendToken, pending: usize },
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub fn token(&self) -> Option<SendToken> {
        match self {
            SubmitOutcome::Accepted { token, .. } => Some(*token),
            SubmitOutcome::Rejected(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Halting,
    EmptyFrame,
    FrameTooLarge,
}

/// Protocol layer bound above an adapter
pub trait ProtocolBinding: Send + Sync {
    /// Exactly once per accepted frame
    fn send_complete(&self, token: SendToken, status: SendStatus);

    /// An accepted frame. The transfer block stays lent out until every
    /// clone of `frame` is dropped.
    fn indicate_receive(&self, frame: ReceivedFrame);

    fn indicate_status(&self, indication: StatusIndication);
}
