//! Relay Adapter Core
//!
//! Asynchronous transfer and cancellation engine for a packet-relay virtual
//! adapter. Frames from the protocol layer above are forwarded to a raw
//! transport below, and frames from the transport are filtered and
//! indicated upward, through small fixed pools of pre-allocated transfer
//! blocks.
//!
//! ## Features
//!
//! - **Completion locks**: exactly-once disposal when a transfer's
//!   completion races its cancellation
//! - **Ordered sends**: FIFO pending queue with backpressure when the send
//!   pool is exhausted
//! - **Receive replenishment**: watermark-driven, idempotent reposting of reads
//! - **Reference-counted lifecycle**: halt waits until every posted transfer,
//!   deferred task and lent frame has come back
//! - **Deferred bring-up**: retries on transport announcements when the
//!   lower device is not available at initialization
//! - **Status polling**: single self-reposting status watch tracking media state

pub mod adapter;
pub mod completion;
pub mod error;
pub mod ethernet;
pub mod filter;
pub mod lifecycle;
pub mod loopback;
pub mod metrics;
pub mod pool;
pub mod receive;
pub mod registry;
pub mod retry;
pub mod test_utils;
pub mod transport;
pub mod upper;

mod send;
mod status;

// Re-export commonly used types
pub use adapter::{Adapter, BringUp, DriverContext};
pub use completion::{CompletionLock, LockState};
pub use error::{AdapterError, InvariantViolation, Result, TransportError};
pub use ethernet::MacAddress;
pub use filter::{FilterState, PacketFilter};
pub use lifecycle::{MediaState, Phase};
pub use loopback::{LoopbackConfig, LoopbackProvider, LoopbackTransport};
pub use metrics::CountersSnapshot;
pub use pool::{PoolKind, PoolStats, TransferPool};
pub use receive::ReceivedFrame;
pub use registry::AdapterRegistry;
pub use retry::{NotificationHub, Subscription, DRIVER_TAG};
pub use transport::{
    BindingRequest, ControlRequest, ControlResponse, IoCompletion, IoStatus, StatusCompletion,
    StatusIndication, Transport, TransportProvider,
};
pub use upper::{ProtocolBinding, RejectReason, SendStatus, SendToken, SubmitOutcome};

pub use relay_config::AdapterSettings;
