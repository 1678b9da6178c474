//! Adapter Error Types
//!
//! Recoverable conditions (pool exhaustion, a transport that is not up yet)
//! are absorbed by the pipelines and never reach these types. What remains is
//! split three ways:
//!
//! - [`TransportError`]: failures reported by the lower transport
//! - [`AdapterError`]: failures surfaced to upward callers
//! - [`InvariantViolation`]: broken internal bookkeeping, always fatal

use crate::completion::LockState;
use thiserror::Error;
use tracing::error;

/// Errors reported by a [`Transport`](crate::transport::Transport) or its provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The lower device is not available yet; bring-up is retried on notification
    #[error("Transport not ready: {message}")]
    NotReady { message: String },

    /// The lower device went away
    #[error("Transport device removed")]
    DeviceRemoved,

    /// The transport was closed before the request was issued
    #[error("Transport closed")]
    Closed,

    /// The transport refused a control request
    #[error("Request rejected by transport: {message}")]
    Rejected { message: String },

    /// Anything else, with the transport's status code
    #[error("Transport failed with status {code:#010x}: {message}")]
    Failed { code: u32, message: String },
}

impl TransportError {
    /// Create a not-ready error
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::NotReady {
            message: message.into(),
        }
    }

    /// Create a rejected-request error
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Create a generic failure
    pub fn failed(code: u32, message: impl Into<String>) -> Self {
        Self::Failed {
            code,
            message: message.into(),
        }
    }

    /// Whether the failure only means "try again once the device shows up"
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}

/// Errors surfaced to upward callers
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Bring-up found the transport unavailable
    #[error("Transport not ready: {message}")]
    TransportNotReady { message: String },

    /// Transport failure during bring-up or a control request
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The adapter is halting or halted and rejects new work
    #[error("Adapter '{name}' is halting")]
    Halting { name: String },

    /// Packet filter bits outside the supported set
    #[error("Packet filter bits not supported: {bits:#x}")]
    NotSupported { bits: u32 },

    /// Multicast list larger than the adapter can track
    #[error("Multicast list full: {requested} addresses, maximum {max}")]
    MulticastListFull { requested: usize, max: usize },

    /// Malformed or unsuitable MAC address
    #[error("Invalid address: {message}")]
    InvalidAddress { message: String },

    /// Parameter out of range
    #[error("Invalid parameter '{parameter}': {message}")]
    InvalidParameter { parameter: String, message: String },

    /// An adapter with this name is already attached
    #[error("Adapter '{name}' is already attached")]
    DuplicateAdapter { name: String },

    /// Every permanent address of the driver is taken
    #[error("Too many adapters: at most {max} per driver")]
    TooManyAdapters { max: usize },

    /// No tokio runtime available to run deferred work
    #[error("No async runtime available: {message}")]
    NoRuntime { message: String },
}

/// Result type alias for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

impl AdapterError {
    /// Create an invalid address error
    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::InvalidAddress {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a halting error
    pub fn halting(name: impl Into<String>) -> Self {
        Self::Halting { name: name.into() }
    }
}

/// Broken internal bookkeeping. Never recovered from.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// A transfer block went back to the free list twice
    #[error("transfer block {slot} released while not busy")]
    DoubleRelease { slot: usize },

    /// The adapter reference count dropped below zero
    #[error("adapter reference count underflow")]
    RefUnderflow,

    /// A per-block handle count dropped below zero
    #[error("received frame handle count underflow on block {slot}")]
    FrameRefUnderflow { slot: usize },

    /// The completion and cancellation paths disagree about disposal
    #[error("completion lock in unexpected state {state:?} during {operation}")]
    DisposalConflict {
        operation: &'static str,
        state: LockState,
    },

    /// Pool buffers freed while blocks were still lent out
    #[error("{pool} pool torn down with {busy} blocks busy")]
    TeardownWhileBusy { pool: &'static str, busy: usize },
}

impl InvariantViolation {
    /// Log at error level and abort the current thread of control
    #[track_caller]
    pub fn fatal(self) -> ! {
        error!(violation = %self, "Invariant violation");
        panic!("invariant violation: {}", self)
    }
}
