//! Downward Transport Interface
//!
//! The raw device underneath an adapter. Reads, writes and status watches
//! are posted with a completion callback which the transport invokes
//! exactly once, from any thread, possibly before the post call returns.
//! A cancelled operation still completes, with [`IoStatus::Cancelled`].
//!
//! Control requests are async and typed.

use crate::error::TransportError;
use crate::ethernet::MacAddress;
use crate::filter::PacketFilter;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::sync::Arc;

/// Identifies one posted operation for cancellation
pub type RequestId = u64;

/// Final status of a posted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IoStatus {
    Success,
    Cancelled,
    /// Completed with an informational status; data, if any, is valid
    Warning(u32),
    /// Hard failure with the transport's status code
    Error(u32),
    DeviceRemoved,
}

impl IoStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, IoStatus::Success)
    }
}

/// Completion of a read or write
#[derive(Debug)]
pub struct IoCompletion {
    pub status: IoStatus,
    /// The buffer handed down with the request. For reads its length is
    /// the number of bytes received.
    pub buffer: BytesMut,
}

impl IoCompletion {
    pub fn new(status: IoStatus, buffer: BytesMut) -> Self {
        Self { status, buffer }
    }
}

pub type CompletionFn = Box<dyn FnOnce(IoCompletion) + Send + 'static>;

/// Asynchronous status events reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusIndication {
    MediaConnect,
    MediaDisconnect,
    ResetStart,
    ResetEnd,
    Other { code: u32, payload: Bytes },
}

/// Completion of a status watch
#[derive(Debug, Clone)]
pub struct StatusCompletion {
    pub status: IoStatus,
    pub indication: Option<StatusIndication>,
}

impl StatusCompletion {
    pub fn indication(indication: StatusIndication) -> Self {
        Self {
            status: IoStatus::Success,
            indication: Some(indication),
        }
    }

    pub fn failed(status: IoStatus) -> Self {
        Self {
            status,
            indication: None,
        }
    }
}

pub type StatusFn = Box<dyn FnOnce(StatusCompletion) + Send + 'static>;

/// Typed control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    QueryLinkSpeed,
    QueryCurrentAddress,
    QueryMaxMulticastList,
    SetPacketFilter(PacketFilter),
    SetMulticastList(Vec<MacAddress>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// Link speed in kbps
    LinkSpeed(u64),
    Address(MacAddress),
    MaxMulticastList(usize),
    Accepted,
}

/// Who is asking to bind. Providers must not bind an adapter to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRequest {
    pub adapter_name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub name: String,
    pub kind: &'static str,
}

/// Raw device underneath an adapter
#[async_trait]
pub trait Transport: Send + Sync {
    /// Post a read into `buffer`
    fn post_read(&self, id: RequestId, buffer: BytesMut, on_complete: CompletionFn);

    /// Post a write of the whole of `buffer`
    fn post_write(&self, id: RequestId, buffer: BytesMut, on_complete: CompletionFn);

    /// Post a watch that completes on the next status event
    fn post_status_watch(&self, id: RequestId, on_complete: StatusFn);

    /// Best-effort cancel. The operation still completes through its callback.
    fn cancel(&self, id: RequestId);

    /// Query or set a transport attribute
    async fn control(&self, request: ControlRequest) -> Result<ControlResponse, TransportError>;

    /// Release the device. Called once no operation is outstanding.
    async fn close(&self);

    fn info(&self) -> TransportInfo;
}

/// Opens the transport for an adapter
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Fails with [`TransportError::NotReady`] while the device is absent
    async fn open(&self, request: &BindingRequest) -> Result<Arc<dyn Transport>, TransportError>;
}
