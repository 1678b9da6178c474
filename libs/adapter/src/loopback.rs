//! Loopback Transport
//!
//! In-memory [`Transport`] and [`TransportProvider`]. In automatic mode
//! writes complete immediately and, with `loop_writes`, land in the oldest
//! outstanding read. In manual mode every operation stays pending until the
//! owner completes it, which lets tests drive completions and races.
//!
//! The provider reports not-ready until [`LoopbackProvider::set_ready`],
//! which announces the transport on the notification hub.

use crate::error::TransportError;
use crate::ethernet::MacAddress;
use crate::retry::NotificationHub;
use crate::transport::{
    BindingRequest, CompletionFn, ControlRequest, ControlResponse, IoCompletion, IoStatus,
    RequestId, StatusCompletion, StatusFn, Transport, TransportInfo, TransportProvider,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use relay_config::defaults::adapter::{DEFAULT_LINK_SPEED_KBPS, MAX_MULTICAST_LIST};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Source tag used when the loopback provider announces itself
pub const LOOPBACK_TAG: &str = "loopback";

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Leave reads and writes pending until completed explicitly
    pub manual: bool,
    /// Complete a cancelled operation from inside `cancel`
    pub complete_on_cancel: bool,
    /// Deliver completed writes into outstanding reads
    pub loop_writes: bool,
    pub address: MacAddress,
    pub link_speed_kbps: u64,
    /// Answer to the multicast list limit query
    pub max_multicast_list: usize,
    /// Fail every control request with this error
    pub fail_controls: Option<TransportError>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            manual: false,
            complete_on_cancel: true,
            loop_writes: false,
            address: MacAddress([0x02, 0x00, 0x4c, 0x4f, 0x4f, 0x50]),
            link_speed_kbps: DEFAULT_LINK_SPEED_KBPS,
            max_multicast_list: MAX_MULTICAST_LIST,
            fail_controls: None,
        }
    }
}

impl LoopbackConfig {
    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Default::default()
        }
    }

    pub fn looped() -> Self {
        Self {
            loop_writes: true,
            ..Default::default()
        }
    }
}

struct PendingIo {
    id: RequestId,
    buffer: BytesMut,
    on_complete: CompletionFn,
}

#[derive(Default)]
struct LoopbackState {
    reads: VecDeque<PendingIo>,
    writes: VecDeque<PendingIo>,
    status: Option<(RequestId, StatusFn)>,
    written: Vec<Bytes>,
    controls: Vec<ControlRequest>,
    cancelled: Vec<RequestId>,
    closed: bool,
}

/// Work collected under the state lock and run after it is released
enum Deferred {
    Io(CompletionFn, IoCompletion),
    Status(StatusFn, StatusCompletion),
}

impl Deferred {
    fn run(self) {
        match self {
            Deferred::Io(callback, completion) => callback(completion),
            Deferred::Status(callback, completion) => callback(completion),
        }
    }
}

fn fill_read(read: PendingIo, frame: &[u8]) -> Deferred {
    let mut buffer = read.buffer;
    let len = frame.len().min(buffer.len());
    buffer[..len].copy_from_slice(&frame[..len]);
    buffer.truncate(len);
    Deferred::Io(read.on_complete, IoCompletion::new(IoStatus::Success, buffer))
}

pub struct LoopbackTransport {
    name: String,
    config: LoopbackConfig,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    pub fn new(name: impl Into<String>, config: LoopbackConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(LoopbackState::default()),
        }
    }

    pub fn pending_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    pub fn pending_writes(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn pending_write_ids(&self) -> Vec<RequestId> {
        self.state.lock().writes.iter().map(|w| w.id).collect()
    }

    pub fn has_status_watch(&self) -> bool {
        self.state.lock().status.is_some()
    }

    /// Frames whose writes completed successfully, in completion order
    pub fn written_frames(&self) -> Vec<Bytes> {
        self.state.lock().written.clone()
    }

    pub fn controls(&self) -> Vec<ControlRequest> {
        self.state.lock().controls.clone()
    }

    /// Request ids passed to `cancel`
    pub fn cancelled(&self) -> Vec<RequestId> {
        self.state.lock().cancelled.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Complete the oldest pending write. Returns false if none was pending.
    pub fn complete_next_write(&self, status: IoStatus) -> bool {
        let write = self.state.lock().writes.pop_front();
        match write {
            Some(write) => {
                self.finish_write(write, status);
                true
            }
            None => false,
        }
    }

    /// Complete a specific pending write
    pub fn complete_write(&self, id: RequestId, status: IoStatus) -> bool {
        let write = {
            let mut state = self.state.lock();
            let position = state.writes.iter().position(|w| w.id == id);
            position.and_then(|p| state.writes.remove(p))
        };
        match write {
            Some(write) => {
                self.finish_write(write, status);
                true
            }
            None => false,
        }
    }

    /// Complete every pending write; returns how many completed
    pub fn complete_all_writes(&self, status: IoStatus) -> usize {
        let mut count = 0;
        while self.complete_next_write(status) {
            count += 1;
        }
        count
    }

    fn finish_write(&self, write: PendingIo, status: IoStatus) {
        let mut deferred = Vec::new();
        {
            let mut state = self.state.lock();
            if status.is_success() {
                let frame = Bytes::copy_from_slice(&write.buffer);
                if self.config.loop_writes {
                    if let Some(read) = state.reads.pop_front() {
                        deferred.push(fill_read(read, &frame));
                    }
                }
                state.written.push(frame);
            }
        }
        deferred.push(Deferred::Io(
            write.on_complete,
            IoCompletion::new(status, write.buffer),
        ));
        for work in deferred {
            work.run();
        }
    }

    /// Deliver `frame` into the oldest outstanding read
    pub fn deliver(&self, frame: &[u8]) -> bool {
        let read = self.state.lock().reads.pop_front();
        match read {
            Some(read) => {
                fill_read(read, frame).run();
                true
            }
            None => false,
        }
    }

    /// Fail the oldest outstanding read with `status`
    pub fn fail_next_read(&self, status: IoStatus) -> bool {
        let read = self.state.lock().reads.pop_front();
        match read {
            Some(read) => {
                (read.on_complete)(IoCompletion::new(status, read.buffer));
                true
            }
            None => false,
        }
    }

    /// Complete the outstanding status watch
    pub fn complete_status(&self, completion: StatusCompletion) -> bool {
        let watch = self.state.lock().status.take();
        match watch {
            Some((_, callback)) => {
                callback(completion);
                true
            }
            None => false,
        }
    }

    /// Remove the operation `id` from whichever queue holds it
    fn take_pending(state: &mut LoopbackState, id: RequestId) -> Option<Deferred> {
        for queue in [&mut state.reads, &mut state.writes] {
            if let Some(position) = queue.iter().position(|io| io.id == id) {
                let io = queue.remove(position)?;
                return Some(Deferred::Io(
                    io.on_complete,
                    IoCompletion::new(IoStatus::Cancelled, io.buffer),
                ));
            }
        }
        match state.status.take() {
            Some((watch_id, callback)) if watch_id == id => Some(Deferred::Status(
                callback,
                StatusCompletion::failed(IoStatus::Cancelled),
            )),
            other => {
                state.status = other;
                None
            }
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn post_read(&self, id: RequestId, buffer: BytesMut, on_complete: CompletionFn) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            on_complete(IoCompletion::new(IoStatus::DeviceRemoved, buffer));
            return;
        }
        state.reads.push_back(PendingIo {
            id,
            buffer,
            on_complete,
        });
    }

    fn post_write(&self, id: RequestId, buffer: BytesMut, on_complete: CompletionFn) {
        let write = PendingIo {
            id,
            buffer,
            on_complete,
        };
        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                (write.on_complete)(IoCompletion::new(IoStatus::DeviceRemoved, write.buffer));
                return;
            }
            if self.config.manual {
                state.writes.push_back(write);
                return;
            }
        }
        self.finish_write(write, IoStatus::Success);
    }

    fn post_status_watch(&self, id: RequestId, on_complete: StatusFn) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            on_complete(StatusCompletion::failed(IoStatus::DeviceRemoved));
            return;
        }
        state.status = Some((id, on_complete));
    }

    fn cancel(&self, id: RequestId) {
        let deferred = {
            let mut state = self.state.lock();
            state.cancelled.push(id);
            if !self.config.complete_on_cancel {
                return;
            }
            Self::take_pending(&mut state, id)
        };
        trace!(transport = %self.name, id, found = deferred.is_some(), "Cancel");
        if let Some(work) = deferred {
            work.run();
        }
    }

    async fn control(&self, request: ControlRequest) -> Result<ControlResponse, TransportError> {
        self.state.lock().controls.push(request.clone());
        if let Some(err) = &self.config.fail_controls {
            return Err(err.clone());
        }
        Ok(match request {
            ControlRequest::QueryLinkSpeed => ControlResponse::LinkSpeed(self.config.link_speed_kbps),
            ControlRequest::QueryCurrentAddress => ControlResponse::Address(self.config.address),
            ControlRequest::QueryMaxMulticastList => {
                ControlResponse::MaxMulticastList(self.config.max_multicast_list)
            }
            ControlRequest::SetPacketFilter(_) | ControlRequest::SetMulticastList(_) => {
                ControlResponse::Accepted
            }
        })
    }

    async fn close(&self) {
        let deferred: Vec<Deferred> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.closed = true;
            let mut work: Vec<Deferred> = state
                .reads
                .drain(..)
                .chain(state.writes.drain(..))
                .map(|io| {
                    Deferred::Io(
                        io.on_complete,
                        IoCompletion::new(IoStatus::Cancelled, io.buffer),
                    )
                })
                .collect();
            if let Some((_, callback)) = state.status.take() {
                work.push(Deferred::Status(
                    callback,
                    StatusCompletion::failed(IoStatus::Cancelled),
                ));
            }
            work
        };
        debug!(transport = %self.name, outstanding = deferred.len(), "Loopback closed");
        for work in deferred {
            work.run();
        }
    }

    fn info(&self) -> TransportInfo {
        TransportInfo {
            name: self.name.clone(),
            kind: "loopback",
        }
    }
}

/// Hands out one [`LoopbackTransport`] per adapter name
pub struct LoopbackProvider {
    config: LoopbackConfig,
    transports: Mutex<HashMap<String, Arc<LoopbackTransport>>>,
    ready: AtomicBool,
    opens: AtomicUsize,
    announce: Mutex<Option<(Arc<NotificationHub>, String)>>,
}

impl LoopbackProvider {
    pub fn new(config: LoopbackConfig, ready: bool) -> Self {
        Self {
            config,
            transports: Mutex::new(HashMap::new()),
            ready: AtomicBool::new(ready),
            opens: AtomicUsize::new(0),
            announce: Mutex::new(None),
        }
    }

    /// Announce on `channel` when [`set_ready`](Self::set_ready) is called
    pub fn announce_on(&self, hub: Arc<NotificationHub>, channel: impl Into<String>) {
        *self.announce.lock() = Some((hub, channel.into()));
    }

    /// Make the transport available and announce it
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
        self.announce_ready();
    }

    /// Announce again without changing readiness
    pub fn announce_ready(&self) -> usize {
        let announce = self.announce.lock().clone();
        match announce {
            Some((hub, channel)) => hub.notify(&channel, LOOPBACK_TAG),
            None => 0,
        }
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::Release);
    }

    /// Successful opens so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }

    /// Transport for `adapter`, created on first use
    pub fn transport(&self, adapter: &str) -> Arc<LoopbackTransport> {
        let mut transports = self.transports.lock();
        Arc::clone(transports.entry(adapter.to_string()).or_insert_with(|| {
            Arc::new(LoopbackTransport::new(
                format!("{}-lower", adapter),
                self.config.clone(),
            ))
        }))
    }
}

#[async_trait]
impl TransportProvider for LoopbackProvider {
    async fn open(&self, request: &BindingRequest) -> Result<Arc<dyn Transport>, TransportError> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(TransportError::not_ready(format!(
                "no lower device for '{}'",
                request.adapter_name
            )));
        }
        let transport = self.transport(&request.adapter_name);
        self.opens.fetch_add(1, Ordering::AcqRel);
        debug!(adapter = %request.adapter_name, lower = %transport.name, "Loopback opened");
        Ok(transport)
    }
}
