//! Adapter
//!
//! [`Adapter`] is the cloneable handle the upper layer talks to. It owns an
//! `AdapterCore` shared with every posted transfer, deferred task and retry
//! callback; the core's lifecycle reference count is what halt drains.
//!
//! Bring-up is attempted once during [`Adapter::initialize`]. If the
//! transport is not up yet the adapter stays subscribed on the driver's
//! notification channel and retries from a deferred task each time another
//! party announces itself there.

use crate::error::{AdapterError, Result, TransportError};
use crate::ethernet::MacAddress;
use crate::filter::{FilterState, PacketFilter};
use crate::lifecycle::{Lifecycle, MediaState, Phase};
use crate::metrics::{bump, Counters, CountersSnapshot};
use crate::pool::PoolStats;
use crate::receive::ReceivePipeline;
use crate::retry::{NotificationHub, NotifyCallback, Subscription, DRIVER_TAG};
use crate::send::SendPipeline;
use crate::status::StatusPoller;
use crate::transport::{
    BindingRequest, ControlRequest, ControlResponse, RequestId, StatusIndication, Transport,
    TransportProvider,
};
use crate::upper::{ProtocolBinding, SubmitOutcome};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relay_config::defaults::{adapter::DEFAULT_LINK_SPEED_KBPS, ethernet::MAX_DATA_SIZE};
use relay_config::AdapterSettings;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

/// State shared by every adapter instance of one driver
pub struct DriverContext {
    provider: Arc<dyn TransportProvider>,
    hub: Arc<NotificationHub>,
    channel: String,
    instances: AtomicUsize,
}

impl DriverContext {
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        hub: Arc<NotificationHub>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            hub,
            channel: channel.into(),
            instances: AtomicUsize::new(0),
        }
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Claim the next instance index, or `None` once every permanent
    /// address has been handed out
    fn next_instance(&self) -> Option<u8> {
        self.instances
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < MacAddress::MAX_PERMANENT).then_some(n + 1)
            })
            .ok()
            .and_then(|n| u8::try_from(n).ok())
    }
}

/// Result of [`Adapter::initialize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUp {
    /// Transport opened and the adapter is Ready
    Complete,
    /// Transport not available yet; bring-up retries on notification
    Pending,
}

pub(crate) struct AdapterCore {
    settings: AdapterSettings,
    pub(crate) lifecycle: Arc<Lifecycle>,
    pub(crate) send: SendPipeline,
    pub(crate) receive: ReceivePipeline,
    pub(crate) status: StatusPoller,
    pub(crate) filter: RwLock<FilterState>,
    pub(crate) counters: Counters,
    pub(crate) upper: Arc<dyn ProtocolBinding>,
    permanent_address: MacAddress,
    current_address: RwLock<MacAddress>,
    link_speed: AtomicU64,
    lookahead: AtomicUsize,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    provider: Arc<dyn TransportProvider>,
    hub: Arc<NotificationHub>,
    channel: String,
    subscription: Mutex<Option<Subscription>>,
    init_gate: tokio::sync::Mutex<()>,
    next_request: AtomicU64,
}

impl AdapterCore {
    pub(crate) fn name(&self) -> &str {
        &self.settings.name
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().clone()
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn current_address(&self) -> MacAddress {
        *self.current_address.read()
    }

    fn on_transport_notification(self: &Arc<Self>, source: &str) {
        if source == DRIVER_TAG {
            trace!(adapter = %self.name(), "Ignoring own announcement");
            return;
        }
        if self.lifecycle.is_halting() || !self.lifecycle.init_in_progress() {
            return;
        }

        bump(&self.counters.retry_notifications);
        debug!(adapter = %self.name(), source, "Transport announced, scheduling bring-up");
        let task_core = Arc::clone(self);
        // A halt may have quiesced the adapter since the check above
        self.lifecycle.try_spawn_tracked(async move {
            task_core.deferred_bring_up().await;
        });
    }

    async fn deferred_bring_up(self: &Arc<Self>) {
        match self.bring_up().await {
            Ok(true) => {
                info!(adapter = %self.name(), "Deferred bring-up complete");
                self.upper.indicate_status(StatusIndication::MediaConnect);
            }
            Ok(false) => trace!(adapter = %self.name(), "Already initialized"),
            Err(AdapterError::TransportNotReady { message }) => {
                debug!(adapter = %self.name(), %message, "Spurious notification, transport still not ready")
            }
            Err(AdapterError::Halting { .. }) => {}
            Err(e) => {
                error!(adapter = %self.name(), error = %e, "Deferred bring-up failed, requesting removal");
                self.lifecycle.request_removal();
            }
        }
    }

    /// Open the transport and go Ready. Returns whether this call did it.
    async fn bring_up(self: &Arc<Self>) -> Result<bool> {
        let _gate = self.init_gate.lock().await;
        if self.lifecycle.is_halting() {
            return Err(AdapterError::halting(self.name()));
        }
        if !self.lifecycle.init_in_progress() {
            return Ok(false);
        }

        bump(&self.counters.bring_up_attempts);
        let request = BindingRequest {
            adapter_name: self.settings.name.clone(),
            description: self.settings.description.clone(),
        };
        let transport = self.provider.open(&request).await.map_err(|e| match e {
            TransportError::NotReady { message } => AdapterError::TransportNotReady { message },
            other => AdapterError::Transport(other),
        })?;

        self.send.pool().provision();
        self.receive.pool().provision();

        if let Err(e) = self.configure(&transport).await {
            warn!(adapter = %self.name(), error = %e, "Transport configuration failed");
            for pool in [self.send.pool(), self.receive.pool()] {
                if let Err(violation) = pool.teardown() {
                    violation.fatal();
                }
            }
            transport.close().await;
            return Err(e);
        }

        let lower = transport.info();
        *self.transport.write() = Some(transport);
        self.lifecycle.set_disconnected(false);
        self.lifecycle.enable_posting();
        self.lifecycle.finish_init();
        self.lifecycle.set_phase(Phase::Ready);
        info!(
            adapter = %self.name(),
            address = %self.current_address(),
            link_speed_kbps = self.link_speed.load(Ordering::Relaxed),
            lower = %lower.name,
            kind = lower.kind,
            "Adapter ready"
        );

        self.receive.pool().set_replenish(true);
        self.receive.schedule_replenish(self);
        self.status.start(self);
        self.send.kick(self);
        Ok(true)
    }

    async fn configure(&self, transport: &Arc<dyn Transport>) -> Result<()> {
        match transport.control(ControlRequest::QueryLinkSpeed).await? {
            ControlResponse::LinkSpeed(kbps) => self.link_speed.store(kbps, Ordering::Relaxed),
            other => warn!(adapter = %self.name(), ?other, "Unexpected link speed response"),
        }

        match transport.control(ControlRequest::QueryMaxMulticastList).await? {
            ControlResponse::MaxMulticastList(reported) => {
                let max = self.filter.write().set_max_multicast(reported);
                debug!(adapter = %self.name(), reported, max, "Multicast list limit");
            }
            other => warn!(adapter = %self.name(), ?other, "Unexpected multicast limit response"),
        }

        if self.settings.promiscuous {
            transport
                .control(ControlRequest::SetPacketFilter(PacketFilter::PROMISCUOUS))
                .await?;
            return Ok(());
        }

        match transport.control(ControlRequest::QueryCurrentAddress).await? {
            ControlResponse::Address(address) => {
                if self.settings.network_address.is_some() {
                    info!(
                        adapter = %self.name(),
                        %address,
                        "Transport address replaces configured override"
                    );
                }
                *self.current_address.write() = address;
            }
            other => warn!(adapter = %self.name(), ?other, "Unexpected address response"),
        }
        Ok(())
    }

    /// Pass a filter change down on a tracked task
    fn forward(self: &Arc<Self>, request: ControlRequest) {
        if self.settings.promiscuous || self.lifecycle.phase() != Phase::Ready {
            trace!(adapter = %self.name(), ?request, "Not forwarding request");
            return;
        }
        let Some(transport) = self.transport() else {
            return;
        };

        let name = self.name().to_string();
        let spawned = self.lifecycle.try_spawn_tracked(async move {
            if let Err(e) = transport.control(request).await {
                warn!(adapter = %name, error = %e, "Forwarded request failed");
            }
        });
        if !spawned {
            debug!(adapter = %self.name(), "Adapter quiesced, request not forwarded");
        }
    }
}

/// Handle to one virtual adapter
#[derive(Clone)]
pub struct Adapter {
    core: Arc<AdapterCore>,
}

impl Adapter {
    /// Create an adapter. Must be called within a tokio runtime; deferred
    /// work runs on that runtime.
    pub fn attach(
        settings: AdapterSettings,
        context: &DriverContext,
        upper: Arc<dyn ProtocolBinding>,
    ) -> Result<Self> {
        settings
            .validate()
            .map_err(|e| AdapterError::invalid_parameter("settings", format!("{:#}", e)))?;
        let runtime = Handle::try_current().map_err(|e| AdapterError::NoRuntime {
            message: e.to_string(),
        })?;

        let Some(instance) = context.next_instance() else {
            error!(
                adapter = %settings.name,
                max = MacAddress::MAX_PERMANENT,
                "No permanent address left for adapter"
            );
            return Err(AdapterError::TooManyAdapters {
                max: MacAddress::MAX_PERMANENT,
            });
        };
        let permanent_address = MacAddress::permanent(instance);
        let current_address = match settings.network_address.as_deref() {
            None => permanent_address,
            Some(text) => match text
                .parse::<MacAddress>()
                .and_then(|mac| mac.validate_override().map(|_| mac))
            {
                Ok(mac) => mac,
                Err(e) => {
                    error!(adapter = %settings.name, error = %e, "Ignoring network address override");
                    permanent_address
                }
            },
        };

        let core = Arc::new(AdapterCore {
            lifecycle: Arc::new(Lifecycle::new(settings.name.clone(), runtime)),
            send: SendPipeline::new(settings.send_pool_size, settings.buffer_size),
            receive: ReceivePipeline::new(
                settings.recv_pool_size,
                settings.buffer_size,
                settings.recv_low_watermark,
                settings.max_consecutive_errors,
            ),
            status: StatusPoller::new(),
            filter: RwLock::new(FilterState::new(settings.promiscuous)),
            counters: Counters::default(),
            upper,
            permanent_address,
            current_address: RwLock::new(current_address),
            link_speed: AtomicU64::new(DEFAULT_LINK_SPEED_KBPS),
            lookahead: AtomicUsize::new(MAX_DATA_SIZE),
            transport: RwLock::new(None),
            provider: Arc::clone(&context.provider),
            hub: Arc::clone(&context.hub),
            channel: context.channel.clone(),
            subscription: Mutex::new(None),
            init_gate: tokio::sync::Mutex::new(()),
            next_request: AtomicU64::new(1),
            settings,
        });

        info!(
            adapter = %core.name(),
            permanent = %permanent_address,
            current = %current_address,
            promiscuous = core.settings.promiscuous,
            "Adapter attached"
        );
        Ok(Self { core })
    }

    /// Subscribe for retries and attempt bring-up
    pub async fn initialize(&self) -> Result<BringUp> {
        let core = &self.core;
        {
            // Halt begins under this gate, so its unsubscribe sees ours
            let _gate = core.init_gate.lock().await;
            if core.lifecycle.is_halting() {
                return Err(AdapterError::halting(core.name()));
            }
            core.lifecycle.begin_init();
            self.subscribe_for_retry();
        }

        match core.bring_up().await {
            Ok(_) => Ok(BringUp::Complete),
            Err(AdapterError::TransportNotReady { message }) => {
                info!(adapter = %core.name(), %message, "Transport not ready, waiting for notification");
                Ok(BringUp::Pending)
            }
            Err(e) => {
                error!(adapter = %core.name(), error = %e, "Bring-up failed");
                Err(e)
            }
        }
    }

    fn subscribe_for_retry(&self) {
        let core = &self.core;
        let weak = Arc::downgrade(core);
        let callback: NotifyCallback = Arc::new(move |source: &str| {
            if let Some(core) = weak.upgrade() {
                core.on_transport_notification(source);
            }
        });

        let subscription = core.hub.subscribe(&core.channel, core.name(), callback);
        *core.subscription.lock() = Some(subscription);
        core.hub.notify(&core.channel, DRIVER_TAG);
    }

    /// Stop all work, wait for every outstanding operation and release the
    /// transport. Returns once the adapter is Halted; concurrent callers
    /// after the first return immediately.
    pub async fn halt(&self) {
        let core = &self.core;
        {
            let _gate = core.init_gate.lock().await;
            if !core.lifecycle.begin_halt() {
                debug!(adapter = %core.name(), "Halt already in progress");
                return;
            }
        }
        info!(adapter = %core.name(), "Halting adapter");

        core.lifecycle.stop_posting();
        let subscription = core.subscription.lock().take();
        if let Some(subscription) = subscription {
            core.hub.unsubscribe(&subscription);
        }

        core.send.shutdown(core);
        core.receive.shutdown(core);
        core.status.cancel(core);

        core.lifecycle.release_ref();
        core.lifecycle
            .wait_quiescent(Duration::from_millis(core.settings.halt_check_interval_ms))
            .await;

        for pool in [core.send.pool(), core.receive.pool()] {
            if let Err(violation) = pool.teardown() {
                violation.fatal();
            }
        }
        let transport = core.transport.write().take();
        if let Some(transport) = transport {
            transport.close().await;
        }

        core.lifecycle.set_phase(Phase::Halted);
        info!(adapter = %core.name(), "Adapter halted");
    }

    /// Queue an outbound frame
    pub fn submit_frame(&self, frame: impl Into<Bytes>) -> SubmitOutcome {
        self.core.send.submit(&self.core, frame.into())
    }

    /// Replace the packet filter. Forwarded to the transport unless the
    /// adapter runs promiscuous.
    pub fn set_packet_filter(&self, bits: u32) -> Result<PacketFilter> {
        self.ensure_live()?;
        let filter = self.core.filter.write().set_filter_bits(bits)?;
        debug!(adapter = %self.name(), ?filter, "Packet filter set");
        self.core.forward(ControlRequest::SetPacketFilter(filter));
        Ok(filter)
    }

    /// Replace the multicast list
    pub fn set_multicast_list(&self, addresses: Vec<MacAddress>) -> Result<()> {
        self.ensure_live()?;
        self.core
            .filter
            .write()
            .set_multicast_list(addresses.clone())?;
        self.core.forward(ControlRequest::SetMulticastList(addresses));
        Ok(())
    }

    pub fn packet_filter(&self) -> PacketFilter {
        self.core.filter.read().filter()
    }

    pub fn multicast_list(&self) -> Vec<MacAddress> {
        self.core.filter.read().multicast_list().to_vec()
    }

    /// Largest multicast list the adapter accepts
    pub fn max_multicast_list(&self) -> usize {
        self.core.filter.read().max_multicast()
    }

    pub fn query_counters(&self) -> CountersSnapshot {
        self.core.counters.snapshot()
    }

    pub fn media_connect_status(&self) -> MediaState {
        self.core.lifecycle.media_state()
    }

    /// Link speed in kbps
    pub fn link_speed(&self) -> u64 {
        self.core.link_speed.load(Ordering::Relaxed)
    }

    pub fn current_address(&self) -> MacAddress {
        self.core.current_address()
    }

    pub fn permanent_address(&self) -> MacAddress {
        self.core.permanent_address
    }

    pub fn lookahead(&self) -> usize {
        self.core.lookahead.load(Ordering::Relaxed)
    }

    pub fn set_lookahead(&self, lookahead: usize) -> Result<()> {
        if lookahead > MAX_DATA_SIZE {
            return Err(AdapterError::invalid_parameter(
                "lookahead",
                format!("{} exceeds maximum {}", lookahead, MAX_DATA_SIZE),
            ));
        }
        self.core.lookahead.store(lookahead, Ordering::Relaxed);
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn description(&self) -> &str {
        &self.core.settings.description
    }

    pub fn phase(&self) -> Phase {
        self.core.lifecycle.phase()
    }

    /// Set when deferred bring-up failed for a reason other than "not ready"
    pub fn removal_requested(&self) -> bool {
        self.core.lifecycle.removal_requested()
    }

    /// Outstanding adapter references, base reference included
    pub fn outstanding_refs(&self) -> usize {
        self.core.lifecycle.refs()
    }

    pub fn send_pool_stats(&self) -> PoolStats {
        self.core.send.stats()
    }

    pub fn receive_pool_stats(&self) -> PoolStats {
        self.core.receive.stats()
    }

    /// Frames waiting for a free send block
    pub fn pending_sends(&self) -> usize {
        self.core.send.pending_len()
    }

    pub fn status_polling(&self) -> bool {
        self.core.status.is_active()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.core.lifecycle.is_halting() {
            return Err(AdapterError::halting(self.name()));
        }
        Ok(())
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name())
            .field("phase", &self.phase())
            .field("refs", &self.outstanding_refs())
            .finish()
    }
}
