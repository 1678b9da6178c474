//! Shared setup for adapter integration tests

#![allow(dead_code)]

use relay_adapter::test_utils::CollectingBinding;
use relay_adapter::{
    Adapter, AdapterSettings, BringUp, DriverContext, LoopbackConfig, LoopbackProvider,
    LoopbackTransport, MacAddress, NotificationHub,
};
use std::sync::Arc;
use std::time::Duration;

pub const CHANNEL: &str = "test.transport.ready";

/// Upper bound for anything that settles through deferred tasks
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub adapter: Adapter,
    pub binding: Arc<CollectingBinding>,
    pub provider: Arc<LoopbackProvider>,
    pub hub: Arc<NotificationHub>,
    pub context: DriverContext,
}

impl Harness {
    /// Build an adapter over a loopback provider without initializing it
    pub fn new(
        settings: AdapterSettings,
        config: LoopbackConfig,
        ready: bool,
        binding: CollectingBinding,
    ) -> Self {
        let hub = Arc::new(NotificationHub::new());
        let provider = Arc::new(LoopbackProvider::new(config, ready));
        provider.announce_on(Arc::clone(&hub), CHANNEL);
        let context = DriverContext::new(provider.clone(), Arc::clone(&hub), CHANNEL);
        let binding = Arc::new(binding);
        let adapter = Adapter::attach(settings, &context, binding.clone()).unwrap();
        Self {
            adapter,
            binding,
            provider,
            hub,
            context,
        }
    }

    /// Build and initialize, expecting an immediate bring-up
    pub async fn ready(settings: AdapterSettings, config: LoopbackConfig) -> Self {
        Self::ready_with(settings, config, CollectingBinding::new()).await
    }

    pub async fn ready_with(
        settings: AdapterSettings,
        config: LoopbackConfig,
        binding: CollectingBinding,
    ) -> Self {
        let harness = Self::new(settings, config, true, binding);
        assert_eq!(harness.adapter.initialize().await.unwrap(), BringUp::Complete);
        harness
    }

    /// The loopback device underneath the adapter
    pub fn lower(&self) -> Arc<LoopbackTransport> {
        self.provider.transport(self.adapter.name())
    }
}

/// Minimum-size frame to `destination` carrying `tag` as its first payload byte
pub fn frame_to(destination: MacAddress, tag: u8) -> Vec<u8> {
    let mut frame = vec![0u8; 60];
    frame[..6].copy_from_slice(&destination.octets());
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame[12..14].copy_from_slice(&[0x08, 0x00]);
    frame[14] = tag;
    frame
}

/// Payload tag of a frame built by [`frame_to`]
pub fn tag_of(frame: &[u8]) -> u8 {
    frame[14]
}
