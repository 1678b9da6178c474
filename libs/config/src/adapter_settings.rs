//! Per-adapter settings
//!
//! Everything the adapter core reads at attach time. Values are validated
//! once here so the core can size its pools without re-checking.

use crate::defaults::{adapter, ethernet, pools};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Settings for one virtual adapter instance
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AdapterSettings {
    /// Instance name; also used to skip our own binding when opening the transport
    pub name: String,

    /// Human readable description of the virtual interface
    pub description: String,

    /// Optional locally administered MAC override, `aa-bb-cc-dd-ee-ff` or `aa:bb:..`
    pub network_address: Option<String>,

    /// Put the transport in promiscuous mode and accept every frame
    pub promiscuous: bool,

    /// Outbound transfer blocks
    pub send_pool_size: usize,

    /// Inbound transfer blocks kept posted
    pub recv_pool_size: usize,

    /// Busy count below which receive replenishment is triggered
    pub recv_low_watermark: usize,

    /// Size of every transfer block buffer
    pub buffer_size: usize,

    /// Consecutive hard receive errors before reads stop being posted
    pub max_consecutive_errors: u32,

    /// Diagnostic re-check interval while halt waits for quiescence
    pub halt_check_interval_ms: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            name: adapter::DEFAULT_NAME.to_string(),
            description: adapter::DEFAULT_DESCRIPTION.to_string(),
            network_address: None,
            promiscuous: false,
            send_pool_size: pools::MAX_BUSY_SENDS,
            recv_pool_size: pools::MAX_BUSY_RECVS,
            recv_low_watermark: pools::RECV_LOW_WATERMARK,
            buffer_size: ethernet::MAX_PACKET_SIZE,
            max_consecutive_errors: adapter::MAX_CONSECUTIVE_RECV_ERRORS,
            halt_check_interval_ms: adapter::HALT_CHECK_INTERVAL_MS,
        }
    }
}

impl AdapterSettings {
    /// Settings with the given name and every other value defaulted
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style pool sizing, mostly for tests
    pub fn with_pools(mut self, send: usize, recv: usize, low_watermark: usize) -> Self {
        self.send_pool_size = send;
        self.recv_pool_size = recv;
        self.recv_low_watermark = low_watermark;
        self
    }

    /// Builder-style promiscuous flag
    pub fn with_promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Builder-style address override
    pub fn with_network_address(mut self, address: impl Into<String>) -> Self {
        self.network_address = Some(address.into());
        self
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("adapter name must not be empty");
        }

        for (field, size) in [
            ("send_pool_size", self.send_pool_size),
            ("recv_pool_size", self.recv_pool_size),
        ] {
            if size == 0 || size > pools::MAX_POOL_SIZE {
                bail!(
                    "{} for adapter '{}' must be in 1..={}, got {}",
                    field,
                    self.name,
                    pools::MAX_POOL_SIZE,
                    size
                );
            }
        }

        if self.recv_low_watermark > self.recv_pool_size {
            bail!(
                "recv_low_watermark ({}) exceeds recv_pool_size ({}) for adapter '{}'",
                self.recv_low_watermark,
                self.recv_pool_size,
                self.name
            );
        }

        if self.buffer_size < ethernet::MIN_PACKET_SIZE {
            bail!(
                "buffer_size ({}) is smaller than a minimum Ethernet frame ({})",
                self.buffer_size,
                ethernet::MIN_PACKET_SIZE
            );
        }

        if self.halt_check_interval_ms == 0 {
            bail!("halt_check_interval_ms must be non-zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let settings = AdapterSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.send_pool_size, pools::MAX_BUSY_SENDS);
        assert_eq!(settings.buffer_size, 1514);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings: AdapterSettings = toml::from_str(
            r#"
name = "relay7"
promiscuous = true
send_pool_size = 4
"#,
        )
        .unwrap();

        assert_eq!(settings.name, "relay7");
        assert!(settings.promiscuous);
        assert_eq!(settings.send_pool_size, 4);
        assert_eq!(settings.recv_pool_size, pools::MAX_BUSY_RECVS);
        assert!(settings.network_address.is_none());
    }

    #[test]
    fn test_rejects_watermark_above_pool() {
        let settings = AdapterSettings::named("relay1").with_pools(4, 4, 5);
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("recv_low_watermark"));
    }

    #[test]
    fn test_rejects_empty_pool_and_name() {
        assert!(AdapterSettings::named("relay1")
            .with_pools(0, 4, 2)
            .validate()
            .is_err());
        assert!(AdapterSettings::named("  ").validate().is_err());
    }

    #[test]
    fn test_rejects_tiny_buffers() {
        let mut settings = AdapterSettings::named("relay1");
        settings.buffer_size = 32;
        assert!(settings.validate().is_err());
    }
}
