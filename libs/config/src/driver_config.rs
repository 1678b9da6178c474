//! Driver Configuration Module
//!
//! Loads the set of adapter instances from a TOML file with `RELAY_`
//! prefixed environment overrides.

use crate::adapter_settings::AdapterSettings;
use crate::defaults::notification;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Top-level driver configuration
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DriverConfig {
    /// Channel the transport announces itself on once it is available
    #[serde(default = "default_channel")]
    pub notification_channel: String,

    /// Adapter instances to attach
    #[serde(default)]
    pub adapters: Vec<AdapterSettings>,
}

fn default_channel() -> String {
    notification::TRANSPORT_READY_CHANNEL.to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            notification_channel: default_channel(),
            adapters: vec![AdapterSettings::default()],
        }
    }
}

impl DriverConfig {
    /// Load configuration from a file with environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading driver config: {:?}", path);

        let builder = Config::builder()
            .add_source(File::from(path).required(true))
            // Override with environment variables (RELAY_ prefix)
            .add_source(
                Environment::with_prefix("RELAY")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!("Loaded {} adapter definitions", config.adapters.len());
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every adapter and check names are unique
    pub fn validate(&self) -> Result<()> {
        if self.notification_channel.trim().is_empty() {
            bail!("notification_channel must not be empty");
        }

        let mut names = HashSet::new();
        for adapter in &self.adapters {
            adapter
                .validate()
                .with_context(|| format!("invalid settings for adapter '{}'", adapter.name))?;
            if !names.insert(adapter.name.as_str()) {
                bail!("duplicate adapter name '{}'", adapter.name);
            }
        }
        Ok(())
    }

    /// Look up one adapter by name
    pub fn adapter(&self, name: &str) -> Option<&AdapterSettings> {
        self.adapters.iter().find(|a| a.name == name)
    }
}

/// Convenience function to load configuration, falling back to defaults
pub fn load_config(path: Option<&Path>) -> Result<DriverConfig> {
    match path {
        Some(path) => DriverConfig::load(path),
        None => {
            info!("No config file given, using defaults");
            Ok(DriverConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("relay.toml");

        let config_content = r#"
notification_channel = "test.ready"

[[adapters]]
name = "relay0"
promiscuous = false
network_address = "02-50-f2-00-01-99"

[[adapters]]
name = "relay1"
promiscuous = true
recv_pool_size = 8
recv_low_watermark = 4
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = DriverConfig::load(&config_path).unwrap();

        assert_eq!(config.notification_channel, "test.ready");
        assert_eq!(config.adapters.len(), 2);

        let second = config.adapter("relay1").unwrap();
        assert!(second.promiscuous);
        assert_eq!(second.recv_pool_size, 8);
        assert_eq!(
            config.adapter("relay0").unwrap().network_address.as_deref(),
            Some("02-50-f2-00-01-99")
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = DriverConfig::from_toml_str(
            r#"
[[adapters]]
name = "relay0"

[[adapters]]
name = "relay0"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate adapter name"));
    }

    #[test]
    fn test_invalid_adapter_reported_with_name() {
        let err = DriverConfig::from_toml_str(
            r#"
[[adapters]]
name = "relay0"
send_pool_size = 0
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("relay0"));
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = tempdir().unwrap();
        assert!(DriverConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_load_config_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.adapters.len(), 1);
        assert_eq!(
            config.notification_channel,
            notification::TRANSPORT_READY_CHANNEL
        );
    }
}
