//! # Relay Adapter Configuration
//!
//! Configuration and defaults consumed by the adapter core at attach time.
//! The core treats these values as pure inputs: it never reloads them and
//! never writes them back.
//!
//! ## Features
//!
//! - **Adapter Settings**: name, description, address override, promiscuous
//!   flag, transfer pool sizing
//! - **Driver Configuration**: the set of adapter instances and the
//!   notification channel used for deferred bring-up
//! - **Defaults**: sizing constants shared by the core and the daemon
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relay_config::DriverConfig;
//!
//! let config = DriverConfig::load(std::path::Path::new("config/relay.toml")).unwrap();
//! for adapter in &config.adapters {
//!     println!("{} (promiscuous: {})", adapter.name, adapter.promiscuous);
//! }
//! ```

pub mod adapter_settings;
pub mod defaults;
pub mod driver_config;

// Re-export commonly used types
pub use adapter_settings::AdapterSettings;
pub use driver_config::{load_config, DriverConfig};
