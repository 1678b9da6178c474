//! Adapter Registry
//!
//! Owns the attached adapters of one driver by name.

use crate::adapter::{Adapter, BringUp, DriverContext};
use crate::error::{AdapterError, Result};
use crate::upper::ProtocolBinding;
use parking_lot::RwLock;
use relay_config::AdapterSettings;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct AdapterRegistry {
    context: DriverContext,
    adapters: RwLock<HashMap<String, Adapter>>,
}

impl AdapterRegistry {
    pub fn new(context: DriverContext) -> Self {
        Self {
            context,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &DriverContext {
        &self.context
    }

    /// Attach and initialize an adapter. The name is reserved before
    /// initialization so concurrent attaches of one name cannot both win.
    pub async fn attach(
        &self,
        settings: AdapterSettings,
        upper: Arc<dyn ProtocolBinding>,
    ) -> Result<(Adapter, BringUp)> {
        let name = settings.name.clone();
        let adapter = {
            let mut adapters = self.adapters.write();
            if adapters.contains_key(&name) {
                return Err(AdapterError::DuplicateAdapter { name });
            }
            let adapter = Adapter::attach(settings, &self.context, upper)?;
            adapters.insert(name.clone(), adapter.clone());
            adapter
        };

        match adapter.initialize().await {
            Ok(bring_up) => {
                info!(adapter = %name, ?bring_up, "Adapter registered");
                Ok((adapter, bring_up))
            }
            Err(e) => {
                self.adapters.write().remove(&name);
                adapter.halt().await;
                Err(e)
            }
        }
    }

    /// Remove an adapter and halt it
    pub async fn detach(&self, name: &str) -> Result<()> {
        let adapter = self.adapters.write().remove(name);
        match adapter {
            Some(adapter) => {
                adapter.halt().await;
                Ok(())
            }
            None => Err(AdapterError::invalid_parameter(
                "name",
                format!("no adapter named '{}'", name),
            )),
        }
    }

    pub fn get(&self, name: &str) -> Option<Adapter> {
        self.adapters.read().get(name).cloned()
    }

    /// Sorted adapter names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.adapters.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.read().is_empty()
    }

    /// Halt and remove every adapter
    pub async fn halt_all(&self) {
        let adapters: Vec<Adapter> = self.adapters.write().drain().map(|(_, a)| a).collect();
        for adapter in adapters {
            if adapter.removal_requested() {
                warn!(adapter = %adapter.name(), "Halting adapter that requested removal");
            }
            adapter.halt().await;
        }
    }
}
