//! The capability object handed to plugins: a fixed, permission-gated view
//! into core services. Plugins never receive the raw service container.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::warn;

use crate::bus::{EventBus, Handler, SubscriptionId};
use crate::llm::LlmManager;
use crate::memory::MemoryStore;
use crate::soul::SoulService;

use super::permissions::Permission;
use super::PluginError;

/// Per-plugin context. Every accessor whose capability is not granted
/// returns [`PluginError::PermissionDenied`]; the denial is logged at WARN
/// and never kills the plugin.
pub struct LuminaContext {
    plugin_id: String,
    bus: Arc<EventBus>,
    soul: Arc<SoulService>,
    memory: Arc<MemoryStore>,
    llm: Arc<LlmManager>,
    config: config::LuminaConfig,
    permissions: HashSet<Permission>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl LuminaContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin_id: impl Into<String>,
        bus: Arc<EventBus>,
        soul: Arc<SoulService>,
        memory: Arc<MemoryStore>,
        llm: Arc<LlmManager>,
        config: config::LuminaConfig,
        permissions: HashSet<Permission>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            bus,
            soul,
            memory,
            llm,
            config,
            permissions,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    pub fn permissions(&self) -> &HashSet<Permission> {
        &self.permissions
    }

    fn require(&self, permission: Permission, action: &str) -> Result<(), PluginError> {
        if self.permissions.contains(&permission) {
            return Ok(());
        }
        warn!(
            plugin_id = %self.plugin_id,
            permission = %permission,
            action,
            "plugin denied capability access"
        );
        Err(PluginError::PermissionDenied {
            permission,
            action: action.to_string(),
        })
    }

    /// Read-only settings snapshot.
    pub fn config(&self) -> &config::LuminaConfig {
        &self.config
    }

    // --- Event bus (defaults cover subscribe/emit) ---

    /// Subscribes to a bus event; the subscription is tracked and removed
    /// when the plugin unloads.
    pub fn subscribe(&self, event_type: &str, handler: Handler) -> Result<SubscriptionId, PluginError> {
        self.require(Permission::EventSubscribe, "subscribe to bus events")?;
        let id = self.bus.subscribe(event_type, handler);
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.push(id);
        }
        Ok(id)
    }

    pub async fn emit(&self, event_type: &str, data: Value) -> Result<u32, PluginError> {
        self.require(Permission::EventEmit, "emit bus events")?;
        Ok(self.bus.emit(event_type, data, &self.plugin_id).await)
    }

    /// Subscribes to `system.tick` (requires ticker.subscribe).
    pub fn subscribe_ticks(&self, handler: Handler) -> Result<SubscriptionId, PluginError> {
        self.require(Permission::TickerSubscribe, "subscribe to ticker")?;
        let id = self
            .bus
            .subscribe(event_packet::event_type::SYSTEM_TICK, handler);
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.push(id);
        }
        Ok(id)
    }

    // --- Service registry ---

    pub fn register_service(
        &self,
        name: &str,
        instance: Arc<dyn std::any::Any + Send + Sync>,
    ) -> Result<(), PluginError> {
        self.require(Permission::PluginDiscovery, "register a service")?;
        self.bus.register_service(name, instance);
        Ok(())
    }

    pub fn get_service(
        &self,
        name: &str,
    ) -> Result<Option<Arc<dyn std::any::Any + Send + Sync>>, PluginError> {
        self.require(Permission::PluginDiscovery, "discover services")?;
        Ok(self.bus.get_service(name))
    }

    // --- Gated core services ---

    /// Memory store handle for reads (requires memory.read).
    pub fn memory(&self) -> Result<Arc<MemoryStore>, PluginError> {
        self.require(Permission::MemoryRead, "read from the memory store")?;
        Ok(Arc::clone(&self.memory))
    }

    /// Memory store handle for writes (requires memory.write).
    pub fn memory_writer(&self) -> Result<Arc<MemoryStore>, PluginError> {
        self.require(Permission::MemoryWrite, "write to the memory store")?;
        Ok(Arc::clone(&self.memory))
    }

    /// LLM route manager (requires llm.invoke).
    pub fn llm(&self) -> Result<Arc<LlmManager>, PluginError> {
        self.require(Permission::LlmInvoke, "invoke the LLM")?;
        Ok(Arc::clone(&self.llm))
    }

    /// Read-only soul view: always available.
    pub fn soul(&self) -> Arc<SoulService> {
        Arc::clone(&self.soul)
    }

    /// Soul handle for mutations (requires soul.modify).
    pub fn soul_modifier(&self) -> Result<Arc<SoulService>, PluginError> {
        self.require(Permission::SoulModify, "modify character state")?;
        Ok(Arc::clone(&self.soul))
    }

    // --- Plugin-scoped persistence ---

    /// Loads this plugin's persisted JSON; reading own data is ungated.
    pub fn load_data(&self) -> Value {
        self.soul.load_plugin_data(&self.plugin_id)
    }

    pub async fn save_data(&self, data: &Value) -> Result<(), PluginError> {
        self.require(Permission::FilesystemWrite, "write plugin data")?;
        self.soul
            .save_plugin_data(&self.plugin_id, data)
            .await
            .map_err(|e| PluginError::Io(e.to_string()))
    }

    pub fn data_dir(&self) -> Result<std::path::PathBuf, PluginError> {
        self.require(Permission::FilesystemRead, "access the data directory")?;
        self.soul
            .plugin_data_dir(&self.plugin_id)
            .map_err(|e| PluginError::Io(e.to_string()))
    }

    /// Drains tracked subscription ids (called on unload).
    pub fn take_subscriptions(&self) -> Vec<SubscriptionId> {
        self.subscriptions
            .lock()
            .map(|mut subscriptions| std::mem::take(&mut *subscriptions))
            .unwrap_or_default()
    }
}
