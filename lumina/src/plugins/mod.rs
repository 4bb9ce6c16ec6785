//! Plugin runtime: manifest discovery, dependency-ordered loading,
//! permission-gated contexts, local and process isolation, and lifecycle
//! events (`plugin.loaded` / `plugin.unloaded` / `plugin.error`).

mod context;
mod deps;
mod host;
mod manifest;
mod permissions;

pub use context::LuminaContext;
pub use deps::{sort_by_dependencies, SortOutcome};
pub use host::{CommandType, IsolatedPlugin, WorkerCommand, WorkerEvent};
pub use manifest::{scan_plugins_dir, IsolationMode, PluginManifest};
pub use permissions::{
    dangerous_permissions, default_permissions, effective_permissions, Permission,
};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{error, info, warn};

use event_packet::event_type;

use crate::bus::EventBus;
use crate::llm::LlmManager;
use crate::memory::MemoryStore;
use crate::soul::SoulService;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
    #[error("circular plugin dependency involving: {0:?}")]
    DependencyCycle(Vec<String>),
    #[error("missing '{permission}' permission required to {action}")]
    PermissionDenied {
        permission: Permission,
        action: String,
    },
    #[error("no factory registered for entrypoint '{0}'")]
    UnknownEntrypoint(String),
    #[error("plugin '{0}' is already loaded")]
    AlreadyLoaded(String),
    #[error("plugin '{0}' is not loaded")]
    NotLoaded(String),
    #[error("plugin '{plugin}' conflicts with '{holder}' in exclusive group '{group}'")]
    GroupConflict {
        plugin: String,
        group: String,
        holder: String,
    },
    #[error("plugin init failed: {0}")]
    Init(String),
    #[error("plugin io error: {0}")]
    Io(String),
    #[error("plugin IPC error: {0}")]
    Ipc(String),
    #[error("plugin IPC call timed out")]
    IpcTimeout,
}

/// In-process plugin contract. The factory registry maps manifest
/// entrypoints to constructors; the runtime drives the lifecycle.
#[async_trait]
pub trait SystemPlugin: Send + Sync {
    async fn initialize(&self, context: Arc<LuminaContext>) -> Result<(), PluginError>;

    async fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Constructor registered for a `module:Class` entrypoint.
pub type PluginFactory = Arc<dyn Fn() -> Arc<dyn SystemPlugin> + Send + Sync>;

enum PluginInstance {
    Local(Arc<dyn SystemPlugin>),
    Isolated(Arc<IsolatedPlugin>),
}

struct LoadedPlugin {
    manifest: PluginManifest,
    instance: PluginInstance,
    context: Arc<LuminaContext>,
}

/// Discovers, sorts, loads, and manages plugins.
pub struct PluginRuntime {
    plugins_dir: PathBuf,
    bus: Arc<EventBus>,
    soul: Arc<SoulService>,
    memory: Arc<MemoryStore>,
    llm: Arc<LlmManager>,
    config: config::LuminaConfig,
    factories: DashMap<String, PluginFactory>,
    loaded: DashMap<String, Arc<LoadedPlugin>>,
    load_order: std::sync::Mutex<Vec<String>>,
}

impl PluginRuntime {
    pub fn new(
        plugins_dir: impl Into<PathBuf>,
        bus: Arc<EventBus>,
        soul: Arc<SoulService>,
        memory: Arc<MemoryStore>,
        llm: Arc<LlmManager>,
        config: config::LuminaConfig,
    ) -> Self {
        Self {
            plugins_dir: plugins_dir.into(),
            bus,
            soul,
            memory,
            llm,
            config,
            factories: DashMap::new(),
            loaded: DashMap::new(),
            load_order: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Registers an in-process constructor for a manifest entrypoint
    /// (`module:Class`). Called by the host application before `load_all`.
    pub fn register_factory(&self, entrypoint: &str, factory: PluginFactory) {
        self.factories.insert(entrypoint.to_string(), factory);
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        self.load_order
            .lock()
            .map(|order| order.clone())
            .unwrap_or_default()
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.contains_key(plugin_id)
    }

    async fn emit_plugin_error(&self, plugin_id: &str, message: &str) {
        self.bus
            .emit(
                event_type::PLUGIN_ERROR,
                serde_json::json!({ "plugin_id": plugin_id, "error": message }),
                "plugin_runtime",
            )
            .await;
    }

    /// Discovers and loads every plugin in dependency order. A dependency
    /// cycle is fatal; missing dependencies and per-plugin failures are
    /// reported via `plugin.error` and skipped.
    pub async fn load_all(&self) -> Result<(), PluginError> {
        let manifests = scan_plugins_dir(&self.plugins_dir);
        let outcome = sort_by_dependencies(manifests)?;

        for (plugin_id, missing_dep) in &outcome.missing {
            warn!(plugin_id = %plugin_id, missing = %missing_dep, "plugin skipped: missing dependency");
            self.emit_plugin_error(plugin_id, &format!("missing dependency '{missing_dep}'"))
                .await;
        }

        for manifest in outcome.ordered {
            let plugin_id = manifest.id.clone();
            if let Err(e) = self.load_manifest(manifest).await {
                error!(plugin_id = %plugin_id, error = %e, "plugin load failed");
                self.emit_plugin_error(&plugin_id, &e.to_string()).await;
            }
        }
        Ok(())
    }

    fn group_holder(&self, manifest: &PluginManifest) -> Option<String> {
        let group = manifest.group_id.as_deref()?;
        self.loaded
            .iter()
            .find(|entry| {
                let held = &entry.value().manifest;
                held.group_id.as_deref() == Some(group)
                    && (held.group_exclusive || manifest.group_exclusive)
            })
            .map(|entry| entry.key().clone())
    }

    /// Loads one plugin from its manifest.
    pub async fn load_manifest(&self, manifest: PluginManifest) -> Result<(), PluginError> {
        if self.loaded.contains_key(&manifest.id) {
            return Err(PluginError::AlreadyLoaded(manifest.id));
        }
        for dep in &manifest.dependencies {
            if !self.loaded.contains_key(dep) {
                return Err(PluginError::InvalidManifest(format!(
                    "dependency '{dep}' is not loaded"
                )));
            }
        }
        if let Some(holder) = self.group_holder(&manifest) {
            return Err(PluginError::GroupConflict {
                plugin: manifest.id,
                group: manifest.group_id.unwrap_or_default(),
                holder,
            });
        }

        let granted = effective_permissions(&manifest.permissions);
        let context = Arc::new(LuminaContext::new(
            manifest.id.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.soul),
            Arc::clone(&self.memory),
            Arc::clone(&self.llm),
            self.config.clone(),
            granted,
        ));

        let instance = match manifest.isolation_mode {
            IsolationMode::Local => {
                let factory = self
                    .factories
                    .get(&manifest.entrypoint)
                    .map(|f| Arc::clone(f.value()))
                    .ok_or_else(|| PluginError::UnknownEntrypoint(manifest.entrypoint.clone()))?;
                let plugin = factory();
                plugin
                    .initialize(Arc::clone(&context))
                    .await
                    .map_err(|e| PluginError::Init(e.to_string()))?;
                plugin.start().await?;
                PluginInstance::Local(plugin)
            }
            IsolationMode::Process => {
                let isolated = Arc::new(IsolatedPlugin::new(
                    manifest.clone(),
                    Arc::clone(&context),
                    Arc::clone(&self.bus),
                ));
                isolated.start().await?;
                PluginInstance::Isolated(isolated)
            }
        };

        let plugin_id = manifest.id.clone();
        let version = manifest.version.clone();
        self.loaded.insert(
            plugin_id.clone(),
            Arc::new(LoadedPlugin {
                manifest,
                instance,
                context,
            }),
        );
        if let Ok(mut order) = self.load_order.lock() {
            order.push(plugin_id.clone());
        }

        info!(plugin_id = %plugin_id, version = %version, "plugin loaded");
        self.bus
            .emit(
                event_type::PLUGIN_LOADED,
                serde_json::json!({
                    "plugin_id": plugin_id,
                    "version": version,
                    "enabled": true,
                }),
                "plugin_runtime",
            )
            .await;
        Ok(())
    }

    /// Unloads a plugin: stops it, removes its bus subscriptions cleanly,
    /// and emits `plugin.unloaded`.
    pub async fn unload(&self, plugin_id: &str) -> Result<(), PluginError> {
        let (_, plugin) = self
            .loaded
            .remove(plugin_id)
            .ok_or_else(|| PluginError::NotLoaded(plugin_id.to_string()))?;
        if let Ok(mut order) = self.load_order.lock() {
            order.retain(|id| id != plugin_id);
        }

        match &plugin.instance {
            PluginInstance::Local(local) => {
                if let Err(e) = local.stop().await {
                    warn!(plugin_id, error = %e, "plugin stop failed");
                }
            }
            PluginInstance::Isolated(isolated) => isolated.terminate().await,
        }

        for subscription in plugin.context.take_subscriptions() {
            self.bus.unsubscribe(subscription);
        }

        info!(plugin_id, "plugin unloaded");
        self.bus
            .emit(
                event_type::PLUGIN_UNLOADED,
                serde_json::json!({
                    "plugin_id": plugin_id,
                    "version": plugin.manifest.version,
                    "enabled": false,
                }),
                "plugin_runtime",
            )
            .await;
        Ok(())
    }

    /// Live reload: unload then rediscover and load the same id.
    pub async fn reload(&self, plugin_id: &str) -> Result<(), PluginError> {
        self.unload(plugin_id).await?;
        let manifest = scan_plugins_dir(&self.plugins_dir)
            .into_iter()
            .find(|m| m.id == plugin_id)
            .ok_or_else(|| PluginError::NotLoaded(plugin_id.to_string()))?;
        self.load_manifest(manifest).await
    }

    /// Unloads everything in reverse load order.
    pub async fn unload_all(&self) {
        let mut order = self.loaded_ids();
        order.reverse();
        for plugin_id in order {
            if let Err(e) = self.unload(&plugin_id).await {
                warn!(plugin_id = %plugin_id, error = %e, "unload failed during shutdown");
            }
        }
    }
}
