//! Out-of-process plugin host: spawns the plugin as a child process and
//! marshals commands and events over a JSON-line stdio protocol.
//!
//! Commands (host → worker): load, start, stop, terminate, update_config,
//! event_emit. Events (worker → host): ready, result, error, log,
//! event_emit, register_service, save_data, update_config. Requests are
//! correlated by id; a timeout fails the call without killing the child. A
//! crashed child is reported via `plugin.error` and respawned lazily on the
//! next invocation.
//!
//! Permission enforcement is mandatory at this boundary: the host validates
//! every worker request against the manifest grant before honouring it.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use event_packet::event_type;

use crate::bus::EventBus;

use super::context::LuminaContext;
use super::manifest::PluginManifest;
use super::permissions::Permission;
use super::PluginError;

/// Per-call IPC timeout.
const IPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Load,
    Start,
    Stop,
    Terminate,
    UpdateConfig,
    EventEmit,
}

/// Host → worker frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub id: String,
    pub cmd: CommandType,
    #[serde(default)]
    pub payload: Value,
}

/// Worker → host frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Ready {
        plugin_id: String,
    },
    Result {
        id: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Error {
        plugin_id: String,
        message: String,
        #[serde(default)]
        traceback: String,
    },
    Log {
        level: String,
        message: String,
    },
    EventEmit {
        event_name: String,
        #[serde(default)]
        data: Value,
    },
    RegisterService {
        name: String,
    },
    SaveData {
        data: Value,
    },
    UpdateConfig {
        key: String,
        value: Value,
    },
}

struct ChildHandle {
    stdin: ChildStdin,
    child: Child,
}

/// Host-side proxy for one isolated plugin. Presents the same calling shape
/// as a local plugin; method invocations and events cross the pipe.
pub struct IsolatedPlugin {
    manifest: PluginManifest,
    context: Arc<LuminaContext>,
    bus: Arc<EventBus>,
    child: Arc<Mutex<Option<ChildHandle>>>,
    pending: Arc<DashMap<String, oneshot::Sender<Result<Value, String>>>>,
}

impl IsolatedPlugin {
    pub fn new(manifest: PluginManifest, context: Arc<LuminaContext>, bus: Arc<EventBus>) -> Self {
        Self {
            manifest,
            context,
            bus,
            child: Arc::new(Mutex::new(None)),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.manifest.id
    }

    fn executable(&self) -> std::path::PathBuf {
        self.manifest.path.join(self.manifest.entry_module())
    }

    /// Spawns the child and its event-reader task. Called lazily; a crashed
    /// child is replaced on the next call.
    async fn ensure_spawned(&self) -> Result<(), PluginError> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let executable = self.executable();
        let mut child = Command::new(&executable)
            .arg("--plugin-id")
            .arg(&self.manifest.id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PluginError::Io(format!("spawn {} failed: {e}", executable.display()))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Io("child stdout unavailable".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Io("child stdin unavailable".to_string()))?;

        info!(plugin_id = %self.manifest.id, exe = %executable.display(), "isolated plugin spawned");

        // Reader task: one worker event per line.
        let plugin_id = self.manifest.id.clone();
        let bus = Arc::clone(&self.bus);
        let context = Arc::clone(&self.context);
        let pending = Arc::clone(&self.pending);
        let child_slot = Arc::clone(&self.child);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let event: WorkerEvent = match serde_json::from_str(&line) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(plugin_id = %plugin_id, error = %e, "bad worker frame; ignored");
                                continue;
                            }
                        };
                        handle_worker_event(&plugin_id, event, &bus, &context, &pending).await;
                    }
                    Ok(None) | Err(_) => break,
                }
            }

            // Child is gone: fail outstanding calls, report, allow respawn.
            for entry in pending.iter() {
                debug!(plugin_id = %plugin_id, call_id = %entry.key(), "failing pending call on exit");
            }
            let keys: Vec<String> = pending.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((_, tx)) = pending.remove(&key) {
                    let _ = tx.send(Err("plugin process exited".to_string()));
                }
            }
            *child_slot.lock().await = None;
            error!(plugin_id = %plugin_id, "isolated plugin process exited");
            bus.emit(
                event_type::PLUGIN_ERROR,
                serde_json::json!({
                    "plugin_id": plugin_id,
                    "error": "plugin process exited",
                }),
                "plugin_host",
            )
            .await;
        });

        *guard = Some(ChildHandle { stdin, child });
        drop(guard);

        // Hand the worker its manifest and effective grant.
        let grant: Vec<&str> = self
            .context
            .permissions()
            .iter()
            .map(|p| p.as_str())
            .collect();
        self.send_command(
            CommandType::Load,
            serde_json::json!({
                "plugin_id": self.manifest.id,
                "entrypoint": self.manifest.entrypoint,
                "permissions": grant,
            }),
        )
        .await?;
        Ok(())
    }

    async fn send_command(&self, cmd: CommandType, payload: Value) -> Result<Value, PluginError> {
        let id = uuid::Uuid::new_v4().to_string();
        let frame = WorkerCommand {
            id: id.clone(),
            cmd,
            payload,
        };
        let mut line =
            serde_json::to_string(&frame).map_err(|e| PluginError::Ipc(e.to_string()))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        {
            let mut guard = self.child.lock().await;
            let Some(handle) = guard.as_mut() else {
                self.pending.remove(&id);
                return Err(PluginError::Ipc("plugin process not running".to_string()));
            };
            if let Err(e) = handle.stdin.write_all(line.as_bytes()).await {
                self.pending.remove(&id);
                return Err(PluginError::Ipc(format!("pipe write failed: {e}")));
            }
        }

        match tokio::time::timeout(IPC_TIMEOUT, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(PluginError::Ipc(message)),
            Ok(Err(_)) => Err(PluginError::Ipc("worker dropped the call".to_string())),
            Err(_) => {
                // Timeout fails the call; the child keeps running.
                self.pending.remove(&id);
                Err(PluginError::IpcTimeout)
            }
        }
    }

    /// Sends a command, spawning (or respawning) the child first.
    pub async fn call(&self, cmd: CommandType, payload: Value) -> Result<Value, PluginError> {
        self.ensure_spawned().await?;
        self.send_command(cmd, payload).await
    }

    pub async fn start(&self) -> Result<(), PluginError> {
        self.call(CommandType::Start, Value::Null).await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<(), PluginError> {
        self.call(CommandType::Stop, Value::Null).await.map(|_| ())
    }

    /// Forwards a subscribed bus event into the worker.
    pub async fn forward_event(&self, event_name: &str, data: Value) -> Result<(), PluginError> {
        self.call(
            CommandType::EventEmit,
            serde_json::json!({ "event_name": event_name, "data": data }),
        )
        .await
        .map(|_| ())
    }

    /// Terminates the child. Outstanding calls fail through the reader task.
    pub async fn terminate(&self) {
        let _ = self.send_command(CommandType::Terminate, Value::Null).await;
        let mut guard = self.child.lock().await;
        if let Some(mut handle) = guard.take() {
            let _ = handle.child.kill().await;
        }
    }
}

/// Dispatches one worker event, enforcing the manifest grant before honouring
/// any request that touches core services.
async fn handle_worker_event(
    plugin_id: &str,
    event: WorkerEvent,
    bus: &Arc<EventBus>,
    context: &Arc<LuminaContext>,
    pending: &DashMap<String, oneshot::Sender<Result<Value, String>>>,
) {
    match event {
        WorkerEvent::Ready { plugin_id: id } => {
            info!(plugin_id = %id, "isolated plugin ready");
        }
        WorkerEvent::Result { id, result, error } => {
            if let Some((_, tx)) = pending.remove(&id) {
                let outcome = match error {
                    Some(message) => Err(message),
                    None => Ok(result),
                };
                let _ = tx.send(outcome);
            }
        }
        WorkerEvent::Error {
            plugin_id: id,
            message,
            traceback,
        } => {
            error!(plugin_id = %id, message = %message, "isolated plugin error");
            bus.emit(
                event_type::PLUGIN_ERROR,
                serde_json::json!({
                    "plugin_id": id,
                    "error": message,
                    "traceback": traceback,
                }),
                "plugin_host",
            )
            .await;
        }
        WorkerEvent::Log { level, message } => match level.as_str() {
            "error" => error!(plugin_id, "{message}"),
            "warning" | "warn" => warn!(plugin_id, "{message}"),
            "debug" => debug!(plugin_id, "{message}"),
            _ => info!(plugin_id, "{message}"),
        },
        WorkerEvent::EventEmit { event_name, data } => {
            if !context.has_permission(Permission::EventEmit) {
                warn!(plugin_id, event_name = %event_name, "worker emit denied: missing event.emit");
                return;
            }
            bus.emit(&event_name, data, plugin_id).await;
        }
        WorkerEvent::RegisterService { name } => {
            if !context.has_permission(Permission::PluginDiscovery) {
                warn!(plugin_id, service = %name, "service registration denied: missing plugin.discovery");
                return;
            }
            bus.register_service(&name, Arc::new(plugin_id.to_string()));
        }
        WorkerEvent::SaveData { data } => {
            if let Err(e) = context.save_data(&data).await {
                warn!(plugin_id, error = %e, "worker save_data denied or failed");
            }
        }
        WorkerEvent::UpdateConfig { key, value } => {
            // Runtime kv lands in the plugin's persisted data.
            let mut data = context.load_data();
            if let Some(object) = data.as_object_mut() {
                object.insert(key, value);
            }
            if let Err(e) = context.save_data(&data).await {
                warn!(plugin_id, error = %e, "worker update_config persist failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_roundtrip() {
        let frame = WorkerCommand {
            id: "c1".to_string(),
            cmd: CommandType::EventEmit,
            payload: serde_json::json!({"event_name": "system.tick"}),
        };
        let line = serde_json::to_string(&frame).unwrap();
        assert!(line.contains("\"event_emit\""));
        let decoded: WorkerCommand = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded.cmd, CommandType::EventEmit);
        assert_eq!(decoded.id, "c1");
    }

    #[test]
    fn worker_event_frames_parse() {
        let ready: WorkerEvent =
            serde_json::from_str(r#"{"type": "ready", "plugin_id": "crash_test"}"#).unwrap();
        assert!(matches!(ready, WorkerEvent::Ready { .. }));

        let result: WorkerEvent =
            serde_json::from_str(r#"{"type": "result", "id": "c1", "result": 42}"#).unwrap();
        match result {
            WorkerEvent::Result { id, result, error } => {
                assert_eq!(id, "c1");
                assert_eq!(result, serde_json::json!(42));
                assert!(error.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        let error: WorkerEvent = serde_json::from_str(
            r#"{"type": "error", "plugin_id": "p", "message": "boom", "traceback": "t"}"#,
        )
        .unwrap();
        assert!(matches!(error, WorkerEvent::Error { .. }));
    }
}
