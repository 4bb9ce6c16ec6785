//! Isolated (process-mode) plugin tests: spawn a child worker over the
//! JSON-line pipe, survive a crash, and respawn on the next invocation.

#![cfg(unix)]

use std::sync::{Arc, Mutex};

use lumina::bus::EventBus;
use lumina::plugins::{effective_permissions, IsolatedPlugin, LuminaContext, PluginManifest};

/// Minimal worker: answers every command with a result frame. On
/// `event_emit` it reports an error and crashes; on `stop` it exits cleanly.
const WORKER_SCRIPT: &str = r#"#!/bin/sh
while read line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":"\([^"]*\)".*/\1/')
  case "$line" in
    *'"cmd":"event_emit"'*)
      printf '{"type":"error","plugin_id":"crash_test","message":"boom","traceback":"worker.sh line 9"}\n'
      exit 1
      ;;
    *'"cmd":"stop"'*)
      printf '{"type":"result","id":"%s","result":"stopped"}\n' "$id"
      exit 0
      ;;
    *)
      printf '{"type":"result","id":"%s","result":"ok"}\n' "$id"
      ;;
  esac
done
"#;

fn write_worker(dir: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("worker.sh");
    std::fs::write(&path, WORKER_SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn isolated_fixture(dir: &tempfile::TempDir) -> (Arc<EventBus>, IsolatedPlugin) {
    let plugin_dir = dir.path().join("crash_test");
    std::fs::create_dir_all(&plugin_dir).unwrap();
    write_worker(&plugin_dir);

    let manifest_yaml = "id: crash_test\nversion: 0.1.0\nname: Crash Test\n\
                         entrypoint: worker.sh:Plugin\nisolation_mode: process\n";
    std::fs::write(plugin_dir.join("manifest.yaml"), manifest_yaml).unwrap();
    let manifest = PluginManifest::load(&plugin_dir.join("manifest.yaml")).unwrap();

    let bus = Arc::new(EventBus::new());
    lumina::bus::events::register_builtin_schemas(&bus);

    let memory = Arc::new(
        lumina::memory::MemoryStore::open(dir.path().join("lumina.db"), None, 4).unwrap(),
    );
    let soul = Arc::new(
        lumina::soul::SoulService::new(
            dir.path().join("characters"),
            &config::SoulConfig::default(),
            Arc::clone(&bus),
        )
        .unwrap(),
    );
    let llm = Arc::new(lumina::llm::LlmManager::new(&config::LlmConfig::default()));

    let context = Arc::new(LuminaContext::new(
        manifest.id.clone(),
        Arc::clone(&bus),
        soul,
        memory,
        llm,
        config::LuminaConfig::default(),
        effective_permissions(&manifest.permissions),
    ));
    let plugin = IsolatedPlugin::new(manifest, context, Arc::clone(&bus));
    (bus, plugin)
}

#[tokio::test]
async fn crash_reports_error_and_respawns_on_next_call() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, plugin) = isolated_fixture(&dir);

    let errors = Arc::new(Mutex::new(Vec::new()));
    let errors_clone = Arc::clone(&errors);
    bus.subscribe_fn("plugin.error", move |event| {
        let errors = Arc::clone(&errors_clone);
        async move {
            errors.lock().unwrap().push(event.data.clone());
            Ok(())
        }
    });

    // Healthy call first.
    plugin.start().await.unwrap();

    // The crashing call fails, and the worker's error frame reaches the bus
    // with plugin id and traceback.
    let crashed = plugin
        .forward_event("system.tick", serde_json::json!({}))
        .await;
    assert!(crashed.is_err());

    // Two error events are expected: the worker's own report, then the
    // process-exit notice (which also clears the child slot for respawn).
    for _ in 0..50 {
        if errors.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    {
        let errors = errors.lock().unwrap();
        assert!(!errors.is_empty(), "no plugin.error event seen");
        assert!(errors.iter().any(|e| {
            e["plugin_id"] == "crash_test"
                && e["error"] == "boom"
                && e["traceback"].as_str().unwrap_or_default().contains("worker.sh")
        }));
    }

    // Next invocation respawns the child and succeeds.
    plugin.start().await.unwrap();
    plugin.stop().await.unwrap();
}
