//! Plugin permission vocabulary. Plugins declare required permissions in
//! their manifest; the context wrapper and the IPC boundary enforce them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A named capability a plugin may be granted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Read files from the plugin data directory.
    #[serde(rename = "filesystem.read")]
    FilesystemRead,
    /// Write files to the plugin data directory.
    #[serde(rename = "filesystem.write")]
    FilesystemWrite,
    /// Access files outside the plugin directory.
    #[serde(rename = "filesystem.external")]
    FilesystemExternal,
    /// Make outbound HTTP/WebSocket requests.
    #[serde(rename = "network.outbound")]
    NetworkOutbound,
    /// Listen on network ports.
    #[serde(rename = "network.listen")]
    NetworkListen,
    /// Read from the memory store.
    #[serde(rename = "memory.read")]
    MemoryRead,
    /// Write to the memory store.
    #[serde(rename = "memory.write")]
    MemoryWrite,
    /// Invoke LLM routes.
    #[serde(rename = "llm.invoke")]
    LlmInvoke,
    /// Subscribe to tick events.
    #[serde(rename = "ticker.subscribe")]
    TickerSubscribe,
    /// Discover and interact with other plugins.
    #[serde(rename = "plugin.discovery")]
    PluginDiscovery,
    /// Subscribe to bus events.
    #[serde(rename = "event.subscribe")]
    EventSubscribe,
    /// Emit custom bus events.
    #[serde(rename = "event.emit")]
    EventEmit,
    /// Modify character personality or mood.
    #[serde(rename = "soul.modify")]
    SoulModify,
    /// Send user notifications.
    #[serde(rename = "system.notification")]
    SystemNotification,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::FilesystemRead => "filesystem.read",
            Permission::FilesystemWrite => "filesystem.write",
            Permission::FilesystemExternal => "filesystem.external",
            Permission::NetworkOutbound => "network.outbound",
            Permission::NetworkListen => "network.listen",
            Permission::MemoryRead => "memory.read",
            Permission::MemoryWrite => "memory.write",
            Permission::LlmInvoke => "llm.invoke",
            Permission::TickerSubscribe => "ticker.subscribe",
            Permission::PluginDiscovery => "plugin.discovery",
            Permission::EventSubscribe => "event.subscribe",
            Permission::EventEmit => "event.emit",
            Permission::SoulModify => "soul.modify",
            Permission::SystemNotification => "system.notification",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permissions every plugin gets without declaring them.
pub fn default_permissions() -> HashSet<Permission> {
    HashSet::from([
        Permission::EventSubscribe,
        Permission::EventEmit,
        Permission::PluginDiscovery,
    ])
}

/// Permissions that should require explicit user approval.
pub fn dangerous_permissions() -> HashSet<Permission> {
    HashSet::from([
        Permission::FilesystemExternal,
        Permission::NetworkOutbound,
        Permission::NetworkListen,
    ])
}

/// The effective grant for a manifest: defaults plus declared permissions.
pub fn effective_permissions(declared: &[Permission]) -> HashSet<Permission> {
    let mut granted = default_permissions();
    granted.extend(declared.iter().copied());
    granted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_dotted_names() {
        let permission: Permission = serde_json::from_str("\"memory.write\"").unwrap();
        assert_eq!(permission, Permission::MemoryWrite);
        assert_eq!(
            serde_json::to_string(&Permission::LlmInvoke).unwrap(),
            "\"llm.invoke\""
        );
    }

    #[test]
    fn unknown_permission_fails_to_parse() {
        assert!(serde_json::from_str::<Permission>("\"root.everything\"").is_err());
    }

    #[test]
    fn effective_grant_includes_defaults() {
        let granted = effective_permissions(&[Permission::MemoryRead]);
        assert!(granted.contains(&Permission::MemoryRead));
        assert!(granted.contains(&Permission::EventEmit));
        assert!(!granted.contains(&Permission::MemoryWrite));
    }
}
