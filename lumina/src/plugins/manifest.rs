//! Plugin manifest (`manifest.yaml`): metadata, entrypoint, dependencies,
//! permissions, and isolation mode. The manifest is authoritative at load
//! time; runtime state (enabled, config values) lives in the character data
//! dir.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use super::permissions::Permission;
use super::PluginError;

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_.]+$").expect("static id regex"));

/// How the plugin runs: in-process or in a spawned child process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    #[default]
    Local,
    Process,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    /// Lowercased dotted id, e.g. `lumina.pomodoro`.
    pub id: String,
    /// Semantic version.
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `module:Class` — resolved against the factory registry for local
    /// plugins, or an executable path relative to the plugin dir for
    /// isolated ones.
    pub entrypoint: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub isolation_mode: IsolationMode,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub group_exclusive: bool,
    /// Directory the manifest was discovered in; set by the scanner.
    #[serde(skip)]
    pub path: PathBuf,
}

impl PluginManifest {
    pub fn from_yaml(yaml: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest = serde_yaml::from_str(yaml)
            .map_err(|e| PluginError::InvalidManifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| PluginError::InvalidManifest(format!("{}: {e}", path.display())))?;
        let mut manifest = Self::from_yaml(&yaml)?;
        manifest.path = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), PluginError> {
        if !ID_PATTERN.is_match(&self.id) {
            return Err(PluginError::InvalidManifest(format!(
                "id '{}' must consist of lowercase letters, numbers, underscores, and dots",
                self.id
            )));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            PluginError::InvalidManifest(format!("version '{}' is not semver: {e}", self.version))
        })?;
        if !self.entrypoint.contains(':') {
            return Err(PluginError::InvalidManifest(format!(
                "entrypoint '{}' must be in 'module:Class' format",
                self.entrypoint
            )));
        }
        Ok(())
    }

    /// The module part of the entrypoint (executable name for isolated
    /// plugins).
    pub fn entry_module(&self) -> &str {
        self.entrypoint.split(':').next().unwrap_or("")
    }
}

/// Scans a plugins directory for `manifest.yaml` files, one level deep.
/// Underscore-prefixed directories are skipped; invalid manifests are logged
/// and skipped.
pub fn scan_plugins_dir(root: &Path) -> Vec<PluginManifest> {
    let mut discovered = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        tracing::warn!(root = %root.display(), "plugins root not found");
        return discovered;
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .map(|name| !name.to_string_lossy().starts_with('_'))
                .unwrap_or(false)
        })
        .collect();
    dirs.sort();

    for dir in dirs {
        let manifest_path = dir.join("manifest.yaml");
        if !manifest_path.is_file() {
            continue;
        }
        match PluginManifest::load(&manifest_path) {
            Ok(manifest) => discovered.push(manifest),
            Err(e) => {
                tracing::error!(path = %manifest_path.display(), error = %e, "invalid manifest; skipped");
            }
        }
    }
    discovered
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
id: lumina.pomodoro
version: 1.2.0
name: Pomodoro Timer
entrypoint: pomodoro:PomodoroPlugin
permissions:
  - ticker.subscribe
dependencies:
  - lumina.notify
isolation_mode: local
"#;

    #[test]
    fn parses_valid_manifest() {
        let manifest = PluginManifest::from_yaml(VALID).unwrap();
        assert_eq!(manifest.id, "lumina.pomodoro");
        assert_eq!(manifest.permissions, vec![Permission::TickerSubscribe]);
        assert_eq!(manifest.dependencies, vec!["lumina.notify"]);
        assert_eq!(manifest.isolation_mode, IsolationMode::Local);
        assert_eq!(manifest.entry_module(), "pomodoro");
    }

    #[test]
    fn rejects_bad_id() {
        let yaml = VALID.replace("lumina.pomodoro", "Bad-Id");
        assert!(matches!(
            PluginManifest::from_yaml(&yaml),
            Err(PluginError::InvalidManifest(_))
        ));
    }

    #[test]
    fn rejects_bad_version_and_entrypoint() {
        let yaml = VALID.replace("1.2.0", "one.two");
        assert!(PluginManifest::from_yaml(&yaml).is_err());

        let yaml = VALID.replace("pomodoro:PomodoroPlugin", "no_colon_here");
        assert!(PluginManifest::from_yaml(&yaml).is_err());
    }

    #[test]
    fn scan_skips_underscore_dirs_and_invalid_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        std::fs::create_dir_all(&good).unwrap();
        std::fs::write(
            good.join("manifest.yaml"),
            "id: good\nversion: 0.1.0\nname: Good\nentrypoint: good:Good\n",
        )
        .unwrap();

        let hidden = dir.path().join("_template");
        std::fs::create_dir_all(&hidden).unwrap();
        std::fs::write(
            hidden.join("manifest.yaml"),
            "id: hidden\nversion: 0.1.0\nname: Hidden\nentrypoint: hidden:Hidden\n",
        )
        .unwrap();

        let broken = dir.path().join("broken");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join("manifest.yaml"), "id: [not yaml\n").unwrap();

        let manifests = scan_plugins_dir(dir.path());
        assert_eq!(manifests.len(), 1);
        assert_eq!(manifests[0].id, "good");
        assert_eq!(manifests[0].path, good);
    }
}
