//! Local SDK plugins.
//!
//! Plugins are statically linked. Each one implements [`SdkPlugin`] and is
//! registered under a factory name in a [`PluginRegistry`]. At startup the
//! broker scans its plugin directory for `*.plugin.json` manifests and
//! instantiates the factory each manifest names:
//!
//! ```json
//! { "factory": "textfile", "name": "Watch", "options": { "path": "/tmp/hr.txt" } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Deserialize;

use super::ReadingSink;
use crate::error::{BridgeError, Result};
use crate::parse::parse_bpm_text;
use crate::types::SdkReport;

/// Lifecycle every local reporter implements.
///
/// All hooks run on the broker's tick task and must not block for long.
pub trait SdkPlugin: Send {
    /// Name reported as `sdkName`; used by bias and destroy.
    fn name(&self) -> &str;

    /// Called once before the first `update`. `sink` is the emit-reading
    /// callback; keep it and call [`ReadingSink::emit`] whenever a new
    /// reading is available.
    fn initialize(&mut self, sink: ReadingSink) -> Result<()>;

    /// Called on every broker tick (~100 ms).
    fn update(&mut self) {}

    /// Release resources. Errors are logged by the broker, never propagated.
    fn teardown(&mut self) -> Result<()>;
}

/// Contents of a `*.plugin.json` file.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub factory: String,
    /// Defaults to the factory name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl PluginManifest {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.factory)
    }
}

pub type PluginFactory = fn(&PluginManifest) -> Result<Box<dyn SdkPlugin>>;

/// Factory table for statically linked plugins.
#[derive(Clone)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the plugins shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("textfile", TextFilePlugin::from_manifest);
        registry
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_owned(), factory);
    }

    pub fn instantiate(&self, manifest: &PluginManifest) -> Result<Box<dyn SdkPlugin>> {
        let factory = self.factories.get(&manifest.factory).ok_or_else(|| {
            BridgeError::Configuration(format!("unknown plugin factory '{}'", manifest.factory))
        })?;
        factory(manifest)
    }

    /// Instantiate every manifest found in `dir`, in file-name order.
    ///
    /// Unreadable or unknown manifests are logged and skipped.
    pub fn discover(&self, dir: &Path) -> Vec<Box<dyn SdkPlugin>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("sdk: cannot scan plugin dir {}: {e}", dir.display());
                return Vec::new();
            }
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".plugin.json"))
            })
            .collect();
        paths.sort();

        let mut plugins = Vec::new();
        for path in paths {
            match self.load_manifest(&path) {
                Ok(plugin) => {
                    info!("sdk: loaded plugin '{}' from {}", plugin.name(), path.display());
                    plugins.push(plugin);
                }
                Err(e) => warn!("sdk: skipping {}: {e}", path.display()),
            }
        }
        plugins
    }

    fn load_manifest(&self, path: &Path) -> Result<Box<dyn SdkPlugin>> {
        let text = std::fs::read_to_string(path)?;
        let manifest: PluginManifest = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Configuration(format!("bad manifest: {e}")))?;
        self.instantiate(&manifest)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ── Built-in: textfile ────────────────────────────────────────────────────────

/// Reports the BPM written to a text file, re-read on every tick.
pub struct TextFilePlugin {
    name: String,
    path: PathBuf,
    sink: Option<ReadingSink>,
    last: Option<u32>,
}

impl TextFilePlugin {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            sink: None,
            last: None,
        }
    }

    fn from_manifest(manifest: &PluginManifest) -> Result<Box<dyn SdkPlugin>> {
        let path = manifest
            .options
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                BridgeError::Configuration("textfile plugin: options.path missing".into())
            })?;
        Ok(Box::new(Self::new(manifest.display_name(), path)))
    }
}

impl SdkPlugin for TextFilePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, sink: ReadingSink) -> Result<()> {
        self.sink = Some(sink);
        Ok(())
    }

    fn update(&mut self) {
        let Some(sink) = &self.sink else { return };
        let reading = std::fs::read_to_string(&self.path)
            .map_err(BridgeError::from)
            .and_then(|t| parse_bpm_text(&t));
        let report = match reading {
            Ok(bpm) => SdkReport {
                sdk_name: self.name.clone(),
                bpm,
                is_open: true,
                is_active: bpm > 0,
            },
            Err(e) => {
                if self.last.is_some() {
                    warn!("{}: {e}", self.name);
                }
                SdkReport {
                    sdk_name: self.name.clone(),
                    ..SdkReport::default()
                }
            }
        };
        let bpm = report.is_open.then_some(report.bpm);
        if bpm != self.last {
            debug!("{}: {:?} bpm", self.name, bpm);
            self.last = bpm;
        }
        sink.emit(report);
    }

    fn teardown(&mut self) -> Result<()> {
        self.sink = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_manifests_in_order_and_skips_bad_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.plugin.json"),
            r#"{ "factory": "textfile", "name": "B", "options": { "path": "/tmp/b" } }"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.plugin.json"),
            r#"{ "factory": "textfile", "options": { "path": "/tmp/a" } }"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("c.plugin.json"), r#"{ "factory": "nope" }"#).unwrap();
        std::fs::write(dir.path().join("notes.json"), r#"{ "factory": "textfile" }"#).unwrap();

        let plugins = PluginRegistry::with_builtins().discover(dir.path());
        let names: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["textfile", "B"]);
    }

    #[test]
    fn textfile_requires_path() {
        let manifest = PluginManifest {
            factory: "textfile".into(),
            name: None,
            options: serde_json::Value::Null,
        };
        assert!(PluginRegistry::with_builtins().instantiate(&manifest).is_err());
    }

    #[test]
    fn missing_dir_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PluginRegistry::empty().discover(&dir.path().join("nope")).is_empty());
    }
}
