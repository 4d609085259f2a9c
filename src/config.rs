//! Bridge configuration and the store that (re)loads it from disk.
//!
//! The file format is plain JSON mirroring [`BridgeConfig`]; every field is
//! optional and falls back to its default.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::types::{BleIdentity, SourceDescriptor, SourceKind};

// ── Per-source sections ───────────────────────────────────────────────────────

/// Which WebSocket service a push source talks to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum PushProvider {
    Pulsoid {
        access_token: String,
    },
    #[serde(rename = "hyperate")]
    HypeRate {
        session_id: String,
        api_key: String,
    },
    /// Any feed that sends JSON or bare numbers.
    Custom {
        url: String,
        /// Text sent once after the socket opens.
        #[serde(default)]
        subscribe: Option<String>,
        /// JSON pointer to the BPM field, e.g. `/data/heart_rate`.
        #[serde(default)]
        bpm_pointer: Option<String>,
    },
}

impl Default for PushProvider {
    fn default() -> Self {
        PushProvider::Custom {
            url: String::new(),
            subscribe: None,
            bpm_pointer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub path: PathBuf,
    /// Re-read interval. Default: `500`.
    pub interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    #[serde(flatten)]
    pub identity: BleIdentity,
    /// Scan duration used when the device is not yet known to the adapter.
    pub scan_timeout_secs: u64,
    /// Hard timeout on a single connect attempt.
    pub connect_timeout_secs: u64,
    /// How often the device state is polled alongside adapter events.
    pub state_poll_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            identity: BleIdentity::default(),
            scan_timeout_secs: 10,
            connect_timeout_secs: 10,
            state_poll_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// Address the broker listens on.
    pub bind: String,
    /// Directory scanned for `*.plugin.json` manifests at startup.
    pub plugin_dir: Option<PathBuf>,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9010".into(),
            plugin_dir: None,
        }
    }
}

/// The settings a single source is built from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceConfig {
    Push(PushProvider),
    Poll(PollConfig),
    Ble(BleConfig),
    SdkBridge(SdkConfig),
}

// ── Output sections ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// How long the beat flag stays `true`.
    pub settle_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settle_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    pub enabled: bool,
    pub address: String,
    pub send_port: u16,
    pub receive_port: u16,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1".into(),
            send_port: 9000,
            receive_port: 9001,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub bind: String,
}

// ── BridgeConfig ──────────────────────────────────────────────────────────────

/// Everything the core reads from its configuration collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Identifier of the active source (`websocket`, `textfile`, `ble`, `sdk`).
    pub source: String,
    pub websocket: PushProvider,
    pub textfile: PollConfig,
    pub ble: BleConfig,
    pub sdk: SdkConfig,
    pub min_hr: f64,
    pub max_hr: f64,
    /// Canonical parameter name → published name.
    pub parameter_names: HashMap<String, String>,
    /// Publish booleans as `0`/`1` integers.
    pub legacy_bool: bool,
    /// Re-arm the game watchdog after every stop.
    pub auto_start: bool,
    /// Start immediately without waiting for the game process.
    pub skip_process_check: bool,
    pub target_process: String,
    pub heartbeat: HeartbeatConfig,
    pub osc: OscConfig,
    pub broadcast: Option<BroadcastConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            source: "textfile".into(),
            websocket: PushProvider::default(),
            textfile: PollConfig::default(),
            ble: BleConfig::default(),
            sdk: SdkConfig::default(),
            min_hr: 0.0,
            max_hr: 255.0,
            parameter_names: HashMap::new(),
            legacy_bool: false,
            auto_start: false,
            skip_process_check: false,
            target_process: "VRChat".into(),
            heartbeat: HeartbeatConfig::default(),
            osc: OscConfig::default(),
            broadcast: None,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| BridgeError::Configuration(format!("invalid config JSON: {e}")))
    }

    /// Reject settings no source or parameter could work with.
    pub fn validate(&self) -> Result<()> {
        if SourceKind::from_id(&self.source).is_none() {
            return Err(BridgeError::Configuration(format!(
                "unknown source '{}'",
                self.source
            )));
        }
        if !(self.max_hr > self.min_hr) {
            return Err(BridgeError::Configuration(format!(
                "max_hr ({}) must be greater than min_hr ({})",
                self.max_hr, self.min_hr
            )));
        }
        Ok(())
    }

    /// Build the descriptor of the currently selected source.
    pub fn descriptor(&self) -> Result<SourceDescriptor> {
        let kind = SourceKind::from_id(&self.source).ok_or_else(|| {
            BridgeError::Configuration(format!("unknown source '{}'", self.source))
        })?;
        let config = match kind {
            SourceKind::Push => SourceConfig::Push(self.websocket.clone()),
            SourceKind::Poll => SourceConfig::Poll(self.textfile.clone()),
            SourceKind::Ble => SourceConfig::Ble(self.ble.clone()),
            SourceKind::SdkBridge => SourceConfig::SdkBridge(self.sdk.clone()),
        };
        Ok(SourceDescriptor {
            id: self.source.to_ascii_lowercase(),
            kind,
            config,
        })
    }
}

// ── ConfigStore ───────────────────────────────────────────────────────────────

/// Holds the current configuration and reloads it on request.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<BridgeConfig>,
}

impl ConfigStore {
    /// A store without a backing file; `reload` keeps the given config.
    pub fn in_memory(config: BridgeConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(config),
        }
    }

    /// Load from `path`. A missing file yields defaults.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = read_config(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(config),
        })
    }

    pub fn get(&self) -> BridgeConfig {
        self.current.read().clone()
    }

    /// Re-read the backing file. On failure the previous config is kept.
    pub fn reload(&self) -> Result<BridgeConfig> {
        if let Some(path) = &self.path {
            let config = read_config(path)?;
            *self.current.write() = config;
            info!("Configuration reloaded from {}", path.display());
        }
        Ok(self.get())
    }

    #[cfg(test)]
    pub(crate) fn replace(&self, config: BridgeConfig) {
        *self.current.write() = config;
    }
}

fn read_config(path: &Path) -> Result<BridgeConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let config = BridgeConfig::from_json(&text)?;
            config.validate()?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config {} not found, using defaults", path.display());
            Ok(BridgeConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg = BridgeConfig::from_json(r#"{ "source": "ble", "max_hr": 200 }"#).unwrap();
        assert_eq!(cfg.source, "ble");
        assert_eq!(cfg.max_hr, 200.0);
        assert_eq!(cfg.textfile.interval_ms, 500);
        assert!(cfg.heartbeat.enabled);
    }

    #[test]
    fn push_provider_is_tagged() {
        let cfg = BridgeConfig::from_json(
            r#"{ "source": "websocket",
                 "websocket": { "provider": "hyperate", "session_id": "abc", "api_key": "k" } }"#,
        )
        .unwrap();
        assert_eq!(
            cfg.websocket,
            PushProvider::HypeRate {
                session_id: "abc".into(),
                api_key: "k".into()
            }
        );
    }

    #[test]
    fn ble_identity_is_flattened() {
        let cfg = BridgeConfig::from_json(
            r#"{ "ble": { "device_id": "AA:BB", "characteristic_id": "00002a37-0000-1000-8000-00805f9b34fb" } }"#,
        )
        .unwrap();
        assert_eq!(cfg.ble.identity.device_id, "AA:BB");
        assert!(cfg.ble.identity.service_id.is_none());
        assert!(cfg.ble.identity.characteristic_id.is_some());
    }

    #[test]
    fn validate_rejects_bad_range_and_source() {
        let mut cfg = BridgeConfig::default();
        cfg.min_hr = 100.0;
        cfg.max_hr = 100.0;
        assert!(matches!(cfg.validate(), Err(BridgeError::Configuration(_))));

        let mut cfg = BridgeConfig::default();
        cfg.source = "smoke-signals".into();
        assert!(cfg.validate().is_err());
        assert!(cfg.descriptor().is_err());
    }

    #[test]
    fn descriptor_carries_selected_section() {
        let mut cfg = BridgeConfig::default();
        cfg.source = "TextFile".into();
        cfg.textfile.path = "/tmp/hr.txt".into();
        let d = cfg.descriptor().unwrap();
        assert_eq!(d.id, "textfile");
        assert_eq!(d.kind, SourceKind::Poll);
        match d.config {
            SourceConfig::Poll(p) => assert_eq!(p.path, PathBuf::from("/tmp/hr.txt")),
            other => panic!("unexpected config {other:?}"),
        }
    }

    #[test]
    fn store_reloads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "min_hr": 40 }}"#).unwrap();
        let store = ConfigStore::open(file.path()).unwrap();
        assert_eq!(store.get().min_hr, 40.0);

        std::fs::write(file.path(), r#"{ "min_hr": 50 }"#).unwrap();
        assert_eq!(store.reload().unwrap().min_hr, 50.0);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path().join("nope.json")).unwrap();
        assert_eq!(store.get(), BridgeConfig::default());
    }
}
