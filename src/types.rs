use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SourceConfig;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

// ── HeartRateSample ───────────────────────────────────────────────────────────

/// One heart-rate reading emitted by the active source.
///
/// Samples are immutable once published; a new reading always produces a new
/// value on the source's heart-rate stream.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HeartRateSample {
    /// Beats per minute. `0` means "no reading".
    pub bpm: u32,
    /// Milliseconds since the Unix epoch at which the reading was taken.
    /// `0.0` for the reset state.
    pub timestamp: f64,
}

impl HeartRateSample {
    /// Stamp a reading with the current wall clock.
    pub fn now(bpm: u32) -> Self {
        Self {
            bpm,
            timestamp: now_ms(),
        }
    }
}

// ── ConnectivityState ─────────────────────────────────────────────────────────

/// Process-wide connectivity of the authoritative source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectivityState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected and reporting a non-zero heart rate.
    Active,
}

impl ConnectivityState {
    /// Combine a source's connectivity flag with its latest reading.
    ///
    /// `started` distinguishes a source that is still trying (`Connecting`)
    /// from one that is stopped (`Disconnected`).
    pub fn derive(started: bool, connected: bool, bpm: u32) -> Self {
        match (started, connected) {
            (_, true) if bpm > 0 => ConnectivityState::Active,
            (_, true) => ConnectivityState::Connected,
            (true, false) => ConnectivityState::Connecting,
            (false, false) => ConnectivityState::Disconnected,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Active)
    }

    pub fn is_active(self) -> bool {
        self == ConnectivityState::Active
    }
}

// ── Sources ───────────────────────────────────────────────────────────────────

/// Acquisition method of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Persistent WebSocket feed.
    Push,
    /// Text file re-read on an interval.
    Poll,
    /// Bluetooth Low Energy heart-rate peripheral.
    Ble,
    /// TCP broker aggregating SDK plugins and remote reporters.
    SdkBridge,
}

impl SourceKind {
    /// Map a configured source identifier to its kind.
    ///
    /// Returns `None` for identifiers the bridge does not know.
    pub fn from_id(id: &str) -> Option<Self> {
        match id.to_ascii_lowercase().as_str() {
            "websocket" | "pulsoid" | "hyperate" | "push" => Some(SourceKind::Push),
            "textfile" | "file" | "poll" => Some(SourceKind::Poll),
            "ble" | "bluetooth" => Some(SourceKind::Ble),
            "sdk" | "sdkbridge" => Some(SourceKind::SdkBridge),
            _ => None,
        }
    }
}

/// Identity and settings of one source instance.
///
/// Immutable after construction. A configuration change builds a new
/// descriptor and a new source; live connections are never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub id: String,
    pub kind: SourceKind,
    pub config: SourceConfig,
}

/// Partial key of the BLE discovery chain.
///
/// A `None` component is "undiscovered"; the chain falls back to the
/// standard Heart Rate service/characteristic for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BleIdentity {
    pub device_id: String,
    pub service_id: Option<Uuid>,
    pub characteristic_id: Option<Uuid>,
}

// ── SDK reports ───────────────────────────────────────────────────────────────

/// Latest reading from one SDK reporter (local plugin or remote client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SdkReport {
    pub sdk_name: String,
    pub bpm: u32,
    pub is_open: bool,
    pub is_active: bool,
}

// ── Parameter values ──────────────────────────────────────────────────────────

/// Tolerance used when deciding whether a float parameter changed.
pub const FLOAT_EPSILON: f32 = 0.001;

/// A value published to a game transport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Float(f32),
    Bool(bool),
}

impl ParamValue {
    /// `true` when `self` should be re-sent given the previously sent value.
    ///
    /// Floats within [`FLOAT_EPSILON`] count as unchanged. A change of
    /// variant always counts as a change.
    pub fn differs_from(&self, previous: &ParamValue) -> bool {
        match (self, previous) {
            (ParamValue::Int(a), ParamValue::Int(b)) => a != b,
            (ParamValue::Bool(a), ParamValue::Bool(b)) => a != b,
            (ParamValue::Float(a), ParamValue::Float(b)) => (a - b).abs() >= FLOAT_EPSILON,
            _ => true,
        }
    }

    /// Cast booleans to `0`/`1` for consumers that predate native bools.
    pub fn to_legacy(self) -> ParamValue {
        match self {
            ParamValue::Bool(b) => ParamValue::Int(b as i32),
            other => other,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

// ── Signals ───────────────────────────────────────────────────────────────────

/// Out-of-band signals received from game transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeSignal {
    /// The remote consumer loaded a new avatar/context and needs a full replay.
    AvatarChanged(String),
}
