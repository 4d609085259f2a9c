//! GATT UUIDs, SDK bridge wire messages, and OSC address helpers.
//!
//! The Heart Rate service and its measurement characteristic are Bluetooth
//! SIG assigned numbers expanded onto the base UUID
//! `0000XXXX-0000-1000-8000-00805f9b34fb`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::types::SdkReport;

// ── GATT ──────────────────────────────────────────────────────────────────────

/// Heart Rate service (`0x180D`).
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);

/// Heart Rate Measurement characteristic (`0x2A37`), notify-only.
///
/// See [`crate::parse::parse_heart_rate_measurement`] for the payload layout.
pub const HEART_RATE_MEASUREMENT: Uuid =
    Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);

/// Bit 0 of the measurement flags byte: value is `u16` LE instead of `u8`.
pub const HR_FLAG_VALUE_U16: u8 = 0x01;

// ── SDK bridge messages ───────────────────────────────────────────────────────

/// A heart-rate report from one SDK reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HrMessage {
    pub sdk_name: String,
    pub bpm: u32,
    pub is_open: bool,
    pub is_active: bool,
}

impl From<HrMessage> for SdkReport {
    fn from(m: HrMessage) -> Self {
        SdkReport {
            sdk_name: m.sdk_name,
            bpm: m.bpm,
            is_open: m.is_open,
            is_active: m.is_active,
        }
    }
}

impl From<&SdkReport> for HrMessage {
    fn from(r: &SdkReport) -> Self {
        HrMessage {
            sdk_name: r.sdk_name.clone(),
            bpm: r.bpm,
            is_open: r.is_open,
            is_active: r.is_active,
        }
    }
}

/// A log line forwarded by a remote reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub level: String,
    pub text: String,
}

/// Every message exchanged on the SDK bridge socket.
///
/// Framing is one JSON object per line, tagged by `"type"`:
///
/// ```text
/// {"type":"HRMessage","sdkName":"MyBand","bpm":72,"isOpen":true,"isActive":true}
/// {"type":"LogMessage","level":"warn","text":"strap loose"}
/// {"type":"GetHRData"}
/// {"type":"UpdateMessage"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SdkMessage {
    #[serde(rename = "HRMessage")]
    Hr(HrMessage),
    #[serde(rename = "LogMessage")]
    Log(LogMessage),
    /// Request for the current preferred reading; answered with `HRMessage`.
    #[serde(rename = "GetHRData")]
    GetHrData,
    /// Keep-alive, sent by the broker about once per second.
    #[serde(rename = "UpdateMessage")]
    Update,
}

/// Encode one message as a newline-terminated line.
///
/// # Example
///
/// ```
/// # use hr_bridge::protocol::{encode_message, SdkMessage};
/// assert_eq!(encode_message(&SdkMessage::Update).unwrap(), "{\"type\":\"UpdateMessage\"}\n");
/// ```
pub fn encode_message(msg: &SdkMessage) -> Result<String> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line (trailing newline optional).
pub fn decode_message(line: &str) -> Result<SdkMessage> {
    let line = line.trim();
    if line.is_empty() {
        return Err(BridgeError::ProtocolParse("empty SDK message".into()));
    }
    serde_json::from_str(line)
        .map_err(|e| BridgeError::ProtocolParse(format!("bad SDK message: {e} | raw: {line}")))
}

// ── OSC ───────────────────────────────────────────────────────────────────────

/// Prefix of every avatar parameter address.
pub const OSC_PARAMETER_PREFIX: &str = "/avatar/parameters/";

/// Address the game sends when the wearer switches avatars.
pub const OSC_AVATAR_CHANGE: &str = "/avatar/change";

/// Full OSC address for a parameter name.
pub fn osc_parameter_address(name: &str) -> String {
    format!("{OSC_PARAMETER_PREFIX}{name}")
}
