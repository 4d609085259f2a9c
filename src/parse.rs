//! Pure decoders for every payload a source can receive.
//!
//! Nothing here performs I/O; all functions are safe to call from any async
//! or sync context.
//!
//! | Function | Input | Used by |
//! |---|---|---|
//! | [`parse_heart_rate_measurement`] | GATT `0x2A37` notification | BLE chain |
//! | [`parse_bpm_text`] | file contents / bare WebSocket text | poll source, push source |
//! | [`extract_bpm`] | JSON envelope + pointer | push source |
//! | [`keepalive_reply`] | inbound WebSocket text | push source |

use serde_json::Value;

use crate::error::{BridgeError, Result};
use crate::protocol::HR_FLAG_VALUE_U16;

// ── BLE ───────────────────────────────────────────────────────────────────────

/// Decode a Heart Rate Measurement notification.
///
/// Layout:
///
/// | Byte | Meaning |
/// |---|---|
/// | 0 | flags; bit 0 set → value is `u16` little-endian |
/// | 1 (..2) | BPM as `u8`, or `u16` LE when the flag is set |
///
/// Energy-expended and RR-interval fields that may follow are ignored.
/// Returns `None` for truncated buffers.
///
/// ```
/// # use hr_bridge::parse::parse_heart_rate_measurement;
/// assert_eq!(parse_heart_rate_measurement(&[0x00, 72]), Some(72));
/// assert_eq!(parse_heart_rate_measurement(&[0x01, 0x2c, 0x01]), Some(300));
/// ```
pub fn parse_heart_rate_measurement(data: &[u8]) -> Option<u32> {
    let flags = *data.first()?;
    if flags & HR_FLAG_VALUE_U16 != 0 {
        let lo = *data.get(1)?;
        let hi = *data.get(2)?;
        Some(u16::from_le_bytes([lo, hi]) as u32)
    } else {
        data.get(1).map(|&b| b as u32)
    }
}

// ── Text ──────────────────────────────────────────────────────────────────────

/// Parse a BPM written as text, e.g. the contents of a heart-rate file.
///
/// Surrounding whitespace is ignored and decimal values are rounded.
/// Negative or non-finite numbers are rejected.
pub fn parse_bpm_text(text: &str) -> Result<u32> {
    let trimmed = text.trim();
    if let Ok(v) = trimmed.parse::<u32>() {
        return Ok(v);
    }
    let v: f64 = trimmed
        .parse()
        .map_err(|_| BridgeError::ProtocolParse(format!("not a number: {trimmed:?}")))?;
    bpm_from_f64(v)
}

fn bpm_from_f64(v: f64) -> Result<u32> {
    if !v.is_finite() || v < 0.0 || v > u32::MAX as f64 {
        return Err(BridgeError::ProtocolParse(format!("BPM out of range: {v}")));
    }
    Ok(v.round() as u32)
}

// ── JSON envelopes ────────────────────────────────────────────────────────────

/// Pull a BPM out of a JSON document at `pointer` (RFC 6901, e.g.
/// `/data/heart_rate`).
///
/// The target may be a number or a numeric string.
pub fn extract_bpm(doc: &Value, pointer: &str) -> Result<u32> {
    match doc.pointer(pointer) {
        Some(Value::Number(n)) => {
            let v = n
                .as_f64()
                .ok_or_else(|| BridgeError::ProtocolParse(format!("bad number at {pointer}")))?;
            bpm_from_f64(v)
        }
        Some(Value::String(s)) => parse_bpm_text(s),
        Some(other) => Err(BridgeError::ProtocolParse(format!(
            "expected number at {pointer}, found {other}"
        ))),
        None => Err(BridgeError::ProtocolParse(format!("missing field {pointer}"))),
    }
}

/// Build the reply to an application-level keep-alive, if `text` is one.
///
/// * `ping` (any case) → `pong`
/// * a JSON object whose `type` or `event` is `"ping"` → the same object with
///   that field set to `"pong"`
///
/// Returns `None` for every other message.
pub fn keepalive_reply(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("ping") {
        return Some("pong".into());
    }
    if !trimmed.starts_with('{') {
        return None;
    }
    let mut doc: Value = serde_json::from_str(trimmed).ok()?;
    let obj = doc.as_object_mut()?;
    for key in ["type", "event"] {
        if obj.get(key).and_then(Value::as_str) == Some("ping") {
            obj.insert(key.into(), Value::String("pong".into()));
            return serde_json::to_string(&doc).ok();
        }
    }
    None
}
