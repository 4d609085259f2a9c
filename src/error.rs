//! Error taxonomy shared by every source, the broker and the orchestrator.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised inside the bridge.
///
/// None of these are fatal to the process: per-source failures stay inside
/// the source's task and are retried or logged there.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Socket or file failure. Retried with backoff.
    #[error("I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    /// Bluetooth adapter or GATT failure. Retried with backoff.
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// WebSocket handshake or transport failure. Retried with backoff.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A payload could not be decoded. The sample is discarded.
    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    /// A source parameter is missing or invalid. The source does not start.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl BridgeError {
    /// Whether the reconnection supervisor should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::TransientIo(_)
                | BridgeError::Ble(_)
                | BridgeError::WebSocket(_)
                | BridgeError::Timeout(_)
                | BridgeError::NotConnected(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::WebSocket(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::ProtocolParse(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_retried() {
        assert!(!BridgeError::Configuration("missing url".into()).is_transient());
        assert!(!BridgeError::ProtocolParse("bad json".into()).is_transient());
    }

    #[test]
    fn io_errors_are_retried() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(BridgeError::from(io).is_transient());
        assert!(BridgeError::Timeout("connect".into()).is_transient());
    }
}
