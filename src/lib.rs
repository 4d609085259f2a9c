//! # hr-bridge
//!
//! Async Rust library and command-line bridge that takes live heart-rate
//! readings from one of several sources and publishes them as avatar
//! parameters for a running game.
//!
//! ## Sources
//!
//! | Id | Kind | Notes |
//! |---|---|---|
//! | `websocket` | push | long-lived WebSocket, provider-specific message format |
//! | `textfile` | poll | re-reads a file that holds a single integer |
//! | `ble` | BLE | Heart Rate Service (`0x180D`) notifications via GATT |
//! | `sdk` | SDK bridge | TCP broker for external reporters plus in-process plugins |
//!
//! Exactly one source runs at a time. Its latest BPM and connectivity are
//! turned into eight avatar parameters (`HR`, `onesHR`, `tensHR`,
//! `hundredsHR`, `HRPercent`, `FullHRPercent`, `isHRConnected`,
//! `isHRActive`) plus the simulated `isHRBeat` pulse, and sent over OSC
//! and/or a plain-text TCP broadcast.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use hr_bridge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(ConfigStore::open("hr-bridge.json")?);
//!     let osc = OscTransport::connect(&config.get().osc).await?;
//!     let bridge = Orchestrator::new(config, Arc::new(AlwaysRunning), vec![Arc::new(osc)]);
//!     bridge.start().await;
//!     tokio::signal::ctrl_c().await?;
//!     bridge.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`orchestrator`] | Lifecycle, game watchdog, command handling |
//! | [`source`] | The [`source::HeartRateSource`] trait and its four implementations |
//! | [`gatt`] | GATT backend abstraction, btleplug backend and the BLE sync chain |
//! | [`broker`] | SDK broker: reporter arbitration, TCP server and plugins |
//! | [`params`] | Parameter computation and change-suppressed publishing |
//! | [`heartbeat`] | `isHRBeat` pulse simulator |
//! | [`transport`] | OSC, TCP broadcast and in-memory game transports |
//! | [`config`] | JSON configuration and the reloadable [`config::ConfigStore`] |
//! | [`command`] | Text commands accepted on stdin |
//! | [`protocol`] | GATT UUIDs, OSC addresses and the SDK wire format |
//! | [`parse`] | Heart Rate Measurement and push-message decoders |
//! | [`supervisor`] | Retry loop with capped linear or exponential backoff |
//! | [`types`] | Shared data types |
//! | [`error`] | [`error::BridgeError`] and the crate `Result` alias |

pub mod broker;
pub mod command;
pub mod config;
pub mod error;
pub mod gatt;
pub mod heartbeat;
pub mod orchestrator;
pub mod params;
pub mod parse;
pub mod protocol;
pub mod source;
pub mod supervisor;
pub mod transport;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
///
/// ```no_run
/// use std::sync::Arc;
/// use hr_bridge::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let memory = MemoryTransport::new();
/// let config = Arc::new(ConfigStore::in_memory(BridgeConfig::default()));
/// let bridge = Orchestrator::new(config, Arc::new(AlwaysRunning), vec![memory.clone()]);
/// bridge.handle_line("start").await;
/// # Ok(())
/// # }
/// ```
pub mod prelude {
    // ── Orchestration ─────────────────────────────────────────────────────────
    pub use crate::command::Command;
    pub use crate::orchestrator::{
        AlwaysRunning, LifecycleState, Orchestrator, ProcessProbe, SystemProbe,
    };

    // ── Configuration ─────────────────────────────────────────────────────────
    pub use crate::config::{BridgeConfig, ConfigStore};
    pub use crate::error::{BridgeError, Result};

    // ── Sources and transports ────────────────────────────────────────────────
    pub use crate::source::{create_source, HeartRateSource, SourceSignals};
    pub use crate::transport::{
        spawn_avatar_listener, BroadcastTransport, GameTransport, MemoryTransport, OscTransport,
    };

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::params::{OutputParameter, ParameterSync};
    pub use crate::types::{
        BridgeSignal, ConnectivityState, HeartRateSample, ParamValue, SdkReport,
        SourceDescriptor,
    };
}
