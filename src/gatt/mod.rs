//! Bluetooth Low Energy plumbing for the BLE source.
//!
//! | Module | Purpose |
//! |---|---|
//! | [`btle`] | [`GattBackend`] over a real adapter via `btleplug` |
//! | [`chain`] | device link watcher and the service → characteristic chain |
//!
//! The chain only talks to [`GattBackend`], so it is tested against an
//! in-memory fake.

pub mod btle;
pub mod chain;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::error::Result;

pub use btle::BtleBackend;
pub use chain::{BleChain, ChainTarget, DeviceLink, SyncOutcome};

/// One GATT service and the UUIDs of its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Raw characteristic values, one item per notification.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Adapter-level connect (`true`) / disconnect (`false`) events for one device.
pub type LinkEventStream = Pin<Box<dyn Stream<Item = bool> + Send>>;

/// Operations the discovery chain needs from a BLE stack.
#[async_trait]
pub trait GattBackend: Send + Sync {
    /// The configured device identifier.
    fn device_id(&self) -> &str;

    /// Locate the device if necessary, connect and discover its services.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Directly observed device state.
    async fn is_connected(&self) -> bool;

    async fn link_events(&self) -> Result<LinkEventStream>;

    /// Services discovered on the connected device.
    async fn services(&self) -> Result<Vec<GattService>>;

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream>;

    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()>;
}
