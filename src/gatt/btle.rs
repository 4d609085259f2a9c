//! [`GattBackend`] implementation on top of `btleplug`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::info;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{GattBackend, GattService, LinkEventStream, NotificationStream};
use crate::config::BleConfig;
use crate::error::{BridgeError, Result};

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

/// A single heart-rate peripheral reached through the first system adapter.
///
/// The peripheral is located lazily on the first `connect`, first among the
/// adapter's known devices and then by scanning. The configured id matches
/// either the platform identifier or the advertised name:
/// * macOS / Windows: a UUID string
/// * Linux: a Bluetooth MAC address (`AA:BB:CC:DD:EE:FF`)
pub struct BtleBackend {
    device_id: String,
    scan_timeout: Duration,
    connect_timeout: Duration,
    adapter: OnceCell<Adapter>,
    peripheral: Mutex<Option<Peripheral>>,
    located_id: Arc<Mutex<Option<PeripheralId>>>,
}

impl BtleBackend {
    pub fn new(config: &BleConfig) -> Self {
        Self {
            device_id: config.identity.device_id.clone(),
            scan_timeout: Duration::from_secs(config.scan_timeout_secs.max(1)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            adapter: OnceCell::new(),
            peripheral: Mutex::new(None),
            located_id: Arc::new(Mutex::new(None)),
        }
    }

    async fn adapter(&self) -> Result<&Adapter> {
        self.adapter
            .get_or_try_init(|| async {
                let manager = Manager::new().await?;
                let adapter = manager
                    .adapters()
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| BridgeError::NotConnected("no Bluetooth adapter found".into()))?;
                wait_powered_on(&adapter).await;
                Ok::<_, BridgeError>(adapter)
            })
            .await
    }

    fn peripheral(&self) -> Option<Peripheral> {
        self.peripheral.lock().clone()
    }

    fn connected_peripheral(&self) -> Result<Peripheral> {
        self.peripheral()
            .ok_or_else(|| BridgeError::NotConnected(format!("{}: not connected", self.device_id)))
    }

    async fn matches(&self, p: &Peripheral) -> bool {
        if p.id().to_string().eq_ignore_ascii_case(&self.device_id) {
            return true;
        }
        matches!(
            p.properties().await,
            Ok(Some(props)) if props.local_name.as_deref() == Some(self.device_id.as_str())
        )
    }

    async fn find_known(&self, adapter: &Adapter) -> Option<Peripheral> {
        for p in adapter.peripherals().await.unwrap_or_default() {
            if self.matches(&p).await {
                return Some(p);
            }
        }
        None
    }

    /// Find the configured device, scanning for up to `scan_timeout`.
    async fn locate(&self, adapter: &Adapter) -> Result<Peripheral> {
        if let Some(p) = self.find_known(adapter).await {
            return Ok(p);
        }
        info!("ble: scanning for '{}' ({:?})", self.device_id, self.scan_timeout);
        adapter.start_scan(ScanFilter::default()).await?;
        let found = tokio::time::timeout(self.scan_timeout, async {
            loop {
                if let Some(p) = self.find_known(adapter).await {
                    return p;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
        .await;
        adapter.stop_scan().await.ok();
        found.map_err(|_| {
            BridgeError::NotConnected(format!(
                "device '{}' not found after {:?}",
                self.device_id, self.scan_timeout
            ))
        })
    }

    fn characteristic(&self, p: &Peripheral, service: Uuid, uuid: Uuid) -> Result<Characteristic> {
        let chars: BTreeSet<Characteristic> = p.characteristics();
        chars
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == service)
            .ok_or_else(|| BridgeError::NotConnected(format!("characteristic {uuid} not found")))
    }
}

/// CoreBluetooth starts in an unknown state; scanning before PoweredOn is a
/// silent no-op.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;
    use log::{debug, warn};

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("ble: adapter still {state:?} after 3 s, proceeding anyway");
                break;
            }
            Ok(state) => debug!("ble: adapter state = {state:?}, waiting"),
            Err(e) => {
                warn!("ble: adapter_state() error: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[cfg(not(target_os = "macos"))]
async fn wait_powered_on(_adapter: &Adapter) {}

#[async_trait]
impl GattBackend for BtleBackend {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn connect(&self) -> Result<()> {
        let adapter = self.adapter().await?;
        let peripheral = match self.peripheral() {
            Some(p) => p,
            None => {
                let p = self.locate(adapter).await?;
                info!("ble: found '{}' as {}", self.device_id, p.id());
                *self.located_id.lock() = Some(p.id());
                *self.peripheral.lock() = Some(p.clone());
                p
            }
        };

        // BlueZ's Device1.Connect can block forever when the device is gone.
        tokio::time::timeout(self.connect_timeout, peripheral.connect())
            .await
            .map_err(|_| {
                BridgeError::Timeout(format!("connect timed out after {:?}", self.connect_timeout))
            })??;

        // BlueZ reports the link before its GATT cache is populated.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        tokio::time::timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| BridgeError::Timeout("service discovery timed out".into()))??;
        info!("ble: connected to '{}'", self.device_id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(p) = self.peripheral() {
            p.disconnect().await?;
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match self.peripheral() {
            Some(p) => p.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn link_events(&self) -> Result<LinkEventStream> {
        let events = self.adapter().await?.events().await?;
        let located = Arc::clone(&self.located_id);
        let stream = events.filter_map(move |event| {
            let target = located.lock().clone();
            let state = match (event, target) {
                (CentralEvent::DeviceConnected(id), Some(t)) if id == t => Some(true),
                (CentralEvent::DeviceDisconnected(id), Some(t)) if id == t => Some(false),
                _ => None,
            };
            async move { state }
        });
        Ok(Box::pin(stream))
    }

    async fn services(&self) -> Result<Vec<GattService>> {
        let p = self.connected_peripheral()?;
        Ok(p.services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<NotificationStream> {
        let p = self.connected_peripheral()?;
        let c = self.characteristic(&p, service, characteristic)?;
        p.subscribe(&c).await?;
        let notifications = p.notifications().await?;
        let stream = notifications.filter_map(move |n| async move {
            (n.uuid == characteristic).then_some(n.value)
        });
        Ok(Box::pin(stream))
    }

    async fn unsubscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let p = self.connected_peripheral()?;
        let c = self.characteristic(&p, service, characteristic)?;
        p.unsubscribe(&c).await?;
        Ok(())
    }
}
