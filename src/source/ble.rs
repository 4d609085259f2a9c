// BLE source
//
// Connection loop: connect (backing off linearly on failure), sync the
// discovery chain, block until the link drops, tear the chain down, repeat.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{HeartRateSource, SourceSignals, SourceTasks};
use crate::config::SourceConfig;
use crate::error::{BridgeError, Result};
use crate::gatt::{BleChain, BtleBackend, ChainTarget, DeviceLink, GattBackend, SyncOutcome};
use crate::supervisor::{sleep_or_cancel, Backoff};
use crate::types::{HeartRateSample, SourceDescriptor};

pub struct BleSource {
    descriptor: SourceDescriptor,
    backend: Arc<dyn GattBackend>,
    chain: Arc<BleChain>,
    link: DeviceLink,
    state_poll: Duration,
    signals: SourceSignals,
    tasks: SourceTasks,
}

impl BleSource {
    pub fn new(descriptor: SourceDescriptor) -> Result<Self> {
        let backend = match &descriptor.config {
            SourceConfig::Ble(cfg) => Arc::new(BtleBackend::new(cfg)),
            _ => {
                return Err(BridgeError::Configuration(format!(
                    "{}: not a BLE source",
                    descriptor.id
                )))
            }
        };
        Self::with_backend(descriptor, backend)
    }

    /// Same as [`BleSource::new`] over an arbitrary GATT backend.
    pub fn with_backend(
        descriptor: SourceDescriptor,
        backend: Arc<dyn GattBackend>,
    ) -> Result<Self> {
        let SourceConfig::Ble(cfg) = &descriptor.config else {
            return Err(BridgeError::Configuration(format!(
                "{}: not a BLE source",
                descriptor.id
            )));
        };
        if cfg.identity.device_id.trim().is_empty() {
            return Err(BridgeError::Configuration("ble: device id is empty".into()));
        }
        let signals = SourceSignals::new();
        let chain = Arc::new(BleChain::new(
            Arc::clone(&backend),
            ChainTarget::from_identity(&cfg.identity),
            signals.clone(),
        ));
        let state_poll = Duration::from_millis(cfg.state_poll_ms.max(50));
        Ok(Self {
            descriptor,
            backend,
            chain,
            link: DeviceLink::new(),
            state_poll,
            signals,
            tasks: SourceTasks::default(),
        })
    }

    pub fn chain(&self) -> &Arc<BleChain> {
        &self.chain
    }
}

#[async_trait]
impl HeartRateSource for BleSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn start(&mut self) -> Result<()> {
        if self.tasks.is_running() {
            warn!("{}: already started", self.descriptor.id);
            return Ok(());
        }
        info!("{}: starting for device '{}'", self.descriptor.id, self.backend.device_id());
        let cancel = self.tasks.begin();
        self.tasks.spawn(self.link.clone().watch(
            Arc::clone(&self.backend),
            self.state_poll,
            cancel.clone(),
        ));
        self.tasks.spawn(connection_loop(
            Arc::clone(&self.backend),
            Arc::clone(&self.chain),
            self.link.clone(),
            cancel,
        ));
        Ok(())
    }

    async fn stop(&mut self) {
        self.tasks.shutdown().await;
        self.chain.teardown().await;
        if self.backend.is_connected().await {
            if let Err(e) = self.backend.disconnect().await {
                warn!("{}: disconnect failed: {e}", self.descriptor.id);
            }
        }
        self.link.observe(false);
        self.signals.reset();
    }

    fn is_started(&self) -> bool {
        self.tasks.is_running()
    }

    fn heart_rate(&self) -> watch::Receiver<HeartRateSample> {
        self.signals.subscribe_bpm()
    }

    fn connected(&self) -> watch::Receiver<bool> {
        self.signals.subscribe_connected()
    }
}

async fn connection_loop(
    backend: Arc<dyn GattBackend>,
    chain: Arc<BleChain>,
    link: DeviceLink,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;
    while !cancel.is_cancelled() {
        if !link.is_connected() {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                r = backend.connect() => r,
            };
            match result {
                Ok(()) => {
                    attempt = 0;
                    link.observe(true);
                }
                Err(BridgeError::Configuration(msg)) => {
                    error!("ble: {msg}; giving up");
                    break;
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let delay = Backoff::BLE.delay(attempt);
                    warn!("ble: connect failed ({e}); retry #{attempt} in {delay:?}");
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    continue;
                }
            }
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = chain.sync(&cancel) => outcome,
        };
        match outcome {
            SyncOutcome::Ready => info!("ble: streaming from '{}'", backend.device_id()),
            SyncOutcome::NotReady => {
                warn!("ble: '{}' connected but not ready", backend.device_id())
            }
            SyncOutcome::Coalesced => {}
        }

        if !link.wait_for_disconnect(&cancel).await {
            break;
        }
        info!("ble: '{}' disconnected", backend.device_id());
        chain.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BleConfig;
    use crate::gatt::fake::FakeGatt;
    use crate::types::{BleIdentity, SourceKind};
    use std::sync::atomic::Ordering;

    fn descriptor(device_id: &str) -> SourceDescriptor {
        SourceDescriptor {
            id: "ble".into(),
            kind: SourceKind::Ble,
            config: SourceConfig::Ble(BleConfig {
                identity: BleIdentity {
                    device_id: device_id.into(),
                    ..BleIdentity::default()
                },
                ..BleConfig::default()
            }),
        }
    }

    #[test]
    fn empty_device_id_is_rejected() {
        let err = BleSource::with_backend(descriptor(" "), FakeGatt::heart_rate())
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_tears_down_and_reconnect_syncs_once() {
        let fake = FakeGatt::heart_rate();
        let mut source = BleSource::with_backend(descriptor("fake-strap"), fake.clone()).unwrap();
        let mut connected = source.connected();
        source.start().await.unwrap();

        connected.wait_for(|c| *c).await.unwrap();
        assert_eq!(source.chain().sync_passes(), 1);
        fake.notify(&[0x00, 70]);
        source.heart_rate().wait_for(|s| s.bpm == 70).await.unwrap();

        // First reconnect fails, so the torn-down state is observable for 2 s.
        fake.failing_connects.store(1, Ordering::SeqCst);
        fake.drop_link();
        connected.wait_for(|c| !*c).await.unwrap();
        assert_eq!(source.heart_rate().borrow().bpm, 0);

        connected.wait_for(|c| *c).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.chain().sync_passes(), 2);
        assert_eq!(fake.connect_calls.load(Ordering::SeqCst), 3);

        source.stop().await;
        assert!(!*source.connected().borrow());
        assert!(!fake.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_back_off_linearly() {
        let fake = FakeGatt::heart_rate();
        fake.failing_connects.store(3, Ordering::SeqCst);
        let mut source = BleSource::with_backend(descriptor("fake-strap"), fake.clone()).unwrap();
        let start = tokio::time::Instant::now();
        source.start().await.unwrap();

        source.connected().wait_for(|c| *c).await.unwrap();
        // 2 s + 4 s + 6 s of backoff before the fourth attempt succeeds.
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert_eq!(fake.connect_calls.load(Ordering::SeqCst), 4);
        source.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_hung_service_discovery() {
        let fake = FakeGatt::heart_rate();
        *fake.services_delay.lock() = Duration::from_secs(60);
        let mut source = BleSource::with_backend(descriptor("fake-strap"), fake.clone()).unwrap();
        source.start().await.unwrap();

        // Connected, now parked inside service discovery.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fake.service_calls.load(Ordering::SeqCst), 1);

        let begun = tokio::time::Instant::now();
        source.stop().await;
        assert!(begun.elapsed() < Duration::from_secs(1));
        assert!(!source.is_started());
        assert!(!*source.connected().borrow());
        assert!(!fake.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_backoff() {
        let fake = FakeGatt::heart_rate();
        fake.failing_connects.store(u32::MAX, Ordering::SeqCst);
        let mut source = BleSource::with_backend(descriptor("fake-strap"), fake.clone()).unwrap();
        source.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        source.stop().await;
        assert!(!source.is_started());
        let calls = fake.connect_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fake.connect_calls.load(Ordering::SeqCst), calls);
    }
}
