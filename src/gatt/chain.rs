//! Device link watcher and the service → characteristic discovery chain.
//!
//! ```text
//!  DeviceLink   adapter events ─┐
//!               state poll ─────┴─► watch<bool> (deduplicated)
//!
//!  BleChain     sync gate ─► resolve service ─► resolve characteristic ─► subscribe
//!                                 │                     │
//!                                 └── not found: enumerate, report not-ready
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{GattBackend, GattService};
use crate::parse::parse_heart_rate_measurement;
use crate::protocol::{HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
use crate::source::SourceSignals;
use crate::types::BleIdentity;

// ── DeviceLink ────────────────────────────────────────────────────────────────

/// Device-layer connection state.
///
/// Adapter connect/disconnect events and a periodic `is_connected` poll both
/// feed one deduplicated boolean.
#[derive(Clone)]
pub struct DeviceLink {
    state: Arc<watch::Sender<bool>>,
}

impl DeviceLink {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Record an observed state. Repeats are not re-notified.
    pub fn observe(&self, connected: bool) {
        self.state.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Block until the link drops. Returns `false` if `cancel` fired first.
    pub async fn wait_for_disconnect(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => false,
            r = rx.wait_for(|c| !*c) => r.is_ok(),
        }
    }

    /// Feed adapter events and a state poll into the link until `cancel`.
    pub async fn watch(
        self,
        backend: Arc<dyn GattBackend>,
        poll: Duration,
        cancel: CancellationToken,
    ) {
        let mut events = match backend.link_events().await {
            Ok(events) => Some(events),
            Err(e) => {
                warn!("ble: adapter events unavailable, polling only: {e}");
                None
            }
        };
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = async {
                    match events.as_mut() {
                        Some(s) => s.next().await,
                        None => std::future::pending().await,
                    }
                } => match event {
                    Some(connected) => {
                        debug!("ble: adapter reports connected={connected}");
                        self.observe(connected);
                    }
                    None => {
                        debug!("ble: adapter event stream ended");
                        events = None;
                    }
                },
                _ = ticker.tick() => self.observe(backend.is_connected().await),
            }
        }
    }
}

impl Default for DeviceLink {
    fn default() -> Self {
        Self::new()
    }
}

// ── BleChain ──────────────────────────────────────────────────────────────────

/// Service and characteristic the chain should resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTarget {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl ChainTarget {
    /// Undiscovered components fall back to the standard Heart Rate profile.
    pub fn from_identity(identity: &BleIdentity) -> Self {
        Self {
            service: identity.service_id.unwrap_or(HEART_RATE_SERVICE),
            characteristic: identity.characteristic_id.unwrap_or(HEART_RATE_MEASUREMENT),
        }
    }
}

impl Default for ChainTarget {
    fn default() -> Self {
        Self {
            service: HEART_RATE_SERVICE,
            characteristic: HEART_RATE_MEASUREMENT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Subscribed and streaming.
    Ready,
    /// Some level failed to resolve; the device stays connected.
    NotReady,
    /// Another sync was running; it will run once more on our behalf.
    Coalesced,
}

struct Subscription {
    target: ChainTarget,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ChainCache {
    service: Option<Uuid>,
    characteristic: Option<Uuid>,
    subscription: Option<Subscription>,
}

/// Service and characteristic layers on top of a connected device.
///
/// One gate serializes syncs. A request arriving while a sync runs sets a
/// flag and returns; the running sync then makes exactly one more pass.
pub struct BleChain {
    backend: Arc<dyn GattBackend>,
    signals: SourceSignals,
    target: parking_lot::Mutex<ChainTarget>,
    gate: tokio::sync::Mutex<ChainCache>,
    resync: AtomicBool,
    passes: AtomicU64,
}

impl BleChain {
    pub fn new(backend: Arc<dyn GattBackend>, target: ChainTarget, signals: SourceSignals) -> Self {
        Self {
            backend,
            signals,
            target: parking_lot::Mutex::new(target),
            gate: tokio::sync::Mutex::new(ChainCache::default()),
            resync: AtomicBool::new(false),
            passes: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> ChainTarget {
        *self.target.lock()
    }

    /// Number of sync passes actually run.
    pub fn sync_passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Resolve and subscribe. Subscription tasks are children of `cancel`.
    pub async fn sync(&self, cancel: &CancellationToken) -> SyncOutcome {
        let Ok(mut cache) = self.gate.try_lock() else {
            debug!("ble: sync already running, coalescing");
            self.resync.store(true, Ordering::SeqCst);
            return SyncOutcome::Coalesced;
        };
        loop {
            self.resync.store(false, Ordering::SeqCst);
            self.passes.fetch_add(1, Ordering::SeqCst);
            let ready = self.sync_pass(&mut cache, cancel).await;
            if !self.resync.swap(false, Ordering::SeqCst) || cancel.is_cancelled() {
                return if ready {
                    SyncOutcome::Ready
                } else {
                    SyncOutcome::NotReady
                };
            }
            debug!("ble: re-running coalesced sync");
        }
    }

    /// Change the service/characteristic selection and re-sync if connected.
    pub async fn reconfigure(
        &self,
        target: ChainTarget,
        cancel: &CancellationToken,
    ) -> SyncOutcome {
        let previous = std::mem::replace(&mut *self.target.lock(), target);
        if previous != target {
            info!(
                "ble: reconfigured to service {} characteristic {}",
                target.service, target.characteristic
            );
        }
        if !self.backend.is_connected().await {
            return SyncOutcome::NotReady;
        }
        self.sync(cancel).await
    }

    /// Drop every cached selection and subscription. Called after the device
    /// link is lost.
    pub async fn teardown(&self) {
        let mut cache = self.gate.lock().await;
        if let Some(sub) = cache.subscription.take() {
            stop_subscription(sub).await;
        }
        cache.service = None;
        cache.characteristic = None;
        self.signals.reset();
    }

    async fn sync_pass(&self, cache: &mut ChainCache, cancel: &CancellationToken) -> bool {
        let target = self.target();

        let listed = tokio::select! {
            _ = cancel.cancelled() => return self.not_ready(),
            r = self.backend.services() => r,
        };
        let services = match listed {
            Ok(services) => services,
            Err(e) => {
                warn!("ble: cannot list services: {e}");
                return self.not_ready();
            }
        };

        // Service layer.
        let Some(service) = services.iter().find(|s| s.uuid == target.service) else {
            warn!("ble: service {} not found on {}", target.service, self.backend.device_id());
            log_enumeration(&services);
            cache.service = None;
            cache.characteristic = None;
            self.drop_subscription(cache).await;
            return self.not_ready();
        };
        if cache.service != Some(service.uuid) {
            cache.characteristic = None;
            cache.service = Some(service.uuid);
        }

        // Characteristic layer.
        if !service.characteristics.contains(&target.characteristic) {
            warn!(
                "ble: characteristic {} not found in service {}",
                target.characteristic, service.uuid
            );
            log_enumeration(std::slice::from_ref(service));
            cache.characteristic = None;
            self.drop_subscription(cache).await;
            return self.not_ready();
        }
        cache.characteristic = Some(target.characteristic);

        let alive = cache
            .subscription
            .as_ref()
            .is_some_and(|s| s.target == target && !s.task.is_finished());
        if alive {
            self.signals.set_connected(true);
            return true;
        }
        self.drop_subscription(cache).await;

        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return self.not_ready(),
            r = self.backend.subscribe(target.service, target.characteristic) => r,
        };
        let stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                warn!("ble: subscribe to {} failed: {e}", target.characteristic);
                return self.not_ready();
            }
        };

        let sub_cancel = cancel.child_token();
        let token = sub_cancel.clone();
        let signals = self.signals.clone();
        let task = tokio::spawn(async move {
            let mut stream = stream;
            loop {
                let data = tokio::select! {
                    _ = token.cancelled() => break,
                    next = stream.next() => match next {
                        Some(data) => data,
                        None => {
                            debug!("ble: notification stream ended");
                            break;
                        }
                    },
                };
                match parse_heart_rate_measurement(&data) {
                    Some(bpm) => signals.publish(bpm),
                    None => warn!("ble: malformed measurement {data:02x?}"),
                }
            }
        });
        cache.subscription = Some(Subscription {
            target,
            cancel: sub_cancel,
            task,
        });
        info!("ble: subscribed to {}", target.characteristic);
        self.signals.set_connected(true);
        true
    }

    async fn drop_subscription(&self, cache: &mut ChainCache) {
        if let Some(sub) = cache.subscription.take() {
            let ChainTarget {
                service,
                characteristic,
            } = sub.target;
            stop_subscription(sub).await;
            if let Err(e) = self.backend.unsubscribe(service, characteristic).await {
                debug!("ble: unsubscribe from {characteristic} failed: {e}");
            }
        }
    }

    fn not_ready(&self) -> bool {
        self.signals.set_connected(false);
        false
    }
}

async fn stop_subscription(sub: Subscription) {
    sub.cancel.cancel();
    if let Err(e) = sub.task.await {
        if e.is_panic() {
            warn!("ble: notification task panicked: {e}");
        }
    }
}

/// Full service listing, for diagnosing a misconfigured identity.
fn log_enumeration(services: &[GattService]) {
    for s in services {
        info!("ble:   service {}", s.uuid);
        for c in &s.characteristics {
            info!("ble:     characteristic {c}");
        }
    }
}
