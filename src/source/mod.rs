//! Heart-rate sources: one state machine per acquisition method.
//!
//! Every source exposes the same two latest-value streams (heart rate and
//! connectivity) through [`tokio::sync::watch`] channels. Consumers may miss
//! intermediate values but always observe the newest one.
//!
//! New sources are added by:
//! 1. implementing [`HeartRateSource`],
//! 2. adding a variant to [`crate::config::SourceConfig`],
//! 3. adding a match arm to [`create_source`].

mod ble;
mod poll;
mod push;
mod sdk;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerHandle, SdkBias};
use crate::config::SourceConfig;
use crate::error::Result;
use crate::types::{HeartRateSample, SourceDescriptor};

pub use ble::BleSource;
pub use poll::PollSource;
pub use push::PushSource;
pub use sdk::SdkBridgeSource;

/// Capability set shared by every acquisition method.
#[async_trait]
pub trait HeartRateSource: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    /// Spawn the source's tasks. A second call while running logs a warning
    /// and does nothing.
    async fn start(&mut self) -> Result<()>;

    /// Cancel all in-flight work, join every task, and reset both streams to
    /// zero/disconnected. Safe to call mid-retry and when already stopped.
    async fn stop(&mut self);

    fn is_started(&self) -> bool;

    /// Latest heart-rate sample.
    fn heart_rate(&self) -> watch::Receiver<HeartRateSample>;

    /// Whether the source currently has a live upstream.
    fn connected(&self) -> watch::Receiver<bool>;

    /// The SDK broker behind this source, if it is an SDK bridge.
    fn sdk_broker(&self) -> Option<BrokerHandle> {
        None
    }
}

/// Build the source named by `descriptor`.
///
/// `bias` is the orchestrator-owned preferred-SDK selection; only the SDK
/// bridge reads it.
pub fn create_source(
    descriptor: SourceDescriptor,
    bias: SdkBias,
) -> Result<Box<dyn HeartRateSource>> {
    match &descriptor.config {
        SourceConfig::Push(_) => Ok(Box::new(PushSource::new(descriptor)?)),
        SourceConfig::Poll(_) => Ok(Box::new(PollSource::new(descriptor)?)),
        SourceConfig::Ble(_) => Ok(Box::new(BleSource::new(descriptor)?)),
        SourceConfig::SdkBridge(_) => Ok(Box::new(SdkBridgeSource::new(descriptor, bias)?)),
    }
}

// ── SourceSignals ─────────────────────────────────────────────────────────────

/// Sending half of a source's two streams.
///
/// Cheap to clone; every task of a source holds one.
#[derive(Clone)]
pub struct SourceSignals {
    bpm: Arc<watch::Sender<HeartRateSample>>,
    connected: Arc<watch::Sender<bool>>,
}

impl SourceSignals {
    pub fn new() -> Self {
        let (bpm, _) = watch::channel(HeartRateSample::default());
        let (connected, _) = watch::channel(false);
        Self {
            bpm: Arc::new(bpm),
            connected: Arc::new(connected),
        }
    }

    /// Publish a fresh reading.
    pub fn publish(&self, bpm: u32) {
        self.bpm.send_replace(HeartRateSample::now(bpm));
    }

    /// Update connectivity; repeated identical values are not re-notified.
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    /// Return both streams to the zero/disconnected state.
    pub fn reset(&self) {
        self.set_connected(false);
        self.bpm.send_if_modified(|current| {
            let changed = *current != HeartRateSample::default();
            *current = HeartRateSample::default();
            changed
        });
    }

    pub fn current_bpm(&self) -> u32 {
        self.bpm.borrow().bpm
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn subscribe_bpm(&self) -> watch::Receiver<HeartRateSample> {
        self.bpm.subscribe()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

impl Default for SourceSignals {
    fn default() -> Self {
        Self::new()
    }
}

// ── SourceTasks ───────────────────────────────────────────────────────────────

/// The cancellation token and join handles of one running source.
#[derive(Default)]
pub struct SourceTasks {
    cancel: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

impl SourceTasks {
    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Start a new session and return its token.
    pub fn begin(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());
        token
    }

    pub fn spawn<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(fut));
    }

    /// Cancel the session and wait for every task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("source task panicked: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_changes_are_deduplicated() {
        let signals = SourceSignals::new();
        let mut rx = signals.subscribe_connected();
        rx.borrow_and_update();

        signals.set_connected(false);
        assert!(!rx.has_changed().unwrap());

        signals.set_connected(true);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        signals.set_connected(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn reset_zeroes_both_streams() {
        let signals = SourceSignals::new();
        signals.publish(80);
        signals.set_connected(true);
        signals.reset();
        assert_eq!(signals.current_bpm(), 0);
        assert!(!signals.is_connected());
        assert_eq!(*signals.subscribe_bpm().borrow(), HeartRateSample::default());
    }

    #[tokio::test]
    async fn shutdown_joins_tasks() {
        let mut tasks = SourceTasks::default();
        let token = tasks.begin();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        tasks.spawn(async move {
            token.cancelled().await;
            let _ = done_tx.send(());
        });
        assert!(tasks.is_running());
        tasks.shutdown().await;
        assert!(!tasks.is_running());
        assert!(done_rx.await.is_ok());
    }
}
