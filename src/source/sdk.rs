// SDK bridge source
//
// Hosts the broker: a TCP listener for remote reporters plus a 100 ms tick
// that drives local plugins and publishes the arbitrated reading.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{HeartRateSource, SourceSignals, SourceTasks};
use crate::broker::{BrokerHandle, PluginRegistry, SdkBias, TICK};
use crate::config::SourceConfig;
use crate::error::{BridgeError, Result};
use crate::supervisor::{supervise, Backoff};
use crate::types::{HeartRateSample, SourceDescriptor};

pub struct SdkBridgeSource {
    descriptor: SourceDescriptor,
    bind: String,
    plugin_dir: Option<PathBuf>,
    registry: PluginRegistry,
    broker: BrokerHandle,
    signals: SourceSignals,
    tasks: SourceTasks,
}

impl SdkBridgeSource {
    pub fn new(descriptor: SourceDescriptor, bias: SdkBias) -> Result<Self> {
        Self::with_registry(descriptor, bias, PluginRegistry::with_builtins())
    }

    /// Same as [`SdkBridgeSource::new`] with a caller-supplied plugin table.
    pub fn with_registry(
        descriptor: SourceDescriptor,
        bias: SdkBias,
        registry: PluginRegistry,
    ) -> Result<Self> {
        let SourceConfig::SdkBridge(cfg) = &descriptor.config else {
            return Err(BridgeError::Configuration(format!(
                "{}: not an SDK bridge source",
                descriptor.id
            )));
        };
        let bind = cfg.bind.clone();
        let plugin_dir = cfg.plugin_dir.clone();
        Ok(Self {
            descriptor,
            bind,
            plugin_dir,
            registry,
            broker: BrokerHandle::new(bias),
            signals: SourceSignals::new(),
            tasks: SourceTasks::default(),
        })
    }

    pub fn broker(&self) -> &BrokerHandle {
        &self.broker
    }
}

#[async_trait]
impl HeartRateSource for SdkBridgeSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn start(&mut self) -> Result<()> {
        if self.tasks.is_running() {
            warn!("{}: already started", self.descriptor.id);
            return Ok(());
        }

        if let Some(dir) = &self.plugin_dir {
            for plugin in self.registry.discover(dir) {
                self.broker.attach_plugin(plugin);
            }
        }

        let cancel = self.tasks.begin();
        self.tasks.spawn(tick_loop(self.broker.clone(), self.signals.clone(), cancel.clone()));

        let broker = self.broker.clone();
        let bind = self.bind.clone();
        self.tasks.spawn(async move {
            supervise("sdk", Backoff::NETWORK, cancel, |token| {
                let broker = broker.clone();
                let bind = bind.clone();
                async move { broker.serve(&bind, token).await }
            })
            .await;
        });
        info!("{}: broker started on {}", self.descriptor.id, self.bind);
        Ok(())
    }

    async fn stop(&mut self) {
        self.tasks.shutdown().await;
        self.broker.shutdown();
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

    fn sdk_broker(&self) -> Option<BrokerHandle> {
        Some(self.broker.clone())
    }
}

async fn tick_loop(broker: BrokerHandle, signals: SourceSignals, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tick = tick.wrapping_add(1);
        broker.tick(tick, &signals);
    }
    debug!("sdk: tick loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SdkConfig;
    use crate::types::SourceKind;
    use std::time::Duration;

    fn descriptor(plugin_dir: Option<PathBuf>) -> SourceDescriptor {
        SourceDescriptor {
            id: "sdk".into(),
            kind: SourceKind::SdkBridge,
            config: SourceConfig::SdkBridge(SdkConfig {
                bind: "127.0.0.1:0".into(),
                plugin_dir,
            }),
        }
    }

    #[tokio::test]
    async fn textfile_plugin_feeds_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let hr_path = dir.path().join("hr.txt");
        std::fs::write(&hr_path, "64").unwrap();
        let manifest = serde_json::json!({
            "factory": "textfile",
            "name": "Watch",
            "options": { "path": hr_path },
        });
        std::fs::write(dir.path().join("watch.plugin.json"), manifest.to_string()).unwrap();

        let mut source =
            SdkBridgeSource::new(descriptor(Some(dir.path().to_path_buf())), SdkBias::default())
                .unwrap();
        let mut hr = source.heart_rate();
        source.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), hr.wait_for(|s| s.bpm == 64))
            .await
            .unwrap()
            .unwrap();
        assert!(*source.connected().borrow());
        assert_eq!(source.broker().reports().len(), 1);

        source.stop().await;
        assert!(source.broker().reports().is_empty());
        assert_eq!(source.heart_rate().borrow().bpm, 0);
    }

    #[tokio::test]
    async fn listener_address_is_published() {
        let mut source = SdkBridgeSource::new(descriptor(None), SdkBias::default()).unwrap();
        source.start().await.unwrap();
        let broker = source.sdk_broker().unwrap();
        let mut addr = None;
        for _ in 0..50 {
            addr = broker.local_addr();
            if addr.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(addr.is_some());
        source.stop().await;
        assert!(broker.local_addr().is_none());
    }
}
