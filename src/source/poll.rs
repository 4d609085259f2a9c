// Text-file source
//
// Re-reads a file on a fixed interval and parses its whole contents as a BPM.
// Read or parse failures keep the previous value; the loop never exits on its
// own.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{HeartRateSource, SourceSignals, SourceTasks};
use crate::config::SourceConfig;
use crate::error::{BridgeError, Result};
use crate::parse::parse_bpm_text;
use crate::types::{HeartRateSample, SourceDescriptor};

pub struct PollSource {
    descriptor: SourceDescriptor,
    path: PathBuf,
    interval: Duration,
    signals: SourceSignals,
    tasks: SourceTasks,
}

impl PollSource {
    pub fn new(descriptor: SourceDescriptor) -> Result<Self> {
        let SourceConfig::Poll(cfg) = &descriptor.config else {
            return Err(BridgeError::Configuration(format!(
                "{}: not a text-file source",
                descriptor.id
            )));
        };
        if cfg.path.as_os_str().is_empty() {
            return Err(BridgeError::Configuration("textfile: path is empty".into()));
        }
        let path = cfg.path.clone();
        let interval = Duration::from_millis(cfg.interval_ms.max(1));
        Ok(Self {
            descriptor,
            path,
            interval,
            signals: SourceSignals::new(),
            tasks: SourceTasks::default(),
        })
    }
}

#[async_trait]
impl HeartRateSource for PollSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn start(&mut self) -> Result<()> {
        if self.tasks.is_running() {
            warn!("{}: already started", self.descriptor.id);
            return Ok(());
        }
        info!("{}: polling {} every {:?}", self.descriptor.id, self.path.display(), self.interval);
        let cancel = self.tasks.begin();
        self.tasks.spawn(poll_loop(
            self.path.clone(),
            self.interval,
            self.signals.clone(),
            cancel,
        ));
        Ok(())
    }

    async fn stop(&mut self) {
        self.tasks.shutdown().await;
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

async fn poll_loop(
    path: PathBuf,
    interval: Duration,
    signals: SourceSignals,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::fs::read_to_string(&path) => r,
        };

        match text {
            Ok(text) => {
                signals.set_connected(true);
                match parse_bpm_text(&text) {
                    Ok(bpm) => {
                        if bpm != signals.current_bpm() {
                            debug!("textfile: {bpm} bpm");
                        }
                        signals.publish(bpm);
                    }
                    Err(e) => warn!("textfile: {e}; keeping {} bpm", signals.current_bpm()),
                }
            }
            Err(e) => {
                warn!("textfile: cannot read {}: {e}", path.display());
                signals.set_connected(false);
            }
        }
    }
    debug!("textfile: poll loop stopped");
}
