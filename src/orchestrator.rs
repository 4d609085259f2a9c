//! Lifecycle owner: source selection, game watchdog, heartbeat and commands.
//!
//! ```text
//!   Idle ──start──► WatchingForGame ──game detected──► Running
//!    ▲                    ▲                               │
//!    │                    └──── auto_start ───────┐       │ stop / game lost
//!    └──────────────────────────────────────── Stopping ◄─┘
//! ```
//!
//! At most one source is live: the previous source's `stop` (which joins all
//! its tasks) completes before the next `start`.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::SdkBias;
use crate::command::Command;
use crate::config::{BridgeConfig, ConfigStore};
use crate::error::Result;
use crate::heartbeat;
use crate::params::{name_table, ParameterSync};
use crate::source::{create_source, HeartRateSource};
use crate::supervisor::sleep_or_cancel;
use crate::transport::GameTransport;
use crate::types::{BridgeSignal, ConnectivityState, HeartRateSample, SourceDescriptor};

/// Watchdog poll period.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

/// `restart` waits this many ticks of [`RESTART_TICK`] between stop and start.
pub const RESTART_TICKS: u32 = 3;
pub const RESTART_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    WatchingForGame,
    Running,
    Stopping,
}

// ── Process detection ─────────────────────────────────────────────────────────

pub trait ProcessProbe: Send + Sync {
    fn is_running(&self, process_name: &str) -> bool;
}

/// Probe for setups that skip process detection.
pub struct AlwaysRunning;

impl ProcessProbe for AlwaysRunning {
    fn is_running(&self, _process_name: &str) -> bool {
        true
    }
}

/// Looks the process up by name in the system process table.
///
/// Names compare case-insensitively, with or without a trailing `.exe`, so
/// `VRChat` matches `VRChat.exe` on Windows and under Proton.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn is_running(&self, process_name: &str) -> bool {
        let wanted = normalize_process_name(process_name);
        if wanted.is_empty() {
            return false;
        }
        let mut system = self.system.lock();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_exe(UpdateKind::OnlyIfNotSet),
        );
        system.processes().values().any(|process| {
            normalize_process_name(&process.name().to_string_lossy()) == wanted
                || process
                    .exe()
                    .and_then(|exe| exe.file_name())
                    .is_some_and(|exe| normalize_process_name(&exe.to_string_lossy()) == wanted)
        })
    }
}

/// Lower-case `name` and drop a trailing `.exe`.
fn normalize_process_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    match name.strip_suffix(".exe") {
        Some(stem) => stem.to_owned(),
        None => name,
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

/// Builds a source from its descriptor.
pub type SourceFactory =
    Arc<dyn Fn(SourceDescriptor, SdkBias) -> Result<Box<dyn HeartRateSource>> + Send + Sync>;

/// A background task with its own cancellation token.
struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<F>(cancel: CancellationToken, fut: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            cancel,
            handle: tokio::spawn(fut),
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                error!("orchestrator: worker panicked: {e}");
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    source: Option<Box<dyn HeartRateSource>>,
    pump: Option<Worker>,
    heartbeat: Option<Worker>,
    watchdog: Option<Worker>,
}

pub struct Orchestrator {
    me: Weak<Orchestrator>,
    config: Arc<ConfigStore>,
    probe: Arc<dyn ProcessProbe>,
    factory: SourceFactory,
    params: Arc<Mutex<ParameterSync>>,
    bias: SdkBias,
    state: watch::Sender<LifecycleState>,
    /// BPM of the authoritative source; `None` when nothing is connected.
    authoritative: Arc<watch::Sender<Option<u32>>>,
    latest: Arc<Mutex<(u32, ConnectivityState)>>,
    inner: tokio::sync::Mutex<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ConfigStore>,
        probe: Arc<dyn ProcessProbe>,
        transports: Vec<Arc<dyn GameTransport>>,
    ) -> Arc<Self> {
        Self::with_factory(config, probe, transports, Arc::new(create_source))
    }

    pub fn with_factory(
        config: Arc<ConfigStore>,
        probe: Arc<dyn ProcessProbe>,
        transports: Vec<Arc<dyn GameTransport>>,
        factory: SourceFactory,
    ) -> Arc<Self> {
        let params = ParameterSync::new(&config.get(), transports);
        let (state, _) = watch::channel(LifecycleState::Idle);
        let (authoritative, _) = watch::channel(None);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            probe,
            factory,
            params: Arc::new(Mutex::new(params)),
            bias: SdkBias::default(),
            state,
            authoritative: Arc::new(authoritative),
            latest: Arc::new(Mutex::new((0, ConnectivityState::Disconnected))),
            inner: tokio::sync::Mutex::new(Inner::default()),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn bias(&self) -> &SdkBias {
        &self.bias
    }

    pub fn params(&self) -> &Arc<Mutex<ParameterSync>> {
        &self.params
    }

    /// Parse and run one command line. Unknown commands are logged.
    pub async fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match line.parse::<Command>() {
            Ok(cmd) => self.execute(cmd).await,
            Err(e) => warn!("{e}"),
        }
    }

    /// Run a command. Failures are logged, never returned.
    pub async fn execute(&self, cmd: Command) {
        debug!("command: {cmd:?}");
        match cmd {
            Command::Start => self.start().await,
            Command::Stop => self.stop().await,
            Command::Restart => self.restart().await,
            Command::StartBeat => self.start_beat().await,
            Command::StopBeat => self.stop_beat().await,
            Command::RefreshConfig => self.refresh_config().await,
            Command::BiasSdk(name) => {
                info!("sdk: biased towards '{name}'");
                self.bias.set(Some(name));
            }
            Command::UnbiasSdk => {
                info!("sdk: bias cleared");
                self.bias.set(None);
            }
            Command::DestroySdk(name) => self.destroy_sdk(&name).await,
        }
    }

    /// React to a transport signal.
    pub fn handle_signal(&self, signal: BridgeSignal) {
        match signal {
            BridgeSignal::AvatarChanged(id) => {
                debug!("avatar changed to '{id}', replaying parameters");
                self.params.lock().replay();
            }
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    pub async fn start(&self) {
        let mut inner = self.inner.lock().await;
        let watching = inner.watchdog.as_ref().is_some_and(|w| !w.handle.is_finished());
        if inner.source.is_some() || watching {
            warn!("orchestrator: already started ({:?})", self.state());
            return;
        }
        let config = self.config.get();
        if config.skip_process_check {
            self.launch(&mut inner, &config).await;
        } else {
            info!("waiting for '{}' to start", config.target_process);
            self.arm_watchdog(&mut inner, true);
        }
    }

    pub async fn stop(&self) {
        self.stop_and_rearm(false).await;
    }

    async fn stop_and_rearm(&self, after_game_lost: bool) {
        let watchdog = self.inner.lock().await.watchdog.take();
        if let Some(w) = watchdog {
            w.stop().await;
        }
        let mut inner = self.inner.lock().await;
        if inner.source.is_none() {
            if self.state() != LifecycleState::Idle {
                self.state.send_replace(LifecycleState::Idle);
            }
            return;
        }
        self.shutdown_source(&mut inner).await;

        let config = self.config.get();
        if config.auto_start && !config.skip_process_check {
            // After an explicit stop the game must exit and come back first.
            self.arm_watchdog(&mut inner, after_game_lost);
        }
    }

    pub async fn restart(&self) {
        info!("restarting");
        self.stop().await;
        for tick in 1..=RESTART_TICKS {
            tokio::time::sleep(RESTART_TICK).await;
            debug!("restart: tick {tick}/{RESTART_TICKS}");
        }
        // Drop a watchdog re-armed by auto_start; start arms its own.
        let watchdog = self.inner.lock().await.watchdog.take();
        if let Some(w) = watchdog {
            w.stop().await;
        }
        self.start().await;
    }

    /// Stop everything, including a watchdog re-armed by `auto_start`.
    pub async fn shutdown(&self) {
        self.stop().await;
        let workers = {
            let mut inner = self.inner.lock().await;
            [inner.watchdog.take(), inner.heartbeat.take()]
        };
        for worker in workers.into_iter().flatten() {
            worker.stop().await;
        }
    }

    /// Create and start the configured source. Must hold `inner`.
    async fn launch(&self, inner: &mut Inner, config: &BridgeConfig) {
        let descriptor = match config.descriptor() {
            Ok(d) => d,
            Err(e) => {
                error!("cannot start: {e}");
                self.state.send_replace(LifecycleState::Idle);
                return;
            }
        };
        let mut source = match (self.factory)(descriptor, self.bias.clone()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot create source: {e}");
                self.state.send_replace(LifecycleState::Idle);
                return;
            }
        };
        if let Err(e) = source.start().await {
            error!("source '{}' failed to start: {e}", source.descriptor().id);
            source.stop().await;
            self.state.send_replace(LifecycleState::Idle);
            return;
        }
        info!("source '{}' started", source.descriptor().id);

        let cancel = CancellationToken::new();
        inner.pump = Some(Worker::spawn(
            cancel.clone(),
            pump(
                source.heart_rate(),
                source.connected(),
                Arc::clone(&self.params),
                Arc::clone(&self.authoritative),
                Arc::clone(&self.latest),
                cancel,
            ),
        ));
        inner.source = Some(source);
        if config.heartbeat.enabled && inner.heartbeat.is_none() {
            inner.heartbeat = Some(self.spawn_heartbeat(config));
        }
        self.state.send_replace(LifecycleState::Running);
    }

    /// Stop the source and zero the parameters. Must hold `inner`.
    async fn shutdown_source(&self, inner: &mut Inner) {
        self.state.send_replace(LifecycleState::Stopping);
        if let Some(w) = inner.heartbeat.take() {
            w.stop().await;
        }
        if let Some(w) = inner.pump.take() {
            w.stop().await;
        }
        if let Some(mut source) = inner.source.take() {
            source.stop().await;
            info!("source '{}' stopped", source.descriptor().id);
        }
        self.authoritative.send_replace(None);
        *self.latest.lock() = (0, ConnectivityState::Disconnected);
        {
            let mut params = self.params.lock();
            params.update(0, ConnectivityState::Disconnected);
            params.set_beat(false);
        }
        self.state.send_replace(LifecycleState::Idle);
    }

    /// Poll the probe every [`WATCHDOG_PERIOD`]. With `armed == false` the
    /// game must be seen not running once before a launch.
    fn arm_watchdog(&self, inner: &mut Inner, armed: bool) {
        let cancel = CancellationToken::new();
        let me = self.me.clone();
        let token = cancel.clone();
        inner.watchdog = Some(Worker::spawn(cancel, async move {
            let mut armed = armed;
            loop {
                let Some(this) = me.upgrade() else { break };
                if !this.watchdog_tick(&token, &mut armed).await {
                    break;
                }
                drop(this);
                if !sleep_or_cancel(WATCHDOG_PERIOD, &token).await {
                    break;
                }
            }
        }));
        self.state.send_replace(LifecycleState::WatchingForGame);
    }

    /// One watchdog step. Returns `false` when the watchdog should exit.
    async fn watchdog_tick(&self, cancel: &CancellationToken, armed: &mut bool) -> bool {
        let config = self.config.get();
        let running = self.probe.is_running(&config.target_process);
        let mut inner = self.inner.lock().await;
        if cancel.is_cancelled() {
            return false;
        }
        match (inner.source.is_some(), running) {
            (false, true) if *armed => {
                info!("'{}' detected", config.target_process);
                self.launch(&mut inner, &config).await;
            }
            (false, false) => *armed = true,
            (true, false) => {
                info!("'{}' exited", config.target_process);
                self.shutdown_source(&mut inner).await;
                if !config.auto_start {
                    // Detach ourselves; the task ends after this tick.
                    inner.watchdog = None;
                    return false;
                }
                self.state.send_replace(LifecycleState::WatchingForGame);
                *armed = true;
            }
            _ => {}
        }
        true
    }

    // ── heartbeat ─────────────────────────────────────────────────────────────

    fn spawn_heartbeat(&self, config: &BridgeConfig) -> Worker {
        let cancel = CancellationToken::new();
        let params = Arc::clone(&self.params);
        let settle = Duration::from_millis(config.heartbeat.settle_ms);
        Worker::spawn(
            cancel.clone(),
            heartbeat::run(self.authoritative.subscribe(), settle, cancel, move |beat| {
                params.lock().set_beat(beat.is_beat());
            }),
        )
    }

    pub async fn start_beat(&self) {
        let mut inner = self.inner.lock().await;
        if inner.heartbeat.is_some() {
            debug!("heartbeat already running");
            return;
        }
        let config = self.config.get();
        inner.heartbeat = Some(self.spawn_heartbeat(&config));
        info!("heartbeat started");
    }

    pub async fn stop_beat(&self) {
        let worker = self.inner.lock().await.heartbeat.take();
        if let Some(w) = worker {
            w.stop().await;
            info!("heartbeat stopped");
        }
    }

    // ── config ────────────────────────────────────────────────────────────────

    pub async fn refresh_config(&self) {
        let config = match self.config.reload() {
            Ok(c) => c,
            Err(e) => {
                error!("refresh-config: {e}; keeping the previous configuration");
                return;
            }
        };
        {
            let mut params = self.params.lock();
            params.apply_config(&config);
            info!("parameter names: {:?}", name_table(&params));
            let (bpm, state) = *self.latest.lock();
            params.update(bpm, state);
        }

        let mut inner = self.inner.lock().await;
        let changed = match (&inner.source, config.descriptor()) {
            (Some(source), Ok(d)) => *source.descriptor() != d,
            _ => false,
        };
        if changed {
            info!("source configuration changed, rebuilding");
            self.shutdown_source(&mut inner).await;
            self.launch(&mut inner, &config).await;
        }
        if !config.heartbeat.enabled {
            if let Some(w) = inner.heartbeat.take() {
                w.stop().await;
            }
        } else if inner.source.is_some() && inner.heartbeat.is_none() {
            inner.heartbeat = Some(self.spawn_heartbeat(&config));
        }
        info!("configuration refreshed");
    }

    // ── sdk ───────────────────────────────────────────────────────────────────

    async fn destroy_sdk(&self, name: &str) {
        let inner = self.inner.lock().await;
        match inner.source.as_ref().and_then(|s| s.sdk_broker()) {
            Some(broker) => {
                if broker.destroy(name) == 0 {
                    warn!("destroy-sdk: no reporter named '{name}'");
                }
            }
            None => warn!("destroy-sdk: the active source is not an SDK bridge"),
        }
    }
}

/// Forward a source's streams into the parameter synchronizer.
async fn pump(
    mut hr: watch::Receiver<HeartRateSample>,
    mut connected: watch::Receiver<bool>,
    params: Arc<Mutex<ParameterSync>>,
    authoritative: Arc<watch::Sender<Option<u32>>>,
    latest: Arc<Mutex<(u32, ConnectivityState)>>,
    cancel: CancellationToken,
) {
    let mut was_connected = false;
    loop {
        let bpm = hr.borrow_and_update().bpm;
        let is_connected = *connected.borrow_and_update();
        let state = ConnectivityState::derive(true, is_connected, bpm);
        if was_connected && !is_connected {
            warn!("no heart-rate data available");
        }
        was_connected = is_connected;

        *latest.lock() = (bpm, state);
        params.lock().update(bpm, state);
        authoritative.send_if_modified(|current| {
            let next = is_connected.then_some(bpm);
            let changed = *current != next;
            *current = next;
            changed
        });

        tokio::select! {
            _ = cancel.cancelled() => break,
            r = hr.changed() => if r.is_err() { break },
            r = connected.changed() => if r.is_err() { break },
        }
    }
}
