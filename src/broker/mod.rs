//! SDK bridge broker.
//!
//! Merges two kinds of reporters into one table:
//!
//! * local plugins ([`SdkPlugin`]) driven by the broker's tick loop, and
//! * remote clients speaking the line-delimited [`SdkMessage`] protocol over TCP.
//!
//! [`BrokerHandle::preferred`] arbitrates which reporter is authoritative.
//!
//! ```text
//!  plugin A ─┐                       ┌─ tick (100 ms): plugin update, publish
//!  plugin B ─┼─► reports (BTreeMap) ─┤
//!  client 1 ─┤   Local(..) < Remote  └─ every 10th tick: UpdateMessage → clients
//!  client 2 ─┘
//! ```

mod plugin;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::{encode_message, decode_message, HrMessage, LogMessage, SdkMessage};
use crate::source::SourceSignals;
use crate::supervisor::SessionEnd;
use crate::types::SdkReport;

pub use plugin::{PluginFactory, PluginManifest, PluginRegistry, SdkPlugin, TextFilePlugin};

/// Broker tick period.
pub const TICK: Duration = Duration::from_millis(100);

/// Remote clients receive an `UpdateMessage` every this many ticks (~1 Hz).
pub const KEEPALIVE_EVERY_TICKS: u64 = 10;

// ── Bias ──────────────────────────────────────────────────────────────────────

/// Preferred SDK name, owned by the orchestrator and shared by handle.
#[derive(Clone, Default, Debug)]
pub struct SdkBias(Arc<RwLock<Option<String>>>);

impl SdkBias {
    pub fn set(&self, name: Option<String>) {
        *self.0.write() = name;
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }
}

// ── Reporter table ────────────────────────────────────────────────────────────

/// Key of one reporter. Ordering is arbitration priority: every local plugin
/// sorts before every remote client, then by arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReporterKey {
    Local(u64),
    Remote(u64),
}

/// Pick the authoritative reporter.
///
/// A biased name wins when one of its reporters is active; otherwise the
/// first active reporter in priority order is used. `None` means no
/// authoritative reading exists.
pub fn arbitrate(
    reports: &BTreeMap<ReporterKey, SdkReport>,
    bias: Option<&str>,
) -> Option<SdkReport> {
    if let Some(name) = bias {
        if let Some(r) = reports.values().find(|r| r.sdk_name == name && r.is_active) {
            return Some(r.clone());
        }
    }
    reports.values().find(|r| r.is_active).cloned()
}

struct RemoteClient {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<SdkMessage>,
    cancel: CancellationToken,
}

struct LocalPlugin {
    id: u64,
    plugin: Box<dyn SdkPlugin>,
}

struct BrokerState {
    reports: RwLock<BTreeMap<ReporterKey, SdkReport>>,
    remotes: Mutex<HashMap<u64, RemoteClient>>,
    plugins: Mutex<Vec<LocalPlugin>>,
    /// Local reporters whose sinks may still write.
    live: RwLock<HashSet<ReporterKey>>,
    next_id: AtomicU64,
    bias: SdkBias,
    local_addr: Mutex<Option<SocketAddr>>,
}

// ── ReadingSink ───────────────────────────────────────────────────────────────

/// Emit-reading callback handed to a local plugin.
#[derive(Clone)]
pub struct ReadingSink {
    state: Weak<BrokerState>,
    key: ReporterKey,
}

impl ReadingSink {
    /// Record the plugin's latest reading. A no-op after the plugin is removed.
    pub fn emit(&self, report: SdkReport) {
        if let Some(state) = self.state.upgrade() {
            if state.live.read().contains(&self.key) {
                state.reports.write().insert(self.key, report);
            }
        }
    }
}

// ── BrokerHandle ──────────────────────────────────────────────────────────────

/// Shared access to the broker's reporter table and lifecycle hooks.
#[derive(Clone)]
pub struct BrokerHandle {
    state: Arc<BrokerState>,
}

impl BrokerHandle {
    pub fn new(bias: SdkBias) -> Self {
        Self {
            state: Arc::new(BrokerState {
                reports: RwLock::new(BTreeMap::new()),
                remotes: Mutex::new(HashMap::new()),
                plugins: Mutex::new(Vec::new()),
                live: RwLock::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                bias,
                local_addr: Mutex::new(None),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.state.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The authoritative reading under the current bias.
    pub fn preferred(&self) -> Option<SdkReport> {
        let bias = self.state.bias.get();
        arbitrate(&self.state.reports.read(), bias.as_deref())
    }

    /// Snapshot of every tracked reporter in priority order.
    pub fn reports(&self) -> Vec<(ReporterKey, SdkReport)> {
        self.state
            .reports
            .read()
            .iter()
            .map(|(k, r)| (*k, r.clone()))
            .collect()
    }

    pub fn bias(&self) -> &SdkBias {
        &self.state.bias
    }

    /// Address the TCP listener is bound to, once it is.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.state.local_addr.lock()
    }

    /// Initialise `plugin` and start ticking it.
    ///
    /// Returns `false` (and drops the plugin) when `initialize` fails.
    pub fn attach_plugin(&self, mut plugin: Box<dyn SdkPlugin>) -> bool {
        let id = self.next_id();
        let key = ReporterKey::Local(id);
        let sink = ReadingSink {
            state: Arc::downgrade(&self.state),
            key,
        };
        // Live before initialize so readings emitted from it are kept.
        self.state.live.write().insert(key);
        let name = plugin.name().to_owned();
        match plugin.initialize(sink) {
            Ok(()) => {
                self.state.plugins.lock().push(LocalPlugin { id, plugin });
                info!("sdk: plugin '{name}' attached");
                true
            }
            Err(e) => {
                warn!("sdk: plugin '{name}' failed to initialize: {e}");
                self.state.live.write().remove(&key);
                self.state.reports.write().remove(&key);
                false
            }
        }
    }

    /// Disconnect (remote) or tear down (local) every reporter named `name`.
    ///
    /// Returns how many reporters were removed. Teardown errors are logged.
    pub fn destroy(&self, name: &str) -> usize {
        let keys: Vec<ReporterKey> = self
            .state
            .reports
            .read()
            .iter()
            .filter(|(_, r)| r.sdk_name == name)
            .map(|(k, _)| *k)
            .collect();

        let mut removed = 0;
        let mut plugins = self.state.plugins.lock();
        let mut local_ids: Vec<u64> = keys
            .iter()
            .filter_map(|k| match k {
                ReporterKey::Local(id) => Some(*id),
                ReporterKey::Remote(_) => None,
            })
            .collect();
        // Plugins that never emitted are still matched by name.
        for p in plugins.iter() {
            if p.plugin.name() == name && !local_ids.contains(&p.id) {
                local_ids.push(p.id);
            }
        }
        plugins.retain_mut(|p| {
            if !local_ids.contains(&p.id) {
                return true;
            }
            if let Err(e) = p.plugin.teardown() {
                error!("sdk: teardown of '{name}' failed: {e}");
            }
            removed += 1;
            false
        });
        drop(plugins);

        let mut remotes = self.state.remotes.lock();
        for key in &keys {
            if let ReporterKey::Remote(id) = key {
                if let Some(client) = remotes.remove(id) {
                    info!("sdk: disconnecting '{name}' at {}", client.addr);
                    client.cancel.cancel();
                    removed += 1;
                }
            }
        }
        drop(remotes);

        let mut live = self.state.live.write();
        let mut reports = self.state.reports.write();
        for key in &keys {
            reports.remove(key);
        }
        for id in &local_ids {
            live.remove(&ReporterKey::Local(*id));
            reports.remove(&ReporterKey::Local(*id));
        }
        drop(reports);
        drop(live);
        info!("sdk: destroyed {removed} reporter(s) named '{name}'");
        removed
    }

    /// Tear down every local plugin and drop every remote client.
    pub fn shutdown(&self) {
        for mut p in self.state.plugins.lock().drain(..) {
            if let Err(e) = p.plugin.teardown() {
                error!("sdk: teardown of '{}' failed: {e}", p.plugin.name());
            }
        }
        for (_, client) in self.state.remotes.lock().drain() {
            client.cancel.cancel();
        }
        self.state.live.write().clear();
        self.state.reports.write().clear();
        *self.state.local_addr.lock() = None;
    }

    // ── tick ──────────────────────────────────────────────────────────────────

    /// One broker tick: update plugins, send keep-alives every
    /// [`KEEPALIVE_EVERY_TICKS`], and publish the preferred reading.
    pub fn tick(&self, tick: u64, signals: &SourceSignals) {
        for p in self.state.plugins.lock().iter_mut() {
            p.plugin.update();
        }

        if tick % KEEPALIVE_EVERY_TICKS == 0 {
            for client in self.state.remotes.lock().values() {
                let _ = client.tx.send(SdkMessage::Update);
            }
        }

        match self.preferred() {
            Some(report) => {
                signals.set_connected(report.is_open);
                if report.bpm != signals.current_bpm() {
                    signals.publish(report.bpm);
                }
            }
            None => {
                if signals.is_connected() {
                    warn!("sdk: no active reporter; no heart-rate data available");
                }
                signals.reset();
            }
        }
    }

    // ── server ────────────────────────────────────────────────────────────────

    /// Bind `bind` and accept remote reporters until `cancel` fires.
    pub async fn serve(&self, bind: &str, cancel: CancellationToken) -> Result<SessionEnd> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        *self.state.local_addr.lock() = Some(addr);
        info!("sdk: listening on {addr}");

        let mut clients = JoinSet::new();
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(done) = clients.join_next(), if !clients.is_empty() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            error!("sdk: client task panicked: {e}");
                        }
                    }
                    continue;
                }
                r = listener.accept() => match r {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("sdk: accept failed: {e}");
                        continue;
                    }
                },
            };
            let id = self.next_id();
            let client_cancel = cancel.child_token();
            let handle = self.clone();
            clients.spawn(async move {
                handle.serve_client(id, peer, stream, client_cancel).await;
            });
        }
        drop(listener);
        // Every client token is a child of `cancel`, so these all finish.
        while clients.join_next().await.is_some() {}
        *self.state.local_addr.lock() = None;
        Ok(SessionEnd::Connected)
    }

    async fn serve_client(
        &self,
        id: u64,
        peer: SocketAddr,
        stream: TcpStream,
        cancel: CancellationToken,
    ) {
        info!("sdk: client #{id} connected from {peer}");
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let (tx, mut rx) = mpsc::unbounded_channel::<SdkMessage>();
        self.state.remotes.lock().insert(
            id,
            RemoteClient {
                addr: peer,
                tx: tx.clone(),
                cancel: cancel.clone(),
            },
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(msg) = rx.recv() => {
                    let line = match encode_message(&msg) {
                        Ok(line) => line,
                        Err(e) => {
                            warn!("sdk: cannot encode {msg:?}: {e}");
                            continue;
                        }
                    };
                    let written = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = writer.write_all(line.as_bytes()) => r,
                    };
                    if let Err(e) = written {
                        debug!("sdk: client #{id} write failed: {e}");
                        break;
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_message(&line) {
                            Ok(msg) => self.handle_message(id, msg, &tx),
                            Err(e) => warn!("sdk: client #{id}: {e}"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("sdk: client #{id} read failed: {e}");
                        break;
                    }
                }
            }
        }

        let _ = writer.shutdown().await;
        self.state.remotes.lock().remove(&id);
        self.state.reports.write().remove(&ReporterKey::Remote(id));
        info!("sdk: client #{id} disconnected");
    }

    fn handle_message(&self, id: u64, msg: SdkMessage, reply: &mpsc::UnboundedSender<SdkMessage>) {
        match msg {
            SdkMessage::Hr(hr) => {
                let report = SdkReport::from(hr);
                debug!("sdk: client #{id} '{}' {} bpm", report.sdk_name, report.bpm);
                self.state.reports.write().insert(ReporterKey::Remote(id), report);
            }
            SdkMessage::Log(LogMessage { level, text }) => {
                match level.to_ascii_lowercase().as_str() {
                    "debug" | "trace" => debug!("sdk[#{id}]: {text}"),
                    "warn" | "warning" => warn!("sdk[#{id}]: {text}"),
                    "error" => error!("sdk[#{id}]: {text}"),
                    _ => info!("sdk[#{id}]: {text}"),
                }
            }
            SdkMessage::GetHrData => {
                let current = self.preferred().unwrap_or_default();
                let _ = reply.send(SdkMessage::Hr(HrMessage::from(&current)));
            }
            SdkMessage::Update => debug!("sdk: client #{id} keep-alive"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use std::sync::atomic::AtomicUsize;

    fn report(name: &str, bpm: u32, active: bool) -> SdkReport {
        SdkReport {
            sdk_name: name.into(),
            bpm,
            is_open: true,
            is_active: active,
        }
    }

    #[test]
    fn local_reporters_outrank_remote() {
        let mut reports = BTreeMap::new();
        reports.insert(ReporterKey::Remote(1), report("remote", 90, true));
        reports.insert(ReporterKey::Local(7), report("local", 60, true));
        assert_eq!(arbitrate(&reports, None).unwrap().sdk_name, "local");
    }

    #[test]
    fn inactive_bias_falls_through_in_priority_order() {
        let mut reports = BTreeMap::new();
        reports.insert(ReporterKey::Local(1), report("idle-local", 0, false));
        reports.insert(ReporterKey::Local(2), report("local", 61, true));
        reports.insert(ReporterKey::Remote(3), report("biased", 99, false));
        reports.insert(ReporterKey::Remote(4), report("remote", 70, true));

        assert_eq!(arbitrate(&reports, Some("biased")).unwrap().sdk_name, "local");

        reports.insert(ReporterKey::Remote(3), report("biased", 99, true));
        assert_eq!(arbitrate(&reports, Some("biased")).unwrap().sdk_name, "biased");
    }

    #[test]
    fn no_active_reporter_means_no_reading() {
        let mut reports = BTreeMap::new();
        reports.insert(ReporterKey::Remote(1), report("a", 70, false));
        assert!(arbitrate(&reports, Some("a")).is_none());
        assert!(arbitrate(&BTreeMap::new(), None).is_none());
    }

    struct CountingPlugin {
        name: &'static str,
        bpm: u32,
        sink: Option<ReadingSink>,
        updates: Arc<AtomicUsize>,
        fail_teardown: bool,
    }

    impl SdkPlugin for CountingPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn initialize(&mut self, sink: ReadingSink) -> Result<()> {
            self.sink = Some(sink);
            Ok(())
        }

        fn update(&mut self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
            if let Some(sink) = &self.sink {
                sink.emit(report(self.name, self.bpm, true));
            }
        }

        fn teardown(&mut self) -> Result<()> {
            if self.fail_teardown {
                return Err(BridgeError::Configuration("stuck".into()));
            }
            Ok(())
        }
    }

    fn counting(
        name: &'static str,
        bpm: u32,
        fail_teardown: bool,
    ) -> (Box<dyn SdkPlugin>, Arc<AtomicUsize>) {
        let updates = Arc::new(AtomicUsize::new(0));
        let plugin = CountingPlugin {
            name,
            bpm,
            sink: None,
            updates: Arc::clone(&updates),
            fail_teardown,
        };
        (Box::new(plugin), updates)
    }

    #[test]
    fn tick_updates_plugins_and_publishes_preferred() {
        let broker = BrokerHandle::new(SdkBias::default());
        let (a, a_updates) = counting("a", 65, false);
        let (b, _) = counting("b", 80, false);
        assert!(broker.attach_plugin(a));
        assert!(broker.attach_plugin(b));

        let signals = SourceSignals::new();
        broker.tick(1, &signals);
        assert_eq!(a_updates.load(Ordering::SeqCst), 1);
        assert_eq!(signals.current_bpm(), 65);
        assert!(signals.is_connected());

        broker.bias().set(Some("b".into()));
        broker.tick(2, &signals);
        assert_eq!(signals.current_bpm(), 80);
    }

    #[test]
    fn destroy_tears_down_and_swallows_errors() {
        let broker = BrokerHandle::new(SdkBias::default());
        let (a, _) = counting("a", 65, true);
        broker.attach_plugin(a);
        let signals = SourceSignals::new();
        broker.tick(1, &signals);
        assert_eq!(broker.reports().len(), 1);

        assert_eq!(broker.destroy("a"), 1);
        assert!(broker.reports().is_empty());
        assert_eq!(broker.destroy("a"), 0);

        broker.tick(2, &signals);
        assert_eq!(signals.current_bpm(), 0);
        assert!(!signals.is_connected());
    }

    #[test]
    fn emit_after_destroy_is_ignored() {
        let broker = BrokerHandle::new(SdkBias::default());
        let (a, _) = counting("a", 65, false);
        broker.attach_plugin(a);
        let sink = ReadingSink {
            state: Arc::downgrade(&broker.state),
            key: ReporterKey::Local(1),
        };
        broker.destroy("a");
        sink.emit(report("a", 70, true));
        assert!(broker.reports().is_empty());
    }

    #[test]
    fn keepalives_go_out_every_tenth_tick() {
        let broker = BrokerHandle::new(SdkBias::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.state.remotes.lock().insert(
            1,
            RemoteClient {
                addr: ([127, 0, 0, 1], 4000).into(),
                tx,
                cancel: CancellationToken::new(),
            },
        );

        let signals = SourceSignals::new();
        let mut sent = Vec::new();
        for tick in 1..=20 {
            broker.tick(tick, &signals);
            while let Ok(msg) = rx.try_recv() {
                assert_eq!(msg, SdkMessage::Update);
                sent.push(tick);
            }
        }
        assert_eq!(sent, vec![10, 20]);
    }

    #[tokio::test]
    async fn serve_joins_its_clients_before_returning() {
        let broker = BrokerHandle::new(SdkBias::default());
        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let broker = broker.clone();
            let cancel = cancel.clone();
            async move { broker.serve("127.0.0.1:0", cancel).await }
        });

        let addr = loop {
            if let Some(addr) = broker.local_addr() {
                break addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let mut client = TcpStream::connect(addr).await.unwrap();
        let line = encode_message(&SdkMessage::Hr(HrMessage {
            sdk_name: "Band".into(),
            bpm: 72,
            is_open: true,
            is_active: true,
        }))
        .unwrap();
        client.write_all(line.as_bytes()).await.unwrap();
        for _ in 0..200 {
            if !broker.reports().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.reports().len(), 1);

        cancel.cancel();
        let end = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(end, SessionEnd::Connected);
        // Client tasks have already cleaned up after themselves.
        assert!(broker.state.remotes.lock().is_empty());
        assert!(broker.reports().is_empty());
        assert!(broker.local_addr().is_none());
    }
}
