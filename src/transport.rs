//! Outbound game transports.
//!
//! A transport is fire-and-forget: [`GameTransport::send`] never blocks and
//! never reports delivery. Failures are logged at `debug!`.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use rosc::{OscMessage, OscPacket, OscType};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{BroadcastConfig, OscConfig};
use crate::error::{BridgeError, Result};
use crate::protocol::{osc_parameter_address, OSC_AVATAR_CHANGE};
use crate::types::{BridgeSignal, ParamValue};

pub trait GameTransport: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, name: &str, value: ParamValue);
}

// ── OSC ───────────────────────────────────────────────────────────────────────

/// UDP OSC sender publishing to `/avatar/parameters/<name>`.
pub struct OscTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscTransport {
    pub async fn connect(cfg: &OscConfig) -> Result<Self> {
        let target = resolve(&cfg.address, cfg.send_port).await?;
        let local: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        info!("osc: sending to {target}");
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl GameTransport for OscTransport {
    fn name(&self) -> &str {
        "osc"
    }

    fn send(&self, name: &str, value: ParamValue) {
        let arg = match value {
            ParamValue::Int(v) => OscType::Int(v),
            ParamValue::Float(v) => OscType::Float(v),
            ParamValue::Bool(v) => OscType::Bool(v),
        };
        let packet = OscPacket::Message(OscMessage {
            addr: osc_parameter_address(name),
            args: vec![arg],
        });
        let buf = match rosc::encoder::encode(&packet) {
            Ok(buf) => buf,
            Err(e) => {
                warn!("osc: cannot encode {name}={value}: {e:?}");
                return;
            }
        };
        if let Err(e) = self.socket.try_send_to(&buf, self.target) {
            debug!("osc: send {name}={value} failed: {e}");
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| BridgeError::Configuration(format!("cannot resolve '{host}'")))
}

/// Listen on the OSC receive port and forward avatar changes to `signals`.
///
/// Returns the bound address and the listener task.
pub async fn spawn_avatar_listener(
    cfg: &OscConfig,
    signals: mpsc::UnboundedSender<BridgeSignal>,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let bind = resolve(&cfg.address, cfg.receive_port).await?;
    let socket = UdpSocket::bind(bind).await?;
    let local = socket.local_addr()?;
    info!("osc: listening on {local}");
    let task = tokio::spawn(async move {
        let mut buf = vec![0u8; rosc::decoder::MTU];
        loop {
            let len = tokio::select! {
                _ = cancel.cancelled() => break,
                r = socket.recv_from(&mut buf) => match r {
                    Ok((len, _)) => len,
                    Err(e) => {
                        debug!("osc: receive failed: {e}");
                        continue;
                    }
                },
            };
            match rosc::decoder::decode_udp(&buf[..len]) {
                Ok((_, packet)) => {
                    for avatar in avatar_changes(packet) {
                        info!("osc: avatar changed to {avatar}");
                        if signals.send(BridgeSignal::AvatarChanged(avatar)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => debug!("osc: undecodable packet: {e:?}"),
            }
        }
    });
    Ok((local, task))
}

/// Avatar ids carried by every `/avatar/change` message in `packet`.
fn avatar_changes(packet: OscPacket) -> Vec<String> {
    match packet {
        OscPacket::Message(msg) if msg.addr == OSC_AVATAR_CHANGE => {
            let id = msg
                .args
                .into_iter()
                .find_map(|a| match a {
                    OscType::String(s) => Some(s),
                    _ => None,
                })
                .unwrap_or_default();
            vec![id]
        }
        OscPacket::Message(_) => Vec::new(),
        OscPacket::Bundle(bundle) => bundle.content.into_iter().flat_map(avatar_changes).collect(),
    }
}

// ── Broadcast ─────────────────────────────────────────────────────────────────

/// TCP server writing `name=value` lines to every connected client.
pub struct BroadcastTransport {
    tx: broadcast::Sender<String>,
    local_addr: SocketAddr,
}

impl BroadcastTransport {
    /// Bind and start accepting clients until `cancel` fires.
    pub async fn bind(
        cfg: &BroadcastConfig,
        cancel: CancellationToken,
    ) -> Result<(Self, JoinHandle<()>)> {
        let listener = TcpListener::bind(&cfg.bind).await?;
        let local_addr = listener.local_addr()?;
        let (tx, _) = broadcast::channel(256);
        info!("broadcast: listening on {local_addr}");

        let accept_tx = tx.clone();
        let task = tokio::spawn(async move {
            loop {
                let (mut stream, peer) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = listener.accept() => match r {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("broadcast: accept failed: {e}");
                            continue;
                        }
                    },
                };
                debug!("broadcast: client {peer} connected");
                let mut rx = accept_tx.subscribe();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let line: String = tokio::select! {
                            _ = cancel.cancelled() => break,
                            r = rx.recv() => match r {
                                Ok(line) => line,
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    warn!("broadcast: client {peer} lagged by {n} updates");
                                    continue;
                                }
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                        };
                        if stream.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    debug!("broadcast: client {peer} gone");
                });
            }
        });
        Ok((Self { tx, local_addr }, task))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl GameTransport for BroadcastTransport {
    fn name(&self) -> &str {
        "broadcast"
    }

    fn send(&self, name: &str, value: ParamValue) {
        // No subscribers is not an error.
        let _ = self.tx.send(format!("{name}={value}\n"));
    }
}

// ── Memory ────────────────────────────────────────────────────────────────────

/// Records every send. Useful for embedding and tests.
#[derive(Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(String, ParamValue)>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything sent since the last call.
    pub fn take(&self) -> Vec<(String, ParamValue)> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Most recent value sent under `name`.
    pub fn last(&self, name: &str) -> Option<ParamValue> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

impl GameTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn send(&self, name: &str, value: ParamValue) {
        self.sent.lock().push((name.to_owned(), value));
    }
}
