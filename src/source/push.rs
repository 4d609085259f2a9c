// WebSocket push source
//
// Opens a persistent socket to a heart-rate service, subscribes with the
// provider's handshake, answers keep-alives, and extracts the BPM from the
// provider's JSON envelope. Malformed payloads are logged and dropped; socket
// failures are retried by the supervisor with exponential backoff.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use super::{HeartRateSource, SourceSignals, SourceTasks};
use crate::config::{PushProvider, SourceConfig};
use crate::error::{BridgeError, Result};
use crate::parse::{extract_bpm, keepalive_reply, parse_bpm_text};
use crate::supervisor::{supervise, Backoff, SessionEnd};
use crate::types::{HeartRateSample, SourceDescriptor};

const PULSOID_URL: &str = "wss://dev.pulsoid.net/api/v1/data/real_time";
const HYPERATE_URL: &str = "wss://app.hyperate.io/socket/websocket";
const HYPERATE_HEARTBEAT_SECS: u64 = 10;

// ── Provider plan ─────────────────────────────────────────────────────────────

/// How BPM values are located inside inbound text.
#[derive(Debug, Clone, PartialEq)]
enum Envelope {
    /// JSON; read the value at this pointer.
    Pointer(String),
    /// Phoenix channel events; only `hr_update` carries data.
    Phoenix,
    /// Bare numbers, or JSON at an optional pointer.
    Loose(Option<String>),
}

impl Envelope {
    /// `Ok(None)` for messages that carry no reading (acks, joins, …).
    fn interpret(&self, text: &str) -> Result<Option<u32>> {
        match self {
            Envelope::Pointer(pointer) => {
                let doc: Value = serde_json::from_str(text)?;
                extract_bpm(&doc, pointer).map(Some)
            }
            Envelope::Phoenix => {
                let doc: Value = serde_json::from_str(text)?;
                if doc.get("event").and_then(Value::as_str) != Some("hr_update") {
                    return Ok(None);
                }
                extract_bpm(&doc, "/payload/hr").map(Some)
            }
            Envelope::Loose(pointer) => {
                if let Ok(bpm) = parse_bpm_text(text) {
                    return Ok(Some(bpm));
                }
                let pointer = pointer.as_deref().ok_or_else(|| {
                    BridgeError::ProtocolParse(format!("not a number: {:?}", text.trim()))
                })?;
                let doc: Value = serde_json::from_str(text)?;
                extract_bpm(&doc, pointer).map(Some)
            }
        }
    }
}

/// Everything needed to run one provider session.
#[derive(Debug, Clone)]
struct ProviderPlan {
    label: &'static str,
    url: String,
    subscribe: Option<String>,
    keepalive: Option<(Duration, String)>,
    envelope: Envelope,
}

impl ProviderPlan {
    fn from_provider(provider: &PushProvider) -> Result<Self> {
        match provider {
            PushProvider::Pulsoid { access_token } => {
                if access_token.is_empty() {
                    return Err(BridgeError::Configuration("pulsoid: access_token is empty".into()));
                }
                Ok(Self {
                    label: "pulsoid",
                    url: format!("{PULSOID_URL}?access_token={access_token}"),
                    subscribe: None,
                    keepalive: None,
                    envelope: Envelope::Pointer("/data/heart_rate".into()),
                })
            }
            PushProvider::HypeRate {
                session_id,
                api_key,
            } => {
                if session_id.is_empty() || api_key.is_empty() {
                    return Err(BridgeError::Configuration(
                        "hyperate: session_id and api_key are required".into(),
                    ));
                }
                Ok(Self {
                    label: "hyperate",
                    url: format!("{HYPERATE_URL}?token={api_key}"),
                    subscribe: Some(phoenix_frame(&format!("hr:{session_id}"), "phx_join")),
                    keepalive: Some((
                        Duration::from_secs(HYPERATE_HEARTBEAT_SECS),
                        phoenix_frame("phoenix", "heartbeat"),
                    )),
                    envelope: Envelope::Phoenix,
                })
            }
            PushProvider::Custom {
                url,
                subscribe,
                bpm_pointer,
            } => {
                if url.is_empty() {
                    return Err(BridgeError::Configuration("websocket: url is empty".into()));
                }
                Ok(Self {
                    label: "websocket",
                    url: url.clone(),
                    subscribe: subscribe.clone(),
                    keepalive: None,
                    envelope: Envelope::Loose(bpm_pointer.clone()),
                })
            }
        }
    }
}

fn phoenix_frame(topic: &str, event: &str) -> String {
    serde_json::json!({ "topic": topic, "event": event, "payload": {}, "ref": 0 }).to_string()
}

// ── PushSource ────────────────────────────────────────────────────────────────

pub struct PushSource {
    descriptor: SourceDescriptor,
    plan: ProviderPlan,
    signals: SourceSignals,
    tasks: SourceTasks,
}

impl PushSource {
    pub fn new(descriptor: SourceDescriptor) -> Result<Self> {
        let SourceConfig::Push(provider) = &descriptor.config else {
            return Err(BridgeError::Configuration(format!(
                "{}: not a WebSocket source",
                descriptor.id
            )));
        };
        let plan = ProviderPlan::from_provider(provider)?;
        Ok(Self {
            descriptor,
            plan,
            signals: SourceSignals::new(),
            tasks: SourceTasks::default(),
        })
    }
}

#[async_trait]
impl HeartRateSource for PushSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn start(&mut self) -> Result<()> {
        if self.tasks.is_running() {
            warn!("{}: already started", self.descriptor.id);
            return Ok(());
        }
        let cancel = self.tasks.begin();
        let plan = self.plan.clone();
        let signals = self.signals.clone();
        self.tasks.spawn(async move {
            let label = plan.label;
            supervise(label, Backoff::NETWORK, cancel, |token| {
                run_session(plan.clone(), signals.clone(), token)
            })
            .await;
        });
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

/// One connect → subscribe → read cycle.
async fn run_session(
    plan: ProviderPlan,
    signals: SourceSignals,
    cancel: CancellationToken,
) -> Result<SessionEnd> {
    info!("{}: connecting to {}", plan.label, redact(&plan.url));
    let (ws, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionEnd::NotConnected),
        r = connect_async(plan.url.as_str()) => r?,
    };
    let (mut write, mut read) = ws.split();

    if let Some(subscribe) = &plan.subscribe {
        write.send(Message::Text(subscribe.clone().into())).await?;
    }
    info!("{}: connected", plan.label);
    signals.set_connected(true);

    let (period, frame) = plan
        .keepalive
        .clone()
        .unwrap_or((Duration::from_secs(3600), String::new()));
    let has_keepalive = plan.keepalive.is_some();
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break Ok(());
            }
            _ = keepalive.tick(), if has_keepalive => {
                if let Err(e) = write.send(Message::Text(frame.clone().into())).await {
                    break Err(BridgeError::from(e));
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = keepalive_reply(text.as_str()) {
                        debug!("{}: keep-alive answered", plan.label);
                        if let Err(e) = write.send(Message::Text(reply.into())).await {
                            break Err(BridgeError::from(e));
                        }
                        continue;
                    }
                    match plan.envelope.interpret(text.as_str()) {
                        Ok(Some(bpm)) => signals.publish(bpm),
                        Ok(None) => debug!("{}: ignored {}", plan.label, text.as_str()),
                        Err(e) => warn!("{}: {e}", plan.label),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = write.send(Message::Pong(payload)).await {
                        break Err(BridgeError::from(e));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("{}: closed by server", plan.label);
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(BridgeError::from(e)),
            }
        }
    };

    signals.reset();
    result.map(|()| SessionEnd::Connected)
}

/// Hide query-string secrets (tokens) from logs.
fn redact(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
