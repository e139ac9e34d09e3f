//! Real-time relay: wire frames and transports.
//!
//! The relay is a broadcast bus. A frame sent by one connection is delivered to
//! every other connection, at most once, with no history and no acknowledgement.
//! Clients therefore filter what they receive themselves (echo suppression,
//! receiver check) and deduplicate by message id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::RelayError;
use crate::state::{Message, MessageKind, MessageStatus, QuotedMessage};

const MIN_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Message payload carried by `send_message` / `receive_message`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub id: String,
    pub chat_id: Option<String>,
    pub text: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    #[serde(default)]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub data_type: MessageKind,
    pub created_at: i64,
    #[serde(default)]
    pub quoted_msg: Option<RelayQuote>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayQuote {
    pub sender: String,
    pub text: String,
}

impl RelayMessage {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id.clone(),
            chat_id: Some(msg.conversation_id.clone()),
            text: msg.body.clone(),
            sender_id: msg.sender_address.clone(),
            sender_name: msg.sender_name.clone(),
            receiver_id: msg.receiver_address.clone(),
            data_type: msg.kind,
            created_at: msg.created_at,
            quoted_msg: msg.quoted.as_ref().map(|q| RelayQuote {
                sender: q.sender_name.clone(),
                text: q.text.clone(),
            }),
        }
    }

    pub fn quoted(&self) -> Option<QuotedMessage> {
        self.quoted_msg.as_ref().map(|q| QuotedMessage {
            sender_name: q.sender.clone(),
            text: q.text.clone(),
        })
    }

    /// Status a received copy starts in.
    pub fn received_status(&self) -> MessageStatus {
        MessageStatus::Delivered
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub sender_id: String,
    pub receiver_id: String,
}

/// Everything that travels over the relay socket.
///
/// Clients send the first three; the relay rebroadcasts each under its
/// `receive_*`/`user_*` name.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RelayFrame {
    SendMessage(RelayMessage),
    Typing(TypingSignal),
    StopTyping(TypingSignal),
    ReceiveMessage(RelayMessage),
    UserTyping(TypingSignal),
    UserStopTyping(TypingSignal),
}

impl RelayFrame {
    /// The frame other connections receive when this one is broadcast.
    /// Server-side frames are returned unchanged.
    pub fn into_broadcast(self) -> RelayFrame {
        match self {
            RelayFrame::SendMessage(m) => RelayFrame::ReceiveMessage(m),
            RelayFrame::Typing(t) => RelayFrame::UserTyping(t),
            RelayFrame::StopTyping(t) => RelayFrame::UserStopTyping(t),
            other => other,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            RelayFrame::SendMessage(_) => "send_message",
            RelayFrame::Typing(_) => "typing",
            RelayFrame::StopTyping(_) => "stop_typing",
            RelayFrame::ReceiveMessage(_) => "receive_message",
            RelayFrame::UserTyping(_) => "user_typing",
            RelayFrame::UserStopTyping(_) => "user_stop_typing",
        }
    }

    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Encode(e.to_string()))
    }

    pub fn from_json(text: &str) -> Option<RelayFrame> {
        serde_json::from_str(text).ok()
    }
}

/// What a transport reports back to its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Connected,
    Disconnected,
    Frame(RelayFrame),
}

pub type RelaySink = Arc<dyn Fn(RelayEvent) + Send + Sync>;

/// Outbound half of a live relay connection.
pub trait RelayTransport: Send + Sync {
    /// Fire-and-forget publish. An error only means the frame was dropped.
    fn publish(&self, frame: RelayFrame) -> Result<(), RelayError>;

    fn close(&self);
}

/// Opens relay connections. One connection per session.
pub trait RelayConnector: Send + Sync {
    fn connect(&self, runtime: &tokio::runtime::Handle, sink: RelaySink) -> Arc<dyn RelayTransport>;
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

pub struct WsRelayConnector {
    url: String,
}

impl WsRelayConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

// Close travels through the same queue as frames so it is sent after
// everything published before it.
enum Outbound {
    Frame(String),
    Close,
}

impl RelayConnector for WsRelayConnector {
    fn connect(&self, runtime: &tokio::runtime::Handle, sink: RelaySink) -> Arc<dyn RelayTransport> {
        let (out_tx, out_rx) = flume::unbounded::<Outbound>();
        let alive = Arc::new(AtomicBool::new(true));
        runtime.spawn(ws_connection_loop(
            self.url.clone(),
            out_rx,
            sink,
            alive.clone(),
        ));
        Arc::new(WsRelayTransport { out_tx, alive })
    }
}

struct WsRelayTransport {
    out_tx: flume::Sender<Outbound>,
    alive: Arc<AtomicBool>,
}

impl RelayTransport for WsRelayTransport {
    fn publish(&self, frame: RelayFrame) -> Result<(), RelayError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }
        let text = frame.to_json()?;
        self.out_tx
            .send(Outbound::Frame(text))
            .map_err(|_| RelayError::Closed)
    }

    fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.out_tx.send(Outbound::Close);
        }
    }
}

async fn ws_connection_loop(
    url: String,
    out_rx: flume::Receiver<Outbound>,
    sink: RelaySink,
    alive: Arc<AtomicBool>,
) {
    let mut backoff = MIN_BACKOFF;
    while alive.load(Ordering::SeqCst) {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                backoff = MIN_BACKOFF;
                tracing::info!(url = %url, "relay connected");
                let (mut write, mut read) = ws.split();

                // Frames queued while disconnected are stale by now; the relay has
                // no history, so drop them instead of replaying. Done before
                // announcing the connection so nothing published after it is lost.
                let mut closing = false;
                let mut stale = 0usize;
                for queued in out_rx.drain() {
                    match queued {
                        Outbound::Frame(_) => stale += 1,
                        Outbound::Close => closing = true,
                    }
                }
                if stale > 0 {
                    tracing::debug!(stale, "relay: dropped frames queued while offline");
                }
                sink(RelayEvent::Connected);

                while !closing {
                    tokio::select! {
                        outbound = out_rx.recv_async() => match outbound {
                            Ok(Outbound::Frame(text)) => {
                                if write.send(WsMessage::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(Outbound::Close) | Err(_) => closing = true,
                        },
                        inbound = read.next() => {
                            match inbound {
                                Some(Ok(WsMessage::Text(text))) => {
                                    match RelayFrame::from_json(text.as_str()) {
                                        Some(frame) => sink(RelayEvent::Frame(frame)),
                                        None => tracing::debug!("relay: ignoring malformed frame"),
                                    }
                                }
                                Some(Ok(WsMessage::Close(_))) | None => break,
                                Some(Err(e)) => {
                                    tracing::warn!(err = %e, "relay read error");
                                    break;
                                }
                                Some(Ok(_)) => {}
                            }
                        }
                    }
                }
                if closing {
                    let _ = write.send(WsMessage::Close(None)).await;
                }
                sink(RelayEvent::Disconnected);
                tracing::info!(url = %url, "relay disconnected");
            }
            Err(e) => {
                tracing::warn!(url = %url, err = %e, backoff_ms = backoff.as_millis() as u64, "relay connect failed");
            }
        }
        if !alive.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

// ---------------------------------------------------------------------------
// In-process loopback
// ---------------------------------------------------------------------------

/// In-process relay with the same broadcast semantics as the relay server.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    inner: Arc<LoopbackInner>,
}

#[derive(Default)]
struct LoopbackInner {
    next_id: AtomicU64,
    endpoints: Mutex<HashMap<u64, RelaySink>>,
    // Every frame that went through the hub, in publish order.
    log: Mutex<Vec<RelayFrame>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `frame` to every endpoint except `from` (`None` = everyone).
    pub fn broadcast(&self, from: Option<u64>, frame: RelayFrame) {
        self.inner.log.lock().push(frame.clone());
        let targets: Vec<RelaySink> = {
            let endpoints = self.inner.endpoints.lock();
            endpoints
                .iter()
                .filter(|(id, _)| Some(**id) != from)
                .map(|(_, sink)| sink.clone())
                .collect()
        };
        let frame = frame.into_broadcast();
        for sink in targets {
            sink(RelayEvent::Frame(frame.clone()));
        }
    }

    /// Simulate the connection of every endpoint dropping.
    pub fn disconnect_all(&self) {
        let sinks: Vec<RelaySink> = self.inner.endpoints.lock().values().cloned().collect();
        for sink in sinks {
            sink(RelayEvent::Disconnected);
        }
    }

    pub fn published(&self) -> Vec<RelayFrame> {
        self.inner.log.lock().clone()
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.endpoints.lock().len()
    }
}

impl RelayConnector for LoopbackHub {
    fn connect(&self, _runtime: &tokio::runtime::Handle, sink: RelaySink) -> Arc<dyn RelayTransport> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.endpoints.lock().insert(id, sink.clone());
        sink(RelayEvent::Connected);
        Arc::new(LoopbackTransport {
            hub: self.clone(),
            id,
        })
    }
}

struct LoopbackTransport {
    hub: LoopbackHub,
    id: u64,
}

impl RelayTransport for LoopbackTransport {
    fn publish(&self, frame: RelayFrame) -> Result<(), RelayError> {
        if !self.hub.inner.endpoints.lock().contains_key(&self.id) {
            return Err(RelayError::Closed);
        }
        self.hub.broadcast(Some(self.id), frame);
        Ok(())
    }

    fn close(&self) {
        self.hub.inner.endpoints.lock().remove(&self.id);
    }
}
