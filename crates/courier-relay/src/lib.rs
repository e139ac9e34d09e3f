//! Broadcast relay for courier clients.
//!
//! Every text frame `{"event": E, "data": D}` a client sends is forwarded to
//! every other open connection as `{"event": E', "data": D}`, where `E'` is the
//! server-side name of `E`. Payloads pass through untouched and nothing is
//! stored, so a client that is offline misses what was said meanwhile.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

type Conns = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>>;

/// Server-side event name for a client event. `None` for anything a client is
/// not allowed to send.
pub fn broadcast_event(event: &str) -> Option<&'static str> {
    match event {
        "send_message" => Some("receive_message"),
        "typing" => Some("user_typing"),
        "stop_typing" => Some("user_stop_typing"),
        _ => None,
    }
}

/// The frame other clients receive for `text`, or `None` if it is malformed.
pub fn rewrite_frame(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let event = broadcast_event(value.get("event")?.as_str()?)?;
    let data = value.get("data")?.clone();
    Some(serde_json::json!({ "event": event, "data": data }).to_string())
}

/// Accept and serve connections until `shutdown` resolves.
pub async fn serve(listener: TcpListener, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
    let conns: Conns = Arc::new(Mutex::new(HashMap::new()));
    let next_conn_id = Arc::new(AtomicU64::new(1));
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let open: Vec<mpsc::UnboundedSender<Message>> =
                    conns.lock().values().cloned().collect();
                tracing::info!(connections = open.len(), "relay shutting down");
                for tx in open {
                    let _ = tx.send(Message::Close(None));
                }
                // Let writers flush the close frames.
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Ok(());
            }
            accept = listener.accept() => {
                let (stream, peer) = match accept {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(%e, "accept failed");
                        continue;
                    }
                };
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(handle_connection(stream, peer, conn_id, conns.clone()));
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, conn_id: u64, conns: Conns) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::debug!(%e, %peer, "websocket handshake failed");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    conns.lock().insert(conn_id, out_tx.clone());
    tracing::info!(conn_id, %peer, "client connected");

    // Writer task
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    // Reader loop
    while let Some(Ok(msg)) = ws_rx.next().await {
        match msg {
            Message::Text(text) => match rewrite_frame(text.as_str()) {
                Some(out) => broadcast(&conns, conn_id, out),
                None => tracing::debug!(conn_id, "dropping malformed frame"),
            },
            Message::Ping(p) => {
                let _ = out_tx.send(Message::Pong(p));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    conns.lock().remove(&conn_id);
    writer.abort();
    tracing::info!(conn_id, %peer, "client disconnected");
}

fn broadcast(conns: &Conns, from: u64, text: String) {
    let targets: Vec<mpsc::UnboundedSender<Message>> = conns
        .lock()
        .iter()
        .filter(|(id, _)| **id != from)
        .map(|(_, tx)| tx.clone())
        .collect();
    for tx in targets {
        let _ = tx.send(Message::Text(text.clone().into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_are_renamed() {
        let out = rewrite_frame(r#"{"event":"typing","data":{"senderId":"1","receiverId":"2"}}"#)
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["event"], "user_typing");
        assert_eq!(v["data"]["receiverId"], "2");
    }

    #[test]
    fn malformed_and_server_side_frames_are_dropped() {
        assert_eq!(rewrite_frame("not json"), None);
        assert_eq!(rewrite_frame(r#"{"event":"send_message"}"#), None);
        assert_eq!(rewrite_frame(r#"{"event":"receive_message","data":{}}"#), None);
        assert_eq!(rewrite_frame(r#"["send_message",{}]"#), None);
    }
}
