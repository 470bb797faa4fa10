//! Realtime channel over the Phoenix websocket protocol
//!
//! One socket per subscription: join `postgres_changes` for a table with an
//! optional `column=eq.value` filter, heartbeat on an interval, forward row
//! changes to the [`ChangeStream`](super::ChangeStream), and reconnect with
//! exponential backoff until the stream is dropped.

use super::CHANGE_STREAM_CAPACITY;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use shared::message::{ChangeEvent, ChangeFilter, ChangeKind, Table};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Initial reconnect delay
const INITIAL_RETRY_DELAY_SECS: u64 = 1;
/// Max reconnect delay
const MAX_RECONNECT_DELAY_SECS: u64 = 30;
/// Time allowed for the join reply
const JOIN_TIMEOUT_SECS: u64 = 10;

/// Current access token, read on every (re)join and heartbeat
pub(crate) type TokenSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Phoenix frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct PhxMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhxMessage {
    fn new(topic: &str, event: &str, payload: Value, reference: u64) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.to_string()),
            join_ref: None,
        }
    }

    fn to_ws(&self) -> Message {
        // Serializing a struct of strings and a Value cannot fail
        Message::Text(serde_json::to_string(self).unwrap_or_default().into())
    }
}

/// Channel parameters
#[derive(Clone)]
pub(crate) struct ChannelConfig {
    /// `wss://.../realtime/v1/websocket?apikey=..&vsn=1.0.0`
    pub url: String,
    pub table: Table,
    pub filter: Option<ChangeFilter>,
    pub heartbeat: Duration,
    pub token: TokenSource,
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("table", &self.table)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl ChannelConfig {
    pub fn topic(&self) -> String {
        match &self.filter {
            Some(f) => format!("realtime:{}:{}", self.table, f.value),
            None => format!("realtime:{}", self.table),
        }
    }

    pub fn join_payload(&self, access_token: &str) -> Value {
        let mut change = json!({
            "event": "*",
            "schema": "public",
            "table": self.table.as_str(),
        });
        if let Some(f) = &self.filter {
            change["filter"] = json!(f.to_string());
        }
        json!({
            "config": {
                "broadcast": {"self": false},
                "presence": {"key": ""},
                "postgres_changes": [change],
            },
            "access_token": access_token,
        })
    }
}

/// Websocket URL for a backend base URL
pub(crate) fn socket_url(base_url: &str, anon_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/realtime/v1/websocket?apikey={anon_key}&vsn=1.0.0")
}

/// Decode a `postgres_changes` payload into a change event
pub(crate) fn decode_change(payload: &Value) -> Option<ChangeEvent> {
    let data = payload.get("data")?;
    let kind = ChangeKind::parse(
        data.get("eventType")
            .or_else(|| data.get("type"))
            .and_then(Value::as_str)?,
    )?;
    let table = Table::from_name(data.get("table").and_then(Value::as_str)?)?;
    let row = |key: &str| {
        data.get(key)
            .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
            .cloned()
    };
    Some(ChangeEvent::new(
        kind,
        table,
        row("new").or_else(|| row("record")),
        row("old").or_else(|| row("old_record")),
    ))
}

enum SessionEnd {
    Cancelled,
    Disconnected(String),
}

/// Spawn the channel task and return the receiving half
pub(crate) fn spawn_channel(channel: ChannelConfig, cancel: CancellationToken) -> mpsc::Receiver<ChangeEvent> {
    let (tx, rx) = mpsc::channel(CHANGE_STREAM_CAPACITY);
    tokio::spawn(run(channel, tx, cancel));
    rx
}

/// Main run loop - connect, join, pump events, reconnect on failure
async fn run(channel: ChannelConfig, tx: mpsc::Sender<ChangeEvent>, cancel: CancellationToken) {
    let topic = channel.topic();
    tracing::info!(topic = %topic, "Realtime channel started");
    let mut reconnect_delay = Duration::from_secs(INITIAL_RETRY_DELAY_SECS);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match tokio_tungstenite::connect_async(channel.url.as_str()).await {
            Ok((ws, _response)) => {
                match run_session(&channel, &topic, ws, &tx, &cancel, &mut reconnect_delay).await {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Disconnected(reason) => {
                        tracing::warn!(
                            topic = %topic,
                            delay_secs = reconnect_delay.as_secs(),
                            "Realtime disconnected, reconnecting: {reason}"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    topic = %topic,
                    delay_secs = reconnect_delay.as_secs(),
                    "Realtime connect failed: {e}"
                );
            }
        }

        if tx.is_closed() {
            break;
        }

        // Wait before reconnecting
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(reconnect_delay) => {},
        }
        reconnect_delay = (reconnect_delay * 2).min(Duration::from_secs(MAX_RECONNECT_DELAY_SECS));
    }

    tracing::info!(topic = %topic, "Realtime channel stopped");
}

async fn run_session<S>(
    channel: &ChannelConfig,
    topic: &str,
    ws: S,
    tx: &mpsc::Sender<ChangeEvent>,
    cancel: &CancellationToken,
    reconnect_delay: &mut Duration,
) -> SessionEnd
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut next_ref: u64 = 1;
    let join_ref = next_ref.to_string();
    let mut sent_token = (channel.token)();

    let mut join = PhxMessage::new(topic, "phx_join", channel.join_payload(&sent_token), next_ref);
    join.join_ref = Some(join_ref.clone());
    if let Err(e) = sink.send(join.to_ws()).await {
        return SessionEnd::Disconnected(format!("join send failed: {e}"));
    }

    let mut joined = false;
    let join_deadline = tokio::time::Instant::now() + Duration::from_secs(JOIN_TIMEOUT_SECS);
    let mut heartbeat = tokio::time::interval(channel.heartbeat.max(Duration::from_secs(1)));
    heartbeat.tick().await; // skip immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                next_ref += 1;
                let leave = PhxMessage::new(topic, "phx_leave", json!({}), next_ref);
                let _ = sink.send(leave.to_ws()).await;
                let _ = sink.close().await;
                return SessionEnd::Cancelled;
            }

            _ = tokio::time::sleep_until(join_deadline), if !joined => {
                return SessionEnd::Disconnected("join timed out".into());
            }

            _ = heartbeat.tick() => {
                next_ref += 1;
                let beat = PhxMessage::new("phoenix", "heartbeat", json!({}), next_ref);
                if sink.send(beat.to_ws()).await.is_err() {
                    return SessionEnd::Disconnected("heartbeat failed".into());
                }
                let token = (channel.token)();
                if joined && token != sent_token {
                    next_ref += 1;
                    let update = PhxMessage::new(topic, "access_token", json!({"access_token": token}), next_ref);
                    if sink.send(update.to_ws()).await.is_err() {
                        return SessionEnd::Disconnected("token update failed".into());
                    }
                    sent_token = token;
                }
            }

            msg = stream.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) => return SessionEnd::Disconnected("closed by server".into()),
                    Some(Err(e)) => return SessionEnd::Disconnected(e.to_string()),
                    None => return SessionEnd::Disconnected("stream ended".into()),
                    _ => continue, // Binary, Pong, Frame
                };

                let frame: PhxMessage = match serde_json::from_str(text.as_str()) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::debug!(topic = %topic, "Unparseable realtime frame: {e}");
                        continue;
                    }
                };
                if frame.topic != topic {
                    continue;
                }

                match frame.event.as_str() {
                    "phx_reply" if frame.reference.as_deref() == Some(join_ref.as_str()) => {
                        let status = frame.payload.get("status").and_then(Value::as_str).unwrap_or("");
                        if status != "ok" {
                            return SessionEnd::Disconnected(format!("join rejected: {}", frame.payload));
                        }
                        joined = true;
                        *reconnect_delay = Duration::from_secs(INITIAL_RETRY_DELAY_SECS);
                        tracing::info!(topic = %topic, "Realtime channel joined");
                    }
                    "postgres_changes" => {
                        if let Some(event) = decode_change(&frame.payload) {
                            if tx.send(event).await.is_err() {
                                return SessionEnd::Cancelled;
                            }
                        }
                    }
                    "phx_error" | "phx_close" => {
                        return SessionEnd::Disconnected(format!("channel {}", frame.event));
                    }
                    "system" => {
                        tracing::debug!(topic = %topic, payload = %frame.payload, "Realtime system message");
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(filter: Option<ChangeFilter>) -> ChannelConfig {
        ChannelConfig {
            url: socket_url("https://demo.supabase.co/", "anon"),
            table: Table::Orders,
            filter,
            heartbeat: Duration::from_secs(25),
            token: Arc::new(|| "tok".to_string()),
        }
    }

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("https://demo.supabase.co/", "k"),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
        assert!(socket_url("http://localhost:54321", "k").starts_with("ws://localhost:54321/"));
    }

    #[test]
    fn test_join_payload() {
        let s = channel(Some(ChangeFilter::eq("branch_id", "b1")));
        assert_eq!(s.topic(), "realtime:orders:b1");
        let payload = s.join_payload("tok");
        let change = &payload["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "orders");
        assert_eq!(change["event"], "*");
        assert_eq!(change["filter"], "branch_id=eq.b1");
        assert_eq!(payload["access_token"], "tok");

        let unfiltered = channel(None).join_payload("tok");
        assert!(unfiltered["config"]["postgres_changes"][0].get("filter").is_none());
    }

    #[test]
    fn test_decode_change() {
        let frame: PhxMessage = serde_json::from_value(json!({
            "topic": "realtime:orders:b1",
            "event": "postgres_changes",
            "ref": null,
            "payload": {
                "data": {
                    "schema": "public",
                    "table": "orders",
                    "eventType": "UPDATE",
                    "new": {"id": "o1", "status": "Ready"},
                    "old": {"id": "o1"}
                },
                "ids": [1]
            }
        }))
        .unwrap();
        let event = decode_change(&frame.payload).unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.table, Table::Orders);
        assert_eq!(event.record_id(), Some("o1"));

        let delete = decode_change(&json!({
            "data": {"table": "notifications", "eventType": "DELETE", "new": {}, "old": {"id": "n1"}}
        }))
        .unwrap();
        assert!(delete.new.is_none());
        assert_eq!(delete.record_id(), Some("n1"));

        assert!(decode_change(&json!({"data": {"table": "unknown", "eventType": "INSERT"}})).is_none());
    }

    #[test]
    fn test_frame_serialization() {
        let mut join = PhxMessage::new("realtime:orders", "phx_join", json!({}), 1);
        join.join_ref = Some("1".into());
        let v = serde_json::to_value(&join).unwrap();
        assert_eq!(v["ref"], "1");
        assert_eq!(v["join_ref"], "1");

        let beat = serde_json::to_value(PhxMessage::new("phoenix", "heartbeat", json!({}), 2)).unwrap();
        assert!(beat.get("join_ref").is_none());
    }
}
