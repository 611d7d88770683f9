//! Websocket transport for the hosted realtime service.
//!
//! Each subscription owns one socket joined to a single
//! `realtime:public:<table>` channel. The transport task keeps the socket
//! alive with heartbeats and reconnects with exponential backoff (1 s,
//! doubling, capped at 30 s; reset once a join succeeds) until the
//! subscription is released. Changes that happen while disconnected are
//! not replayed; the next pull picks them up.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{ChangeFeed, Collection, RealtimeError, Subscription};
use crate::api::SupabaseClient;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ============================================================================
// Constants
// ============================================================================

const PROTOCOL_VERSION: &str = "1.0.0";

const SCHEMA: &str = "public";

/// The service drops sockets that stay silent for longer than a minute.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;

const INITIAL_RECONNECT_MS: u64 = 1000;
const MAX_RECONNECT_MS: u64 = 30_000;

/// Events buffered between the socket and the listener.
const EVENT_BUFFER_SIZE: usize = 256;

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(INITIAL_RECONNECT_MS),
            Duration::from_millis(MAX_RECONNECT_MS),
        )
    }
}

/// Wire frame of the channel protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

/// Realtime change feed over the hosted service's websocket endpoint.
#[derive(Clone)]
pub struct PhoenixFeed {
    socket_url: String,
    api_key: String,
    library: Option<String>,
}

impl PhoenixFeed {
    pub fn new(project_url: &str, api_key: &str) -> Self {
        Self {
            socket_url: socket_url(project_url, api_key),
            api_key: api_key.to_string(),
            library: None,
        }
    }

    /// Feed for the same project (and library filter) as `client`.
    pub fn for_client(client: &SupabaseClient, library: Option<String>) -> Self {
        Self::new(client.base_url(), client.api_key()).with_library(library)
    }

    /// Only receive changes for rows of this library.
    pub fn with_library(mut self, library: Option<String>) -> Self {
        self.library = library;
        self
    }

    fn join_message(&self, collection: Collection, join_ref: &str) -> PhoenixMessage {
        let mut change = json!({
            "event": "*",
            "schema": SCHEMA,
            "table": collection.table(),
        });
        if let Some(library) = &self.library {
            change["filter"] = json!(format!("library=eq.{}", library));
        }
        PhoenixMessage {
            topic: topic(collection),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [change],
                },
                "access_token": self.api_key,
            }),
            msg_ref: Some(join_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// Transport task: keep a joined socket open until the receiver goes away.
    async fn run(self, collection: Collection, socket: WsStream, tx: mpsc::Sender<Value>) {
        let mut backoff = Backoff::default();
        let mut socket = Some(socket);

        loop {
            let ws = match socket.take() {
                Some(ws) => ws,
                None => match connect(&self.socket_url).await {
                    Ok(ws) => ws,
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(table = collection.table(), error = %e, delay_ms = delay.as_millis() as u64, "Realtime reconnect failed");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                },
            };

            match self.pump(collection, ws, &tx, &mut backoff).await {
                Ok(()) => {
                    debug!(table = collection.table(), "Subscriber gone, realtime channel closed");
                    return;
                }
                Err(e) => {
                    if tx.is_closed() {
                        return;
                    }
                    let delay = backoff.next_delay();
                    warn!(table = collection.table(), error = %e, delay_ms = delay.as_millis() as u64, "Realtime channel dropped, reconnecting");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Join the channel and forward changes. `Ok` means the subscriber went
    /// away; `Err` means the connection needs to be re-established.
    async fn pump(
        &self,
        collection: Collection,
        ws: WsStream,
        tx: &mpsc::Sender<Value>,
        backoff: &mut Backoff,
    ) -> Result<(), RealtimeError> {
        let (mut sink, mut stream) = ws.split();
        let mut next_ref: u64 = 1;
        let join_ref = next_ref.to_string();
        send(&mut sink, &self.join_message(collection, &join_ref)).await?;

        let mut heartbeat = tokio::time::interval(Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
        heartbeat.tick().await; // first tick completes immediately

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    next_ref += 1;
                    let leave = PhoenixMessage {
                        topic: topic(collection),
                        event: "phx_leave".to_string(),
                        payload: json!({}),
                        msg_ref: Some(next_ref.to_string()),
                        join_ref: Some(join_ref.clone()),
                    };
                    let _ = send(&mut sink, &leave).await;
                    let _ = sink.close().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    next_ref += 1;
                    send(&mut sink, &heartbeat_message(next_ref)).await?;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let msg: PhoenixMessage = match serde_json::from_str(&text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!(error = %e, "Ignoring unparseable realtime frame");
                                continue;
                            }
                        };
                        match msg.event.as_str() {
                            "phx_reply" if msg.msg_ref.as_deref() == Some(join_ref.as_str()) => {
                                let status = msg.payload.get("status").and_then(Value::as_str).unwrap_or("");
                                if status != "ok" {
                                    return Err(RealtimeError::Protocol(format!("join rejected: {}", msg.payload)));
                                }
                                backoff.reset();
                                info!(table = collection.table(), "Joined realtime channel");
                            }
                            "postgres_changes" => match normalize_postgres_change(&msg.payload) {
                                Some(change) => {
                                    if tx.send(change).await.is_err() {
                                        return Ok(());
                                    }
                                }
                                None => warn!(table = collection.table(), "Dropping malformed change frame"),
                            },
                            "phx_error" => {
                                return Err(RealtimeError::Protocol(format!("channel error: {}", msg.payload)));
                            }
                            "phx_close" => return Err(RealtimeError::Closed),
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(RealtimeError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(RealtimeError::Protocol(e.to_string())),
                },
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for PhoenixFeed {
    async fn subscribe(&self, collection: Collection) -> Result<Subscription, RealtimeError> {
        // Connect up front so an unreachable service is reported to the caller
        let socket = connect(&self.socket_url).await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let feed = self.clone();
        let task = tokio::spawn(feed.run(collection, socket, tx));
        info!(table = collection.table(), "Realtime subscription opened");
        Ok(Subscription::new(collection, rx, Some(task)))
    }
}

async fn connect(url: &str) -> Result<WsStream, RealtimeError> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| RealtimeError::Connect(e.to_string()))?;
    Ok(ws)
}

async fn send<S>(sink: &mut S, msg: &PhoenixMessage) -> Result<(), RealtimeError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(msg).map_err(|e| RealtimeError::Protocol(e.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| RealtimeError::Protocol(e.to_string()))
}

fn topic(collection: Collection) -> String {
    format!("realtime:{}:{}", SCHEMA, collection.table())
}

fn heartbeat_message(msg_ref: u64) -> PhoenixMessage {
    PhoenixMessage {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        msg_ref: Some(msg_ref.to_string()),
        join_ref: None,
    }
}

/// Websocket endpoint for a project URL (`https://x.supabase.co` ->
/// `wss://x.supabase.co/realtime/v1/websocket?...`).
fn socket_url(project_url: &str, api_key: &str) -> String {
    let base = project_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!(
        "{}/realtime/v1/websocket?apikey={}&vsn={}",
        ws_base, api_key, PROTOCOL_VERSION
    )
}

/// Turn a `postgres_changes` payload into `{eventType, new, old}`.
fn normalize_postgres_change(payload: &Value) -> Option<Value> {
    let data = payload.get("data")?;
    let kind = data.get("type")?.as_str()?;
    Some(json!({
        "eventType": kind,
        "new": data.get("record").cloned().unwrap_or(Value::Null),
        "old": data.get("old_record").cloned().unwrap_or(Value::Null),
    }))
}
