/// Realtime change feed over the backend's websocket.
/// Keeps one multiplexed connection, joins one channel per watched table and
/// fans `postgres_changes` events out to local subscriptions.

use crate::error::{ClientError, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::rest::TokenSlot;
use super::{ChangeEvent, ChangeKind, Subscription, Table};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

struct Listener {
    kinds: Vec<ChangeKind>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

struct RealtimeInner {
    ws_url: String,
    tokens: TokenSlot,
    state: Mutex<ConnectionState>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    channels: Mutex<HashMap<Table, Vec<Listener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_ref: AtomicU64,
}

/// Cloneable handle to the shared realtime connection.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<RealtimeInner>,
}

impl RealtimeClient {
    pub fn new(ws_url: String, tokens: TokenSlot) -> Self {
        RealtimeClient {
            inner: Arc::new(RealtimeInner {
                ws_url,
                tokens,
                state: Mutex::new(ConnectionState::Disconnected),
                outgoing: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                next_ref: AtomicU64::new(1),
            }),
        }
    }

    /// Watch `table` for the given kinds of change, connecting first if needed.
    pub async fn subscribe(&self, table: Table, kinds: &[ChangeKind]) -> Result<Subscription> {
        self.ensure_connected().await?;

        let (tx, subscription) = Subscription::channel(table);
        let first = {
            let mut channels = self.inner.channels.lock().await;
            let listeners = channels.entry(table).or_default();
            listeners.push(Listener {
                kinds: kinds.to_vec(),
                tx,
            });
            listeners.len() == 1
        };

        if first {
            self.inner.send_join(table).await?;
        }
        Ok(subscription)
    }

    /// Connect unless already connected or connecting.
    pub async fn ensure_connected(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().await;
            match *state {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    *state = ConnectionState::Connecting;
                }
            }
        }

        self.connect_with_backoff().await
    }

    /// Connect with exponential backoff retry
    async fn connect_with_backoff(&self) -> Result<()> {
        let mut backoff_ms = 1000;
        let max_backoff_ms = 32000;
        let max_retries = 12;

        for attempt in 0..max_retries {
            match self.connect_internal().await {
                Ok(()) => {
                    log::info!("Realtime connected: {}", self.redacted_url());
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Realtime connection attempt {} failed: {}", attempt + 1, e);

                    if attempt == max_retries - 1 {
                        *self.inner.state.lock().await = ConnectionState::Failed;
                        return Err(ClientError::WebSocket(format!(
                            "Failed to connect after {} attempts: {}",
                            max_retries, e
                        )));
                    }

                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
                }
            }
        }

        Err(ClientError::WebSocket(
            "Max reconnection attempts exceeded".to_string(),
        ))
    }

    async fn connect_internal(&self) -> Result<()> {
        let (ws_stream, _) = connect_async(self.inner.ws_url.as_str())
            .await
            .map_err(|e| ClientError::WebSocket(format!("Connection failed: {}", e)))?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel::<String>();

        *self.inner.outgoing.lock().await = Some(msg_tx);
        *self.inner.state.lock().await = ConnectionState::Connected;

        let writer = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if let Err(e) = ws_sender.send(Message::Text(msg.into())).await {
                    log::error!("Failed to send realtime frame: {}", e);
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(result) = ws_receiver.next().await {
                match result {
                    Ok(Message::Text(text)) => inner.route_message(text.as_str()).await,
                    Ok(Message::Close(_)) => {
                        log::info!("Realtime socket closed by server");
                        break;
                    }
                    Err(e) => {
                        log::error!("Realtime socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            *inner.state.lock().await = ConnectionState::Disconnected;
            inner.outgoing.lock().await.take();
            log::info!("Realtime connection closed");
        });

        let inner = self.inner.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = json!({
                    "topic": "phoenix",
                    "event": "heartbeat",
                    "payload": {},
                    "ref": inner.next_ref().to_string(),
                });
                if inner.send_raw(frame.to_string()).await.is_err() {
                    break;
                }
            }
        });

        {
            let mut tasks = self.inner.tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
            tasks.extend([writer, reader, heartbeat]);
        }

        // Rejoin channels that were live before a reconnect
        let tables: Vec<Table> = self.inner.channels.lock().await.keys().copied().collect();
        for table in tables {
            self.inner.send_join(table).await?;
        }

        Ok(())
    }

    /// Periodically reconnect while subscriptions exist but the socket is down.
    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
            loop {
                ticker.tick().await;
                let wanted = !client.inner.channels.lock().await.is_empty();
                let state = client.get_state().await;
                if wanted && matches!(state, ConnectionState::Disconnected | ConnectionState::Failed) {
                    if let Err(e) = client.ensure_connected().await {
                        log::warn!("Realtime reconnect failed: {}", e);
                    }
                }
            }
        })
    }

    /// Close the socket and end every subscription.
    pub async fn stop(&self) {
        *self.inner.state.lock().await = ConnectionState::Disconnected;
        self.inner.outgoing.lock().await.take();
        self.inner.channels.lock().await.clear();
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
        log::info!("Realtime stopped");
    }

    pub async fn get_state(&self) -> ConnectionState {
        *self.inner.state.lock().await
    }

    pub async fn is_connected(&self) -> bool {
        self.get_state().await == ConnectionState::Connected
    }

    fn redacted_url(&self) -> String {
        self.inner
            .ws_url
            .split('?')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

impl RealtimeInner {
    fn next_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_raw(&self, frame: String) -> Result<()> {
        let outgoing = self.outgoing.lock().await;
        match outgoing.as_ref() {
            Some(sender) => sender
                .send(frame)
                .map_err(|e| ClientError::WebSocket(format!("Failed to queue frame: {}", e))),
            None => Err(ClientError::State("Realtime socket not connected".to_string())),
        }
    }

    async fn send_join(&self, table: Table) -> Result<()> {
        let frame = join_frame(table, self.tokens.get().as_deref(), self.next_ref());
        self.send_raw(frame.to_string()).await
    }

    async fn send_leave(&self, table: Table) -> Result<()> {
        let frame = json!({
            "topic": topic(table),
            "event": "phx_leave",
            "payload": {},
            "ref": self.next_ref().to_string(),
        });
        self.send_raw(frame.to_string()).await
    }

    async fn route_message(&self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Unparseable realtime frame: {}", e);
                return;
            }
        };

        match value.get("event").and_then(Value::as_str) {
            Some("postgres_changes") => {}
            Some("phx_reply") => {
                if value["payload"]["status"].as_str() == Some("error") {
                    log::warn!("Realtime join rejected: {}", value["payload"]["response"]);
                }
                return;
            }
            Some("phx_error") | Some("phx_close") => {
                log::warn!("Realtime channel {} closed", value["topic"]);
                return;
            }
            _ => {
                log::debug!("Ignoring realtime frame: {}", value);
                return;
            }
        }

        let Some(event) = parse_change(&value) else {
            log::warn!("Malformed change payload: {}", value);
            return;
        };

        let abandoned = {
            let mut channels = self.channels.lock().await;
            let Some(listeners) = channels.get_mut(&event.table) else {
                return;
            };

            listeners.retain(|l| !l.tx.is_closed());
            for listener in listeners.iter() {
                if listener.kinds.contains(&event.kind) {
                    let _ = listener.tx.send(event.clone());
                }
            }

            if listeners.is_empty() {
                channels.remove(&event.table);
                true
            } else {
                false
            }
        };

        if abandoned {
            if let Err(e) = self.send_leave(event.table).await {
                log::debug!("Could not leave {}: {}", event.table, e);
            }
        }
    }
}

fn topic(table: Table) -> String {
    format!("realtime:public:{}", table.as_str())
}

fn join_frame(table: Table, access_token: Option<&str>, reference: u64) -> Value {
    let mut payload = json!({
        "config": {
            "postgres_changes": [
                { "event": "*", "schema": "public", "table": table.as_str() }
            ]
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }

    json!({
        "topic": topic(table),
        "event": "phx_join",
        "payload": payload,
        "ref": reference.to_string(),
    })
}

/// Extract a change event from a `postgres_changes` frame.
fn parse_change(frame: &Value) -> Option<ChangeEvent> {
    let data = frame.get("payload")?.get("data")?;
    let table = Table::from_name(data.get("table")?.as_str()?)?;
    let kind: ChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    let present = |key: &str| {
        data.get(key)
            .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
            .cloned()
    };

    Some(ChangeEvent {
        table,
        kind,
        record: present("record"),
        old_record: present("old_record"),
    })
}
