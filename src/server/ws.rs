//! WebSocket multiplexer: typed channel subscriptions, one-shot requests,
//! binary-framed memory/screenshot streaming and polled memory watches.
//!
//! Binary payloads are always announced first: any frame whose `type` is
//! `memory:update`, `memory:data` or `screenshot:data` is a JSON metadata
//! frame followed by exactly one binary frame carrying the payload. A single
//! writer task owns the sink, so the pair can never be torn apart by
//! interleaved sends.

use crate::address::Address;
use crate::backend::BackendEvent;
use crate::error::{Error, Result};
use crate::server::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use strum_macros::{Display, EnumString};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Floor for memory-watch polling.
const MIN_WATCH_INTERVAL_MS: u64 = 200;
/// Poll interval applied when the client does not name one.
const DEFAULT_WATCH_INTERVAL_MS: u64 = 1000;

const OUT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
enum Channel {
    Status,
    Debug,
    Memory,
    Capture,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { channel: String },
    #[serde(rename = "unsubscribe")]
    Unsubscribe { channel: String },
    #[serde(rename = "exec:pause")]
    ExecPause,
    #[serde(rename = "exec:resume")]
    ExecResume,
    #[serde(rename = "exec:step")]
    ExecStep,
    #[serde(rename = "keys:send")]
    KeysSend {
        keys: Vec<String>,
        #[serde(default)]
        delay: Option<u64>,
    },
    #[serde(rename = "memory:watch")]
    MemoryWatch {
        id: String,
        address: String,
        size: usize,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    #[serde(rename = "memory:unwatch")]
    MemoryUnwatch { id: String },
    #[serde(rename = "memory:read")]
    MemoryRead {
        request_id: String,
        address: String,
        size: usize,
    },
    #[serde(rename = "registers:read")]
    RegistersRead { request_id: String },
    #[serde(rename = "screenshot:take")]
    ScreenshotTake { request_id: String },
}

/// Frames handed to the writer task. `Pair` keeps metadata and payload
/// adjacent on the wire.
enum Outgoing {
    Json(Value),
    Pair(Value, Vec<u8>),
}

struct WatchShared {
    last_hash: StdMutex<Option<[u8; 32]>>,
}

struct Watch {
    task: JoinHandle<()>,
    shared: Arc<WatchShared>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let (out, out_rx) = mpsc::channel(OUT_QUEUE);
    tokio::spawn(write_frames(sink, out_rx));

    let mut backend_events = state.holder.subscribe();
    let mut capture_events = state.capture_events.subscribe();

    let mut conn = Connection {
        id: Uuid::new_v4(),
        state,
        out,
        subscriptions: Arc::new(StdMutex::new(HashSet::new())),
        watches: HashMap::new(),
        suspended: Arc::new(AtomicBool::new(false)),
    };
    info!(target: "ws", "client {} connected", conn.id);

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => conn.handle_text(&text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary/ping/pong from clients: dropped
                Some(Err(e)) => {
                    debug!(target: "ws", "client {} read error: {e}", conn.id);
                    break;
                }
            },
            event = backend_events.recv() => match event {
                Ok(event) => conn.handle_backend_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(target: "ws", "client {} lagged, {skipped} events dropped", conn.id);
                }
                Err(broadcast::error::RecvError::Closed) => {}
            },
            event = capture_events.recv() => match event {
                Ok(event) => {
                    if conn.subscribed(Channel::Capture) {
                        conn.send_json(event).await;
                    }
                }
                Err(_) => {}
            },
        }
    }

    conn.teardown();
    info!(target: "ws", "client {} disconnected", conn.id);
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outgoing>,
) {
    while let Some(frame) = rx.recv().await {
        let sent = match frame {
            Outgoing::Json(value) => sink.send(Message::Text(value.to_string())).await,
            Outgoing::Pair(value, payload) => {
                match sink.send(Message::Text(value.to_string())).await {
                    Ok(()) => sink.send(Message::Binary(payload)).await,
                    Err(e) => Err(e),
                }
            }
        };
        if sent.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

struct Connection {
    id: Uuid,
    state: AppState,
    out: mpsc::Sender<Outgoing>,
    /// Shared with the watch pollers, which only deliver while the client
    /// is subscribed to the `memory` channel.
    subscriptions: Arc<StdMutex<HashSet<Channel>>>,
    watches: HashMap<String, Watch>,
    /// Set while a snapshot load is in flight; watch timers keep firing but
    /// short-circuit.
    suspended: Arc<AtomicBool>,
}

impl Connection {
    fn subscribed(&self, channel: Channel) -> bool {
        self.subscriptions.lock().unwrap().contains(&channel)
    }

    async fn send_json(&self, value: Value) {
        let _ = self.out.send(Outgoing::Json(value)).await;
    }

    async fn send_pair(&self, value: Value, payload: Vec<u8>) {
        let _ = self.out.send(Outgoing::Pair(value, payload)).await;
    }

    async fn send_error(&self, message: String, request_id: Option<String>) {
        let mut frame = json!({ "type": "error", "message": message });
        if let Some(request_id) = request_id {
            frame["requestId"] = Value::String(request_id);
        }
        self.send_json(frame).await;
    }

    async fn handle_text(&mut self, text: &str) {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                self.send_error(format!("bad message: {e}"), None).await;
                return;
            }
        };
        if let Err((error, request_id)) = self.dispatch(message).await {
            self.send_error(error.to_string(), request_id).await;
        }
    }

    async fn dispatch(
        &mut self,
        message: ClientMessage,
    ) -> std::result::Result<(), (Error, Option<String>)> {
        match message {
            ClientMessage::Subscribe { channel } => {
                // unknown channel names are ignored
                if let Ok(channel) = Channel::from_str(&channel) {
                    self.subscriptions.lock().unwrap().insert(channel);
                }
                Ok(())
            }
            ClientMessage::Unsubscribe { channel } => {
                if let Ok(channel) = Channel::from_str(&channel) {
                    self.subscriptions.lock().unwrap().remove(&channel);
                }
                Ok(())
            }
            ClientMessage::ExecPause => self.exec_stop(false).await.map_err(|e| (e, None)),
            ClientMessage::ExecStep => self.exec_stop(true).await.map_err(|e| (e, None)),
            ClientMessage::ExecResume => async {
                self.state.holder.require().await?.resume().await
            }
            .await
            .map_err(|e| (e, None)),
            ClientMessage::KeysSend { keys, delay } => async {
                self.state.holder.require().await?.send_keys(&keys, delay).await
            }
            .await
            .map_err(|e| (e, None)),
            ClientMessage::MemoryWatch {
                id,
                address,
                size,
                interval_ms,
            } => self
                .start_watch(id, &address, size, interval_ms)
                .await
                .map_err(|e| (e, None)),
            ClientMessage::MemoryUnwatch { id } => {
                if let Some(watch) = self.watches.remove(&id) {
                    watch.task.abort();
                }
                Ok(())
            }
            ClientMessage::MemoryRead {
                request_id,
                address,
                size,
            } => self
                .memory_read(request_id.clone(), &address, size)
                .await
                .map_err(|e| (e, Some(request_id))),
            ClientMessage::RegistersRead { request_id } => self
                .registers_read(request_id.clone())
                .await
                .map_err(|e| (e, Some(request_id))),
            ClientMessage::ScreenshotTake { request_id } => self
                .screenshot_take(request_id.clone())
                .await
                .map_err(|e| (e, Some(request_id))),
        }
    }

    /// Pause or step; either way the reply carries the fresh register file.
    async fn exec_stop(&self, step: bool) -> Result<()> {
        let backend = self.state.holder.require().await?;
        let registers = if step {
            backend.step().await?
        } else {
            backend.pause().await?
        };
        self.send_json(json!({
            "type": "debug:step-complete",
            "registers": registers,
            "timestamp": now_ms(),
        }))
        .await;
        Ok(())
    }

    async fn memory_read(&self, request_id: String, address: &str, size: usize) -> Result<()> {
        let address: Address = address.parse()?;
        let backend = self.state.holder.require().await?;
        let bytes = backend.read_memory(address, size).await?;
        let meta = json!({
            "type": "memory:data",
            "requestId": request_id,
            "address": address.to_string(),
            "size": bytes.len(),
            "checksum": crate::capture::sha256_hex(&bytes),
            "timestamp": now_ms(),
        });
        self.send_pair(meta, bytes).await;
        Ok(())
    }

    async fn registers_read(&self, request_id: String) -> Result<()> {
        let backend = self.state.holder.require().await?;
        let registers = backend.read_registers().await?;
        self.send_json(json!({
            "type": "registers:data",
            "requestId": request_id,
            "registers": registers,
            "timestamp": now_ms(),
        }))
        .await;
        Ok(())
    }

    async fn screenshot_take(&self, request_id: String) -> Result<()> {
        let backend = self.state.holder.require().await?;
        let (bytes, format) = backend.screenshot().await?;
        let meta = json!({
            "type": "screenshot:data",
            "requestId": request_id,
            "format": format,
            "timestamp": now_ms(),
        });
        self.send_pair(meta, bytes).await;
        Ok(())
    }

    /// Start (or replace) the watch registered under `id`.
    async fn start_watch(
        &mut self,
        id: String,
        address: &str,
        size: usize,
        interval_ms: Option<u64>,
    ) -> Result<()> {
        let address: Address = address.parse()?;
        let interval_ms = interval_ms
            .unwrap_or(DEFAULT_WATCH_INTERVAL_MS)
            .max(MIN_WATCH_INTERVAL_MS);

        if let Some(previous) = self.watches.remove(&id) {
            previous.task.abort();
        }

        let shared = Arc::new(WatchShared {
            last_hash: StdMutex::new(None),
        });
        let task = spawn_watch(
            self.state.clone(),
            self.out.clone(),
            self.subscriptions.clone(),
            self.suspended.clone(),
            shared.clone(),
            id.clone(),
            address,
            size,
            Duration::from_millis(interval_ms),
        );
        self.watches.insert(id.clone(), Watch { task, shared });

        self.send_json(json!({
            "type": "memory:watching",
            "id": id,
            "intervalMs": interval_ms,
        }))
        .await;
        Ok(())
    }

    /// Clear every watch's last-seen hash so the next poll always reports.
    fn invalidate_watches(&self) {
        for watch in self.watches.values() {
            *watch.shared.last_hash.lock().unwrap() = None;
        }
    }

    async fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Status(info) => {
                if self.subscribed(Channel::Status) {
                    let mut frame = serde_json::to_value(&info).unwrap_or_default();
                    frame["type"] = Value::String("status".into());
                    frame["timestamp"] = json!(now_ms());
                    self.send_json(frame).await;
                }
            }
            BackendEvent::SnapshotLoading { name } => {
                self.suspended.store(true, Ordering::SeqCst);
                if self.subscribed(Channel::Status) {
                    self.send_json(json!({ "type": "snapshot:loading", "name": name }))
                        .await;
                }
            }
            BackendEvent::SnapshotLoaded { name } => {
                self.invalidate_watches();
                self.suspended.store(false, Ordering::SeqCst);
                if self.subscribed(Channel::Status) {
                    self.send_json(json!({ "type": "snapshot:loaded", "name": name }))
                        .await;
                }
            }
            BackendEvent::SnapshotLoadFailed { name, error } => {
                self.invalidate_watches();
                self.suspended.store(false, Ordering::SeqCst);
                if self.subscribed(Channel::Status) {
                    self.send_json(json!({
                        "type": "snapshot:load-failed",
                        "name": name,
                        "error": error,
                    }))
                    .await;
                }
            }
            BackendEvent::BreakpointHit { registers } => {
                if self.subscribed(Channel::Debug) {
                    self.send_json(json!({
                        "type": "debug:breakpoint-hit",
                        "registers": registers,
                        "timestamp": now_ms(),
                    }))
                    .await;
                }
            }
            BackendEvent::StepComplete { registers } => {
                if self.subscribed(Channel::Debug) {
                    self.send_json(json!({
                        "type": "debug:step-complete",
                        "registers": registers,
                        "timestamp": now_ms(),
                    }))
                    .await;
                }
            }
        }
    }

    fn teardown(&mut self) {
        for (_, watch) in self.watches.drain() {
            watch.task.abort();
        }
    }
}

/// One poller per watch. The interval skips missed ticks, so at most one
/// poll is ever in flight; emissions happen only when the content hash
/// changes from the last observed value, and only while the client is
/// subscribed to the `memory` channel.
#[allow(clippy::too_many_arguments)]
fn spawn_watch(
    state: AppState,
    out: mpsc::Sender<Outgoing>,
    subscriptions: Arc<StdMutex<HashSet<Channel>>>,
    suspended: Arc<AtomicBool>,
    shared: Arc<WatchShared>,
    id: String,
    address: Address,
    size: usize,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if suspended.load(Ordering::SeqCst) {
                continue;
            }
            if !subscriptions.lock().unwrap().contains(&Channel::Memory) {
                continue;
            }
            let Some(backend) = state.holder.current().await else {
                continue;
            };
            let bytes = match backend.read_memory(address, size).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(target: "ws", "watch `{id}` poll failed: {e}");
                    continue;
                }
            };
            // a snapshot load may have begun while the poll was in flight
            if suspended.load(Ordering::SeqCst) {
                continue;
            }

            let digest: [u8; 32] = Sha256::digest(&bytes).into();
            let changed = {
                let mut last = shared.last_hash.lock().unwrap();
                if last.map_or(true, |seen| seen != digest) {
                    *last = Some(digest);
                    true
                } else {
                    false
                }
            };
            if changed {
                let meta = json!({
                    "type": "memory:update",
                    "id": id,
                    "address": address.to_string(),
                    "size": bytes.len(),
                    "timestamp": now_ms(),
                });
                if out.send(Outgoing::Pair(meta, bytes)).await.is_err() {
                    break;
                }
            }
        }
    })
}
