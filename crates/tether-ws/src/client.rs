//! The WebSocket RPC client.
//!
//! A client keeps one connection alive in the background, re-dialing with
//! a 2-second floor and presenting the saved `conn=<id>-<security>` pair so
//! the server can resume the session.  Each outbound call registers a
//! callback slot keyed by a fresh 32-bit id; the reply frame (or the
//! timeout sweeper) completes it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tether_rpc::{RpcError, clock};
use tether_wire::{Stream, Value};

use crate::config::ClientConfig;
use crate::server::HANDSHAKE_PATH;

type ClientSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const CONNECT_SETTLE: Duration = Duration::from_millis(30);
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// One in-flight call.
struct CallSlot {
    id: u32,
    time_ns: i64,
    timed_out: AtomicBool,
    /// Holds the request stream until it is sent, then the reply stream.
    stream: Mutex<Option<Stream>>,
    done: Mutex<Option<oneshot::Sender<bool>>>,
}

impl CallSlot {
    fn complete(&self, delivered: bool) {
        if let Some(tx) = self.done.lock().expect("call slot poisoned").take() {
            let _ = tx.send(delivered);
        }
    }
}

struct ClientInner {
    cfg: ClientConfig,
    running: AtomicBool,
    seed: Mutex<u32>,
    callbacks: Mutex<HashMap<u32, Arc<CallSlot>>>,
    /// `"<id>-<security>"` learned from the last handshake; empty before
    /// the first connect.
    server_conn: Mutex<String>,
    /// The sequence value to stamp on the next outbound frame.
    next_sequence: Mutex<u32>,
    send_tx: mpsc::UnboundedSender<u32>,
    sink: tokio::sync::Mutex<Option<ClientSink>>,
}

impl ClientInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn callback(&self, id: u32) -> Option<Arc<CallSlot>> {
        self.callbacks
            .lock()
            .expect("callback table poisoned")
            .get(&id)
            .cloned()
    }

    fn register_callback(&self) -> (Arc<CallSlot>, oneshot::Receiver<bool>) {
        let mut callbacks = self.callbacks.lock().expect("callback table poisoned");
        let mut seed = self.seed.lock().expect("callback seed poisoned");
        loop {
            *seed = seed.wrapping_add(1);
            if *seed == u32::MAX {
                *seed = 1;
            }
            let id = *seed;
            if callbacks.contains_key(&id) {
                continue;
            }
            let (tx, rx) = oneshot::channel();
            let slot = Arc::new(CallSlot {
                id,
                time_ns: clock::now_ns(),
                timed_out: AtomicBool::new(false),
                stream: Mutex::new(None),
                done: Mutex::new(Some(tx)),
            });
            callbacks.insert(id, Arc::clone(&slot));
            return (slot, rx);
        }
    }

    fn unregister_callback(&self, id: u32) {
        self.callbacks
            .lock()
            .expect("callback table poisoned")
            .remove(&id);
    }

    fn sequence_guard(&self) -> MutexGuard<'_, u32> {
        self.next_sequence.lock().expect("sequence poisoned")
    }

    /// Route a reply frame to its callback slot by the id at header bytes
    /// 0..4 (offset by the marker byte on the wire).
    fn on_binary(&self, data: &[u8]) {
        if data.len() <= 5 {
            return;
        }
        let callback_id = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
        let Some(slot) = self.callback(callback_id) else {
            return;
        };
        *slot.stream.lock().expect("call slot poisoned") = Some(Stream::from_wire(data));
        slot.complete(true);
    }
}

/// A background-connected RPC client.
pub struct Client {
    inner: Arc<ClientInner>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Client {
    /// Create the client and start its connect, send and timeout tasks.
    pub fn start(cfg: ClientConfig) -> Client {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            cfg,
            running: AtomicBool::new(true),
            seed: Mutex::new(1),
            callbacks: Mutex::new(HashMap::new()),
            server_conn: Mutex::new(String::new()),
            next_sequence: Mutex::new(1),
            send_tx,
            sink: tokio::sync::Mutex::new(None),
        });
        let tasks = vec![
            tokio::spawn(connect_loop(Arc::clone(&inner))),
            tokio::spawn(send_loop(Arc::clone(&inner), send_rx)),
            tokio::spawn(sweep_loop(Arc::clone(&inner))),
        ];
        Client {
            inner,
            tasks: Mutex::new(tasks),
        }
    }

    /// The saved resume pair, empty before the first handshake.
    pub fn conn_token(&self) -> String {
        self.inner
            .server_conn
            .lock()
            .expect("server conn poisoned")
            .clone()
    }

    /// Call `target` with `args` and wait for the reply or the timeout
    /// sweep.
    pub async fn send_message(&self, target: &str, args: &[Value]) -> Result<Value, RpcError> {
        if !self.inner.is_running() {
            return Err(RpcError::new("client closed"));
        }
        let (slot, done_rx) = self.inner.register_callback();
        let result = self.call(&slot, done_rx, target, args).await;
        self.inner.unregister_callback(slot.id);
        result
    }

    async fn call(
        &self,
        slot: &Arc<CallSlot>,
        done_rx: oneshot::Receiver<bool>,
        target: &str,
        args: &[Value],
    ) -> Result<Value, RpcError> {
        let mut stream = Stream::take();
        stream.set_client_callback_id(slot.id);
        stream.write_str(target);
        stream.write_uint64(0);
        stream.write_str("@");
        for arg in args {
            if !stream.write_value(arg).is_ok() {
                stream.recycle();
                return Err(RpcError::new("args not supported"));
            }
        }
        *slot.stream.lock().expect("call slot poisoned") = Some(stream);
        if self.inner.send_tx.send(slot.id).is_err() {
            return Err(RpcError::new("client closed"));
        }

        match done_rx.await {
            Ok(true) => {}
            _ => return Err(RpcError::new("timeout")),
        }

        let mut reply = slot
            .stream
            .lock()
            .expect("call slot poisoned")
            .take()
            .ok_or_else(|| RpcError::new("data format error"))?;
        let result = parse_reply(&mut reply);
        reply.recycle();
        result
    }

    /// Close the socket, fail in-flight calls, and cancel the background
    /// tasks.
    pub async fn close(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let mut sink = self.inner.sink.lock().await;
            if let Some(ws) = sink.as_mut() {
                let _ = ws.send(Message::Close(None)).await;
            }
            *sink = None;
        }
        let slots: Vec<Arc<CallSlot>> = {
            let callbacks = self.inner.callbacks.lock().expect("callback table poisoned");
            callbacks.values().cloned().collect()
        };
        for slot in slots {
            slot.complete(false);
        }
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn parse_reply(reply: &mut Stream) -> Result<Value, RpcError> {
    let Some(success) = reply.read_bool() else {
        return Err(RpcError::new("data format error"));
    };
    if success {
        return reply
            .read_value()
            .ok_or_else(|| RpcError::new("data format error"));
    }
    let Some(message) = reply.read_string() else {
        return Err(RpcError::new("data format error"));
    };
    let Some(debug) = reply.read_string() else {
        return Err(RpcError::new("data format error"));
    };
    Err(RpcError::with_debug(message, debug))
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn connect_loop(inner: Arc<ClientInner>) {
    tokio::time::sleep(CONNECT_SETTLE).await;
    while inner.is_running() {
        let started = tokio::time::Instant::now();
        connect_once(&inner).await;
        let elapsed = started.elapsed();
        if elapsed < inner.cfg.reconnect_floor && inner.is_running() {
            tokio::time::sleep(inner.cfg.reconnect_floor - elapsed).await;
        }
    }
}

/// One dial: handshake, then pump inbound frames until the socket dies.
async fn connect_once(inner: &Arc<ClientInner>) {
    let conn = inner
        .server_conn
        .lock()
        .expect("server conn poisoned")
        .clone();
    let separator = if inner.cfg.url.contains('?') { '&' } else { '?' };
    let url = format!("{}{}conn={}", inner.cfg.url, separator, conn);

    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(err) => {
            tracing::debug!(error = %err, "connect failed");
            return;
        }
    };
    let (sink, mut ws_rx) = ws.split();

    // First frame is the handshake carrying the resume pair and the
    // sequence the server expects next.
    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, ws_rx.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => data,
        _ => {
            tracing::warn!("no handshake frame");
            return;
        }
    };
    let mut handshake = Stream::from_wire(&first);
    let path = handshake.read_string();
    let session_id = handshake.read_uint64();
    let security = handshake.read_string();
    let sequence = handshake.read_uint64();
    handshake.recycle();
    let (Some(path), Some(session_id), Some(security), Some(sequence)) =
        (path, session_id, security, sequence)
    else {
        tracing::warn!("malformed handshake frame");
        return;
    };
    if path != HANDSHAKE_PATH || security.is_empty() {
        tracing::warn!(path = %path, "unexpected handshake payload");
        return;
    }

    {
        *inner.server_conn.lock().expect("server conn poisoned") =
            format!("{session_id}-{security}");
        *inner.sequence_guard() = sequence as u32;
    }
    *inner.sink.lock().await = Some(sink);
    tracing::info!(conn_id = session_id, "client connected");

    loop {
        if !inner.is_running() {
            break;
        }
        match tokio::time::timeout(inner.cfg.read_timeout, ws_rx.next()).await {
            Err(_) => {
                tracing::warn!("client read deadline exceeded");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(err))) => {
                tracing::warn!(error = %err, "client read failed");
                break;
            }
            Ok(Some(Ok(Message::Binary(data)))) => {
                if data.len() > inner.cfg.read_size_limit {
                    tracing::warn!(size = data.len(), "reply exceeds read size limit");
                    break;
                }
                inner.on_binary(&data);
            }
            Ok(Some(Ok(_))) => {}
        }
    }

    *inner.sink.lock().await = None;
    tracing::info!("client disconnected");
}

/// Pops queued call ids and writes their frames, retrying while the
/// socket is down.  Stamps the session sequence at write time so frames
/// go out in exactly the order the server will check.
async fn send_loop(inner: Arc<ClientInner>, mut send_rx: mpsc::UnboundedReceiver<u32>) {
    while let Some(id) = send_rx.recv().await {
        let Some(slot) = inner.callback(id) else {
            continue;
        };
        loop {
            if slot.timed_out.load(Ordering::Acquire) || !inner.is_running() {
                break;
            }
            let payload = {
                let mut guard = slot.stream.lock().expect("call slot poisoned");
                guard.as_mut().map(|stream| {
                    stream.set_client_sequence(*inner.sequence_guard());
                    Bytes::from(stream.wire_bytes().into_owned())
                })
            };
            let Some(payload) = payload else { break };
            let sent = {
                let mut sink = inner.sink.lock().await;
                match sink.as_mut() {
                    Some(ws) => ws.send(Message::Binary(payload)).await.is_ok(),
                    None => false,
                }
            };
            if sent {
                // The server now expects replies for this callback id.
                *inner.sequence_guard() = id;
                break;
            }
            tokio::time::sleep(SEND_RETRY_INTERVAL).await;
        }
    }
}

/// Fails calls older than the message timeout.
async fn sweep_loop(inner: Arc<ClientInner>) {
    let budget_ns = inner.cfg.message_timeout.as_nanos() as i64;
    while inner.is_running() {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        let now = clock::now_ns();
        let slots: Vec<Arc<CallSlot>> = {
            let callbacks = inner.callbacks.lock().expect("callback table poisoned");
            callbacks.values().cloned().collect()
        };
        for slot in slots {
            if now - slot.time_ns > budget_ns {
                slot.timed_out.store(true, Ordering::Release);
                slot.complete(false);
            }
        }
    }
}
