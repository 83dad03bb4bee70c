//! Server-side connection sessions.
//!
//! A session binds a `(conn_id, security)` pair to whatever socket is
//! currently attached.  Disconnects leave the record behind with a grace
//! deadline; a reconnect carrying the same pair swaps a new socket in and
//! keeps the sequence state.  The reaper deletes records whose deadline
//! passed, which also ends their outbound writer task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Bytes, Message};

use tether_rpc::clock;
use tether_wire::Stream;

pub(crate) type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(200);
const SECURITY_LEN: usize = 32;

pub(crate) fn random_security() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECURITY_LEN)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub(crate) struct Session {
    id: u32,
    security: Mutex<String>,
    /// 0 while a socket is attached; otherwise the reap deadline.
    deadline_ns: AtomicI64,
    /// The next inbound frame must carry this value as its sequence.
    sequence: Mutex<u32>,
    /// Bumped on every attach so a stale handler cannot detach a socket
    /// that a resumed connection just swapped in.
    attach_epoch: AtomicU64,
    out_tx: mpsc::UnboundedSender<Stream>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
}

impl Session {
    fn new(id: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<Stream>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            id,
            security: Mutex::new(random_security()),
            deadline_ns: AtomicI64::new(0),
            sequence: Mutex::new(1),
            attach_epoch: AtomicU64::new(0),
            out_tx,
            sink: tokio::sync::Mutex::new(None),
        });
        (session, out_rx)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn security(&self) -> String {
        self.security.lock().expect("session security poisoned").clone()
    }

    pub(crate) fn is_valid(&self) -> bool {
        !self.security.lock().expect("session security poisoned").is_empty()
    }

    pub(crate) fn sequence(&self) -> u32 {
        *self.sequence.lock().expect("session sequence poisoned")
    }

    /// Advance the expected sequence.  Succeeds only for the exact
    /// `(stored == prev, prev != next)` transition.
    pub(crate) fn set_sequence(&self, prev: u32, next: u32) -> bool {
        let mut sequence = self.sequence.lock().expect("session sequence poisoned");
        if *sequence == prev && prev != next {
            *sequence = next;
            true
        } else {
            false
        }
    }

    /// Queue a reply for the outbound writer.
    pub(crate) fn send(&self, stream: Stream) {
        if let Err(err) = self.out_tx.send(stream) {
            err.0.recycle();
        }
    }

    /// Swap a fresh socket in and clear the grace deadline.  Returns the
    /// attach epoch the owning handler must present to detach.
    pub(crate) async fn attach(&self, sink: WsSink) -> u64 {
        let mut guard = self.sink.lock().await;
        *guard = Some(sink);
        self.deadline_ns.store(0, Ordering::Release);
        self.attach_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop the socket and start the resume grace window, unless a newer
    /// connection already attached.
    pub(crate) async fn detach(&self, epoch: u64, resume_window: Duration) {
        let mut guard = self.sink.lock().await;
        if self.attach_epoch.load(Ordering::Acquire) != epoch {
            return;
        }
        *guard = None;
        self.deadline_ns.store(
            clock::now_ns() + resume_window.as_nanos() as i64,
            Ordering::Release,
        );
    }

    /// Clear the security token so the next connect re-handshakes, and
    /// start the grace window for the reaper.
    pub(crate) async fn invalidate(&self, resume_window: Duration) {
        self.security.lock().expect("session security poisoned").clear();
        let mut guard = self.sink.lock().await;
        *guard = None;
        self.deadline_ns.store(
            clock::now_ns() + resume_window.as_nanos() as i64,
            Ordering::Release,
        );
    }

    fn clear_security(&self) {
        self.security.lock().expect("session security poisoned").clear();
    }

    fn expired(&self, now_ns: i64) -> bool {
        let deadline = self.deadline_ns.load(Ordering::Acquire);
        deadline > 0 && deadline < now_ns
    }
}

/// The per-session outbound writer: the sole consumer of the session's
/// stream channel.  Retries the current socket until the write lands or
/// the session is invalidated; exits when the channel closes.
pub(crate) fn spawn_writer(session: &Arc<Session>, mut out_rx: mpsc::UnboundedReceiver<Stream>) {
    let weak = Arc::downgrade(session);
    tokio::spawn(async move {
        while let Some(mut stream) = out_rx.recv().await {
            stream.set_client_conn_id(0);
            let payload = Bytes::from(stream.wire_bytes().into_owned());
            let mut sent = false;
            loop {
                let Some(session) = weak.upgrade() else { break };
                if !session.is_valid() {
                    break;
                }
                let wrote = {
                    let mut sink = session.sink.lock().await;
                    match sink.as_mut() {
                        Some(ws) => match ws.send(Message::Binary(payload.clone())).await {
                            Ok(()) => true,
                            Err(err) => {
                                tracing::warn!(conn_id = session.id, error = %err, "outbound write failed");
                                false
                            }
                        },
                        None => false,
                    }
                };
                if wrote {
                    sent = true;
                    break;
                }
                drop(session);
                tokio::time::sleep(WRITE_RETRY_INTERVAL).await;
            }
            if sent {
                stream.recycle();
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Session table
// ---------------------------------------------------------------------------

pub(crate) struct SessionTable {
    map: RwLock<HashMap<u32, Arc<Session>>>,
    /// Monotonic id seed: 1..=u32::MAX-1, wraps, never 0.
    seed: Mutex<u32>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        SessionTable {
            map: RwLock::new(HashMap::new()),
            seed: Mutex::new(1),
        }
    }

    pub(crate) fn get(&self, id: u32) -> Option<Arc<Session>> {
        self.map.read().expect("session map poisoned").get(&id).cloned()
    }

    /// Resume the session named by the query pair, or allocate a fresh one
    /// (spawning its outbound writer).  Returns the session and whether it
    /// is newly created.
    pub(crate) fn resume_or_create(&self, conn_id: u32, security: &str) -> (Arc<Session>, bool) {
        if conn_id != 0 && !security.is_empty() {
            if let Some(session) = self.get(conn_id) {
                if session.security() == security {
                    return (session, false);
                }
            }
        }

        let mut map = self.map.write().expect("session map poisoned");
        let mut seed = self.seed.lock().expect("session seed poisoned");
        loop {
            *seed = seed.wrapping_add(1);
            if *seed == u32::MAX {
                *seed = 1;
            }
            let id = *seed;
            if map.contains_key(&id) {
                continue;
            }
            let (session, out_rx) = Session::new(id);
            map.insert(id, Arc::clone(&session));
            spawn_writer(&session, out_rx);
            return (session, true);
        }
    }

    /// Delete every session whose grace deadline passed.  Dropping the map
    /// entry closes the outbound channel, which ends the writer task.
    pub(crate) fn reap(&self, now_ns: i64) {
        let mut map = self.map.write().expect("session map poisoned");
        map.retain(|_, session| {
            if session.expired(now_ns) {
                session.clear_security();
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.read().expect("session map poisoned").len()
    }
}
