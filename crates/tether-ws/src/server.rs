//! The WebSocket server: accepts upgrades, binds sockets to sessions,
//! enforces the per-session sequence, and feeds inbound envelopes to the
//! dispatch processor.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};

use tether_rpc::{FuncCache, Processor, ProcessorCallback, RpcError, Service, clock};
use tether_wire::Stream;

use crate::config::ServerConfig;
use crate::session::{Session, SessionTable};

/// Path sent in the first frame of every connection.
pub const HANDSHAKE_PATH: &str = "#.connection.openInformation";

/// Sequences past this point force a fresh handshake instead of wrapping.
const SEQUENCE_FORCE_HANDSHAKE: u32 = 4_000_000_000;

const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// Server start/serve failures.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("server socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server has already been started")]
    AlreadyStarted,
}

/// A WebSocket RPC server.  Register services, then [`Server::start`].
pub struct Server {
    cfg: ServerConfig,
    processor: Arc<Processor>,
    sessions: Arc<SessionTable>,
}

impl Server {
    pub fn new(cfg: ServerConfig, fn_cache: Option<Arc<dyn FuncCache>>) -> Arc<Self> {
        let sessions = Arc::new(SessionTable::new());
        let callback_sessions = Arc::clone(&sessions);
        // Completed replies route back to the originating session by the
        // conn id stamped into the request header.
        let callback: ProcessorCallback = Arc::new(move |stream: Stream, _success| {
            match callback_sessions.get(stream.client_conn_id()) {
                Some(session) => session.send(stream),
                None => stream.recycle(),
            }
        });
        let processor = Arc::new(Processor::new(
            cfg.max_node_depth,
            cfg.max_call_depth,
            Some(callback),
            fn_cache,
        ));
        Arc::new(Server {
            cfg,
            processor,
            sessions,
        })
    }

    /// Mount a service tree under the root namespace.
    #[track_caller]
    pub fn add_service(&self, name: &str, service: Service) -> Result<(), RpcError> {
        self.processor.add_service(name, service)
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// Bind the listener, start the processor, the reaper and the clock
    /// refresher, and begin accepting connections in the background.
    pub async fn start(self: &Arc<Self>) -> Result<ServerHandle, ServeError> {
        if !self.processor.start() {
            return Err(ServeError::AlreadyStarted);
        }
        let listener = TcpListener::bind(&self.cfg.bind).await?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, endpoint = %self.cfg.endpoint, "rpc server listening");

        let clock_task = clock::spawn_refresher();
        let reaper_task = {
            let sessions = Arc::clone(&self.sessions);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(REAP_INTERVAL).await;
                    sessions.reap(clock::now_ns());
                }
            })
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let accept_task = {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        accepted = listener.accept() => match accepted {
                            Ok((tcp, _peer)) => {
                                tokio::spawn(Arc::clone(&server).handle_connection(tcp));
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "accept failed");
                            }
                        },
                    }
                }
            })
        };

        Ok(ServerHandle {
            addr,
            server: Arc::clone(self),
            shutdown_tx: Some(shutdown_tx),
            accept_task,
            reaper_task,
            clock_task,
        })
    }

    async fn handle_connection(self: Arc<Self>, tcp: TcpStream) {
        let endpoint = self.cfg.endpoint.clone();
        let mut resume = (0u32, String::new());
        let accept_result = accept_hdr_async(tcp, |req: &Request, resp: Response| {
            if req.uri().path() != endpoint {
                return Err(not_found());
            }
            resume = parse_conn_query(req.uri().query().unwrap_or_default());
            Ok(resp)
        })
        .await;
        let ws = match accept_result {
            Ok(ws) => ws,
            Err(err) => {
                tracing::warn!(error = %err, "websocket upgrade failed");
                return;
            }
        };
        let (sink, mut ws_rx) = ws.split();

        let (conn_id, security) = resume;
        let (session, created) = self.sessions.resume_or_create(conn_id, &security);
        let epoch = session.attach(sink).await;
        tracing::info!(conn_id = session.id(), resumed = !created, "connection opened");

        // The handshake frame tells the client its resume pair and the
        // sequence the server expects next.
        let mut handshake = Stream::take();
        handshake.set_client_callback_id(0);
        handshake.write_str(HANDSHAKE_PATH);
        handshake.write_uint64(u64::from(session.id()));
        handshake.write_str(&session.security());
        handshake.write_uint64(u64::from(session.sequence()));
        session.send(handshake);

        self.read_loop(&session, &mut ws_rx).await;

        session.detach(epoch, self.cfg.resume_window).await;
        tracing::info!(conn_id = session.id(), "connection closed");
    }

    async fn read_loop(
        &self,
        session: &Arc<Session>,
        ws_rx: &mut futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<TcpStream>,
        >,
    ) {
        loop {
            let message = match tokio::time::timeout(self.cfg.read_timeout, ws_rx.next()).await {
                Err(_) => {
                    tracing::warn!(conn_id = session.id(), "read deadline exceeded");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(err))) => {
                    tracing::warn!(conn_id = session.id(), error = %err, "socket read failed");
                    return;
                }
                Ok(Some(Ok(message))) => message,
            };
            match message {
                Message::Binary(data) => {
                    if data.len() > self.cfg.read_size_limit {
                        tracing::warn!(
                            conn_id = session.id(),
                            size = data.len(),
                            "frame exceeds read size limit"
                        );
                        return;
                    }
                    let mut stream = Stream::from_wire(&data);
                    let sequence = stream.client_sequence();
                    let callback_id = stream.client_callback_id();

                    // Callback id 0 is reserved for the handshake frame the
                    // server sends; a client must never use it.
                    if callback_id == 0 {
                        stream.recycle();
                        tracing::warn!(conn_id = session.id(), "unknown system instruction");
                        return;
                    }

                    if sequence > SEQUENCE_FORCE_HANDSHAKE {
                        session.invalidate(self.cfg.resume_window).await;
                    }

                    if session.set_sequence(sequence, callback_id) {
                        stream.set_client_conn_id(session.id());
                        self.processor.put_stream(stream).await;
                    } else {
                        stream.recycle();
                        tracing::warn!(conn_id = session.id(), "server sequence error");
                        return;
                    }
                }
                // A normal close is silent.
                Message::Close(_) => return,
                Message::Ping(_) | Message::Pong(_) => {}
                _ => {
                    tracing::warn!(conn_id = session.id(), "unknown message type");
                    return;
                }
            }
        }
    }
}

/// A started server: the bound address plus the shutdown path.
pub struct ServerHandle {
    addr: std::net::SocketAddr,
    server: Arc<Server>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: tokio::task::JoinHandle<()>,
    reaper_task: tokio::task::JoinHandle<()>,
    clock_task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// The full `ws://` URL of the endpoint.
    pub fn url(&self) -> String {
        format!("ws://{}{}", self.addr, self.server.cfg.endpoint)
    }

    /// Stop accepting, then stop the processor with its bounded worker
    /// shutdown.  Live sessions are dropped.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.accept_task.await;
        self.reaper_task.abort();
        self.clock_task.abort();
        self.server.processor.stop().await;
        tracing::info!("rpc server stopped");
    }
}

fn not_found() -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = tokio_tungstenite::tungstenite::http::StatusCode::NOT_FOUND;
    response
}

/// Parse `conn=<id>-<security>` out of a raw query string.  Anything
/// malformed falls back to a fresh session.
fn parse_conn_query(query: &str) -> (u32, String) {
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("conn=") {
            let parts: Vec<&str> = value.split('-').collect();
            if parts.len() == 2 {
                if let Ok(id) = parts[0].parse::<u64>() {
                    return (id as u32, parts[1].to_owned());
                }
            }
        }
    }
    (0, String::new())
}
