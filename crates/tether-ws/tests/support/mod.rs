//! Shared helpers for the integration suites: a started server on an
//! ephemeral port and a raw WebSocket client that speaks the frame format
//! directly.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tether_rpc::{Service, ValueKind};
use tether_wire::{Stream, Value};
use tether_ws::{HANDSHAKE_PATH, Server, ServerConfig, ServerHandle};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A service with one `sayHello(String)` echo, mounted as `$.user` in
/// most tests.
pub fn hello_service() -> Service {
    Service::new().echo("sayHello", true, &[ValueKind::String], |ctx, args| {
        let Value::String(name) = &args[0] else {
            return ctx.errorf("wrong argument kind");
        };
        ctx.ok(format!("hello {name}"))
    })
}

pub async fn start_server(service: Service) -> (Arc<Server>, ServerHandle) {
    let mut cfg = ServerConfig::default();
    cfg.bind = "127.0.0.1:0".to_owned();
    start_server_with(cfg, service).await
}

pub async fn start_server_with(cfg: ServerConfig, service: Service) -> (Arc<Server>, ServerHandle) {
    let server = Server::new(cfg, None);
    server.add_service("user", service).expect("mount service");
    let handle = server.start().await.expect("start server");
    (server, handle)
}

// ---------------------------------------------------------------------------
// Raw client
// ---------------------------------------------------------------------------

pub struct Handshake {
    pub session_id: u64,
    pub security: String,
    pub sequence: u64,
}

impl Handshake {
    pub fn conn_token(&self) -> String {
        format!("{}-{}", self.session_id, self.security)
    }
}

/// A parsed reply envelope.
pub struct Reply {
    pub callback_id: u32,
    pub success: bool,
    pub stream: Stream,
}

impl Reply {
    pub fn parse(data: &[u8]) -> Reply {
        let mut stream = Stream::from_wire(data);
        let callback_id = stream.client_callback_id();
        let success = stream.read_bool().expect("reply success flag");
        Reply {
            callback_id,
            success,
            stream,
        }
    }

    pub fn value(mut self) -> Value {
        self.stream.read_value().expect("reply value")
    }

    pub fn error_parts(mut self) -> (String, String) {
        let message = self.stream.read_string().expect("error message");
        let debug = self.stream.read_string().expect("error debug");
        (message, debug)
    }
}

/// Hand-rolled protocol client; no resend, no sweeper, just frames.
pub struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl RawClient {
    pub async fn connect(url: &str, conn: &str) -> RawClient {
        let full = format!("{url}?conn={conn}");
        let (ws, _response) = connect_async(full.as_str()).await.expect("connect");
        RawClient { ws }
    }

    /// Read and parse the server's first frame.
    pub async fn handshake(&mut self) -> Handshake {
        let data = self.recv_binary().await.expect("handshake frame");
        let mut stream = Stream::from_wire(&data);
        assert_eq!(stream.client_callback_id(), 0);
        assert_eq!(stream.read_string().as_deref(), Some(HANDSHAKE_PATH));
        let session_id = stream.read_uint64().expect("session id");
        let security = stream.read_string().expect("security token");
        let sequence = stream.read_uint64().expect("sequence");
        stream.recycle();
        Handshake {
            session_id,
            security,
            sequence,
        }
    }

    pub async fn send_stream(&mut self, stream: &Stream) {
        self.ws
            .send(Message::Binary(stream.wire_bytes().into_owned().into()))
            .await
            .expect("send frame");
    }

    pub async fn send_raw(&mut self, data: Vec<u8>) {
        self.ws
            .send(Message::Binary(data.into()))
            .await
            .expect("send frame");
    }

    /// Next binary frame, or `None` when the server closed the socket.
    pub async fn recv_binary(&mut self) -> Option<Vec<u8>> {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => return Some(data.to_vec()),
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => return None,
                Err(_) => panic!("timed out waiting for a frame"),
            }
        }
    }

    /// True when the server closes without sending another binary frame.
    pub async fn expect_close(&mut self) -> bool {
        self.recv_binary().await.is_none()
    }

    /// Send one call frame and wait for its reply.
    pub async fn call(
        &mut self,
        sequence: u32,
        callback_id: u32,
        target: &str,
        depth: u64,
        args: &[Value],
    ) -> Reply {
        let stream = build_call(sequence, callback_id, target, depth, args);
        self.send_stream(&stream).await;
        stream.recycle();
        let data = self.recv_binary().await.expect("reply frame");
        Reply::parse(&data)
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }

    pub fn ws_mut(&mut self) -> &mut WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>> {
        &mut self.ws
    }
}

pub fn build_call(
    sequence: u32,
    callback_id: u32,
    target: &str,
    depth: u64,
    args: &[Value],
) -> Stream {
    let mut stream = Stream::take();
    stream.set_client_callback_id(callback_id);
    stream.set_client_sequence(sequence);
    stream.write_str(target);
    stream.write_uint64(depth);
    stream.write_str("@");
    for arg in args {
        assert!(stream.write_value(arg).is_ok());
    }
    stream
}
