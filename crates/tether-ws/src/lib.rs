// tether-ws: the WebSocket transport for the tether RPC runtime.
//
// The server binds inbound sockets to resumable sessions keyed by
// `(conn_id, security)` and enforces a strict per-session sequence before
// handing envelopes to the dispatch processor.  The client keeps one
// connection alive in the background and correlates replies to calls by
// callback id.

mod client;
mod config;
mod server;
mod session;

pub use client::Client;
pub use config::{ClientConfig, ConfigError, ServerConfig, load_client_config, load_server_config};
pub use server::{HANDSHAKE_PATH, ServeError, Server, ServerHandle};
