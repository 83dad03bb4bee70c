//! Endpoint configuration loading.
//!
//! TOML is the sole config source; every field has a default so an empty
//! file (or no file at all) yields a working local setup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Resolved config types
// ---------------------------------------------------------------------------

/// Server-side endpoint settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:8080`.  Port 0 picks an ephemeral
    /// port.
    pub bind: String,
    /// The WebSocket upgrade path, e.g. `/rpc`.
    pub endpoint: String,
    /// Largest accepted inbound frame in bytes.
    pub read_size_limit: usize,
    /// Per-receive read deadline.
    pub read_timeout: Duration,
    /// How long a detached session stays resumable.
    pub resume_window: Duration,
    pub max_node_depth: u64,
    pub max_call_depth: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1:8080".to_owned(),
            endpoint: "/rpc".to_owned(),
            read_size_limit: 64 * 1024,
            read_timeout: Duration::from_secs(60),
            resume_window: Duration::from_secs(35),
            max_node_depth: 32,
            max_call_depth: 32,
        }
    }
}

/// Client-side settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, e.g. `ws://127.0.0.1:8080/rpc` (no query string).
    pub url: String,
    /// How long one in-flight call may take before it fails with
    /// `"timeout"`.
    pub message_timeout: Duration,
    /// Per-receive read deadline on the socket.
    pub read_timeout: Duration,
    /// Largest accepted inbound frame in bytes.
    pub read_size_limit: usize,
    /// Minimum interval between connect attempts.
    pub reconnect_floor: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            message_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(60),
            read_size_limit: 10 * 1024 * 1024,
            reconnect_floor: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    client: Option<RawClientConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
    endpoint: Option<String>,
    read_size_limit: Option<usize>,
    read_timeout_ms: Option<u64>,
    resume_window_ms: Option<u64>,
    max_node_depth: Option<u64>,
    max_call_depth: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawClientConfig {
    url: Option<String>,
    message_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    read_size_limit: Option<usize>,
    reconnect_floor_ms: Option<u64>,
}

/// Config loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Load the `[server]` table, filling defaults for missing fields.
pub fn load_server_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(&std::fs::read_to_string(path)?)?;
    let mut cfg = ServerConfig::default();
    if let Some(server) = raw.server {
        if let Some(v) = server.bind {
            cfg.bind = v;
        }
        if let Some(v) = server.endpoint {
            cfg.endpoint = v;
        }
        if let Some(v) = server.read_size_limit {
            cfg.read_size_limit = v;
        }
        if let Some(v) = server.read_timeout_ms {
            cfg.read_timeout = Duration::from_millis(v);
        }
        if let Some(v) = server.resume_window_ms {
            cfg.resume_window = Duration::from_millis(v);
        }
        if let Some(v) = server.max_node_depth {
            cfg.max_node_depth = v;
        }
        if let Some(v) = server.max_call_depth {
            cfg.max_call_depth = v;
        }
    }
    Ok(cfg)
}

/// Load the `[client]` table.  The URL is required.
pub fn load_client_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(&std::fs::read_to_string(path)?)?;
    let client = raw.client.unwrap_or_default();
    let mut cfg = ClientConfig::new(client.url.unwrap_or_default());
    if let Some(v) = client.message_timeout_ms {
        cfg.message_timeout = Duration::from_millis(v);
    }
    if let Some(v) = client.read_timeout_ms {
        cfg.read_timeout = Duration::from_millis(v);
    }
    if let Some(v) = client.read_size_limit {
        cfg.read_size_limit = v;
    }
    if let Some(v) = client.reconnect_floor_ms {
        cfg.reconnect_floor = Duration::from_millis(v);
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"").expect("write");
        let cfg = load_server_config(file.path()).expect("load");
        assert_eq!(cfg.endpoint, "/rpc");
        assert_eq!(cfg.read_size_limit, 64 * 1024);
        assert_eq!(cfg.resume_window, Duration::from_secs(35));
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(
            b"[server]\nbind = \"0.0.0.0:9000\"\nread_timeout_ms = 1500\n\n[client]\nurl = \"ws://h/rpc\"\nmessage_timeout_ms = 250\n",
        )
        .expect("write");
        let server = load_server_config(file.path()).expect("server");
        assert_eq!(server.bind, "0.0.0.0:9000");
        assert_eq!(server.read_timeout, Duration::from_millis(1500));
        assert_eq!(server.endpoint, "/rpc");

        let client = load_client_config(file.path()).expect("client");
        assert_eq!(client.url, "ws://h/rpc");
        assert_eq!(client.message_timeout, Duration::from_millis(250));
        assert_eq!(client.read_size_limit, 10 * 1024 * 1024);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(b"[server\nbind=").expect("write");
        assert!(matches!(
            load_server_config(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }
}
