//! Network module - Handles the TCP command session with a turret server
//!
//! Provides:
//! - Connection framing over a byte stream
//! - The request/reply turret client

mod client;
mod connection;

pub use client::*;
pub use connection::*;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::{Framing, DEFAULT_COMMAND_PORT, DEFAULT_MAX_FRAME_SIZE};

/// Configuration for a command session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Command port used when a server address omits one
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// How long to wait for each reply, in milliseconds
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Stream framing expected by the server
    #[serde(default)]
    pub framing: Framing,
    /// Maximum message size
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_port() -> u16 {
    DEFAULT_COMMAND_PORT
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_reply_timeout() -> u64 {
    5000
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            connect_timeout_ms: default_connect_timeout(),
            reply_timeout_ms: default_reply_timeout(),
            framing: Framing::default(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let mut addrs = lookup_host((host, port)).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Resolve `HOST`, `HOST:PORT`, `IP` or `IP:PORT`, falling back to
/// `default_port` when none is given
pub async fn resolve_server(spec: &str, default_port: u16) -> std::io::Result<SocketAddr> {
    if let Ok(addr) = spec.parse::<SocketAddr>() {
        return Ok(addr);
    }

    match spec.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port.parse::<u16>().map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("Invalid port in server address: {}", spec),
                )
            })?;
            resolve_host(host, port).await
        }
        // Bare hostname or a bare IPv6 address
        _ => resolve_host(spec.trim_matches(|c| c == '[' || c == ']'), default_port).await,
    }
}
