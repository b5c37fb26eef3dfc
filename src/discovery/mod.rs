//! Server discovery module
//!
//! Locates a turret server on the local network with one UDP broadcast
//! exchange: a `Discover` probe goes out, a single `Address` reply comes
//! back. The server's IP is the reply's source address; its command port
//! is carried in the payload.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::protocol::{self, Address, CodecError, Discover, DISCOVERY_PORT, MAX_DATAGRAM_SIZE};

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid discovery reply: {0}")]
    Codec(#[from] CodecError),

    #[error("No discovery reply within {0:?}")]
    Timeout(Duration),
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Address the probe is sent to
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: IpAddr,
    /// Port the server listens on for probes
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Local address to send the probe from
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// How long to wait for a reply, in ms
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Receive buffer for the reply datagram
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

fn default_broadcast_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::BROADCAST)
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

fn default_timeout() -> u64 {
    5000
}

fn default_max_datagram_size() -> usize {
    MAX_DATAGRAM_SIZE
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_addr: default_broadcast_addr(),
            port: default_discovery_port(),
            bind_addr: default_bind_addr(),
            timeout_ms: default_timeout(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl DiscoveryConfig {
    /// Where the probe is sent
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_addr, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Turn a discovery reply into the server's command endpoint
pub fn resolve_reply(from: SocketAddr, payload: &[u8]) -> DiscoveryResult<SocketAddr> {
    let reply: Address = protocol::decode(payload)?;
    Ok(SocketAddr::new(from.ip(), reply.port()))
}

/// One-shot broadcast discovery
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Broadcast a probe and wait for the first reply.
    ///
    /// The socket lives only for this call and is never reused for
    /// command traffic.
    pub async fn find_server(&self) -> DiscoveryResult<SocketAddr> {
        let socket = UdpSocket::bind(self.config.bind_addr).await?;
        socket.set_broadcast(true)?;

        let target = self.config.target();
        let probe = protocol::encode(Discover)?;
        socket.send_to(&probe, target).await?;
        tracing::debug!("Sent discovery probe to {}", target);

        let timeout = self.config.timeout();
        let mut buf = vec![0u8; self.config.max_datagram_size];
        let (len, from) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DiscoveryError::Timeout(timeout))??;

        tracing::debug!("Discovery reply from {} ({} bytes)", from, len);

        let server = resolve_reply(from, &buf[..len]).map_err(|e| {
            tracing::warn!("Unusable discovery reply from {}: {}", from, e);
            e
        })?;

        tracing::info!("Discovered turret server at {}", server);
        Ok(server)
    }
}
