//! Connection handling for the command stream
//!
//! Wraps one byte stream (a `TcpStream` in production) and provides:
//! - Framed message sending
//! - Buffered reply reading with timeouts
//! - Connection state and statistics

use bytes::BytesMut;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::SessionConfig;
use crate::protocol::{CodecError, Decoder, Encoder, Message};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Connection closed")]
    Closed,

    #[error("No reply within {0:?}")]
    Timeout(Duration),
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Ready for requests
    Connected,
    /// Shut down locally, by the peer, or by a transport failure
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Messages sent
    pub messages_sent: u64,
    /// Frames received
    pub messages_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
}

/// A framed connection to a turret server
pub struct Connection<S = TcpStream> {
    /// Remote peer address
    remote_addr: SocketAddr,
    /// The underlying stream
    stream: S,
    /// Protocol encoder
    encoder: Encoder,
    /// Protocol decoder
    decoder: Decoder,
    /// Read buffer
    read_buf: BytesMut,
    /// Write buffer
    write_buf: BytesMut,
    /// Connection state
    state: ConnectionState,
    /// Statistics
    stats: ConnectionStats,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection from an established stream
    pub fn new(stream: S, remote_addr: SocketAddr, config: &SessionConfig) -> Self {
        Self {
            remote_addr,
            stream,
            encoder: Encoder::new(config.framing, config.max_frame_size),
            decoder: Decoder::new(config.framing, config.max_frame_size),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(256),
            state: ConnectionState::Connected,
            stats: ConnectionStats::default(),
        }
    }

    /// Get the remote address
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get connection statistics
    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Check if the connection is still usable
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Drop any buffered bytes that did not belong to a consumed frame.
    /// Returns how many were discarded.
    pub fn discard_pending(&mut self) -> usize {
        let stale = self.read_buf.len();
        self.read_buf.clear();
        stale
    }

    /// Send a message as a single frame
    pub async fn send(&mut self, message: impl Into<Message>) -> ConnectionResult<()> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }

        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;

        let written = match self.stream.write_all(&self.write_buf).await {
            Ok(()) => self.stream.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            self.state = ConnectionState::Closed;
            return Err(e.into());
        }

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += self.write_buf.len() as u64;

        Ok(())
    }

    /// Receive one frame payload. Returns None if the peer closed the
    /// stream cleanly between frames.
    pub async fn recv(&mut self) -> ConnectionResult<Option<BytesMut>> {
        if !self.is_active() {
            return Err(ConnectionError::Closed);
        }

        loop {
            if let Some(frame) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                return Ok(Some(frame));
            }

            let mut buf = [0u8; 4096];
            let n = match self.stream.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.state = ConnectionState::Closed;
                    return Err(e.into());
                }
            };

            if n == 0 {
                self.state = ConnectionState::Closed;
                if self.read_buf.is_empty() {
                    return Ok(None); // Clean close
                } else {
                    return Err(ConnectionError::Closed);
                }
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Receive one frame, giving up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<BytesMut>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        }
    }

    /// Shut the stream down. Closing twice is a no-op.
    pub async fn close(&mut self) -> ConnectionResult<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }

        self.state = ConnectionState::Closed;
        self.stream.shutdown().await?;

        tracing::debug!("Closed connection to {}", self.remote_addr);
        Ok(())
    }

    /// Get the underlying stream for advanced operations
    pub fn stream_ref(&self) -> &S {
        &self.stream
    }
}
