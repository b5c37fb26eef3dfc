//! Turret client
//!
//! Owns one command connection to a turret server. Every operation writes
//! exactly one request and reads exactly one reply before returning.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::connection::{Connection, ConnectionError, ConnectionState, ConnectionStats};
use super::SessionConfig;
use crate::discovery::{Discovery, DiscoveryConfig, DiscoveryError};
use crate::protocol::{
    self, Acknowledge, CodecError, Message, MessageError, Move, RequestStatus, Reset, Shoot,
    Status,
};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("Invalid reply: {0}")]
    Codec(#[from] CodecError),

    #[error("Connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("Session closed")]
    Closed,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Outcome of a command the server is expected to acknowledge.
///
/// The command may have reached the turret even when the acknowledgment
/// could not be read, so an unconfirmed command is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    /// The server replied with an acknowledgment
    Confirmed,
    /// The command was sent but no valid acknowledgment came back
    Unconfirmed(String),
}

impl AckStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, AckStatus::Confirmed)
    }
}

/// Client for one turret server
pub struct TurretClient<S = TcpStream> {
    /// Session configuration
    config: SessionConfig,
    /// The command connection
    conn: Connection<S>,
}

impl TurretClient<TcpStream> {
    /// Connect to a server by address
    pub async fn connect(server_addr: SocketAddr, config: SessionConfig) -> ClientResult<Self> {
        tracing::info!("Connecting to turret at {}", server_addr);

        let timeout = config.connect_timeout();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(server_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::Io(e)),
            Err(_) => return Err(ClientError::Timeout(timeout)),
        };
        stream.set_nodelay(true)?;

        tracing::info!("Connected to turret at {}", server_addr);
        Ok(Self::from_stream(stream, server_addr, config))
    }

    /// Connect to a server by hostname
    pub async fn connect_hostname(
        hostname: &str,
        port: u16,
        config: SessionConfig,
    ) -> ClientResult<Self> {
        let addr = super::resolve_host(hostname, port).await?;
        Self::connect(addr, config).await
    }

    /// Find a server by broadcast discovery, then connect to it
    pub async fn discover(discovery: DiscoveryConfig, config: SessionConfig) -> ClientResult<Self> {
        let server_addr = Discovery::new(discovery).find_server().await?;
        Self::connect(server_addr, config).await
    }
}

impl<S> TurretClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already established stream
    pub fn from_stream(stream: S, remote_addr: SocketAddr, config: SessionConfig) -> Self {
        let conn = Connection::new(stream, remote_addr, &config);
        Self { config, conn }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.conn.is_active()
    }

    pub fn stats(&self) -> &ConnectionStats {
        self.conn.stats()
    }

    /// Rotate the turret to the given base and elevation angles
    pub async fn move_to(&mut self, base_angle: f64, elev_angle: f64) -> ClientResult<AckStatus> {
        self.command(Move::new(base_angle, elev_angle).into()).await
    }

    /// Fire `times` shots
    pub async fn shoot(&mut self, times: i64) -> ClientResult<AckStatus> {
        let message = Shoot::new(times)?;
        self.command(message.into()).await
    }

    /// Fire a single shot
    pub async fn shoot_once(&mut self) -> ClientResult<AckStatus> {
        self.command(Shoot::once().into()).await
    }

    /// Return the turret to its home pose
    pub async fn reset(&mut self) -> ClientResult<AckStatus> {
        self.command(Reset.into()).await
    }

    /// Ask the server for the turret's current status.
    ///
    /// Unlike commands there is nothing to return without a reply, so a
    /// missing or malformed status is an error.
    pub async fn request_status(&mut self) -> ClientResult<Status> {
        self.send(RequestStatus.into()).await?;

        let frame = match self.conn.recv_timeout(self.config.reply_timeout()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(ConnectionError::Closed.into()),
            Err(e @ ConnectionError::Io(_)) => return Err(e.into()),
            Err(e) => {
                self.abandon(&e).await;
                return Err(e.into());
            }
        };

        match protocol::decode::<Status>(&frame) {
            Ok(status) => {
                tracing::debug!("Received {:?}", status);
                Ok(status)
            }
            Err(e @ CodecError::Message(_)) => Err(e.into()),
            Err(e) => {
                self.abandon(&e).await;
                Err(e.into())
            }
        }
    }

    /// Close the session. Safe to call more than once.
    pub async fn close(&mut self) -> ClientResult<()> {
        self.conn.close().await?;
        Ok(())
    }

    async fn send(&mut self, message: Message) -> ClientResult<()> {
        if !self.conn.is_active() {
            return Err(ClientError::Closed);
        }

        let stale = self.conn.discard_pending();
        if stale > 0 {
            tracing::debug!("Discarded {} stale bytes before {} request", stale, message.tag());
        }

        tracing::debug!("Sending {:?}", message);
        self.conn.send(message).await?;
        Ok(())
    }

    /// Send a command and try to read its acknowledgment.
    ///
    /// Only failures of the write, or of the socket read itself, are
    /// returned as errors.
    async fn command(&mut self, message: Message) -> ClientResult<AckStatus> {
        self.send(message).await?;

        let reason = match self.conn.recv_timeout(self.config.reply_timeout()).await {
            Ok(Some(frame)) => match protocol::decode::<Acknowledge>(&frame) {
                Ok(_) => {
                    tracing::debug!("{} command acknowledged", message.tag());
                    return Ok(AckStatus::Confirmed);
                }
                // A whole map of the wrong shape leaves the stream in step
                Err(e @ CodecError::Message(_)) => e.to_string(),
                Err(e) => {
                    self.abandon(&e).await;
                    e.to_string()
                }
            },
            Ok(None) => "connection closed before reply".to_string(),
            Err(e @ ConnectionError::Io(_)) => return Err(e.into()),
            Err(e) => {
                self.abandon(&e).await;
                e.to_string()
            }
        };

        tracing::warn!(
            "Ack message not received after sending {} command: {}",
            message.tag(),
            reason
        );
        Ok(AckStatus::Unconfirmed(reason))
    }

    /// Close a session whose reply could not be framed. Whatever is still
    /// in flight would otherwise be read as the answer to the next request.
    async fn abandon(&mut self, cause: &dyn std::fmt::Display) {
        if !self.conn.is_active() {
            return;
        }

        tracing::warn!(
            "Closing session with {}: reply stream out of step ({})",
            self.conn.remote_addr(),
            cause
        );
        if let Err(e) = self.conn.close().await {
            tracing::debug!("Shutdown after broken reply failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_test::io::Builder;

    /// Log sink shared with a test subscriber
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn mock_addr() -> SocketAddr {
        "127.0.0.1:12345".parse().unwrap()
    }

    /// Accepts one client and answers every read with `reply`.
    /// Resolves to everything the client sent.
    async fn stub_server(reply: Vec<u8>) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                if !reply.is_empty() {
                    stream.write_all(&reply).await.unwrap();
                }
            }
            received
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn test_move_writes_exact_frame() {
        let request = protocol::encode(Move::new(10.0, 5.0)).unwrap();
        let ack = protocol::encode(Acknowledge).unwrap();
        let mock = Builder::new().write(&request).read(&ack).build();

        let mut client = TurretClient::from_stream(mock, mock_addr(), SessionConfig::default());
        let status = client.move_to(10.0, 5.0).await.unwrap();
        assert_eq!(status, AckStatus::Confirmed);
        assert_eq!(client.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_move_against_stub_server() {
        let (addr, server) = stub_server(protocol::encode(Acknowledge).unwrap()).await;

        let mut client = TurretClient::connect(addr, SessionConfig::default())
            .await
            .unwrap();
        assert!(client.is_connected());
        assert!(client.move_to(10.0, 5.0).await.unwrap().is_confirmed());
        client.close().await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, protocol::encode(Move::new(10.0, 5.0)).unwrap());
        let sent: Move = protocol::decode(&received).unwrap();
        assert_eq!(sent.base_angle(), 10.0);
        assert_eq!(sent.elev_angle(), 5.0);
    }

    #[tokio::test]
    async fn test_garbage_ack_is_soft_failure() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let (addr, server) = stub_server(b"not msgpack".to_vec()).await;
        let mut client = TurretClient::connect(addr, SessionConfig::default())
            .await
            .unwrap();

        let status = client.shoot(3).await.unwrap();
        assert!(matches!(status, AckStatus::Unconfirmed(_)));
        // Unframeable bytes leave the stream out of step
        assert_eq!(client.state(), ConnectionState::Closed);
        client.close().await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, protocol::encode(Shoot::new(3).unwrap()).unwrap());

        let output = logs.contents();
        assert!(output.contains("WARN"));
        assert!(output.contains("Ack message not received after sending shoot command"));
    }

    #[tokio::test]
    async fn test_wrong_reply_kind_is_unconfirmed() {
        let status = protocol::encode(Status::new(0, 0, 0).unwrap()).unwrap();
        let request = protocol::encode(Reset).unwrap();
        let mock = Builder::new().write(&request).read(&status).build();

        let mut client = TurretClient::from_stream(mock, mock_addr(), SessionConfig::default());
        match client.reset().await.unwrap() {
            AckStatus::Unconfirmed(reason) => assert!(reason.contains("acknowledge")),
            AckStatus::Confirmed => panic!("status reply must not confirm a reset"),
        }
    }

    #[tokio::test]
    async fn test_peer_close_is_unconfirmed_then_closed() {
        let request = protocol::encode(Shoot::once()).unwrap();
        let mock = Builder::new().write(&request).build();

        let mut client = TurretClient::from_stream(mock, mock_addr(), SessionConfig::default());
        let status = client.shoot_once().await.unwrap();
        assert!(!status.is_confirmed());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.move_to(1.0, 1.0).await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_reply_timeout_is_unconfirmed() {
        let (addr, server) = stub_server(Vec::new()).await;
        let config = SessionConfig::default().with_reply_timeout(Duration::from_millis(100));
        let mut client = TurretClient::connect(addr, config).await.unwrap();

        let status = client.move_to(0.0, 0.0).await.unwrap();
        assert!(matches!(status, AckStatus::Unconfirmed(_)));
        assert_eq!(client.state(), ConnectionState::Closed);
        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_late_ack_never_answers_next_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Answers the move too late, then answers a status request correctly
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            assert!(protocol::decode::<Move>(&buf[..n]).is_ok());

            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = stream.write_all(&protocol::encode(Acknowledge).unwrap()).await;

            let mut requests = 1;
            loop {
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                requests += 1;
                let status = protocol::encode(Status::new(1, 2, 3).unwrap()).unwrap();
                let _ = stream.write_all(&status).await;
            }
            requests
        });

        let config = SessionConfig::default().with_reply_timeout(Duration::from_millis(100));
        let mut client = TurretClient::connect(addr, config).await.unwrap();

        let status = client.move_to(10.0, 5.0).await.unwrap();
        assert!(matches!(status, AckStatus::Unconfirmed(_)));
        assert!(!client.is_connected());

        assert!(matches!(client.request_status().await, Err(ClientError::Closed)));
        drop(client);

        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_oversized_reply_closes_session() {
        let config = SessionConfig {
            max_frame_size: 24,
            ..SessionConfig::default()
        };
        let request = protocol::encode(Shoot::once()).unwrap();
        let reply = protocol::encode(Status::new(90.0, 45.0, 2).unwrap()).unwrap();
        assert!(reply.len() > 24);
        let mock = Builder::new().write(&request).read(&reply).build();

        let mut client = TurretClient::from_stream(mock, mock_addr(), config);
        match client.shoot_once().await.unwrap() {
            AckStatus::Unconfirmed(reason) => assert!(reason.contains("too large")),
            AckStatus::Confirmed => panic!("oversized reply must not confirm"),
        }
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.reset().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_wrong_reply_kind_keeps_session() {
        let request = protocol::encode(RequestStatus).unwrap();
        let ack = protocol::encode(Acknowledge).unwrap();
        let status = protocol::encode(Status::new(5, 6, 7).unwrap()).unwrap();
        let mock = Builder::new()
            .write(&request)
            .read(&ack)
            .write(&request)
            .read(&status)
            .build();

        let mut client = TurretClient::from_stream(mock, mock_addr(), SessionConfig::default());
        assert!(matches!(client.request_status().await, Err(ClientError::Codec(_))));
        assert!(client.is_connected());
        assert_eq!(client.request_status().await.unwrap().shots(), 7);
    }

    #[tokio::test]
    async fn test_invalid_shoot_fails_before_sending() {
        // The mock expects no I/O at all
        let mock = Builder::new().build();
        let mut client = TurretClient::from_stream(mock, mock_addr(), SessionConfig::default());

        match client.shoot(-1).await {
            Err(ClientError::Message(e)) => assert!(e.is_validation_error()),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(client.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_request_status() {
        let reply = protocol::encode(Status::new(90, 30.5, 4).unwrap()).unwrap();
        let request = protocol::encode(RequestStatus).unwrap();
        let mock = Builder::new().write(&request).read(&reply).build();

        let mut client = TurretClient::from_stream(mock, mock_addr(), SessionConfig::default());
        let status = client.request_status().await.unwrap();
        assert_eq!(status.base_angle(), 90.0);
        assert_eq!(status.elev_angle(), 30.5);
        assert_eq!(status.shots(), 4);
    }

    #[tokio::test]
    async fn test_request_status_rejects_ack() {
        let reply = protocol::encode(Acknowledge).unwrap();
        let request = protocol::encode(RequestStatus).unwrap();
        let mock = Builder::new().write(&request).read(&reply).build();

        let mut client = TurretClient::from_stream(mock, mock_addr(), SessionConfig::default());
        match client.request_status().await {
            Err(ClientError::Codec(e)) => assert!(e.message_error().unwrap().is_type_error()),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then release it so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TurretClient::connect(addr, SessionConfig::default()).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mock = Builder::new().build();
        let mut client = TurretClient::from_stream(mock, mock_addr(), SessionConfig::default());
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(!client.is_connected());
        assert!(matches!(client.reset().await, Err(ClientError::Closed)));
    }
}
