//! TCP transport.
//!
//! For devices that sit directly on the lab network. The address is resolved
//! through the port registry; the socket is opened with a connect timeout and
//! every read is bounded by the same per-device timeout.
//!
//! `read_line` accumulates receive chunks until the terminator substring
//! appears anywhere in the accumulated buffer. If the peer sends back-to-back
//! lines faster than they are consumed, a read can return trailing bytes
//! belonging to the next line; callers own that framing risk.

use crate::discovery::ServiceId;
use crate::error::ConnectionError;
use crate::transport::{Backend, ConnectionHandle, Transport};
use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default communication timeout for TCP devices.
pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(1);

/// Typical socket read size.
const READ_SIZE: usize = 4096;

/// Line terminator used by [`Transport::read_line`].
const LINE_TERMINATOR: &str = "\n";

fn timed_out(timeout: Duration) -> ConnectionError {
    ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("socket read timeout after {timeout:?}"),
    ))
}

fn closed_by_peer() -> ConnectionError {
    ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "socket closed by peer",
    ))
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Blocking-style socket to one network device.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<TcpStream>,
    peer: String,
    timeout: Duration,
}

impl TcpTransport {
    /// Connect to `address:port` within `timeout`.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::OpenFailed`] on refusal or connect timeout.
    pub async fn connect(
        address: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let peer = format!("{address}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&peer))
            .await
            .map_err(|_| ConnectionError::OpenFailed(format!("connection to {peer} timed out")))?
            .map_err(|e| ConnectionError::OpenFailed(format!("failed to connect to {peer}: {e}")))?;

        debug!("TCP connection opened to {peer}");
        Ok(Self {
            stream: Some(stream),
            peer,
            timeout,
        })
    }

    fn stream(&mut self) -> Result<&mut TcpStream, ConnectionError> {
        self.stream.as_mut().ok_or(ConnectionError::NotConnected)
    }

    /// Read one line terminated by `terminator`.
    ///
    /// Each call starts with an empty accumulator; everything received up to
    /// and including the first appearance of the terminator is returned.
    pub async fn read_line_with(&mut self, terminator: &str) -> Result<String, ConnectionError> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        let mut accumulated = BytesMut::with_capacity(READ_SIZE);
        let mut buffer = [0u8; READ_SIZE];

        while !contains_subslice(&accumulated, terminator.as_bytes()) {
            let n = tokio::time::timeout(timeout, stream.read(&mut buffer))
                .await
                .map_err(|_| timed_out(timeout))??;
            if n == 0 {
                return Err(closed_by_peer());
            }
            accumulated.extend_from_slice(&buffer[..n]);
        }

        Ok(String::from_utf8_lossy(&accumulated).into_owned())
    }

    /// Drain the socket read buffer, stopping at the first timeout.
    ///
    /// Used to clear stale buffered data when a device server starts; this is
    /// a single bounded read, not a blocking full drain.
    pub async fn read_all(&mut self) -> Result<String, ConnectionError> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        let mut buffer = [0u8; READ_SIZE];
        match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Err(_elapsed) => Ok(String::new()),
            Ok(Ok(n)) => Ok(String::from_utf8_lossy(&buffer[..n]).into_owned()),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        tokio::time::timeout(timeout, stream.write_all(data))
            .await
            .map_err(|_| timed_out(timeout))??;
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>, ConnectionError> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        let mut buffer = vec![0u8; max.max(1)];
        match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
            Err(_elapsed) => Ok(Vec::new()),
            Ok(Ok(n)) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        let timeout = self.timeout;
        let stream = self.stream()?;
        let mut buffer = vec![0u8; n];
        tokio::time::timeout(timeout, stream.read_exact(&mut buffer))
            .await
            .map_err(|_| timed_out(timeout))??;
        Ok(buffer)
    }

    async fn read_line(&mut self) -> Result<String, ConnectionError> {
        self.read_line_with(LINE_TERMINATOR).await
    }

    async fn flush_input(&mut self) -> Result<(), ConnectionError> {
        self.read_all().await.map(|_| ())
    }

    async fn flush_output(&mut self) -> Result<(), ConnectionError> {
        self.stream()?.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("TCP connection to {} closed", self.peer);
        }
        Ok(())
    }
}

/// TCP backend: connect directly to the resolved address.
///
/// TCP devices are not advertised through the service directory, so the
/// handle identity is freshly minted per connection and availability events
/// never re-bind them.
pub struct TcpBackend {
    port: u16,
    timeout: Duration,
}

impl TcpBackend {
    /// Create a backend for a device listening on `port`.
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl Backend for TcpBackend {
    async fn open(&self, address: &str) -> Result<ConnectionHandle, ConnectionError> {
        let mut transport = TcpTransport::connect(address, self.port, self.timeout).await?;
        // Clear anything the device buffered before we attached.
        let stale = transport.read_all().await?;
        if !stale.is_empty() {
            debug!("discarded {} bytes of stale data from {address}", stale.len());
        }
        info!("TCP connection opened to {address}:{}", self.port);
        Ok(ConnectionHandle::new(Box::new(transport), ServiceId::new()))
    }

    fn matches_service(&self, _name: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn transport_pair() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ip = addr.ip().to_string();
        let connect = TcpTransport::connect(
            &ip,
            addr.port(),
            Duration::from_millis(500),
        );
        let (transport, accepted) = tokio::join!(connect, listener.accept());
        (transport.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_read_line_across_chunks() {
        let (mut transport, mut peer) = transport_pair().await;

        let writer = tokio::spawn(async move {
            peer.write_all(b"12.").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            peer.write_all(b"5\n").await.unwrap();
            peer
        });

        let line = transport.read_line().await.unwrap();
        assert_eq!(line, "12.5\n");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_line_returns_everything_received() {
        let (mut transport, mut peer) = transport_pair().await;

        // Two lines in one segment: both come back from a single read_line.
        peer.write_all(b"first\nsecond\n").await.unwrap();
        let line = transport.read_line().await.unwrap();
        assert_eq!(line, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_read_line_timeout() {
        let (mut transport, _peer) = transport_pair().await;
        let err = transport.read_line().await.unwrap_err();
        match err {
            ConnectionError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_all_returns_empty_on_timeout() {
        let (mut transport, _peer) = transport_pair().await;
        assert_eq!(transport.read_all().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_read_all_drains_stale_data() {
        let (mut transport, mut peer) = transport_pair().await;
        peer.write_all(b"stale\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.read_all().await.unwrap(), "stale\r\n");
    }

    #[tokio::test]
    async fn test_write_then_echo() {
        let (mut transport, mut peer) = transport_pair().await;

        transport.write(b"PING\r").await.unwrap();
        let mut buffer = [0u8; 5];
        peer.read_exact(&mut buffer).await.unwrap();
        assert_eq!(&buffer, b"PING\r");
    }

    #[tokio::test]
    async fn test_closed_transport_is_not_connected() {
        let (mut transport, _peer) = transport_pair().await;
        transport.close().await.unwrap();
        assert!(matches!(
            transport.write(b"x").await.unwrap_err(),
            ConnectionError::NotConnected
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on localhost is almost certainly closed.
        let err = TcpTransport::connect("127.0.0.1", 1, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::OpenFailed(_)));
    }

    #[tokio::test]
    async fn test_backend_open_clears_stale_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"stale\r\n").await.unwrap();
            // Keep the socket open until the backend has drained it.
            tokio::time::sleep(Duration::from_millis(400)).await;
            socket
        });

        let backend = TcpBackend::new(addr.port(), Duration::from_millis(200));
        let mut handle = backend.open(&addr.ip().to_string()).await.unwrap();
        let _socket = peer.await.unwrap();

        // The stale line was consumed during open; nothing is left to read.
        let err = handle.read_line().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut));
    }

    #[test]
    fn test_backend_never_matches_directory_services() {
        let backend = TcpBackend::new(5025, DEFAULT_TCP_TIMEOUT);
        assert!(!backend.matches_service("labnode Serial Server"));
    }

    #[test]
    fn test_contains_subslice() {
        assert!(contains_subslice(b"12.5\n", b"\n"));
        assert!(contains_subslice(b"ab\r\ncd", b"\r\n"));
        assert!(!contains_subslice(b"12.5", b"\n"));
        assert!(!contains_subslice(b"", b"\n"));
    }
}
