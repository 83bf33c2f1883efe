//! Transport backends.
//!
//! A transport moves bytes and lines between the framework and one physical
//! device. Every backend exposes the same capability set through the
//! [`Transport`] trait; the [`Backend`] trait covers locating the backend and
//! opening a [`ConnectionHandle`] to a resolved address, so the connection
//! manager can drive one state machine over serial, TCP, and instrument-bus
//! variants alike.

pub mod mock;
pub mod serial;
pub mod tcp;
pub mod visa;

pub use mock::{MockBackend, MockTransport};
pub use serial::{SerialBackend, SerialTransport};
pub use tcp::{TcpBackend, TcpTransport, DEFAULT_TCP_TIMEOUT};
pub use visa::BusBackend;

use crate::discovery::ServiceId;
use crate::error::ConnectionError;
use async_trait::async_trait;

/// Uniform byte/line I/O over one device link.
///
/// All methods are suspension points; a slow device stalls only the calling
/// task. Read timeouts surface as [`ConnectionError::Io`] with kind
/// `TimedOut`, except [`Transport::read`], which returns what was available
/// (possibly nothing).
#[async_trait]
pub trait Transport: Send {
    /// Write raw bytes.
    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Read up to `max` bytes, returning early with whatever is available.
    async fn read(&mut self, max: usize) -> Result<Vec<u8>, ConnectionError>;

    /// Read exactly `n` bytes or time out.
    async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError>;

    /// Read one terminated line, including the terminator.
    async fn read_line(&mut self) -> Result<String, ConnectionError>;

    /// Discard any buffered inbound data.
    async fn flush_input(&mut self) -> Result<(), ConnectionError>;

    /// Push any buffered outbound data to the wire.
    async fn flush_output(&mut self) -> Result<(), ConnectionError>;

    /// Close the link. Further operations fail with
    /// [`ConnectionError::NotConnected`].
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// An open transport plus the identity of the backend service providing it.
///
/// Exclusively owned by one device connection manager; never shared across
/// devices. The identity token correlates disconnect notifications with this
/// handle.
pub struct ConnectionHandle {
    transport: Box<dyn Transport>,
    identity: ServiceId,
}

impl ConnectionHandle {
    /// Wrap an open transport.
    pub fn new(transport: Box<dyn Transport>, identity: ServiceId) -> Self {
        Self {
            transport,
            identity,
        }
    }

    /// Identity of the backend service behind this handle.
    pub fn identity(&self) -> ServiceId {
        self.identity
    }

    /// Write raw bytes.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.transport.write(data).await
    }

    /// Read up to `max` bytes.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, ConnectionError> {
        self.transport.read(max).await
    }

    /// Read exactly `n` bytes or time out.
    pub async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        self.transport.read_bytes(n).await
    }

    /// Read one terminated line.
    pub async fn read_line(&mut self) -> Result<String, ConnectionError> {
        self.transport.read_line().await
    }

    /// Discard buffered inbound data.
    pub async fn flush_input(&mut self) -> Result<(), ConnectionError> {
        self.transport.flush_input().await
    }

    /// Push buffered outbound data.
    pub async fn flush_output(&mut self) -> Result<(), ConnectionError> {
        self.transport.flush_output().await
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) -> Result<(), ConnectionError> {
        self.transport.close().await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Locates a transport backend and opens connections through it.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Locate the backend and open a connection to the resolved address.
    ///
    /// `address` is the value resolved from the port registry: a serial port
    /// name, an IP address, or an instrument-bus resource identifier.
    async fn open(&self, address: &str) -> Result<ConnectionHandle, ConnectionError>;

    /// Whether an advertised service name identifies this device's backend.
    ///
    /// Drives re-binding on availability events; backends that are not
    /// advertised through the service directory always return `false`.
    fn matches_service(&self, name: &str) -> bool;
}
