//! Serial transport.
//!
//! The serial line for a device is provided by a named proxy server on the
//! device's node; [`SerialBackend`] locates it through the service directory
//! and opens the advertised port. Byte-level I/O goes through the `serialport`
//! crate, which is blocking, so every operation runs on Tokio's blocking
//! executor behind an `Arc<Mutex<..>>`.
//!
//! Reads poll the port with a short internal timeout and give up after the
//! configured per-device deadline.

use crate::discovery::{find_serial_server, is_serial_server_for, ServiceDirectory};
use crate::error::ConnectionError;
use crate::transport::{Backend, ConnectionHandle, Transport};
use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use log::debug;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::io::{Read, Write};
#[cfg(feature = "instrument_serial")]
use std::time::Instant;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Default serial baud rate when the device configuration does not set one.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Internal poll interval handed to the serial port; the overall read
/// deadline is enforced on top of it.
#[cfg(feature = "instrument_serial")]
const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[cfg(not(feature = "instrument_serial"))]
fn feature_disabled() -> ConnectionError {
    ConnectionError::OpenFailed(
        "serial support not enabled. Rebuild with --features instrument_serial".to_string(),
    )
}

#[cfg(feature = "instrument_serial")]
fn task_panicked(err: tokio::task::JoinError) -> ConnectionError {
    ConnectionError::Io(std::io::Error::other(format!(
        "serial I/O task panicked: {err}"
    )))
}

#[cfg(feature = "instrument_serial")]
fn timed_out(timeout: Duration) -> ConnectionError {
    ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("serial read timeout after {timeout:?}"),
    ))
}

/// Serial line to one device.
pub struct SerialTransport {
    port_name: String,
    timeout: Duration,
    response_delimiter: u8,
    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Open a serial port.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::OpenFailed`] when the port cannot be opened (or
    /// serial support is compiled out).
    pub async fn open(
        port_name: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        #[cfg(feature = "instrument_serial")]
        {
            let name = port_name.to_string();
            let port = tokio::task::spawn_blocking(move || {
                serialport::new(&name, baud_rate)
                    .timeout(PORT_POLL_TIMEOUT)
                    .open()
            })
            .await
            .map_err(task_panicked)?
            .map_err(|e| {
                ConnectionError::OpenFailed(format!(
                    "failed to open serial port '{port_name}' at {baud_rate} baud: {e}"
                ))
            })?;

            debug!("serial port '{port_name}' opened at {baud_rate} baud");
            Ok(Self {
                port_name: port_name.to_string(),
                timeout,
                response_delimiter: b'\n',
                port: Some(Arc::new(Mutex::new(port))),
            })
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = (port_name, baud_rate, timeout);
            Err(feature_disabled())
        }
    }

    /// Override the response line delimiter (defaults to `\n`).
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>, ConnectionError> {
        self.port.clone().ok_or(ConnectionError::NotConnected)
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .field("timeout", &self.timeout)
            .field("response_delimiter", &self.response_delimiter)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let port = self.port()?;
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            guard.write_all(&data)?;
            guard.flush()?;
            Ok::<(), std::io::Error>(())
        })
        .await
        .map_err(task_panicked)??;
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>, ConnectionError> {
        let port = self.port()?;
        let data = tokio::task::spawn_blocking(move || {
            let mut guard = port.blocking_lock();
            let mut buffer = vec![0u8; max.max(1)];
            match guard.read(&mut buffer) {
                Ok(n) => {
                    buffer.truncate(n);
                    Ok(buffer)
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(task_panicked)??;
        Ok(data)
    }

    async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        let port = self.port()?;
        let timeout = self.timeout;
        let data = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ConnectionError> {
            let mut guard = port.blocking_lock();
            let mut collected = Vec::with_capacity(n);
            let start = Instant::now();
            while collected.len() < n {
                if start.elapsed() > timeout {
                    return Err(timed_out(timeout));
                }
                let mut buffer = vec![0u8; n - collected.len()];
                match guard.read(&mut buffer) {
                    Ok(0) => {
                        return Err(ConnectionError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "unexpected EOF from serial port",
                        )))
                    }
                    Ok(read) => collected.extend_from_slice(&buffer[..read]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(collected)
        })
        .await
        .map_err(task_panicked)??;
        Ok(data)
    }

    async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let port = self.port()?;
        let timeout = self.timeout;
        let delimiter = self.response_delimiter;
        let line = tokio::task::spawn_blocking(move || -> Result<String, ConnectionError> {
            let mut guard = port.blocking_lock();
            let mut line: Vec<u8> = Vec::new();
            let mut buffer = [0u8; 1];
            let start = Instant::now();
            loop {
                if start.elapsed() > timeout {
                    return Err(timed_out(timeout));
                }
                match guard.read(&mut buffer) {
                    Ok(1) => {
                        line.push(buffer[0]);
                        if buffer[0] == delimiter {
                            break;
                        }
                    }
                    Ok(_) => {
                        return Err(ConnectionError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "unexpected EOF from serial port",
                        )))
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(String::from_utf8_lossy(&line).into_owned())
        })
        .await
        .map_err(task_panicked)??;
        debug!("serial response: {}", line.trim_end());
        Ok(line)
    }

    async fn flush_input(&mut self) -> Result<(), ConnectionError> {
        let port = self.port()?;
        tokio::task::spawn_blocking(move || {
            let guard = port.blocking_lock();
            guard
                .clear(serialport::ClearBuffer::Input)
                .map_err(|e| std::io::Error::other(e.to_string()))
        })
        .await
        .map_err(task_panicked)??;
        Ok(())
    }

    async fn flush_output(&mut self) -> Result<(), ConnectionError> {
        let port = self.port()?;
        tokio::task::spawn_blocking(move || {
            let guard = port.blocking_lock();
            guard
                .clear(serialport::ClearBuffer::Output)
                .map_err(|e| std::io::Error::other(e.to_string()))
        })
        .await
        .map_err(task_panicked)??;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        if self.port.take().is_some() {
            debug!("serial port '{}' closed", self.port_name);
        }
        Ok(())
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, _data: &[u8]) -> Result<(), ConnectionError> {
        Err(feature_disabled())
    }

    async fn read(&mut self, _max: usize) -> Result<Vec<u8>, ConnectionError> {
        Err(feature_disabled())
    }

    async fn read_bytes(&mut self, _n: usize) -> Result<Vec<u8>, ConnectionError> {
        Err(feature_disabled())
    }

    async fn read_line(&mut self) -> Result<String, ConnectionError> {
        Err(feature_disabled())
    }

    async fn flush_input(&mut self) -> Result<(), ConnectionError> {
        Err(feature_disabled())
    }

    async fn flush_output(&mut self) -> Result<(), ConnectionError> {
        Err(feature_disabled())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}

/// Serial backend: locate the node's serial server, then open its port.
pub struct SerialBackend {
    directory: Arc<dyn ServiceDirectory>,
    node: String,
    baud_rate: u32,
    timeout: Duration,
}

impl SerialBackend {
    /// Create a backend scoped to one node's serial server.
    pub fn new(
        directory: Arc<dyn ServiceDirectory>,
        node: &str,
        baud_rate: Option<u32>,
        timeout: Duration,
    ) -> Self {
        Self {
            directory,
            node: node.to_string(),
            baud_rate: baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            timeout,
        }
    }
}

#[async_trait]
impl Backend for SerialBackend {
    async fn open(&self, address: &str) -> Result<ConnectionHandle, ConnectionError> {
        let server = find_serial_server(self.directory.as_ref(), &self.node).await?;
        info!(
            "attempting to connect at server '{}', port '{}', timeout {:?}",
            server.name, address, self.timeout
        );
        let transport = SerialTransport::open(address, self.baud_rate, self.timeout).await?;
        info!("serial connection opened on '{address}'");
        Ok(ConnectionHandle::new(Box::new(transport), server.id))
    }

    fn matches_service(&self, name: &str) -> bool {
        is_serial_server_for(&self.node, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDirectory;

    #[tokio::test]
    async fn test_open_nonexistent_port_fails() {
        let err =
            SerialTransport::open("/dev/does-not-exist-9999", 9600, Duration::from_millis(50))
                .await
                .unwrap_err();
        assert!(matches!(err, ConnectionError::OpenFailed(_)));
    }

    #[tokio::test]
    async fn test_backend_requires_advertised_server() {
        let directory = Arc::new(MemoryDirectory::new());
        directory.register("othernode Serial Server");
        let backend = SerialBackend::new(directory, "labnode", None, Duration::from_millis(50));

        let err = backend.open("/dev/ttyUSB0").await.unwrap_err();
        assert!(matches!(err, ConnectionError::ServerNotFound { node } if node == "labnode"));
    }

    #[test]
    fn test_backend_matches_its_node() {
        let directory = Arc::new(MemoryDirectory::new());
        let backend = SerialBackend::new(directory, "labnode", None, Duration::from_millis(50));
        assert!(backend.matches_service("LabNode Serial Server"));
        assert!(!backend.matches_service("othernode Serial Server"));
    }
}
