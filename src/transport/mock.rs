//! Mock transport and backend.
//!
//! Scripted stand-ins for the real backends, used by codec and server tests
//! and by the simulator path. Responses are queued ahead of time; every
//! write is captured for later inspection. Clones share the same script and
//! capture buffers, so a test can keep one clone while the device owns the
//! other.

use crate::discovery::{is_serial_server_for, ServiceId};
use crate::error::ConnectionError;
use crate::transport::{Backend, ConnectionHandle, Transport};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

fn no_scripted_response() -> ConnectionError {
    ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        "no scripted response queued",
    ))
}

#[derive(Default)]
struct MockState {
    writes: Vec<Vec<u8>>,
    responses: VecDeque<String>,
    fail_io: bool,
    open: bool,
}

/// Scripted transport.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create an open transport with an empty script.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                open: true,
                ..MockState::default()
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a response line for a later read.
    pub fn push_response(&self, line: impl Into<String>) {
        self.lock().responses.push_back(line.into());
    }

    /// Make every subsequent I/O operation fail, as a half-closed link would.
    pub fn fail_io(&self) {
        self.lock().fail_io = true;
    }

    /// Everything written so far, lossily decoded per write.
    pub fn written(&self) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    /// Number of writes issued so far.
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    fn check_usable(state: &MockState) -> Result<(), ConnectionError> {
        if !state.open {
            return Err(ConnectionError::NotConnected);
        }
        if state.fail_io {
            return Err(ConnectionError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated I/O failure",
            )));
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut state = self.lock();
        Self::check_usable(&state)?;
        state.writes.push(data.to_vec());
        Ok(())
    }

    async fn read(&mut self, max: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut state = self.lock();
        Self::check_usable(&state)?;
        match state.responses.pop_front() {
            Some(line) => {
                let mut bytes = line.into_bytes();
                bytes.truncate(max);
                Ok(bytes)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut state = self.lock();
        Self::check_usable(&state)?;
        let line = state.responses.pop_front().ok_or_else(no_scripted_response)?;
        let mut bytes = line.into_bytes();
        bytes.truncate(n);
        Ok(bytes)
    }

    async fn read_line(&mut self) -> Result<String, ConnectionError> {
        let mut state = self.lock();
        Self::check_usable(&state)?;
        state.responses.pop_front().ok_or_else(no_scripted_response)
    }

    async fn flush_input(&mut self) -> Result<(), ConnectionError> {
        Self::check_usable(&self.lock())
    }

    async fn flush_output(&mut self) -> Result<(), ConnectionError> {
        Self::check_usable(&self.lock())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.lock().open = false;
        Ok(())
    }
}

/// Scripted backend.
///
/// Each `open` consumes the next queued outcome; an empty queue reports the
/// backend server as missing.
pub struct MockBackend {
    node: String,
    identity: ServiceId,
    outcomes: Mutex<VecDeque<Result<MockTransport, ConnectionError>>>,
    opens: Mutex<usize>,
}

impl MockBackend {
    /// Create a backend for `node` with an empty outcome queue.
    pub fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            identity: ServiceId::new(),
            outcomes: Mutex::new(VecDeque::new()),
            opens: Mutex::new(0),
        }
    }

    /// Identity attached to every handle this backend opens.
    pub fn identity(&self) -> ServiceId {
        self.identity
    }

    /// Queue a transport for the next `open`.
    pub fn push_transport(&self, transport: MockTransport) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Ok(transport));
    }

    /// Queue a failure for the next `open`.
    pub fn push_failure(&self, error: ConnectionError) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(error));
    }

    /// Number of `open` attempts made so far.
    pub fn open_count(&self) -> usize {
        *self.opens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn open(&self, _address: &str) -> Result<ConnectionHandle, ConnectionError> {
        *self.opens.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        let outcome = self
            .outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match outcome {
            Some(Ok(transport)) => Ok(ConnectionHandle::new(Box::new(transport), self.identity)),
            Some(Err(error)) => Err(error),
            None => Err(ConnectionError::ServerNotFound {
                node: self.node.clone(),
            }),
        }
    }

    fn matches_service(&self, name: &str) -> bool {
        is_serial_server_for(&self.node, name)
    }
}
