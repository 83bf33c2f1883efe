//! Backend service discovery.
//!
//! Transport backends (serial proxy servers in particular) are provided by
//! named services that come and go at runtime. This module defines the
//! directory contract used to enumerate them and the event stream that
//! reports availability changes, so a device can re-bind to its backend when
//! the backing server is relaunched.
//!
//! Subscription is explicit: interested parties call
//! [`ServiceDirectory::subscribe`] and own their receiver. There is no
//! ambient global listener state.

use crate::error::ConnectionError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Substring every serial proxy server carries in its advertised name.
pub const SERIAL_SERVER_MARKER: &str = "serial";

/// Opaque identity token for a backend service.
///
/// Used to correlate disconnect notifications with the connection handle
/// they affect; never interpreted beyond equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceId(Uuid);

impl ServiceId {
    /// Mint a fresh identity token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One advertised backend service.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    /// Identity token, stable for the lifetime of the service.
    pub id: ServiceId,
    /// Advertised service name.
    pub name: String,
}

/// Availability change for a backend service.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// A named service came online.
    Available(ServiceEntry),
    /// A service went offline.
    Unavailable(ServiceId),
}

/// Contract for the service directory collaborator.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Enumerate the currently advertised services.
    async fn services(&self) -> Vec<ServiceEntry>;

    /// Subscribe to availability events.
    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent>;
}

/// Whether an advertised name identifies the serial server for `node`.
///
/// Both the marker and the node name are matched as case-insensitive
/// substrings.
pub fn is_serial_server_for(node: &str, advertised: &str) -> bool {
    let advertised = advertised.to_lowercase();
    advertised.contains(SERIAL_SERVER_MARKER) && advertised.contains(&node.to_lowercase())
}

/// Find the serial server for `node`, taking the first match.
pub async fn find_serial_server(
    directory: &dyn ServiceDirectory,
    node: &str,
) -> Result<ServiceEntry, ConnectionError> {
    directory
        .services()
        .await
        .into_iter()
        .find(|service| is_serial_server_for(node, &service.name))
        .ok_or_else(|| ConnectionError::ServerNotFound {
            node: node.to_string(),
        })
}

/// In-process service directory.
///
/// The server binary registers its local backends here; tests drive
/// availability transitions through it.
pub struct MemoryDirectory {
    services: Mutex<Vec<ServiceEntry>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            services: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Advertise a service and notify subscribers.
    pub fn register(&self, name: &str) -> ServiceEntry {
        let entry = ServiceEntry {
            id: ServiceId::new(),
            name: name.to_string(),
        };
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        let _ = self.events.send(ServiceEvent::Available(entry.clone()));
        entry
    }

    /// Withdraw a service and notify subscribers.
    pub fn deregister(&self, id: ServiceId) {
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|service| service.id != id);
        let _ = self.events.send(ServiceEvent::Unavailable(id));
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceDirectory for MemoryDirectory {
    async fn services(&self) -> Vec<ServiceEntry> {
        self.services
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_server_matching() {
        assert!(is_serial_server_for("labnode", "labnode Serial Server"));
        assert!(is_serial_server_for("LabNode", "labnode serial server"));
        assert!(!is_serial_server_for("labnode", "othernode Serial Server"));
        assert!(!is_serial_server_for("labnode", "labnode GPIB Bus"));
    }

    #[tokio::test]
    async fn test_find_serial_server_first_match() {
        let directory = MemoryDirectory::new();
        directory.register("othernode Serial Server");
        let expected = directory.register("labnode Serial Server");
        directory.register("labnode serial server (backup)");

        let found = find_serial_server(&directory, "labnode").await.unwrap();
        assert_eq!(found.id, expected.id);
    }

    #[tokio::test]
    async fn test_find_serial_server_not_found() {
        let directory = MemoryDirectory::new();
        directory.register("othernode Serial Server");

        let err = find_serial_server(&directory, "labnode").await.unwrap_err();
        assert!(matches!(err, ConnectionError::ServerNotFound { node } if node == "labnode"));
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let directory = MemoryDirectory::new();
        let mut events = directory.subscribe();

        let entry = directory.register("labnode Serial Server");
        match events.recv().await.unwrap() {
            ServiceEvent::Available(seen) => assert_eq!(seen.id, entry.id),
            other => panic!("unexpected event: {other:?}"),
        }

        directory.deregister(entry.id);
        match events.recv().await.unwrap() {
            ServiceEvent::Unavailable(id) => assert_eq!(id, entry.id),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
