//! The discovery→connect state machine.
//!
//! Startup resolves the device's port through the registry, locates the
//! transport backend, and opens the connection. Registry and
//! backend-discovery failures are operator problems, not crashes: they are
//! logged with remediation guidance and leave the device disconnected, ready
//! to re-bind when the backend comes online. Only missing configuration is
//! fatal.
//!
//! Availability events re-bind without re-resolving the port; the address a
//! port key resolved to is reused until the next full initialization.

use crate::config::DeviceConfig;
use crate::discovery::{ServiceEntry, ServiceId};
use crate::error::{ConfigError, ConnectionError, DeviceResult, RegistryError};
use crate::registry::{resolve_port, Registry};
use crate::transport::{Backend, ConnectionHandle};
use log::{debug, info, warn};
use std::sync::Arc;

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// Manager constructed, `initialize` not yet called.
    Uninitialized,
    /// Resolving the port key through the registry.
    ResolvingPort,
    /// Locating the transport backend and opening the connection.
    LocatingBackend,
    /// A live connection handle is held.
    Connected,
    /// No live handle; waiting for operator action or an availability event.
    Disconnected,
}

/// Owns one device's transport connection.
pub struct DeviceConnectionManager {
    config: DeviceConfig,
    registry: Arc<dyn Registry>,
    backend: Arc<dyn Backend>,
    state: LinkState,
    address: Option<String>,
    handle: Option<ConnectionHandle>,
}

impl DeviceConnectionManager {
    /// Create a manager in the `Uninitialized` state.
    pub fn new(
        config: DeviceConfig,
        registry: Arc<dyn Registry>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            config,
            registry,
            backend,
            state: LinkState::Uninitialized,
            address: None,
            handle: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// The device configuration this manager was built with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Whether a live connection handle is held.
    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Resolve the port and connect.
    ///
    /// # Errors
    ///
    /// `ConfigError::MissingAttributes` when the registry key or node name
    /// is not configured; this aborts initialization. Registry and
    /// backend-discovery failures do not: the device is left `Disconnected`
    /// with guidance logged for the operator.
    pub async fn initialize(&mut self) -> DeviceResult<()> {
        if self.config.reg_key.is_none() || self.config.node.is_none() {
            return Err(ConfigError::MissingAttributes {
                device: self.config.name.clone(),
                missing: "reg_key and node",
            }
            .into());
        }

        self.state = LinkState::ResolvingPort;
        let resolved = match resolve_port(
            self.registry.as_ref(),
            &self.config.name,
            self.config.reg_key.as_deref(),
        )
        .await
        {
            Ok(resolved) => resolved,
            Err(err @ RegistryError::NotConfigured(_)) => {
                warn!(
                    "device '{}': {err}; create the directory and store the device port under it",
                    self.config.name
                );
                self.state = LinkState::Disconnected;
                return Ok(());
            }
            Err(err @ RegistryError::KeyNotFound { .. }) => {
                warn!(
                    "device '{}': {err}; add the port key to the registry",
                    self.config.name
                );
                self.state = LinkState::Disconnected;
                return Ok(());
            }
            Err(err) => {
                self.state = LinkState::Disconnected;
                return Err(err.into());
            }
        };

        debug!(
            "device '{}': registry key '{}' resolved to '{}'",
            self.config.name, resolved.key, resolved.value
        );
        self.address = Some(resolved.value);
        self.connect_backend().await
    }

    /// Locate the backend and open the connection to the resolved address.
    async fn connect_backend(&mut self) -> DeviceResult<()> {
        self.state = LinkState::LocatingBackend;
        let Some(address) = self.address.clone() else {
            self.state = LinkState::Disconnected;
            return Ok(());
        };

        match self.backend.open(&address).await {
            Ok(handle) => {
                info!("device '{}' connected on '{}'", self.config.name, address);
                self.handle = Some(handle);
                self.state = LinkState::Connected;
                Ok(())
            }
            Err(err @ ConnectionError::ServerNotFound { .. }) => {
                warn!(
                    "device '{}': {err}; please start the correct backend server",
                    self.config.name
                );
                self.state = LinkState::Disconnected;
                Ok(())
            }
            Err(ConnectionError::OpenFailed(reason)) => {
                warn!(
                    "device '{}': error opening connection: {reason}; check the setup and restart the backend server",
                    self.config.name
                );
                self.state = LinkState::Disconnected;
                Ok(())
            }
            Err(err) => {
                self.state = LinkState::Disconnected;
                Err(err.into())
            }
        }
    }

    /// Borrow the live handle, or fail fast.
    ///
    /// # Errors
    ///
    /// `ConnectionError::NotConnected` when no live handle is held —
    /// including while a re-bind is still in progress.
    pub fn check_connected(&mut self) -> Result<&mut ConnectionHandle, ConnectionError> {
        self.handle.as_mut().ok_or(ConnectionError::NotConnected)
    }

    /// React to a backend service coming online.
    ///
    /// Re-binds when this device is disconnected, its port was already
    /// resolved, and the advertised name matches the expected backend for
    /// the configured node. The port is not re-resolved.
    pub async fn on_backend_available(&mut self, service: &ServiceEntry) {
        let should_bind = self.handle.is_none()
            && self.address.is_some()
            && self.config.node.is_some()
            && self.backend.matches_service(&service.name);
        if !should_bind {
            return;
        }

        match self.connect_backend().await {
            Ok(()) if self.is_connected() => {
                info!(
                    "backend server '{}' connected after startup; device '{}' re-bound",
                    service.name, self.config.name
                );
            }
            Ok(()) => {}
            Err(err) => {
                warn!(
                    "device '{}': re-bind to '{}' failed: {err}",
                    self.config.name, service.name
                );
            }
        }
    }

    /// React to a backend service going offline.
    ///
    /// Drops the handle only when the identity token matches the one the
    /// held handle was opened with. Returns whether the connection was
    /// dropped.
    pub fn on_backend_unavailable(&mut self, id: ServiceId) -> bool {
        match &self.handle {
            Some(handle) if handle.identity() == id => {
                warn!(
                    "backend server for device '{}' disconnected; relaunch it to reconnect",
                    self.config.name
                );
                self.handle = None;
                self.state = LinkState::Disconnected;
                true
            }
            _ => false,
        }
    }

    /// Drop the handle after a mid-operation transport failure.
    pub fn invalidate(&mut self) {
        if self.handle.take().is_some() {
            self.state = LinkState::Disconnected;
        }
    }

    /// Close the connection if one is open. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            if let Err(err) = handle.close().await {
                debug!(
                    "device '{}': error closing transport during shutdown: {err}",
                    self.config.name
                );
            }
        }
        self.state = LinkState::Disconnected;
    }
}
