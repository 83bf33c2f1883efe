//! Instrument-bus transport (VISA resources: GPIB/USB/LXI).
//!
//! The bus is enumerated rather than discovered through the service
//! directory: the backend takes a candidate list of `(name, address)` pairs
//! and opens the first whose address is present among the attached resources.
//! A bus with no matching instrument is a diagnostic, not a failure —
//! initialization continues with the device disconnected.
//!
//! The [`InstrumentBus`] seam keeps VISA specifics behind the
//! `instrument_visa` feature; tests substitute their own bus.

use crate::discovery::ServiceId;
use crate::error::ConnectionError;
use crate::transport::{Backend, ConnectionHandle, Transport};
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

/// Enumerates attached instrument resources and opens transports to them.
#[async_trait]
pub trait InstrumentBus: Send + Sync {
    /// List the resource identifiers of all attached instruments.
    async fn list_resources(&self) -> Result<Vec<String>, ConnectionError>;

    /// Open a transport to one resource.
    async fn open(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectionError>;
}

/// Instrument-bus backend: enumerate, match a candidate, open.
///
/// Bus instruments are not advertised through the service directory, so the
/// handle identity is freshly minted per connection and availability events
/// never re-bind them.
pub struct BusBackend {
    bus: Arc<dyn InstrumentBus>,
    candidates: Vec<(String, String)>,
    timeout: Duration,
}

impl BusBackend {
    /// Create a backend over `bus` for the given `(name, address)` candidates.
    pub fn new(bus: Arc<dyn InstrumentBus>, candidates: Vec<(String, String)>, timeout: Duration) -> Self {
        Self {
            bus,
            candidates,
            timeout,
        }
    }
}

#[async_trait]
impl Backend for BusBackend {
    async fn open(&self, _address: &str) -> Result<ConnectionHandle, ConnectionError> {
        let resources = self.bus.list_resources().await?;
        if resources.is_empty() {
            warn!("no instruments attached to the bus");
            return Err(ConnectionError::ServerNotFound {
                node: "instrument bus".to_string(),
            });
        }
        info!("bus instruments: {resources:?}");

        for (name, address) in &self.candidates {
            if resources.iter().any(|resource| resource == address) {
                let transport = self.bus.open(address, self.timeout).await?;
                info!("instrument '{name}' connected at {address}");
                return Ok(ConnectionHandle::new(transport, ServiceId::new()));
            }
        }

        warn!("none of the configured instruments were found on the bus");
        Err(ConnectionError::ServerNotFound {
            node: "instrument bus".to_string(),
        })
    }

    fn matches_service(&self, _name: &str) -> bool {
        false
    }
}

#[cfg(feature = "instrument_visa")]
pub use visa_bus::VisaBus;

#[cfg(feature = "instrument_visa")]
mod visa_bus {
    use super::*;
    use log::debug;
    use tokio::sync::Mutex;
    use visa_rs::{DefaultRM, Instrument, VISA};

    fn visa_error(context: &str, err: impl std::fmt::Display) -> ConnectionError {
        ConnectionError::OpenFailed(format!("{context}: {err}"))
    }

    /// VISA-backed instrument bus.
    pub struct VisaBus;

    #[async_trait]
    impl InstrumentBus for VisaBus {
        async fn list_resources(&self) -> Result<Vec<String>, ConnectionError> {
            tokio::task::spawn_blocking(|| {
                let rm = DefaultRM::new()
                    .map_err(|e| visa_error("failed to create VISA resource manager", e))?;
                let resources = rm
                    .find_res_list("?*::INSTR")
                    .map_err(|e| visa_error("failed to enumerate VISA resources", e))?
                    .map(|resource| resource.to_string())
                    .collect();
                Ok(resources)
            })
            .await
            .map_err(|e| {
                ConnectionError::Io(std::io::Error::other(format!("VISA task panicked: {e}")))
            })?
        }

        async fn open(
            &self,
            address: &str,
            timeout: Duration,
        ) -> Result<Box<dyn Transport>, ConnectionError> {
            let resource = address.to_string();
            let timeout_ms = timeout.as_millis() as u32;
            let instrument = tokio::task::spawn_blocking(move || {
                let rm = DefaultRM::new()
                    .map_err(|e| visa_error("failed to create VISA resource manager", e))?;
                rm.open(&resource, timeout_ms, 0)
                    .map_err(|e| visa_error(&format!("failed to open VISA resource {resource}"), e))
            })
            .await
            .map_err(|e| {
                ConnectionError::Io(std::io::Error::other(format!("VISA task panicked: {e}")))
            })??;

            debug!("VISA resource '{address}' opened with {timeout_ms}ms timeout");
            Ok(Box::new(VisaTransport {
                instrument: Some(Arc::new(Mutex::new(instrument))),
                resource: address.to_string(),
            }))
        }
    }

    /// One open VISA instrument session.
    pub struct VisaTransport {
        instrument: Option<Arc<Mutex<Box<dyn Instrument>>>>,
        resource: String,
    }

    impl VisaTransport {
        fn instrument(&self) -> Result<Arc<Mutex<Box<dyn Instrument>>>, ConnectionError> {
            self.instrument.clone().ok_or(ConnectionError::NotConnected)
        }
    }

    #[async_trait]
    impl Transport for VisaTransport {
        async fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
            let instrument = self.instrument()?;
            let command = String::from_utf8_lossy(data).into_owned();
            tokio::task::spawn_blocking(move || {
                let mut guard = instrument.blocking_lock();
                guard
                    .write(&command)
                    .map_err(|e| visa_error("VISA write failed", e))
            })
            .await
            .map_err(|e| {
                ConnectionError::Io(std::io::Error::other(format!("VISA task panicked: {e}")))
            })??;
            Ok(())
        }

        async fn read(&mut self, max: usize) -> Result<Vec<u8>, ConnectionError> {
            let line = self.read_line().await?;
            let mut bytes = line.into_bytes();
            bytes.truncate(max);
            Ok(bytes)
        }

        async fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
            self.read(n).await
        }

        async fn read_line(&mut self) -> Result<String, ConnectionError> {
            let instrument = self.instrument()?;
            let line = tokio::task::spawn_blocking(move || {
                let mut guard = instrument.blocking_lock();
                guard.read().map_err(|e| visa_error("VISA read failed", e))
            })
            .await
            .map_err(|e| {
                ConnectionError::Io(std::io::Error::other(format!("VISA task panicked: {e}")))
            })??;
            Ok(line)
        }

        async fn flush_input(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn flush_output(&mut self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            if self.instrument.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource);
            }
            Ok(())
        }
    }
}

#[cfg(not(feature = "instrument_visa"))]
pub use stub_bus::VisaBus;

#[cfg(not(feature = "instrument_visa"))]
mod stub_bus {
    use super::*;

    fn feature_disabled() -> ConnectionError {
        ConnectionError::OpenFailed(
            "VISA support not enabled. Rebuild with --features instrument_visa".to_string(),
        )
    }

    /// Placeholder bus used when VISA support is compiled out.
    pub struct VisaBus;

    #[async_trait]
    impl InstrumentBus for VisaBus {
        async fn list_resources(&self) -> Result<Vec<String>, ConnectionError> {
            Err(feature_disabled())
        }

        async fn open(
            &self,
            _address: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn Transport>, ConnectionError> {
            Err(feature_disabled())
        }
    }
}
