//! Device server for the HV500-16 low noise voltage supply.
//!
//! Remote operations: `get_identity`, `get_voltage(channel)` and
//! `set_voltage(channel, voltage)`. The graphical client polls voltages
//! periodically and writes setpoints on user edits; any failed call is
//! reported to it as an error reply, never a crash.
//!
//! The server task keeps a per-channel state cache, rebuilt from device
//! queries whenever the connection is (re)established, and pushes observed
//! voltages to registered subscribers.

use crate::config::DeviceConfig;
use crate::device::{DeviceConnectionManager, LinkState};
use crate::discovery::{ServiceDirectory, ServiceEvent};
use crate::error::{ConnectionError, DeviceError, DeviceResult};
use crate::messages::{DeviceRequest, Subscription, VoltageUpdate};
use crate::protocol::hv500::{parse_voltage_reply, ChannelState, Hv500Codec, CHANNEL_COUNT};
use crate::protocol::VoltageReading;
use crate::registry::Registry;
use crate::transport::Backend;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Capacity of the request channel into the server task.
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the voltage-update broadcast channel.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// The HV500 device server task.
pub struct Hv500Server {
    manager: DeviceConnectionManager,
    codec: Hv500Codec,
    channels: Vec<ChannelState>,
    listeners: HashSet<Uuid>,
    updates: broadcast::Sender<VoltageUpdate>,
}

impl Hv500Server {
    /// Create a server for one HV500 unit.
    pub fn new(
        config: DeviceConfig,
        registry: Arc<dyn Registry>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        let codec = Hv500Codec::from_registry_key(config.reg_key.as_deref().unwrap_or_default());
        let channels = (1..=CHANNEL_COUNT).map(ChannelState::new).collect();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            manager: DeviceConnectionManager::new(config, registry, backend),
            codec,
            channels,
            listeners: HashSet::new(),
            updates,
        }
    }

    /// Spawn the server task and return the client handle.
    pub fn spawn(
        config: DeviceConfig,
        registry: Arc<dyn Registry>,
        backend: Arc<dyn Backend>,
        directory: &dyn ServiceDirectory,
    ) -> (Hv500Handle, JoinHandle<()>) {
        let events = directory.subscribe();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let server = Self::new(config, registry, backend);
        let task = tokio::spawn(server.run(requests_rx, events));
        (Hv500Handle { requests: requests_tx }, task)
    }

    fn name(&self) -> &str {
        &self.manager.config().name
    }

    /// Serve requests and availability events until shutdown.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<DeviceRequest>,
        mut events: broadcast::Receiver<ServiceEvent>,
    ) {
        match self.manager.initialize().await {
            Ok(()) => {
                if self.manager.is_connected() {
                    info!("device '{}' connected; reading initial channel state", self.name());
                    self.refresh_channels().await;
                }
            }
            Err(err) => {
                error!("device '{}' failed to initialize: {err}", self.name());
                return;
            }
        }

        let mut events_open = true;
        loop {
            tokio::select! {
                request = requests.recv() => {
                    match request {
                        Some(request) => {
                            if self.handle_request(request).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                "device '{}' missed {missed} backend availability events",
                                self.name()
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => events_open = false,
                    }
                }
            }
        }

        self.manager.shutdown().await;
        info!("device server '{}' stopped", self.name());
    }

    /// Returns whether shutdown was requested.
    async fn handle_request(&mut self, request: DeviceRequest) -> bool {
        match request {
            DeviceRequest::GetIdentity { response } => {
                let _ = response.send(self.get_identity().await);
            }
            DeviceRequest::GetVoltage { channel, response } => {
                let _ = response.send(self.get_voltage(channel).await);
            }
            DeviceRequest::SetVoltage {
                channel,
                voltage,
                response,
            } => {
                let _ = response.send(self.set_voltage(channel, voltage).await);
            }
            DeviceRequest::GetLinkState { response } => {
                let _ = response.send(self.manager.state());
            }
            DeviceRequest::Subscribe { response } => {
                let id = Uuid::new_v4();
                self.listeners.insert(id);
                let _ = response.send(Subscription {
                    id,
                    updates: self.updates.subscribe(),
                });
            }
            DeviceRequest::Unsubscribe { id, response } => {
                let _ = response.send(self.listeners.remove(&id));
            }
            DeviceRequest::Shutdown { response } => {
                let _ = response.send(());
                return true;
            }
        }
        false
    }

    async fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Available(service) => {
                let was_connected = self.manager.is_connected();
                self.manager.on_backend_available(&service).await;
                if !was_connected && self.manager.is_connected() {
                    self.refresh_channels().await;
                }
            }
            ServiceEvent::Unavailable(id) => {
                self.manager.on_backend_unavailable(id);
            }
        }
    }

    /// Read the device identification line, e.g. `"HV264 500 16 b"`.
    async fn get_identity(&mut self) -> DeviceResult<String> {
        let command = self.codec.identify_command();
        let line = self.exchange(&command).await?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read one channel's voltage.
    ///
    /// Readback is digitized to tens of millivolts by the device.
    async fn get_voltage(&mut self, channel: u8) -> DeviceResult<f64> {
        let command = self.codec.query_voltage_command(channel)?;
        let line = self.exchange(&command).await?;
        let volts = parse_voltage_reply(&line)?;

        let state = &mut self.channels[usize::from(channel - 1)];
        state.last_reading = Some(VoltageReading { volts, at: Utc::now() });
        state.pending_setpoint = None;
        self.notify_listeners(channel, volts);
        Ok(volts)
    }

    /// Set one channel's voltage. No response is expected from the device.
    async fn set_voltage(&mut self, channel: u8, voltage: f64) -> DeviceResult<()> {
        let command = self.codec.set_voltage_command(channel, voltage)?;
        self.send(&command).await?;
        self.channels[usize::from(channel - 1)].pending_setpoint = Some(voltage);
        Ok(())
    }

    /// Rebuild the channel cache from device queries.
    async fn refresh_channels(&mut self) {
        for channel in 1..=CHANNEL_COUNT {
            match self.get_voltage(channel).await {
                Ok(_) => {}
                Err(DeviceError::Connection(ConnectionError::NotConnected)) => {
                    warn!(
                        "device '{}' lost its connection while refreshing channels",
                        self.name()
                    );
                    break;
                }
                Err(err) => {
                    debug!("device '{}': channel {channel} refresh failed: {err}", self.name());
                }
            }
        }
    }

    /// Write a command and read one response line.
    async fn exchange(&mut self, command: &str) -> DeviceResult<String> {
        let outcome = {
            let handle = self.manager.check_connected()?;
            match handle.write(command.as_bytes()).await {
                Ok(()) => handle.read_line().await,
                Err(err) => Err(err),
            }
        };
        self.settle_io(outcome)
    }

    /// Write a command with no expected response.
    async fn send(&mut self, command: &str) -> DeviceResult<()> {
        let outcome = {
            let handle = self.manager.check_connected()?;
            handle.write(command.as_bytes()).await
        };
        self.settle_io(outcome)
    }

    /// Invalidate the connection on a transport failure; the caller observes
    /// `NotConnected` and recovery waits for an availability event.
    fn settle_io<T>(&mut self, outcome: Result<T, ConnectionError>) -> DeviceResult<T> {
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(
                    "device '{}': transport failure: {err}; dropping connection",
                    self.name()
                );
                self.manager.invalidate();
                Err(ConnectionError::NotConnected.into())
            }
        }
    }

    fn notify_listeners(&self, channel: u8, volts: f64) {
        if self.listeners.is_empty() {
            return;
        }
        let _ = self.updates.send(VoltageUpdate {
            channel,
            volts,
            at: Utc::now(),
        });
    }
}

/// Client handle to a spawned [`Hv500Server`].
///
/// Cheap to clone; every method is one remote operation.
#[derive(Clone)]
pub struct Hv500Handle {
    requests: mpsc::Sender<DeviceRequest>,
}

impl Hv500Handle {
    async fn deliver<T>(
        &self,
        request: DeviceRequest,
        response: oneshot::Receiver<T>,
    ) -> DeviceResult<T> {
        self.requests
            .send(request)
            .await
            .map_err(|_| DeviceError::ServerStopped)?;
        response.await.map_err(|_| DeviceError::ServerStopped)
    }

    /// Device identification line, e.g. `"HV264 500 16 b"`.
    pub async fn get_identity(&self) -> DeviceResult<String> {
        let (request, response) = DeviceRequest::get_identity();
        self.deliver(request, response).await?
    }

    /// Voltage on `channel` (1..=16), in volts.
    pub async fn get_voltage(&self, channel: u8) -> DeviceResult<f64> {
        let (request, response) = DeviceRequest::get_voltage(channel);
        self.deliver(request, response).await?
    }

    /// Set `channel` (1..=16) to `voltage` volts, |voltage| <= 300.
    pub async fn set_voltage(&self, channel: u8, voltage: f64) -> DeviceResult<()> {
        let (request, response) = DeviceRequest::set_voltage(channel, voltage);
        self.deliver(request, response).await?
    }

    /// Current connection state.
    pub async fn link_state(&self) -> DeviceResult<LinkState> {
        let (request, response) = DeviceRequest::get_link_state();
        self.deliver(request, response).await
    }

    /// Register for voltage-update push notifications.
    pub async fn subscribe(&self) -> DeviceResult<Subscription> {
        let (request, response) = DeviceRequest::subscribe();
        self.deliver(request, response).await
    }

    /// Withdraw a subscription; returns whether the id was registered.
    pub async fn unsubscribe(&self, id: Uuid) -> DeviceResult<bool> {
        let (request, response) = DeviceRequest::unsubscribe(id);
        self.deliver(request, response).await
    }

    /// Stop the device server. Further requests fail with `ServerStopped`.
    pub async fn shutdown(&self) -> DeviceResult<()> {
        let (request, response) = DeviceRequest::shutdown();
        self.deliver(request, response).await
    }
}
