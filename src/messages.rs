//! Message types for the remote operation surface.
//!
//! Clients hold a command channel into a device server task and get results
//! back over oneshot channels. This is the crate-side stand-in for the
//! opaque RPC call/return channel: one request enum variant per remote
//! operation, argument validation and error signaling included in the reply.

use crate::device::LinkState;
use crate::error::DeviceResult;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

/// A voltage observed on one channel, pushed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageUpdate {
    /// Channel index, 1-based.
    pub channel: u8,
    /// Volts as reported by the device.
    pub volts: f64,
    /// When the reading was taken.
    pub at: DateTime<Utc>,
}

/// A registered push-notification subscription.
pub struct Subscription {
    /// Subscriber identity; pass to `unsubscribe` to withdraw.
    pub id: Uuid,
    /// Stream of voltage updates.
    pub updates: broadcast::Receiver<VoltageUpdate>,
}

/// Requests handled by a device server task.
pub enum DeviceRequest {
    /// Read the device identification line.
    GetIdentity {
        /// Reply channel.
        response: oneshot::Sender<DeviceResult<String>>,
    },

    /// Read the voltage on one channel.
    GetVoltage {
        /// Channel index, 1-based.
        channel: u8,
        /// Reply channel.
        response: oneshot::Sender<DeviceResult<f64>>,
    },

    /// Set the voltage on one channel.
    SetVoltage {
        /// Channel index, 1-based.
        channel: u8,
        /// Setpoint in volts.
        voltage: f64,
        /// Reply channel.
        response: oneshot::Sender<DeviceResult<()>>,
    },

    /// Read the connection state.
    GetLinkState {
        /// Reply channel.
        response: oneshot::Sender<LinkState>,
    },

    /// Register for push notifications.
    Subscribe {
        /// Reply channel.
        response: oneshot::Sender<Subscription>,
    },

    /// Withdraw a subscription. Replies whether the id was registered.
    Unsubscribe {
        /// Subscriber identity from [`Subscription`].
        id: Uuid,
        /// Reply channel.
        response: oneshot::Sender<bool>,
    },

    /// Stop the device server.
    Shutdown {
        /// Reply channel, completed once shutdown begins.
        response: oneshot::Sender<()>,
    },
}

impl DeviceRequest {
    /// Helper to create a GetIdentity request
    pub fn get_identity() -> (Self, oneshot::Receiver<DeviceResult<String>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetIdentity { response: tx }, rx)
    }

    /// Helper to create a GetVoltage request
    pub fn get_voltage(channel: u8) -> (Self, oneshot::Receiver<DeviceResult<f64>>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetVoltage { channel, response: tx }, rx)
    }

    /// Helper to create a SetVoltage request
    pub fn set_voltage(channel: u8, voltage: f64) -> (Self, oneshot::Receiver<DeviceResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::SetVoltage {
                channel,
                voltage,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a GetLinkState request
    pub fn get_link_state() -> (Self, oneshot::Receiver<LinkState>) {
        let (tx, rx) = oneshot::channel();
        (Self::GetLinkState { response: tx }, rx)
    }

    /// Helper to create a Subscribe request
    pub fn subscribe() -> (Self, oneshot::Receiver<Subscription>) {
        let (tx, rx) = oneshot::channel();
        (Self::Subscribe { response: tx }, rx)
    }

    /// Helper to create an Unsubscribe request
    pub fn unsubscribe(id: Uuid) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (Self::Unsubscribe { id, response: tx }, rx)
    }

    /// Helper to create a Shutdown request
    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
