//! Custom error types for the device-control framework.
//!
//! Errors are grouped by the layer that raises them, and every variant carries
//! a structured reason so callers can pattern-match instead of comparing
//! framework-specific codes:
//!
//! - **`ConfigError`**: missing or invalid device configuration. A missing
//!   registry key or node name is fatal and aborts initialization.
//! - **`RegistryError`**: failures while resolving a port through the shared
//!   configuration registry. Non-fatal at startup; the device is left
//!   disconnected and the operator is told what to fix.
//! - **`ConnectionError`**: transport discovery and lifecycle failures.
//!   `ServerNotFound`/`OpenFailed` are non-fatal at startup; `NotConnected`
//!   is raised per-operation whenever no live handle is held.
//! - **`ProtocolError`**: caller-input validation and wire-response parsing
//!   for a device codec. Always surfaced synchronously, never retried.
//!
//! `DeviceError` consolidates the above with `#[from]` conversions so the `?`
//! operator works across layer boundaries.

use thiserror::Error;

/// Convenience alias for results using the framework error type.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Fatal configuration problems.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The device definition lacks attributes required before any connection
    /// attempt can be made.
    #[error("device '{device}' must define {missing}")]
    MissingAttributes {
        /// Device identifier from the settings file.
        device: String,
        /// Human-readable list of the missing attributes.
        missing: &'static str,
    },

    /// The settings file could not be loaded or parsed.
    #[error("configuration load error: {0}")]
    Load(#[from] figment::Error),

    /// The settings file parsed but contains logically invalid values.
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Failures while navigating the configuration registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The well-known namespace directory does not exist at the registry
    /// root. The registry has never been set up for port lookups.
    #[error("registry is not configured: missing '{0}' directory at the root")]
    NotConfigured(String),

    /// No key under the namespace directory contains the lookup substring.
    #[error("no key matching '{pattern}' found in the registry '{namespace}' directory")]
    KeyNotFound {
        /// Substring the lookup searched for.
        pattern: String,
        /// Namespace directory that was searched.
        namespace: String,
    },

    /// A `cd` target does not exist.
    #[error("registry directory not found: {0}")]
    NoSuchDirectory(String),

    /// A `get` key does not exist in the current directory.
    #[error("registry key not found: {0}")]
    NoSuchKey(String),
}

/// Transport discovery and lifecycle failures.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// No backend server advertising the expected name is currently online.
    #[error("could not find a serial server for node '{node}'")]
    ServerNotFound {
        /// Node name the discovery was scoped to.
        node: String,
    },

    /// The backend was located but the transport could not be opened.
    #[error("error opening connection: {0}")]
    OpenFailed(String),

    /// An operation was attempted while no live connection handle is held.
    #[error("attempting to use a device connection when not connected")]
    NotConnected,

    /// Transport-level I/O failure, including read timeouts.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Caller-input validation and wire-response parsing failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Channel index outside the instrument's fixed channel count.
    #[error("channel {channel} out of range (1..={max})")]
    ChannelOutOfRange {
        /// Requested channel index.
        channel: u8,
        /// Highest valid channel index.
        max: u8,
    },

    /// Setpoint outside the instrument's voltage bound.
    #[error("voltage setpoint {voltage} V out of bounds (|v| <= {limit} V)")]
    OutOfBounds {
        /// Requested voltage in volts.
        voltage: f64,
        /// Symmetric bound in volts.
        limit: f64,
    },

    /// The device reply did not parse as the expected value.
    #[error("malformed device response: '{0}'")]
    MalformedResponse(String),
}

/// Unified error type for the framework.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// See [`RegistryError`].
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// See [`ConnectionError`].
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// See [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The device server task has stopped and can no longer answer requests.
    #[error("device server has stopped")]
    ServerStopped,
}
