//! Device connection management.
//!
//! One [`manager::DeviceConnectionManager`] per device drives the
//! discovery→connect state machine and owns the single live connection
//! handle. Device protocol code never opens transports itself; it borrows
//! the handle through `check_connected` and lets the manager decide when the
//! link is usable.

pub mod manager;

pub use manager::{DeviceConnectionManager, LinkState};
