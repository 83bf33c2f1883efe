//! Device protocol codecs.
//!
//! A codec translates domain operations into the instrument's wire-level
//! ASCII command language and parses responses back into domain values. It
//! never touches a transport itself; the device server feeds encoded command
//! lines through the connection manager's handle.

pub mod hv500;

pub use hv500::{ChannelState, Hv500Codec, VoltageReading};
