//! Device server tasks.
//!
//! A device server owns its connection manager and codec, runs as a single
//! Tokio task, and serves the remote operations defined in
//! [`crate::messages`]. Commands and backend availability events interleave
//! only at await points, so an operation never races a re-bind on a
//! half-closed handle.

pub mod hv500;

pub use hv500::{Hv500Handle, Hv500Server};
