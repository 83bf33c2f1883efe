//! Core library for the rust_devctl application.
//!
//! A device-control layer for laboratory instruments: remote clients issue
//! get/set operations against devices reached over serial, TCP, or an
//! instrument bus. The library provides port discovery through a shared
//! configuration registry, transport-agnostic connection management with
//! automatic re-binding on backend availability events, and the command
//! codec for the HV500-16 high-voltage supply.

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod messages;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod transport;
