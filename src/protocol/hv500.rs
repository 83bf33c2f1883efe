//! Codec for the HV500-16 low noise voltage supply.
//!
//! ## Wire protocol
//!
//! ASCII command lines terminated by a carriage return. Queries are answered
//! with one terminated ASCII line; sets produce no response.
//!
//! ```text
//! IDN                      -> identity line, e.g. "HV264 500 16 b"
//! <IDN> Q<ch>              -> channel voltage, e.g. "12.50V"
//! <IDN> CH<ch> <word>      -> set channel voltage (no response)
//! ```
//!
//! Channels are encoded as two-digit zero-padded decimals ("01".."16"). A
//! setpoint is transmitted as `(volts + 500) / 1000` formatted to exactly six
//! decimal places, so 0 V is "0.500000" and the ±300 V limits map to
//! "0.200000" and "0.800000". The `<IDN>` address prefix is the last five
//! characters of the device's registry key.
//!
//! Voltage readback is digitized to tens of millivolts by the device.

use crate::error::ProtocolError;
use chrono::{DateTime, Utc};

/// Number of output channels.
pub const CHANNEL_COUNT: u8 = 16;

/// Symmetric voltage bound in volts, enforced before any wire write.
pub const VOLTAGE_LIMIT: f64 = 300.0;

/// Offset applied when encoding a setpoint into the wire word.
const ENCODE_OFFSET: f64 = 500.0;

/// Scale applied when encoding a setpoint into the wire word.
const ENCODE_SCALE: f64 = 1000.0;

/// Number of characters of the registry key used as the device address.
const IDN_LEN: usize = 5;

/// Encode a channel index as the two-digit wire form.
///
/// # Errors
///
/// [`ProtocolError::ChannelOutOfRange`] outside `1..=16`.
pub fn channel_to_code(channel: u8) -> Result<String, ProtocolError> {
    if !(1..=CHANNEL_COUNT).contains(&channel) {
        return Err(ProtocolError::ChannelOutOfRange {
            channel,
            max: CHANNEL_COUNT,
        });
    }
    Ok(format!("{channel:02}"))
}

/// Encode a voltage setpoint as the wire word.
///
/// # Errors
///
/// [`ProtocolError::OutOfBounds`] when `|volts|` exceeds [`VOLTAGE_LIMIT`].
pub fn encode_setpoint(volts: f64) -> Result<String, ProtocolError> {
    if !volts.is_finite() || volts.abs() > VOLTAGE_LIMIT {
        return Err(ProtocolError::OutOfBounds {
            voltage: volts,
            limit: VOLTAGE_LIMIT,
        });
    }
    let word = (volts + ENCODE_OFFSET) / ENCODE_SCALE;
    Ok(format!("{word:.6}"))
}

/// Invert [`encode_setpoint`].
///
/// # Errors
///
/// [`ProtocolError::MalformedResponse`] when the word does not parse.
pub fn decode_setpoint(word: &str) -> Result<f64, ProtocolError> {
    let value: f64 = word
        .trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedResponse(word.to_string()))?;
    Ok(value * ENCODE_SCALE - ENCODE_OFFSET)
}

/// Parse a voltage query reply.
///
/// The device appends a unit character to the reading, so everything up to
/// the final character of the line is parsed as the voltage.
///
/// # Errors
///
/// [`ProtocolError::MalformedResponse`] on an empty or unparsable line.
pub fn parse_voltage_reply(line: &str) -> Result<f64, ProtocolError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut chars = trimmed.chars();
    if chars.next_back().is_none() {
        return Err(ProtocolError::MalformedResponse(line.to_string()));
    }
    chars
        .as_str()
        .trim()
        .parse()
        .map_err(|_| ProtocolError::MalformedResponse(line.to_string()))
}

/// Command builder addressing one HV500 unit.
#[derive(Debug, Clone)]
pub struct Hv500Codec {
    idn: String,
}

impl Hv500Codec {
    /// Derive the codec from the device's registry key; the address prefix
    /// is the key's last five characters.
    pub fn from_registry_key(reg_key: &str) -> Self {
        let skip = reg_key.chars().count().saturating_sub(IDN_LEN);
        Self {
            idn: reg_key.chars().skip(skip).collect(),
        }
    }

    /// The address prefix used on every channel command.
    pub fn idn(&self) -> &str {
        &self.idn
    }

    /// Identity query line.
    pub fn identify_command(&self) -> String {
        "IDN\r".to_string()
    }

    /// Voltage query line for one channel.
    pub fn query_voltage_command(&self, channel: u8) -> Result<String, ProtocolError> {
        let code = channel_to_code(channel)?;
        Ok(format!("{} Q{}\r", self.idn, code))
    }

    /// Setpoint line for one channel.
    ///
    /// The voltage bound is checked before the channel code so an
    /// out-of-bounds setpoint is rejected regardless of the channel.
    pub fn set_voltage_command(&self, channel: u8, volts: f64) -> Result<String, ProtocolError> {
        let word = encode_setpoint(volts)?;
        let code = channel_to_code(channel)?;
        Ok(format!("{} CH{} {}\r", self.idn, code, word))
    }
}

/// Per-channel protocol state.
///
/// Held by the device server, rebuilt from device queries on (re)connect;
/// nothing here outlives the process.
#[derive(Debug, Clone, Default)]
pub struct ChannelState {
    /// Channel index, 1-based.
    pub channel: u8,
    /// Last voltage observed from the device.
    pub last_reading: Option<VoltageReading>,
    /// Setpoint written but not yet observed back.
    pub pending_setpoint: Option<f64>,
}

impl ChannelState {
    /// Fresh state for one channel.
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            last_reading: None,
            pending_setpoint: None,
        }
    }
}

/// One observed channel voltage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageReading {
    /// Volts as reported by the device.
    pub volts: f64,
    /// When the reading was taken.
    pub at: DateTime<Utc>,
}
