//! # Register Model
//!
//! Declarative description of the charge controller's telemetry registers and
//! the single decode function that turns raw response bytes into values.
//!
//! EPSolar controllers store 32-bit quantities as two input registers with the
//! **low word first**, the reverse of the usual big-endian multi-register
//! layout. A plain big-endian read of those registers produces garbage, so the
//! word order is part of each descriptor's [`ValueKind`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::ModbusAddress;

/// Shape of a register value on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// One register, big-endian unsigned
    Unsigned16,
    /// One register, big-endian two's complement
    Signed16,
    /// Two registers, low word first, unsigned
    Unsigned32WordSwapped,
    /// Two registers, low word first, two's complement
    Signed32WordSwapped,
    /// One register; bits 2-3 of the low byte hold a charging phase
    StatusBitfield,
}

impl ValueKind {
    /// Number of 16-bit registers occupied by this kind
    pub fn word_count(self) -> u16 {
        match self {
            ValueKind::Unsigned16 | ValueKind::Signed16 | ValueKind::StatusBitfield => 1,
            ValueKind::Unsigned32WordSwapped | ValueKind::Signed32WordSwapped => 2,
        }
    }

    /// Number of payload bytes decoded for this kind
    pub fn byte_len(self) -> usize {
        self.word_count() as usize * 2
    }
}

/// Charging phase reported in the status bitfield
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargingPhase {
    NoCharging = 0,
    Float = 1,
    Boost = 2,
    Equalization = 3,
}

impl ChargingPhase {
    /// Map the 2-bit field value to a phase
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => ChargingPhase::NoCharging,
            1 => ChargingPhase::Float,
            2 => ChargingPhase::Boost,
            _ => ChargingPhase::Equalization,
        }
    }
}

impl fmt::Display for ChargingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChargingPhase::NoCharging => "no-charging",
            ChargingPhase::Float => "float",
            ChargingPhase::Boost => "boost",
            ChargingPhase::Equalization => "equalization",
        };
        f.write_str(name)
    }
}

/// Decoded register value, unscaled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RegisterValue {
    Unsigned(u32),
    Signed(i32),
    Status(u8),
}

impl RegisterValue {
    /// Raw value as a wide integer
    pub fn raw(&self) -> i64 {
        match *self {
            RegisterValue::Unsigned(v) => i64::from(v),
            RegisterValue::Signed(v) => i64::from(v),
            RegisterValue::Status(v) => i64::from(v),
        }
    }

    /// Value divided by the descriptor's scale
    pub fn scaled(&self, scale: u16) -> f64 {
        self.raw() as f64 / f64::from(scale.max(1))
    }

    /// Charging phase, for status values
    pub fn charging_phase(&self) -> Option<ChargingPhase> {
        match *self {
            RegisterValue::Status(bits) => Some(ChargingPhase::from_bits(bits)),
            _ => None,
        }
    }
}

/// Telemetry channel description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Property identifier used when publishing
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Engineering unit, empty for enumerations
    pub unit: String,
    /// First input register
    pub address: ModbusAddress,
    pub kind: ValueKind,
    /// Divisor applied for display; EPSolar reports most values x100
    #[serde(default = "default_scale")]
    pub scale: u16,
}

fn default_scale() -> u16 {
    1
}

impl RegisterDescriptor {
    pub fn new(id: &str, name: &str, unit: &str, address: ModbusAddress, kind: ValueKind, scale: u16) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            unit: unit.to_string(),
            address,
            kind,
            scale,
        }
    }

    /// Registers requested for this channel
    pub fn word_count(&self) -> u16 {
        self.kind.word_count()
    }

    /// Decode this channel's value from a response payload
    pub fn decode(&self, payload: &[u8]) -> ModbusResult<RegisterValue> {
        decode_value(self.kind, payload)
    }
}

/// Decode a response payload according to `kind`
///
/// The payload must be exactly `2 * word_count` bytes long.
pub fn decode_value(kind: ValueKind, payload: &[u8]) -> ModbusResult<RegisterValue> {
    if payload.len() != kind.byte_len() {
        return Err(ModbusError::invalid_data(format!(
            "{:?} needs {} bytes, got {}",
            kind,
            kind.byte_len(),
            payload.len()
        )));
    }

    let value = match kind {
        ValueKind::Unsigned16 => {
            RegisterValue::Unsigned(u32::from(u16::from_be_bytes([payload[0], payload[1]])))
        }
        ValueKind::Signed16 => {
            RegisterValue::Signed(i32::from(i16::from_be_bytes([payload[0], payload[1]])))
        }
        ValueKind::Unsigned32WordSwapped => {
            RegisterValue::Unsigned(u32::from_be_bytes(swap_words(payload)))
        }
        ValueKind::Signed32WordSwapped => {
            RegisterValue::Signed(i32::from_be_bytes(swap_words(payload)))
        }
        ValueKind::StatusBitfield => RegisterValue::Status((payload[1] >> 2) & 0b11),
    };
    Ok(value)
}

/// Reorder a low-word-first pair into big-endian byte order
fn swap_words(payload: &[u8]) -> [u8; 4] {
    [payload[2], payload[3], payload[0], payload[1]]
}

/// Reference register table for EPSolar Tracer charge controllers
pub fn epsolar_profile() -> Vec<RegisterDescriptor> {
    use ValueKind::*;

    vec![
        RegisterDescriptor::new("solar-voltage", "Solar voltage", "V", 0x3100, Unsigned16, 100),
        RegisterDescriptor::new("solar-current", "Solar current", "A", 0x3101, Unsigned16, 100),
        RegisterDescriptor::new("solar-power", "Solar power", "W", 0x3102, Unsigned32WordSwapped, 100),
        RegisterDescriptor::new("load-voltage", "Load voltage", "V", 0x310C, Unsigned16, 100),
        RegisterDescriptor::new("load-current", "Load current", "A", 0x310D, Unsigned16, 100),
        RegisterDescriptor::new("load-power", "Load power", "W", 0x310E, Unsigned32WordSwapped, 100),
        RegisterDescriptor::new("air-temperature", "Air temperature", "°C", 0x3110, Signed16, 100),
        RegisterDescriptor::new("device-temperature", "Device temperature", "°C", 0x3111, Signed16, 100),
        RegisterDescriptor::new("battery-level", "Battery level", "%", 0x311A, Unsigned16, 1),
        RegisterDescriptor::new("battery-voltage", "Battery voltage", "V", 0x331A, Unsigned16, 100),
        RegisterDescriptor::new("battery-current", "Battery current", "A", 0x331B, Signed32WordSwapped, 100),
        RegisterDescriptor::new("battery-status", "Battery status", "", 0x3201, StatusBitfield, 1),
    ]
}
