/// Modbus protocol definitions and data structures
///
/// This module contains the protocol types the poller exchanges with the
/// charge controller: the function code, exception codes, and the read input
/// registers request/response pair.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::error::{ModbusError, ModbusResult};

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier (1-247)
pub type SlaveId = u8;

/// Bit set on the function code of an exception response
pub const EXCEPTION_BIAS: u8 = 0x80;

/// Length of the CRC16 trailer
pub const CRC_LENGTH: usize = 2;

/// Address, function code and byte count
pub const RESPONSE_HEADER_LENGTH: usize = 3;

/// Address, function|0x80, exception code, CRC
pub const EXCEPTION_FRAME_LENGTH: usize = 5;

/// Modbus function codes supported by the poller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name of the exception
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "Illegal Function",
            ModbusException::IllegalDataAddress => "Illegal Data Address",
            ModbusException::IllegalDataValue => "Illegal Data Value",
            ModbusException::ServerDeviceFailure => "Slave Device Failure",
            ModbusException::Acknowledge => "Acknowledge",
            ModbusException::ServerDeviceBusy => "Slave Device Busy",
            ModbusException::MemoryParityError => "Memory Parity Error",
            ModbusException::GatewayPathUnavailable => "Gateway Path Unavailable",
            ModbusException::GatewayTargetDeviceFailedToRespond => {
                "Gateway Target Device Failed to Respond"
            }
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.to_u8())
    }
}

/// Read input registers request (function 0x04)
///
/// Built once per poll attempt and consumed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadInputRegistersRequest {
    pub slave_id: SlaveId,
    pub address: ModbusAddress,
    pub quantity: u16,
}

impl ReadInputRegistersRequest {
    /// Create a validated request
    pub fn new(slave_id: SlaveId, address: ModbusAddress, quantity: u16) -> ModbusResult<Self> {
        let request = Self { slave_id, address, quantity };
        request.validate()?;
        Ok(request)
    }

    /// Function code carried by this request
    pub fn function(&self) -> ModbusFunction {
        ModbusFunction::ReadInputRegisters
    }

    /// Validate the request
    pub fn validate(&self) -> ModbusResult<()> {
        if self.slave_id == 0 || self.slave_id > 247 {
            return Err(ModbusError::invalid_data(format!(
                "Invalid slave ID: {}",
                self.slave_id
            )));
        }

        if self.quantity == 0 || self.quantity > crate::MAX_REGISTERS_PER_REQUEST {
            return Err(ModbusError::invalid_address(self.address, self.quantity));
        }

        if u32::from(self.address) + u32::from(self.quantity) > 0x1_0000 {
            return Err(ModbusError::invalid_address(self.address, self.quantity));
        }

        Ok(())
    }

    /// Number of payload bytes a normal response carries
    pub fn expected_byte_count(&self) -> usize {
        self.quantity as usize * 2
    }

    /// Total length of a normal response frame, CRC included
    pub fn expected_response_len(&self) -> usize {
        RESPONSE_HEADER_LENGTH + self.expected_byte_count() + CRC_LENGTH
    }
}

/// Validated normal response to a read input registers request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub slave_id: SlaveId,
    pub function: ModbusFunction,
    /// Register data, exactly `2 * quantity` bytes, big-endian words
    pub payload: Vec<u8>,
}

impl ModbusResponse {
    /// Create a successful response
    pub fn new(slave_id: SlaveId, function: ModbusFunction, payload: Vec<u8>) -> Self {
        Self { slave_id, function, payload }
    }

    /// Parse the payload as big-endian 16-bit registers
    pub fn registers(&self) -> Vec<u16> {
        self.payload
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x04).unwrap(), ModbusFunction::ReadInputRegisters);
        assert_eq!(ModbusFunction::ReadInputRegisters.to_u8(), 0x04);
        assert!(ModbusFunction::from_u8(0x03).is_err());
        assert_eq!(
            ModbusFunction::ReadInputRegisters.to_string(),
            "Read Input Registers (0x04)"
        );
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02).unwrap(), ModbusException::IllegalDataAddress);
        assert_eq!(ModbusException::IllegalDataAddress.to_u8(), 0x02);
        assert!(ModbusException::from_u8(0x07).is_none());
        assert_eq!(ModbusException::ServerDeviceBusy.to_string(), "Slave Device Busy (0x06)");
    }

    #[test]
    fn test_request_validation() {
        assert!(ReadInputRegistersRequest::new(1, 0x3100, 1).is_ok());
        assert!(ReadInputRegistersRequest::new(1, 0x3100, 125).is_ok());

        assert!(ReadInputRegistersRequest::new(0, 0x3100, 1).is_err());
        assert!(ReadInputRegistersRequest::new(248, 0x3100, 1).is_err());
        assert!(matches!(
            ReadInputRegistersRequest::new(1, 0x3100, 0),
            Err(ModbusError::InvalidAddress { .. })
        ));
        assert!(ReadInputRegistersRequest::new(1, 0x3100, 126).is_err());
        assert!(ReadInputRegistersRequest::new(1, 0xFFFF, 2).is_err());
    }

    #[test]
    fn test_expected_lengths() {
        let request = ReadInputRegistersRequest::new(1, 0x3102, 2).unwrap();
        assert_eq!(request.expected_byte_count(), 4);
        assert_eq!(request.expected_response_len(), 9);
    }

    #[test]
    fn test_response_registers() {
        let response = ModbusResponse::new(
            1,
            ModbusFunction::ReadInputRegisters,
            vec![0x12, 0x34, 0x56, 0x78],
        );
        assert_eq!(response.registers(), vec![0x1234, 0x5678]);
    }
}
