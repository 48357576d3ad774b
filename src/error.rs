//! # EPSolar Modbus Error Handling
//!
//! This module provides the error type shared by every layer of the poller:
//! serial transport, RTU frame validation, register decoding, configuration,
//! and the power-state collaborators.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: serial port read/write failures
//! - **Connection Errors**: the port could not be opened or went away
//! - **Timeout Errors**: no complete response within the exchange deadline
//!
//! ### Protocol Errors
//! - **CRC Errors**: checksum mismatch on a received frame
//! - **Address Mismatch**: a frame from a different slave than the one polled
//! - **Frame Errors**: truncated frames, trailing bytes, wrong byte counts
//! - **Exception Responses**: the device rejected the request
//!
//! ### Local Errors
//! - **Invalid Address / Data**: request parameters or payload lengths out of range
//! - **Configuration Errors**: invalid poller, power or serial settings
//! - **Power Errors**: wake timer or sleep facilities failed
//!
//! ## Recovery
//!
//! Every failure of a single request/response exchange is retryable. The poller
//! retries a register up to its attempt cap and then records it as missing; no
//! error from an exchange ever aborts a sweep.
//!
//! ```rust
//! use epsolar_modbus::ModbusError;
//!
//! let err = ModbusError::timeout("read input registers", 500);
//! assert!(err.is_retryable());
//! assert!(err.is_transport_error());
//!
//! let err = ModbusError::exception(0x04, 0x02);
//! assert!(err.is_retryable());
//! assert!(err.is_protocol_error());
//! ```

use thiserror::Error;

use crate::protocol::ModbusException;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus RTU master error types
///
/// Each variant carries enough context to diagnose the failing exchange from a
/// log line alone.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (serial read/write)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The serial port could not be opened or is not available
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// No complete response within the exchange deadline
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Unexpected function code in a response
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Address range validation failures
    ///
    /// # Examples
    /// - Reading 200 input registers (max 125)
    /// - Zero quantity in read request
    #[error("Invalid address: start=0x{start:04X}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value or payload length
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure
    ///
    /// `expected` is the CRC computed over the received bytes, `actual` the
    /// value found in the frame trailer.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Response came from a different slave than the one addressed
    #[error("Slave address mismatch: expected {expected}, got {actual}")]
    AddressMismatch { expected: u8, actual: u8 },

    /// Modbus exception response
    ///
    /// Standard codes are listed in [`ModbusException`].
    #[error("Modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception { function: u8, code: u8, message: String },

    /// Frame structure violations
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// The channel delivered fewer bytes than the frame requires
    #[error("Incomplete frame: {received} bytes read on a total of {expected} expected bytes")]
    IncompleteFrame { received: usize, expected: usize },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Wake timer or low-power facilities failed
    #[error("Power control error: {message}")]
    Power { message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a CRC mismatch error
    ///
    /// # Arguments
    ///
    /// * `expected` - CRC computed over the received frame
    /// * `actual` - CRC carried in the frame trailer
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create an address mismatch error
    pub fn address_mismatch(expected: u8, actual: u8) -> Self {
        Self::AddressMismatch { expected, actual }
    }

    /// Create a Modbus exception error
    ///
    /// Maps standard exception codes to human-readable messages; the raw code
    /// is preserved for diagnostics.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = ModbusException::from_u8(code)
            .map_or("Unknown Exception", ModbusException::description)
            .to_string();

        Self::Exception { function, code, message }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create an incomplete frame error
    pub fn incomplete_frame(received: usize, expected: usize) -> Self {
        Self::IncompleteFrame { received, expected }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a power control error
    pub fn power<S: Into<String>>(message: S) -> Self {
        Self::Power { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if a failed register read should be attempted again
    ///
    /// Every failure of a request/response exchange qualifies, device
    /// exceptions included. Errors that stem from the request parameters or
    /// local configuration would fail identically on every attempt.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use epsolar_modbus::ModbusError;
    ///
    /// assert!(ModbusError::crc_mismatch(0x1234, 0x4321).is_retryable());
    /// assert!(!ModbusError::invalid_address(0x3100, 0).is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::InvalidFunction { .. }
                | Self::InvalidData { .. }
                | Self::CrcMismatch { .. }
                | Self::AddressMismatch { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::IncompleteFrame { .. }
        )
    }

    /// Check if the error is a serial transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is an RTU protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFunction { .. }
                | Self::Exception { .. }
                | Self::Frame { .. }
                | Self::IncompleteFrame { .. }
                | Self::CrcMismatch { .. }
                | Self::AddressMismatch { .. }
        )
    }

    /// Exception code reported by the device, if this is an exception response
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from tokio timeout errors
///
/// The elapsed error carries no duration; callers that know the deadline
/// should build `ModbusError::timeout` themselves.
impl From<tokio::time::error::Elapsed> for ModbusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::timeout("Operation timeout", 0)
    }
}

impl From<tokio_serial::Error> for ModbusError {
    fn from(err: tokio_serial::Error) -> Self {
        Self::connection(err.to_string())
    }
}

impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}

impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}
