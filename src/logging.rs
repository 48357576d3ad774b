//! Logging setup and RTU packet formatting
//!
//! The library logs through `tracing`; binaries call [`init_tracing`] once.
//! Packet dumps are off by default and are emitted by the transport through a
//! [`PacketLogger`].

use tracing::{debug, info, Level};

use crate::protocol::ReadInputRegistersRequest;

/// Logging mode for packet display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoggingMode {
    /// Show raw packet data only
    #[default]
    Raw,
    /// Show interpreted packet data with field descriptions
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

/// Install the global `tracing` subscriber
///
/// `debug` lowers the level to DEBUG so per-attempt failures become visible;
/// otherwise only sweep summaries and power transitions are logged.
pub fn init_tracing(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// Format raw bytes as hex string for packet logging
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Packet logger used by the RTU transport
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketLogger {
    enabled: bool,
    mode: LoggingMode,
}

impl PacketLogger {
    pub fn new(enabled: bool, mode: LoggingMode) -> Self {
        Self { enabled, mode }
    }

    /// Logger that outputs nothing
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn mode(&self) -> LoggingMode {
        self.mode
    }

    /// Log an outgoing request frame
    pub fn log_request(&self, request: &ReadInputRegistersRequest, frame: &[u8]) {
        if !self.enabled {
            return;
        }
        match self.mode {
            LoggingMode::Raw => {
                info!("[MODBUS-RTU] send slave:{} {}", request.slave_id, format_hex_packet(frame));
            }
            LoggingMode::Interpreted => {
                info!("[MODBUS-RTU] send {}", describe_request(request));
            }
            LoggingMode::Both => {
                info!("[MODBUS-RTU] send {}", describe_request(request));
                debug!("[MODBUS-RTU] send raw {}", format_hex_packet(frame));
            }
        }
    }

    /// Log a received frame (complete or partial)
    pub fn log_response(&self, slave_id: u8, frame: &[u8]) {
        if !self.enabled {
            return;
        }
        match self.mode {
            LoggingMode::Raw => {
                info!("[MODBUS-RTU] receive slave:{} {}", slave_id, format_hex_packet(frame));
            }
            LoggingMode::Interpreted => {
                info!("[MODBUS-RTU] receive slave:{} {}", slave_id, describe_response(frame));
            }
            LoggingMode::Both => {
                info!("[MODBUS-RTU] receive slave:{} {}", slave_id, describe_response(frame));
                debug!("[MODBUS-RTU] receive raw {}", format_hex_packet(frame));
            }
        }
    }
}

/// Human readable request summary
pub fn describe_request(request: &ReadInputRegistersRequest) -> String {
    format!(
        "Slave: {}, Function: {}, Address: 0x{:04X}, Quantity: {}",
        request.slave_id,
        request.function(),
        request.address,
        request.quantity
    )
}

/// Human readable response summary
pub fn describe_response(frame: &[u8]) -> String {
    if frame.len() < 3 {
        return format!("Partial: {}", hex::encode(frame));
    }
    if frame[1] & 0x80 != 0 {
        return format!("Exception: function 0x{:02X}, code 0x{:02X}", frame[1] & 0x7F, frame[2]);
    }

    let byte_count = frame[2] as usize;
    let end = (3 + byte_count).min(frame.len().saturating_sub(2)).max(3);
    let registers: Vec<u16> = frame[3..end]
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect();
    format!("Byte count: {}, Registers: {:?}", byte_count, registers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hex_packet() {
        assert_eq!(format_hex_packet(&[0x01, 0x04, 0xAB]), "01 04 AB");
        assert_eq!(format_hex_packet(&[]), "");
    }

    #[test]
    fn test_describe_request() {
        let request = ReadInputRegistersRequest::new(1, 0x3100, 2).unwrap();
        assert_eq!(
            describe_request(&request),
            "Slave: 1, Function: Read Input Registers (0x04), Address: 0x3100, Quantity: 2"
        );
    }

    #[test]
    fn test_describe_response() {
        assert_eq!(
            describe_response(&[0x01, 0x04, 0x04, 0x00, 0x01, 0x00, 0x02, 0x2B, 0x85]),
            "Byte count: 4, Registers: [1, 2]"
        );
        assert_eq!(
            describe_response(&[0x01, 0x84, 0x02, 0xC2, 0xC1]),
            "Exception: function 0x04, code 0x02"
        );
        assert_eq!(describe_response(&[0x01, 0x04]), "Partial: 0104");
    }

    #[test]
    fn test_disabled_logger() {
        let logger = PacketLogger::disabled();
        assert!(!logger.is_enabled());
        assert_eq!(logger.mode(), LoggingMode::Raw);
    }
}
