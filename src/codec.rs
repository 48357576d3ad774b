//! # RTU Frame Codec
//!
//! Encodes read input registers requests into checksummed RTU frames and
//! validates response frames received from the charge controller.
//!
//! ## Frame Layout
//!
//! ```text
//! request:   [slave][0x04][start_hi][start_lo][qty_hi][qty_lo][crc_lo][crc_hi]
//! response:  [slave][0x04][byte_count][data ...][crc_lo][crc_hi]
//! exception: [slave][0x84][code][crc_lo][crc_hi]
//! ```
//!
//! The CRC is the Modbus CRC16 (initial value 0xFFFF, reflected polynomial
//! 0xA001) over every byte preceding it, transmitted low byte first.

use crc::{Crc, CRC_16_MODBUS};

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{
    ModbusFunction, ModbusResponse, ReadInputRegistersRequest, SlaveId, CRC_LENGTH,
    EXCEPTION_BIAS, EXCEPTION_FRAME_LENGTH, RESPONSE_HEADER_LENGTH,
};

/// CRC calculator for RTU
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Calculate the Modbus CRC16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC16 of `frame` in little-endian order
fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the trailing CRC of a complete frame
pub fn verify_crc(frame: &[u8]) -> ModbusResult<()> {
    if frame.len() < CRC_LENGTH + 1 {
        return Err(ModbusError::frame("RTU frame too short for CRC"));
    }

    let data_len = frame.len() - CRC_LENGTH;
    let received = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated = crc16(&frame[..data_len]);

    if received != calculated {
        return Err(ModbusError::crc_mismatch(calculated, received));
    }
    Ok(())
}

/// Whether the function byte of a (possibly partial) frame flags an exception
pub fn is_exception_frame(frame: &[u8]) -> bool {
    frame.len() >= 2 && frame[1] & EXCEPTION_BIAS != 0
}

/// Encode request to RTU frame
pub fn encode_request(request: &ReadInputRegistersRequest) -> Vec<u8> {
    let mut frame = Vec::with_capacity(8);
    frame.push(request.slave_id);
    frame.push(request.function().to_u8());
    frame.extend_from_slice(&request.address.to_be_bytes());
    frame.extend_from_slice(&request.quantity.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// Decode and validate a response frame for `request`
///
/// Checks run in wire order: CRC, slave address, exception flag, function
/// code, byte count. An exception response is returned as
/// `ModbusError::Exception` so it can never be mistaken for data.
pub fn decode_response(
    frame: &[u8],
    request: &ReadInputRegistersRequest,
) -> ModbusResult<ModbusResponse> {
    if frame.len() < EXCEPTION_FRAME_LENGTH {
        return Err(ModbusError::frame(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }

    verify_crc(frame)?;

    let slave_id = frame[0];
    if slave_id != request.slave_id {
        return Err(ModbusError::address_mismatch(request.slave_id, slave_id));
    }

    let function_code = frame[1];
    if function_code & EXCEPTION_BIAS != 0 {
        if frame.len() != EXCEPTION_FRAME_LENGTH {
            return Err(ModbusError::frame(format!(
                "Exception response must be {} bytes, got {}",
                EXCEPTION_FRAME_LENGTH,
                frame.len()
            )));
        }
        return Err(ModbusError::exception(function_code & !EXCEPTION_BIAS, frame[2]));
    }

    let function = ModbusFunction::from_u8(function_code)?;
    if function != request.function() {
        return Err(ModbusError::invalid_function(function_code));
    }

    let byte_count = frame[2] as usize;
    let body = &frame[RESPONSE_HEADER_LENGTH..frame.len() - CRC_LENGTH];
    if body.len() > byte_count {
        return Err(ModbusError::frame(format!(
            "{} trailing bytes after {} byte payload",
            body.len() - byte_count,
            byte_count
        )));
    }
    if body.len() < byte_count {
        return Err(ModbusError::frame(format!(
            "Payload truncated: byte count {} but {} bytes present",
            byte_count,
            body.len()
        )));
    }
    if byte_count != request.expected_byte_count() {
        return Err(ModbusError::frame(format!(
            "Byte count {} does not match {} requested registers",
            byte_count, request.quantity
        )));
    }

    Ok(ModbusResponse::new(slave_id, function, body.to_vec()))
}

/// Encode a normal read input registers response (slave side)
pub fn encode_response(slave_id: SlaveId, registers: &[u16]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(RESPONSE_HEADER_LENGTH + registers.len() * 2 + CRC_LENGTH);
    frame.push(slave_id);
    frame.push(ModbusFunction::ReadInputRegisters.to_u8());
    frame.push((registers.len() * 2) as u8);
    for register in registers {
        frame.extend_from_slice(&register.to_be_bytes());
    }
    append_crc(&mut frame);
    frame
}

/// Encode an exception response (slave side)
pub fn encode_exception(slave_id: SlaveId, function: ModbusFunction, code: u8) -> Vec<u8> {
    let mut frame = vec![slave_id, function.to_u8() | EXCEPTION_BIAS, code];
    append_crc(&mut frame);
    frame
}

/// Parse a request frame (slave side)
pub fn decode_request(frame: &[u8]) -> ModbusResult<ReadInputRegistersRequest> {
    if frame.len() != 8 {
        return Err(ModbusError::frame(format!(
            "Read request must be 8 bytes, got {}",
            frame.len()
        )));
    }
    verify_crc(frame)?;
    ModbusFunction::from_u8(frame[1])?;

    ReadInputRegistersRequest::new(
        frame[0],
        u16::from_be_bytes([frame[2], frame[3]]),
        u16::from_be_bytes([frame[4], frame[5]]),
    )
}
