//! Modbus frame envelopes
//!
//! TCP wraps the PDU in an MBAP header; RTU prefixes the slave address and
//! appends a little-endian CRC-16/MODBUS.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};

use super::constants::{
    EXCEPTION_FLAG, FC_READ_COILS, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH, MBAP_HEADER_LEN,
    RTU_MIN_FRAME_LEN,
};
use crate::error::TransportError;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Transmission mode of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    Tcp,
    Rtu,
}

/// MBAP header for TCP mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_len as u16 + 1,
            unit_id,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(TransportError::Protocol(format!(
                "MBAP header needs {MBAP_HEADER_LEN} bytes, got {}",
                data.len()
            )));
        }
        let header = Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            unit_id: data[6],
        };
        if header.protocol_id != 0 {
            return Err(TransportError::Protocol(format!(
                "invalid MBAP protocol id {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || usize::from(header.length) > MAX_MBAP_LENGTH {
            return Err(TransportError::Protocol(format!(
                "invalid MBAP length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// PDU bytes following the header
    pub fn pdu_len(&self) -> usize {
        usize::from(self.length) - 1
    }
}

/// MBAP header + PDU
pub fn build_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> BytesMut {
    let header = MbapHeader::new(transaction_id, unit_id, pdu.len());
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(header.transaction_id);
    frame.put_u16(header.protocol_id);
    frame.put_u16(header.length);
    frame.put_u8(header.unit_id);
    frame.put_slice(pdu);
    frame
}

pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Slave address + PDU + CRC (low byte first)
pub fn build_rtu_frame(slave_id: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(slave_id);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Verify address and CRC of a complete RTU frame and return its PDU
pub fn parse_rtu_frame(slave_id: u8, frame: &[u8]) -> Result<&[u8], TransportError> {
    if frame.len() < RTU_MIN_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    let expected = crc16(body);
    if received != expected {
        return Err(TransportError::Protocol(format!(
            "CRC mismatch: expected 0x{expected:04X}, got 0x{received:04X}"
        )));
    }
    if body[0] != slave_id {
        return Err(TransportError::Protocol(format!(
            "response from slave {}, expected {slave_id}",
            body[0]
        )));
    }
    Ok(&body[1..])
}

/// Total RTU response length, once enough of the frame has arrived to tell
///
/// Needs the address and function code, plus the byte count for reads.
/// `Err` for function codes this master never sends.
pub fn rtu_response_length(buffer: &[u8]) -> Result<Option<usize>, TransportError> {
    let Some(&function) = buffer.get(1) else {
        return Ok(None);
    };
    if function & EXCEPTION_FLAG != 0 {
        // address + function + exception code + CRC
        return Ok(Some(5));
    }
    match function {
        FC_READ_COILS | FC_READ_HOLDING_REGISTERS => {
            Ok(buffer.get(2).map(|&byte_count| 3 + usize::from(byte_count) + 2))
        },
        FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => Ok(Some(8)),
        other => Err(TransportError::Protocol(format!(
            "unexpected function code 0x{other:02X} in RTU response"
        ))),
    }
}

/// Inter-frame silence: 3.5 character times, fixed 1.75 ms above 19200 baud
pub fn rtu_frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return Duration::from_millis(4);
    }
    if baud_rate > 19_200 {
        return Duration::from_micros(1750);
    }
    // 11 bits per character (start + 8 data + parity + stop)
    let char_time_us = 11 * 1_000_000 / u64::from(baud_rate);
    Duration::from_micros(char_time_us * 35 / 10 + 100)
}
