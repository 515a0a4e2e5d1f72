//! Modbus PDU building and response parsing
//!
//! A PDU lives in a fixed stack array; requests are assembled through
//! `PduBuilder` and responses are validated against the request that produced
//! them before any data is handed upward.

use tracing::debug;

use super::constants::{
    COIL_OFF, COIL_ON, EXCEPTION_FLAG, FC_READ_COILS, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE,
    MODBUS_MAX_READ_COILS, MODBUS_MAX_READ_REGISTERS, MODBUS_MAX_WRITE_REGISTERS,
};
use crate::error::TransportError;

type PduResult<T> = std::result::Result<T, TransportError>;

/// PDU backed by a fixed-size stack array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a received PDU
    pub fn from_slice(data: &[u8]) -> PduResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(TransportError::Protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> PduResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(TransportError::Protocol("PDU buffer full".to_string()));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> PduResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .is_some_and(|fc| fc & EXCEPTION_FLAG != 0)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable function code name for logs
pub fn function_code_description(fc: u8) -> &'static str {
    match fc & !EXCEPTION_FLAG {
        0x01 => "Read Coils",
        0x02 => "Read Discrete Inputs",
        0x03 => "Read Holding Registers",
        0x04 => "Read Input Registers",
        0x05 => "Write Single Coil",
        0x06 => "Write Single Register",
        0x0F => "Write Multiple Coils",
        0x10 => "Write Multiple Registers",
        _ => "Unknown Function",
    }
}

/// PDU builder - fluent API
#[derive(Default)]
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> PduResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> PduResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> PduResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> PduResult<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> PduResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            debug!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                function_code_description(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }
}

fn check_quantity(what: &str, count: u16, max: u16) -> PduResult<()> {
    if count == 0 || count > max {
        return Err(TransportError::Protocol(format!(
            "{what} quantity {count} outside 1..={max}"
        )));
    }
    Ok(())
}

/// FC03 request
pub fn read_holding_registers_request(start: u16, count: u16) -> PduResult<ModbusPdu> {
    check_quantity("register", count, MODBUS_MAX_READ_REGISTERS)?;
    Ok(PduBuilder::new()
        .function_code(FC_READ_HOLDING_REGISTERS)?
        .address(start)?
        .quantity(count)?
        .build())
}

/// FC01 request
pub fn read_coils_request(start: u16, count: u16) -> PduResult<ModbusPdu> {
    check_quantity("coil", count, MODBUS_MAX_READ_COILS)?;
    Ok(PduBuilder::new()
        .function_code(FC_READ_COILS)?
        .address(start)?
        .quantity(count)?
        .build())
}

/// FC06 request
pub fn write_single_register_request(address: u16, value: u16) -> PduResult<ModbusPdu> {
    Ok(PduBuilder::new()
        .function_code(FC_WRITE_SINGLE_REGISTER)?
        .address(address)?
        .word(value)?
        .build())
}

/// FC05 request
pub fn write_single_coil_request(address: u16, on: bool) -> PduResult<ModbusPdu> {
    Ok(PduBuilder::new()
        .function_code(FC_WRITE_SINGLE_COIL)?
        .address(address)?
        .word(if on { COIL_ON } else { COIL_OFF })?
        .build())
}

/// FC16 request
pub fn write_multiple_registers_request(start: u16, values: &[u16]) -> PduResult<ModbusPdu> {
    let count = u16::try_from(values.len()).unwrap_or(u16::MAX);
    check_quantity("register", count, MODBUS_MAX_WRITE_REGISTERS)?;
    let mut builder = PduBuilder::new()
        .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
        .address(start)?
        .quantity(count)?
        .byte((count * 2) as u8)?;
    for value in values {
        builder = builder.word(*value)?;
    }
    Ok(builder.build())
}

/// Turn exception responses and function code mismatches into errors
pub fn check_response_function(expected: u8, response: &[u8]) -> PduResult<()> {
    let Some(&fc) = response.first() else {
        return Err(TransportError::Protocol("empty response PDU".to_string()));
    };
    if fc == (expected | EXCEPTION_FLAG) {
        let code = response.get(1).copied().ok_or_else(|| {
            TransportError::Protocol("exception response without code".to_string())
        })?;
        return Err(TransportError::Exception {
            function: expected,
            code,
        });
    }
    if fc != expected {
        return Err(TransportError::Protocol(format!(
            "function code mismatch: sent {expected:#04X}, got {fc:#04X}"
        )));
    }
    Ok(())
}

/// Extract register words from an FC03 response
pub fn parse_read_registers_response(response: &[u8], count: u16) -> PduResult<Vec<u16>> {
    check_response_function(FC_READ_HOLDING_REGISTERS, response)?;
    let expected = usize::from(count) * 2;
    let byte_count = response.get(1).copied().map(usize::from);
    if byte_count != Some(expected) || response.len() != 2 + expected {
        return Err(TransportError::Protocol(format!(
            "register response carries {} data bytes, expected {expected}",
            response.len().saturating_sub(2)
        )));
    }
    Ok(response[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Extract coil states from an FC01 response (LSB of the first byte = first coil)
pub fn parse_read_coils_response(response: &[u8], count: u16) -> PduResult<Vec<bool>> {
    check_response_function(FC_READ_COILS, response)?;
    let expected = usize::from(count).div_ceil(8);
    let byte_count = response.get(1).copied().map(usize::from);
    if byte_count != Some(expected) || response.len() != 2 + expected {
        return Err(TransportError::Protocol(format!(
            "coil response carries {} data bytes, expected {expected}",
            response.len().saturating_sub(2)
        )));
    }
    let data = &response[2..];
    Ok((0..usize::from(count))
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

/// Validate a write acknowledgement
///
/// FC05/FC06 echo the whole request; FC16 echoes address and quantity.
pub fn check_write_response(request: &ModbusPdu, response: &[u8]) -> PduResult<()> {
    let Some(fc) = request.function_code() else {
        return Err(TransportError::Protocol("empty request PDU".to_string()));
    };
    check_response_function(fc, response)?;
    let echoed = match fc {
        FC_WRITE_MULTIPLE_REGISTERS => &request.as_slice()[..5],
        _ => request.as_slice(),
    };
    if response != echoed {
        return Err(TransportError::Protocol(format!(
            "write acknowledgement does not echo request ({} bytes)",
            response.len()
        )));
    }
    Ok(())
}
