//! Modbus protocol limits
//!
//! Derived from the 253-byte PDU ceiling inherited from the 256-byte RS485 ADU.

/// MBAP header length: transaction id(2) + protocol id(2) + length(2) + unit id(1)
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size: 256 (RS485 ADU) - 1 (slave address) - 2 (CRC)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// FC03 response: 1 + 1 + 2N <= 253
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

/// FC16 request: 1 + 2 + 2 + 1 + 2N <= 253
pub const MODBUS_MAX_WRITE_REGISTERS: u16 = 123;

/// FC01 response, rounded down from 251 * 8
pub const MODBUS_MAX_READ_COILS: u16 = 2000;

/// FC05 payload for ON; OFF is 0x0000
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Smallest RTU frame: address + function + CRC(2)
pub const RTU_MIN_FRAME_LEN: usize = 4;

// Function codes
pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;
