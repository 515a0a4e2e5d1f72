//! Modbus framing
//!
//! Only the master side is implemented: request PDUs for the five function
//! codes the CDU needs (01, 03, 05, 06, 16), their response parsers, and the
//! TCP (MBAP) and RTU (CRC-16) envelopes.

pub mod constants;
pub mod frame;
pub mod pdu;

pub use frame::{Framing, MbapHeader};
pub use pdu::{ModbusPdu, PduBuilder};
