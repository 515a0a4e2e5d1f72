//! Error types for the CDU service
//!
//! Each layer owns a narrow enum so callers can match on exactly the failures
//! that layer produces; `CduError` gathers them for startup and configuration.

use thiserror::Error;

use crate::codec::Value;

/// Failure of one Modbus request/response exchange
///
/// All variants are transient from the poll loop's point of view: the next
/// cycle simply tries again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No (complete) response within the exchange timeout
    #[error("Transport timeout: {0}")]
    Timeout(String),

    /// Malformed frame, CRC mismatch or unexpected response
    #[error("Transport protocol error: {0}")]
    Protocol(String),

    /// The device answered with a Modbus exception response
    #[error("Modbus exception {code:#04X} ({}) for function {function:#04X}", exception_name(*.code))]
    Exception { function: u8, code: u8 },

    /// Link not open or unreachable; nothing was sent
    #[error("Transport link down: {0}")]
    LinkDown(String),

    /// I/O failure after the request was (possibly partly) sent
    #[error("Transport connection lost: {0}")]
    ConnectionLost(String),
}

impl TransportError {
    /// Timeouts and dead links may be cured by switching to another link
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::LinkDown(_) | Self::ConnectionLost(_)
        )
    }

    /// The request never reached the wire, so another link may carry it
    pub fn is_unsent(&self) -> bool {
        matches!(self, Self::LinkDown(_))
    }

    /// Exception code, when the device rejected the request
    pub fn exception_code(&self) -> Option<u8> {
        match self {
            Self::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Standard Modbus exception code names
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

/// Raw word <-> typed value conversion failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Decoded value lies outside the register's valid range
    #[error("Register '{register}' decoded {value} outside [{min}, {max}]")]
    DecodeRangeViolation {
        register: String,
        value: Value,
        min: f64,
        max: f64,
    },

    /// Value cannot be represented in the register or violates its range
    #[error("Value for register '{register}' out of range: {reason}")]
    EncodeOutOfRange { register: String, reason: String },

    /// Register is read-only
    #[error("Register '{0}' is read-only")]
    EncodeNotWritable(String),

    /// Wrong number of raw words handed to the codec
    #[error("Register '{register}' expects {expected} word(s), got {actual}")]
    WordCount {
        register: String,
        expected: usize,
        actual: usize,
    },
}

/// Register map lookup and definition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("Unknown register: {0}")]
    UnknownRegister(String),

    #[error("Invalid register definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("Duplicate register name: {0}")]
    Duplicate(String),

    #[error("Register '{first}' overlaps register '{second}'")]
    Overlap { first: String, second: String },
}

/// Command submission failures, reported before the command is queued
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("Command queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Poll engine stopped")]
    EngineStopped,
}

/// Service-level error type
#[derive(Error, Debug)]
pub enum CduError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Register map error: {0}")]
    Registers(#[from] RegisterError),

    #[error("Register map source error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<figment::Error> for CduError {
    fn from(err: figment::Error) -> Self {
        CduError::Config(err.to_string())
    }
}

/// Result type alias for the CDU service
pub type Result<T> = std::result::Result<T, CduError>;
