//! Raw register words <-> typed values
//!
//! All conversion rules come from the `RegisterDescriptor`; the only global
//! knob is the word/byte order used for two-word values, which Modbus leaves
//! to the vendor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::register_map::{DataType, RegisterDescriptor, Width};

/// A decoded register value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Scaled numeric value in engineering units
    Number(f64),
    /// Raw status/fault bits
    Bits(u32),
    /// Coil state
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            Value::Bits(b) => Some(f64::from(*b)),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{v}"),
            Value::Bits(b) => write!(f, "0x{b:04X}"),
            Value::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Byte order of a 32-bit value spread over two registers
///
/// Letters name the bytes of the value from most to least significant, in the
/// order they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// High word first, big-endian bytes
    #[default]
    #[serde(rename = "ABCD", alias = "abcd")]
    Abcd,
    /// Low word first
    #[serde(rename = "CDAB", alias = "cdab")]
    Cdab,
    /// High word first, bytes swapped within each word
    #[serde(rename = "BADC", alias = "badc")]
    Badc,
    /// Fully reversed
    #[serde(rename = "DCBA", alias = "dcba")]
    Dcba,
}

impl ByteOrder {
    /// Compose two registers, in wire order, into a 32-bit value
    pub fn combine(self, words: [u16; 2]) -> u32 {
        let [w0, w1] = words;
        let (hi, lo) = match self {
            ByteOrder::Abcd => (w0, w1),
            ByteOrder::Cdab => (w1, w0),
            ByteOrder::Badc => (w0.swap_bytes(), w1.swap_bytes()),
            ByteOrder::Dcba => (w1.swap_bytes(), w0.swap_bytes()),
        };
        (u32::from(hi) << 16) | u32::from(lo)
    }

    /// Split a 32-bit value into two registers in wire order
    pub fn split(self, value: u32) -> [u16; 2] {
        let hi = (value >> 16) as u16;
        let lo = value as u16;
        match self {
            ByteOrder::Abcd => [hi, lo],
            ByteOrder::Cdab => [lo, hi],
            ByteOrder::Badc => [hi.swap_bytes(), lo.swap_bytes()],
            ByteOrder::Dcba => [lo.swap_bytes(), hi.swap_bytes()],
        }
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ABCD" => Ok(ByteOrder::Abcd),
            "CDAB" => Ok(ByteOrder::Cdab),
            "BADC" => Ok(ByteOrder::Badc),
            "DCBA" => Ok(ByteOrder::Dcba),
            other => Err(format!("unknown byte order '{other}'")),
        }
    }
}

/// Converts between raw words and `Value`s
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    order: ByteOrder,
}

impl Codec {
    pub fn new(order: ByteOrder) -> Self {
        Self { order }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Decode raw words into a typed value
    ///
    /// A value outside the register's valid range is still returned, inside
    /// `CodecError::DecodeRangeViolation`, so the caller can choose to flag
    /// or withhold it.
    pub fn decode(&self, desc: &RegisterDescriptor, words: &[u16]) -> Result<Value, CodecError> {
        let expected = usize::from(desc.words());
        if words.len() != expected {
            return Err(CodecError::WordCount {
                register: desc.name.clone(),
                expected,
                actual: words.len(),
            });
        }

        let raw = match desc.width {
            Width::One => u32::from(words[0]),
            Width::Two => self.order.combine([words[0], words[1]]),
        };

        let value = match desc.data_type {
            DataType::Bool => Value::Bool(raw != 0),
            DataType::Bitfield => Value::Bits(raw),
            DataType::Unsigned => Value::Number(desc.scale.apply(f64::from(raw))),
            DataType::Signed => {
                let signed = match desc.width {
                    Width::One => i32::from(raw as u16 as i16),
                    Width::Two => raw as i32,
                };
                Value::Number(desc.scale.apply(f64::from(signed)))
            },
        };

        if let (Value::Number(v), Some(range)) = (value, desc.valid_range) {
            if !range.contains(v) {
                return Err(CodecError::DecodeRangeViolation {
                    register: desc.name.clone(),
                    value,
                    min: range.min,
                    max: range.max,
                });
            }
        }

        Ok(value)
    }

    /// Encode a typed value into raw words ready for a write request
    pub fn encode(&self, desc: &RegisterDescriptor, value: &Value) -> Result<Vec<u16>, CodecError> {
        if !desc.is_writable() {
            return Err(CodecError::EncodeNotWritable(desc.name.clone()));
        }
        let out_of_range = |reason: String| CodecError::EncodeOutOfRange {
            register: desc.name.clone(),
            reason,
        };

        let raw: u32 = match desc.data_type {
            DataType::Bool => match value {
                Value::Bool(b) => u32::from(*b),
                Value::Number(v) if *v == 0.0 || *v == 1.0 => *v as u32,
                other => return Err(out_of_range(format!("coil expects a boolean, got {other}"))),
            },
            DataType::Bitfield => {
                let bits = match value {
                    Value::Bits(b) => *b,
                    Value::Number(v) if v.fract() == 0.0 && *v >= 0.0 && *v <= f64::from(u32::MAX) => {
                        *v as u32
                    },
                    other => return Err(out_of_range(format!("expected raw bits, got {other}"))),
                };
                if desc.width == Width::One && bits > u32::from(u16::MAX) {
                    return Err(out_of_range(format!("bits 0x{bits:X} exceed one word")));
                }
                bits
            },
            DataType::Unsigned | DataType::Signed => {
                let v = match value {
                    Value::Number(v) => *v,
                    other => return Err(out_of_range(format!("expected a number, got {other}"))),
                };
                if !v.is_finite() {
                    return Err(out_of_range(format!("{v} is not finite")));
                }
                if let Some(range) = desc.valid_range {
                    if !range.contains(v) {
                        return Err(out_of_range(format!(
                            "{v} outside [{}, {}]",
                            range.min, range.max
                        )));
                    }
                }
                let scaled = desc.scale.unapply(v).round();
                let (lo, hi) = representable(desc);
                if scaled < lo || scaled > hi {
                    return Err(out_of_range(format!(
                        "{v} {} needs raw {scaled}, register holds [{lo}, {hi}]",
                        desc.unit
                    )));
                }
                if desc.data_type == DataType::Signed {
                    scaled as i64 as i32 as u32
                } else {
                    scaled as u32
                }
            },
        };

        Ok(match desc.width {
            Width::One => vec![raw as u16],
            Width::Two => self.order.split(raw).to_vec(),
        })
    }
}

/// Raw integer limits of a numeric register
fn representable(desc: &RegisterDescriptor) -> (f64, f64) {
    match (desc.data_type, desc.width) {
        (DataType::Signed, Width::One) => (f64::from(i16::MIN), f64::from(i16::MAX)),
        (DataType::Signed, Width::Two) => (f64::from(i32::MIN), f64::from(i32::MAX)),
        (_, Width::One) => (0.0, f64::from(u16::MAX)),
        (_, Width::Two) => (0.0, f64::from(u32::MAX)),
    }
}
