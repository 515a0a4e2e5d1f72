//! Register map: static description of every CDU register
//!
//! The map is loaded once at startup from a CSV table and never changes. Its
//! canonical order (kind, then access class, then address) doubles as the read
//! order, and `read_ranges_for` coalesces neighbouring registers into as few
//! Modbus read transactions as the framing limit allows.

use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RegisterError, Result};
use crate::protocols::modbus::constants::MODBUS_MAX_READ_REGISTERS;

/// Modbus object type backing a register
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    /// Holding register (FC03 read, FC06/FC16 write)
    #[serde(alias = "holding_register")]
    Holding,
    /// Coil (FC01 read, FC05 write)
    Coil,
}

/// Number of 16-bit words a register spans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Width {
    One,
    Two,
}

impl Width {
    pub fn words(self) -> u16 {
        match self {
            Width::One => 1,
            Width::Two => 2,
        }
    }
}

impl TryFrom<u8> for Width {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Width::One),
            2 => Ok(Width::Two),
            other => Err(format!("width must be 1 or 2 words, got {other}")),
        }
    }
}

impl From<Width> for u8 {
    fn from(width: Width) -> Self {
        width.words() as u8
    }
}

/// How raw words are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "uint")]
    Unsigned,
    #[serde(alias = "int")]
    Signed,
    #[serde(alias = "bits")]
    Bitfield,
    Bool,
}

/// Access class; coalesced reads never mix classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[serde(alias = "ro", alias = "r")]
    ReadOnly,
    #[serde(alias = "rw")]
    ReadWrite,
}

/// Exact rational scale factor: engineering = raw * num / den
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scale {
    num: i64,
    den: i64,
}

impl Scale {
    pub const IDENTITY: Scale = Scale { num: 1, den: 1 };

    /// Build a reduced scale; the denominator is kept positive
    pub fn new(num: i64, den: i64) -> std::result::Result<Self, String> {
        if den == 0 {
            return Err("scale denominator is zero".to_string());
        }
        if num == 0 {
            return Err("scale is zero".to_string());
        }
        let sign = if den < 0 { -1 } else { 1 };
        let divisor = gcd(num.unsigned_abs(), den.unsigned_abs()) as i64;
        Ok(Scale {
            num: sign * num / divisor,
            den: sign * den / divisor,
        })
    }

    pub fn numerator(&self) -> i64 {
        self.num
    }

    pub fn denominator(&self) -> i64 {
        self.den
    }

    pub fn is_identity(&self) -> bool {
        self.num == 1 && self.den == 1
    }

    /// Raw integer to engineering units
    pub fn apply(&self, raw: f64) -> f64 {
        raw * self.num as f64 / self.den as f64
    }

    /// Engineering units back to an (unrounded) raw value
    pub fn unapply(&self, value: f64) -> f64 {
        value * self.den as f64 / self.num as f64
    }
}

impl Default for Scale {
    fn default() -> Self {
        Self::IDENTITY
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

impl FromStr for Scale {
    type Err = String;

    /// Accepts `10`, `0.1`, `-0.001` and `1/3`
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((num, den)) = s.split_once('/') {
            let num: i64 = num
                .trim()
                .parse()
                .map_err(|_| format!("invalid scale numerator '{num}'"))?;
            let den: i64 = den
                .trim()
                .parse()
                .map_err(|_| format!("invalid scale denominator '{den}'"))?;
            return Scale::new(num, den);
        }

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if (int_part.is_empty() && frac_part.is_empty())
            || !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
            || frac_part.len() > 9
        {
            return Err(format!("invalid scale '{s}'"));
        }

        let den = 10_i64.pow(frac_part.len() as u32);
        let int_value: i64 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| format!("invalid scale '{s}'"))?
        };
        let frac_value: i64 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().map_err(|_| format!("invalid scale '{s}'"))?
        };
        let num = int_value
            .checked_mul(den)
            .and_then(|v| v.checked_add(frac_value))
            .ok_or_else(|| format!("scale '{s}' too large"))?;
        Scale::new(if negative { -num } else { num }, den)
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl TryFrom<String> for Scale {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Scale> for String {
    fn from(scale: Scale) -> Self {
        scale.to_string()
    }
}

/// Inclusive plausibility range in engineering units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidRange {
    pub min: f64,
    pub max: f64,
}

impl ValidRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Immutable description of one register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub name: String,
    pub address: u16,
    pub kind: RegisterKind,
    pub width: Width,
    pub data_type: DataType,
    pub scale: Scale,
    pub unit: String,
    pub access: Access,
    pub valid_range: Option<ValidRange>,
    /// Read on cycles where `cycle % poll_every == 0`
    pub poll_every: u32,
    pub description: String,
}

impl RegisterDescriptor {
    pub fn words(&self) -> u16 {
        self.width.words()
    }

    /// One past the last address covered by this register
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.words())
    }

    pub fn is_writable(&self) -> bool {
        self.access == Access::ReadWrite
    }

    pub fn is_due(&self, cycle: u64) -> bool {
        cycle % u64::from(self.poll_every.max(1)) == 0
    }

    fn invalid(&self, reason: impl Into<String>) -> RegisterError {
        RegisterError::InvalidDefinition {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn validate(&self) -> std::result::Result<(), RegisterError> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("empty register name"));
        }
        if self.end() > 0x1_0000 {
            return Err(self.invalid(format!(
                "span {}..{} runs past address 65535",
                self.address,
                self.end()
            )));
        }
        if self.poll_every == 0 {
            return Err(self.invalid("poll_every must be at least 1"));
        }
        match (self.kind, self.data_type) {
            (RegisterKind::Coil, DataType::Bool) => {
                if self.width != Width::One {
                    return Err(self.invalid("coils are one bit wide"));
                }
            },
            (RegisterKind::Coil, other) => {
                return Err(self.invalid(format!("coils must be typed bool, not {other:?}")));
            },
            (RegisterKind::Holding, DataType::Bool) => {
                return Err(self.invalid("bool type is only valid on coils"));
            },
            _ => {},
        }
        if matches!(self.data_type, DataType::Bitfield | DataType::Bool) {
            if !self.scale.is_identity() {
                return Err(self.invalid("bitfield and bool registers cannot be scaled"));
            }
            if self.valid_range.is_some() {
                return Err(self.invalid("bitfield and bool registers cannot carry a range"));
            }
        }
        if let Some(range) = self.valid_range {
            if range.min.is_nan() || range.max.is_nan() || range.min > range.max {
                return Err(self.invalid(format!("min {} > max {}", range.min, range.max)));
            }
        }
        Ok(())
    }
}

/// One coalesced read transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRange {
    pub kind: RegisterKind,
    pub access: Access,
    pub start: u16,
    pub count: u16,
    /// Indices into `RegisterMap::all_registers`, in address order
    pub members: Vec<usize>,
}

/// One row of the register map source
#[derive(Debug, Deserialize)]
struct CsvRow {
    name: String,
    address: u16,
    kind: RegisterKind,
    width: u8,
    #[serde(rename = "type")]
    data_type: DataType,
    #[serde(default)]
    scale: Option<String>,
    #[serde(default)]
    unit: String,
    access: Access,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    poll_every: Option<u32>,
    #[serde(default)]
    description: String,
}

impl CsvRow {
    fn into_descriptor(self) -> std::result::Result<RegisterDescriptor, RegisterError> {
        let invalid = |reason: String| RegisterError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };
        let width = Width::try_from(self.width).map_err(invalid)?;
        let scale = match self.scale.as_deref().map(str::trim) {
            None | Some("") => Scale::IDENTITY,
            Some(text) => text.parse().map_err(invalid)?,
        };
        let valid_range = match (self.min, self.max) {
            (None, None) => None,
            (Some(min), Some(max)) => Some(ValidRange { min, max }),
            _ => return Err(invalid("min and max must be given together".to_string())),
        };

        Ok(RegisterDescriptor {
            name: self.name.trim().to_string(),
            address: self.address,
            kind: self.kind,
            width,
            data_type: self.data_type,
            scale,
            unit: self.unit.trim().to_string(),
            access: self.access,
            valid_range,
            poll_every: self.poll_every.unwrap_or(1),
            description: self.description.trim().to_string(),
        })
    }
}

/// The fixed register set of one device
#[derive(Debug, Clone)]
pub struct RegisterMap {
    registers: Vec<RegisterDescriptor>,
    by_name: HashMap<String, usize>,
    max_read_width: u16,
}

impl RegisterMap {
    /// Validate descriptors and fix the canonical order
    pub fn new(
        mut registers: Vec<RegisterDescriptor>,
        max_read_width: u16,
    ) -> std::result::Result<Self, RegisterError> {
        if max_read_width < 2 {
            return Err(RegisterError::InvalidDefinition {
                name: "max_read_width".to_string(),
                reason: format!("must be at least 2 words, got {max_read_width}"),
            });
        }

        for desc in &registers {
            desc.validate()?;
        }

        registers.sort_by_key(|d| (d.kind, d.access, d.address));

        let mut by_name = HashMap::with_capacity(registers.len());
        for (index, desc) in registers.iter().enumerate() {
            if by_name.insert(desc.name.clone(), index).is_some() {
                return Err(RegisterError::Duplicate(desc.name.clone()));
            }
        }

        // Overlap is checked per kind regardless of access class
        let mut spans: Vec<&RegisterDescriptor> = registers.iter().collect();
        spans.sort_by_key(|d| (d.kind, d.address));
        for pair in spans.windows(2) {
            let (first, second) = (pair[0], pair[1]);
            if first.kind == second.kind && u32::from(second.address) < first.end() {
                return Err(RegisterError::Overlap {
                    first: first.name.clone(),
                    second: second.name.clone(),
                });
            }
        }

        Ok(Self {
            registers,
            by_name,
            max_read_width: max_read_width.min(MODBUS_MAX_READ_REGISTERS),
        })
    }

    /// Parse the CSV register table
    ///
    /// Columns: `name,address,kind,width,type,scale,unit,access,min,max,poll_every,description`
    pub fn from_csv_reader<R: Read>(reader: R, max_read_width: u16) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);

        let mut registers = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            registers.push(row?.into_descriptor()?);
        }
        Ok(Self::new(registers, max_read_width)?)
    }

    pub fn from_csv_path(path: impl AsRef<Path>, max_read_width: u16) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let map = Self::from_csv_reader(file, max_read_width)?;
        debug!("Loaded {} registers from {}", map.len(), path.display());
        Ok(map)
    }

    pub fn resolve(&self, name: &str) -> std::result::Result<&RegisterDescriptor, RegisterError> {
        self.index_of(name)
            .map(|i| &self.registers[i])
            .ok_or_else(|| RegisterError::UnknownRegister(name.to_string()))
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// All registers in canonical read order
    pub fn all_registers(&self) -> &[RegisterDescriptor] {
        &self.registers
    }

    pub fn get(&self, index: usize) -> Option<&RegisterDescriptor> {
        self.registers.get(index)
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn max_read_width(&self) -> u16 {
        self.max_read_width
    }

    /// Coalesced ranges covering every register
    pub fn read_ranges(&self) -> Vec<ReadRange> {
        self.read_ranges_for(|_, _| true)
    }

    /// Coalesced ranges covering the registers selected by `due`
    ///
    /// Only address-contiguous registers of the same kind and access class
    /// share a range, and no range exceeds `max_read_width` words.
    pub fn read_ranges_for<F>(&self, mut due: F) -> Vec<ReadRange>
    where
        F: FnMut(usize, &RegisterDescriptor) -> bool,
    {
        let mut ranges: Vec<ReadRange> = Vec::new();

        for (index, desc) in self.registers.iter().enumerate() {
            if !due(index, desc) {
                continue;
            }
            let words = desc.words();
            if let Some(current) = ranges.last_mut() {
                let contiguous = u32::from(current.start) + u32::from(current.count)
                    == u32::from(desc.address);
                if current.kind == desc.kind
                    && current.access == desc.access
                    && contiguous
                    && current.count + words <= self.max_read_width
                {
                    current.count += words;
                    current.members.push(index);
                    continue;
                }
            }
            ranges.push(ReadRange {
                kind: desc.kind,
                access: desc.access,
                start: desc.address,
                count: words,
                members: vec![index],
            });
        }

        ranges
    }
}
