//! Tag model: what a PLC tag addresses and what values travel over the link.
//!
//! A [`TagDescriptor`] is immutable once built. Construction normalises the
//! fields that only matter for some datatypes (bit offset for bits, quantity
//! for array-capable types), so every later stage can trust them.

use crate::error::{S7Error, S7Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// PLC memory areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryArea {
    /// Process image inputs (I).
    Input,
    /// Process image outputs (Q).
    Output,
    /// Markers / flags (M).
    Marker,
    /// Peripheral inputs (PI).
    PeripheralInput,
    /// Peripheral outputs (PQ).
    PeripheralOutput,
    /// Data block with its block number (DB).
    DataBlock(u16),
    /// Timers (T).
    Timer,
    /// Counters (C).
    Counter,
}

impl MemoryArea {
    /// Parse an area code, taking the block number for data blocks.
    ///
    /// # Errors
    ///
    /// Returns [`S7Error::MalformedTag`] for unknown codes or a data block
    /// without a number.
    pub fn parse(code: &str, db_number: Option<u16>) -> S7Result<Self> {
        let area = match code.trim().to_ascii_uppercase().as_str() {
            "I" => Self::Input,
            "Q" => Self::Output,
            "M" => Self::Marker,
            "PI" => Self::PeripheralInput,
            "PQ" => Self::PeripheralOutput,
            "T" => Self::Timer,
            "C" => Self::Counter,
            "DB" => Self::DataBlock(db_number.ok_or_else(|| {
                S7Error::MalformedTag("data block area without block number".into())
            })?),
            other => return Err(S7Error::MalformedTag(format!("unknown memory area '{other}'"))),
        };
        Ok(area)
    }

    /// Area code without the block number.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Input => "I",
            Self::Output => "Q",
            Self::Marker => "M",
            Self::PeripheralInput => "PI",
            Self::PeripheralOutput => "PQ",
            Self::DataBlock(_) => "DB",
            Self::Timer => "T",
            Self::Counter => "C",
        }
    }

    /// Block number for data blocks.
    #[must_use]
    pub fn db_number(&self) -> Option<u16> {
        match self {
            Self::DataBlock(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataBlock(n) => write!(f, "DB{n}"),
            other => f.write_str(other.code()),
        }
    }
}

/// Datatypes a tag can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Single bit (X).
    Bit,
    /// Unsigned 8-bit.
    Byte,
    /// Unsigned 16-bit.
    Word,
    /// Unsigned 32-bit.
    DWord,
    /// Signed 16-bit (INT).
    Int16,
    /// Signed 32-bit (DINT).
    Int32,
    /// Single character.
    Char,
    /// S7 string; quantity is the maximum length.
    String,
    /// 32-bit float.
    Real,
    /// Timer value.
    Timer,
    /// Counter value.
    Counter,
}

impl DataType {
    /// Type tag used inside I/Q/M/PI/PQ addresses (`MW4`, `IB0`).
    #[must_use]
    pub fn short_code(&self) -> &'static str {
        match self {
            Self::Bit => "X",
            Self::Byte => "B",
            Self::Word => "W",
            Self::DWord => "D",
            Self::Int16 => "I",
            Self::Int32 => "DI",
            Self::Char => "C",
            Self::String => "S",
            Self::Real => "R",
            Self::Timer => "TIMER",
            Self::Counter => "COUNTER",
        }
    }

    /// Type tag used inside data block addresses (`DB10,WORD4`).
    #[must_use]
    pub fn block_code(&self) -> &'static str {
        match self {
            Self::Bit => "X",
            Self::Byte => "BYTE",
            Self::Word => "WORD",
            Self::DWord => "DWORD",
            Self::Int16 => "INT",
            Self::Int32 => "DINT",
            Self::Char => "CHAR",
            Self::String => "STRING",
            Self::Real => "REAL",
            Self::Timer => "TIMER",
            Self::Counter => "COUNTER",
        }
    }

    /// Whether `quantity` means anything for this type.
    #[must_use]
    pub fn is_array_capable(&self) -> bool {
        !matches!(self, Self::Bit | Self::Char)
    }
}

impl FromStr for DataType {
    type Err = S7Error;

    fn from_str(s: &str) -> S7Result<Self> {
        let datatype = match s.trim().to_ascii_uppercase().as_str() {
            "X" | "BIT" | "BOOL" => Self::Bit,
            "B" | "BYTE" | "UINT8" => Self::Byte,
            "W" | "WORD" | "UINT16" => Self::Word,
            "D" | "DWORD" | "UINT32" => Self::DWord,
            "I" | "INT" | "INT16" => Self::Int16,
            "DI" | "DINT" | "INT32" => Self::Int32,
            "C" | "CHAR" => Self::Char,
            "S" | "STRING" => Self::String,
            "R" | "REAL" => Self::Real,
            "TIMER" => Self::Timer,
            "COUNTER" => Self::Counter,
            other => return Err(S7Error::MalformedTag(format!("unknown datatype '{other}'"))),
        };
        Ok(datatype)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.block_code())
    }
}

/// Immutable description of one PLC tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTag", into = "RawTag")]
pub struct TagDescriptor {
    name: String,
    area: MemoryArea,
    datatype: DataType,
    byte_offset: u32,
    bit_offset: u8,
    quantity: u32,
}

impl TagDescriptor {
    /// Build a descriptor, normalising type-dependent fields.
    ///
    /// Bit offsets are kept only for bits; quantity is kept only for
    /// array-capable types outside the timer and counter areas.
    ///
    /// # Errors
    ///
    /// Returns [`S7Error::MalformedTag`] if a bit offset is above 7 or the
    /// addressed span ends past the last byte offset a `u32` can hold.
    pub fn new(
        name: impl Into<String>,
        area: MemoryArea,
        datatype: DataType,
        byte_offset: u32,
        bit_offset: u8,
        quantity: u32,
    ) -> S7Result<Self> {
        if datatype == DataType::Bit && bit_offset > 7 {
            return Err(S7Error::MalformedTag(format!(
                "bit offset {bit_offset} out of range 0..=7"
            )));
        }
        let bit_offset = if datatype == DataType::Bit { bit_offset } else { 0 };
        let single = !datatype.is_array_capable()
            || matches!(area, MemoryArea::Timer | MemoryArea::Counter);
        let quantity = if single { 1 } else { quantity };
        if byte_offset.checked_add(quantity.saturating_sub(1)).is_none() {
            return Err(S7Error::MalformedTag(format!(
                "{quantity} elements from offset {byte_offset} overflow the address range"
            )));
        }

        Ok(Self {
            name: name.into(),
            area,
            datatype,
            byte_offset,
            bit_offset,
            quantity,
        })
    }

    /// Display label.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Memory area.
    #[must_use]
    pub fn area(&self) -> MemoryArea {
        self.area
    }

    /// Declared datatype.
    #[must_use]
    pub fn datatype(&self) -> DataType {
        self.datatype
    }

    /// Byte offset (timer/counter number for T and C areas).
    #[must_use]
    pub fn byte_offset(&self) -> u32 {
        self.byte_offset
    }

    /// Bit offset, always 0 unless the datatype is a bit.
    #[must_use]
    pub fn bit_offset(&self) -> u8 {
        self.bit_offset
    }

    /// Element count; string length for strings. `0` marks an unreadable
    /// quantity from a legacy payload.
    #[must_use]
    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    /// Number of values a read of this tag yields. A string is one value
    /// whatever its length.
    #[must_use]
    pub fn element_count(&self) -> u32 {
        if self.datatype == DataType::String {
            1
        } else {
            self.quantity
        }
    }

    /// True if the tag addresses more than one element.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.element_count() > 1
    }
}

/// Numbers in legacy editor payloads arrive either as JSON numbers or strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum LenientNumber {
    Number(u64),
    Text(String),
}

impl LenientNumber {
    fn value(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl Default for LenientNumber {
    fn default() -> Self {
        Self::Number(0)
    }
}

fn default_quantity() -> LenientNumber {
    LenientNumber::Number(1)
}

/// Serialized form of a [`TagDescriptor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawTag {
    #[serde(default, alias = "S7_Name")]
    name: String,
    #[serde(alias = "S7_Type")]
    area: String,
    #[serde(default, alias = "S7_DBnum", skip_serializing_if = "Option::is_none")]
    db_number: Option<LenientNumber>,
    #[serde(alias = "S7_Datatype")]
    datatype: String,
    #[serde(default, alias = "S7_Offset")]
    byte_offset: LenientNumber,
    #[serde(default, alias = "S7_BitOffset")]
    bit_offset: LenientNumber,
    #[serde(default = "default_quantity", alias = "S7_Quantity")]
    quantity: LenientNumber,
}

fn field<T: TryFrom<u64>>(raw: &LenientNumber, what: &str) -> S7Result<T> {
    raw.value()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| S7Error::MalformedTag(format!("invalid {what}: {raw:?}")))
}

impl TryFrom<RawTag> for TagDescriptor {
    type Error = S7Error;

    fn try_from(raw: RawTag) -> S7Result<Self> {
        let db_number = match &raw.db_number {
            Some(n) if raw.area.trim().eq_ignore_ascii_case("DB") => {
                Some(field::<u16>(n, "data block number")?)
            }
            _ => None,
        };
        let area = MemoryArea::parse(&raw.area, db_number)?;
        let datatype: DataType = raw.datatype.parse()?;
        let byte_offset = field::<u32>(&raw.byte_offset, "byte offset")?;
        let bit_offset = if datatype == DataType::Bit {
            field::<u8>(&raw.bit_offset, "bit offset")?
        } else {
            0
        };
        // An unreadable quantity becomes 0; the value validator flags it.
        let quantity = raw
            .quantity
            .value()
            .and_then(|q| u32::try_from(q).ok())
            .unwrap_or(0);

        Self::new(raw.name, area, datatype, byte_offset, bit_offset, quantity)
    }
}

impl From<TagDescriptor> for RawTag {
    fn from(tag: TagDescriptor) -> Self {
        Self {
            name: tag.name,
            area: tag.area.code().to_string(),
            db_number: tag.area.db_number().map(|n| LenientNumber::Number(u64::from(n))),
            datatype: tag.datatype.block_code().to_string(),
            byte_offset: LenientNumber::Number(u64::from(tag.byte_offset)),
            bit_offset: LenientNumber::Number(u64::from(tag.bit_offset)),
            quantity: LenientNumber::Number(u64::from(tag.quantity)),
        }
    }
}

/// A single value read from or written to the PLC.
///
/// Serializes to the bare JSON scalar, so result payloads look like
/// `[1, 2, 3]` or `"abc"` rather than tagged objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Bit value.
    Bool(bool),
    /// Any integer value.
    Int(i64),
    /// Floating point value.
    Real(f64),
    /// Character, string, or a quality marker from the transport.
    Text(String),
}

impl TagValue {
    /// Numeric view of the value; numeric strings count as numbers.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(v) => Some(*v as f64),
            Self::Real(v) if v.is_finite() => Some(*v),
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            Self::Bool(_) | Self::Real(_) => None,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Real(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        Self::Real(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}
