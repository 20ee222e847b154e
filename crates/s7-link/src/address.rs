//! Wire address codec.
//!
//! Maps a [`TagDescriptor`] to the address strings the transport understands
//! and parses them back. Two forms exist per tag and they only differ for
//! arrays:
//!
//! | tag                    | data form      | path form       |
//! |------------------------|----------------|-----------------|
//! | input bit 0.3          | `I0.3`         | `I0.3`          |
//! | marker word 4          | `MW4`          | `MW4`           |
//! | 3 input bytes from 2   | `IB2.3`        | `IB2..4`        |
//! | DB10 word 4            | `DB10,WORD4`   | `DB10,WORD4`    |
//! | DB10 bit 0.1           | `DB10,X0.1`    | `DB10,X0.1`     |
//! | 2 DB10 reals from 8    | `DB10,REAL8.2` | `DB10,REAL8..9` |
//!
//! The data form goes on the polling list and into writes; the path form is
//! reported back to callers.

use s7_common::error::{S7Error, S7Result};
use s7_common::tag::{DataType, MemoryArea, TagDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which representation to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressForm {
    /// `start.count` array notation; registered with the transport.
    Data,
    /// `start..end` array notation; reported to callers.
    Path,
}

/// An address string in transport syntax.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireAddress(String);

impl WireAddress {
    /// Wrap an address string as-is.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WireAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WireAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Both address forms of one tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagAddresses {
    /// Data form.
    pub data: WireAddress,
    /// Path form.
    pub path: WireAddress,
}

impl TagAddresses {
    /// Encode both forms of `tag`.
    #[must_use]
    pub fn of(tag: &TagDescriptor) -> Self {
        Self {
            data: encode(tag, AddressForm::Data),
            path: encode(tag, AddressForm::Path),
        }
    }
}

/// Encode a tag descriptor into the requested address form.
///
/// Unknown areas and datatypes cannot reach this point: they are rejected
/// with [`S7Error::MalformedTag`] when the descriptor is built.
#[must_use]
pub fn encode(tag: &TagDescriptor, form: AddressForm) -> WireAddress {
    let offset = tag.byte_offset();
    let (prefix, code) = match tag.area() {
        MemoryArea::Timer | MemoryArea::Counter => {
            return WireAddress(format!("{}{offset}", tag.area().code()));
        }
        MemoryArea::DataBlock(n) => (format!("DB{n},"), tag.datatype().block_code()),
        area => (area.code().to_string(), tag.datatype().short_code()),
    };

    let address = match tag.datatype() {
        DataType::Bit => {
            // Inside process areas the bit form carries no type tag: I0.3
            let code = if tag.area().db_number().is_some() { code } else { "" };
            format!("{prefix}{code}{offset}.{}", tag.bit_offset())
        }
        DataType::Char => format!("{prefix}{code}{offset}"),
        _ if tag.quantity() > 1 => match form {
            AddressForm::Path => {
                // The descriptor guarantees the span fits in u32
                let end = offset + (tag.quantity() - 1);
                format!("{prefix}{code}{offset}..{end}")
            }
            AddressForm::Data => format!("{prefix}{code}{offset}.{}", tag.quantity()),
        },
        _ => format!("{prefix}{code}{offset}"),
    };
    WireAddress(address)
}

const SHORT_CODES: [(&str, DataType); 11] = [
    ("COUNTER", DataType::Counter),
    ("TIMER", DataType::Timer),
    ("DI", DataType::Int32),
    ("B", DataType::Byte),
    ("W", DataType::Word),
    ("D", DataType::DWord),
    ("I", DataType::Int16),
    ("C", DataType::Char),
    ("S", DataType::String),
    ("R", DataType::Real),
    ("X", DataType::Bit),
];

const BLOCK_CODES: [(&str, DataType); 11] = [
    ("COUNTER", DataType::Counter),
    ("TIMER", DataType::Timer),
    ("STRING", DataType::String),
    ("DWORD", DataType::DWord),
    ("DINT", DataType::Int32),
    ("BYTE", DataType::Byte),
    ("WORD", DataType::Word),
    ("CHAR", DataType::Char),
    ("REAL", DataType::Real),
    ("INT", DataType::Int16),
    ("X", DataType::Bit),
];

fn malformed(address: &str) -> S7Error {
    S7Error::MalformedTag(format!("unparseable address '{address}'"))
}

/// Parse a data or path form address back into a descriptor.
///
/// The descriptor has an empty name. Data form `.N` suffixes are read as a
/// bit offset for bits and as an element count otherwise.
///
/// # Errors
///
/// Returns [`S7Error::MalformedTag`] if the string is not a valid address.
pub fn parse_address(address: &str) -> S7Result<TagDescriptor> {
    let upper = address.trim().to_ascii_uppercase();

    let (area, datatype, rest) = if let Some(block) = upper.strip_prefix("DB") {
        let (number, rest) = block.split_once(',').ok_or_else(|| malformed(address))?;
        let number: u16 = number.parse().map_err(|_| malformed(address))?;
        let letters = rest.bytes().take_while(u8::is_ascii_alphabetic).count();
        let datatype = lookup(&BLOCK_CODES, &rest[..letters]).ok_or_else(|| malformed(address))?;
        (MemoryArea::DataBlock(number), datatype, &rest[letters..])
    } else {
        let area_len = if upper.starts_with("PI") || upper.starts_with("PQ") { 2 } else { 1 };
        let area_code = upper.get(..area_len).ok_or_else(|| malformed(address))?;
        let area = MemoryArea::parse(area_code, None)?;
        let rest = &upper[area_len..];
        match area {
            MemoryArea::Timer => (area, DataType::Timer, rest),
            MemoryArea::Counter => (area, DataType::Counter, rest),
            _ => {
                let letters = rest.bytes().take_while(u8::is_ascii_alphabetic).count();
                let datatype = if letters == 0 {
                    DataType::Bit
                } else {
                    lookup(&SHORT_CODES, &rest[..letters]).ok_or_else(|| malformed(address))?
                };
                (area, datatype, &rest[letters..])
            }
        }
    };

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let offset: u32 = rest[..digits].parse().map_err(|_| malformed(address))?;
    let suffix = &rest[digits..];

    let (bit_offset, quantity) = if suffix.is_empty() {
        (0, 1)
    } else if let Some(end) = suffix.strip_prefix("..") {
        let end: u32 = end.parse().map_err(|_| malformed(address))?;
        let quantity = end
            .checked_sub(offset)
            .and_then(|span| span.checked_add(1))
            .ok_or_else(|| malformed(address))?;
        (0, quantity)
    } else if let Some(n) = suffix.strip_prefix('.') {
        if datatype == DataType::Bit {
            (n.parse().map_err(|_| malformed(address))?, 1)
        } else {
            (0, n.parse().map_err(|_| malformed(address))?)
        }
    } else {
        return Err(malformed(address));
    };

    TagDescriptor::new("", area, datatype, offset, bit_offset, quantity)
}

fn lookup(table: &[(&str, DataType)], code: &str) -> Option<DataType> {
    table.iter().find(|(c, _)| *c == code).map(|(_, t)| *t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(area: MemoryArea, datatype: DataType, offset: u32, bit: u8, quantity: u32) -> TagDescriptor {
        TagDescriptor::new("t", area, datatype, offset, bit, quantity).unwrap()
    }

    #[test]
    fn test_bit_addresses() {
        let t = tag(MemoryArea::Input, DataType::Bit, 0, 3, 1);
        assert_eq!(encode(&t, AddressForm::Data).as_str(), "I0.3");
        assert_eq!(encode(&t, AddressForm::Path).as_str(), "I0.3");

        let t = tag(MemoryArea::DataBlock(10), DataType::Bit, 0, 1, 1);
        assert_eq!(encode(&t, AddressForm::Data).as_str(), "DB10,X0.1");
    }

    #[test]
    fn test_char_has_no_quantity_suffix() {
        let t = tag(MemoryArea::Marker, DataType::Char, 0, 0, 5);
        assert_eq!(encode(&t, AddressForm::Data).as_str(), "MC0");
        let t = tag(MemoryArea::DataBlock(10), DataType::Char, 4, 0, 5);
        assert_eq!(encode(&t, AddressForm::Path).as_str(), "DB10,CHAR4");
    }

    #[test]
    fn test_scalar_addresses() {
        let t = tag(MemoryArea::Marker, DataType::Word, 4, 0, 1);
        assert_eq!(encode(&t, AddressForm::Data).as_str(), "MW4");
        let t = tag(MemoryArea::PeripheralInput, DataType::Int32, 8, 0, 1);
        assert_eq!(encode(&t, AddressForm::Data).as_str(), "PIDI8");
        let t = tag(MemoryArea::DataBlock(3), DataType::Real, 12, 0, 1);
        assert_eq!(encode(&t, AddressForm::Path).as_str(), "DB3,REAL12");
        let t = tag(MemoryArea::Timer, DataType::Timer, 5, 0, 1);
        assert_eq!(encode(&t, AddressForm::Data).as_str(), "T5");
        let t = tag(MemoryArea::Counter, DataType::Counter, 2, 0, 1);
        assert_eq!(encode(&t, AddressForm::Path).as_str(), "C2");
    }

    #[test]
    fn test_array_forms_differ() {
        let t = tag(MemoryArea::Input, DataType::Byte, 2, 0, 3);
        assert_eq!(encode(&t, AddressForm::Data).as_str(), "IB2.3");
        assert_eq!(encode(&t, AddressForm::Path).as_str(), "IB2..4");

        let t = tag(MemoryArea::DataBlock(10), DataType::Word, 0, 0, 2);
        let addrs = TagAddresses::of(&t);
        assert_eq!(addrs.data.as_str(), "DB10,WORD0.2");
        assert_eq!(addrs.path.as_str(), "DB10,WORD0..1");
    }

    #[test]
    fn test_parse_examples() {
        let t = parse_address("DB10,X0.1").unwrap();
        assert_eq!(t.area(), MemoryArea::DataBlock(10));
        assert_eq!(t.datatype(), DataType::Bit);
        assert_eq!(t.bit_offset(), 1);

        let t = parse_address("MC0").unwrap();
        assert_eq!(t.datatype(), DataType::Char);

        let t = parse_address("IB2..4").unwrap();
        assert_eq!((t.byte_offset(), t.quantity()), (2, 3));

        let t = parse_address("pqw6").unwrap();
        assert_eq!(t.area(), MemoryArea::PeripheralOutput);
        assert_eq!(t.datatype(), DataType::Word);

        let t = parse_address("T5").unwrap();
        assert_eq!(t.area(), MemoryArea::Timer);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in [
            "",
            "Z0",
            "MQ4",
            "DB,WORD0",
            "DB1WORD0",
            "MW",
            "MW4..2",
            "MW4;2",
            "DB1,LREAL0",
            "MB0..4294967295",
            "MB4294967295..4294967296",
            "MB4294967290.10",
        ] {
            assert!(
                matches!(parse_address(bad), Err(S7Error::MalformedTag(_))),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_roundtrip_all_descriptors() {
        let areas = [
            MemoryArea::Input,
            MemoryArea::Output,
            MemoryArea::Marker,
            MemoryArea::PeripheralInput,
            MemoryArea::PeripheralOutput,
            MemoryArea::DataBlock(42),
            MemoryArea::Timer,
            MemoryArea::Counter,
        ];
        let types = [
            DataType::Bit,
            DataType::Byte,
            DataType::Word,
            DataType::DWord,
            DataType::Int16,
            DataType::Int32,
            DataType::Char,
            DataType::String,
            DataType::Real,
            DataType::Timer,
            DataType::Counter,
        ];

        for area in areas {
            for datatype in types {
                for quantity in [1, 2, 7] {
                    let original = tag(area, datatype, 6, 5, quantity);
                    for form in [AddressForm::Path, AddressForm::Data] {
                        let encoded = encode(&original, form);
                        let parsed = parse_address(encoded.as_str()).unwrap();
                        assert_eq!(parsed.area(), original.area(), "{encoded}");
                        assert_eq!(parsed.byte_offset(), original.byte_offset(), "{encoded}");
                        assert_eq!(parsed.quantity(), original.quantity(), "{encoded}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_roundtrip_at_end_of_address_range() {
        let last = u32::MAX - 3;
        let original = tag(MemoryArea::Marker, DataType::Byte, last, 0, 4);
        let path = encode(&original, AddressForm::Path);
        assert_eq!(path.as_str(), "MB4294967292..4294967295");
        let parsed = parse_address(path.as_str()).unwrap();
        assert_eq!((parsed.byte_offset(), parsed.quantity()), (last, 4));

        let data = encode(&original, AddressForm::Data);
        let parsed = parse_address(data.as_str()).unwrap();
        assert_eq!((parsed.byte_offset(), parsed.quantity()), (last, 4));

        let whole = parse_address("MB0..4294967294").unwrap();
        assert_eq!(whole.quantity(), u32::MAX);
    }
}
