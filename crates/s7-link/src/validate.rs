//! Write value validation.
//!
//! Coerces caller supplied values into each datatype's domain before they
//! reach the transport. Out-of-range numbers are corrected and flagged;
//! wrong primitive types for bit, char and string tags are fatal and the
//! write never happens.

use crate::transport::WriteValue;
use s7_common::error::{S7Error, S7Result};
use s7_common::tag::{DataType, TagDescriptor, TagValue};

/// A write payload that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedWrite {
    /// Set when any value was corrected or dropped.
    pub error: bool,
    /// Payload for `write_items`; always exactly one entry.
    pub values: Vec<WriteValue>,
}

/// Validate and coerce `raw` for a write to `tag`.
///
/// Integer rules: byte, word and dword clamp negatives to 0 and wrap values
/// above the maximum modulo `max + 1`. Int16 and int32 wrap modulo `2^15`
/// and `2^31` when out of range. Non-numeric input becomes 0 and fractional
/// input is truncated, both flagged.
///
/// # Errors
///
/// Returns [`S7Error::FatalValueType`] for an empty payload, a non-boolean
/// bit value, or a non-string char or string value.
pub fn validate(tag: &TagDescriptor, raw: &[TagValue]) -> S7Result<ValidatedWrite> {
    if raw.is_empty() {
        return Err(S7Error::FatalValueType(format!(
            "no value supplied for {}",
            tag.name()
        )));
    }

    let (quantity, mut error) = match tag.quantity() {
        0 => (1, true),
        q => (q as usize, false),
    };

    let mut coerced = Vec::with_capacity(raw.len());
    for value in raw {
        coerced.push(coerce(tag, value, quantity, &mut error)?);
    }

    let array = tag.datatype().is_array_capable()
        && tag.datatype() != DataType::String
        && quantity > 1;

    let values = if array {
        if coerced.len() > quantity {
            error = true;
        }
        coerced.truncate(quantity);
        vec![WriteValue::Array(coerced)]
    } else {
        if coerced.len() > 1 {
            error = true;
        }
        coerced.truncate(1);
        coerced.into_iter().map(WriteValue::Scalar).collect()
    };

    Ok(ValidatedWrite { error, values })
}

fn coerce(
    tag: &TagDescriptor,
    value: &TagValue,
    quantity: usize,
    error: &mut bool,
) -> S7Result<TagValue> {
    let coerced = match tag.datatype() {
        DataType::Bit => match value {
            TagValue::Bool(_) => value.clone(),
            other => return Err(fatal(tag, "a boolean", other)),
        },
        DataType::Char => match value {
            TagValue::Text(s) => {
                let mut chars = s.chars();
                match chars.next() {
                    None => TagValue::Text(" ".into()),
                    Some(first) => {
                        if chars.next().is_some() {
                            *error = true;
                        }
                        TagValue::Text(first.to_string())
                    }
                }
            }
            other => return Err(fatal(tag, "a string", other)),
        },
        DataType::String => match value {
            TagValue::Text(s) => {
                if s.chars().count() > quantity {
                    *error = true;
                    TagValue::Text(s.chars().take(quantity).collect())
                } else {
                    value.clone()
                }
            }
            other => return Err(fatal(tag, "a string", other)),
        },
        DataType::Byte => TagValue::Int(unsigned(value, 0xFF, error)),
        DataType::Word => TagValue::Int(unsigned(value, 0xFFFF, error)),
        DataType::DWord => TagValue::Int(unsigned(value, 0xFFFF_FFFF, error)),
        DataType::Int16 => TagValue::Int(signed(value, i64::from(i16::MIN), i64::from(i16::MAX), error)),
        DataType::Int32 => TagValue::Int(signed(value, i64::from(i32::MIN), i64::from(i32::MAX), error)),
        DataType::Real => match value.as_f64() {
            Some(v) => TagValue::Real(v),
            None => {
                *error = true;
                TagValue::Real(0.0)
            }
        },
        DataType::Timer | DataType::Counter => value.clone(),
    };
    Ok(coerced)
}

fn fatal(tag: &TagDescriptor, expected: &str, got: &TagValue) -> S7Error {
    S7Error::FatalValueType(format!(
        "{} ({}) expects {expected}, got '{got}'",
        tag.name(),
        tag.datatype()
    ))
}

/// Integer view of a value. Fractions are truncated and flagged; anything
/// non-numeric becomes 0 and is flagged.
#[allow(clippy::cast_possible_truncation)]
fn integer(value: &TagValue, error: &mut bool) -> i64 {
    if let TagValue::Int(v) = value {
        return *v;
    }
    match value.as_f64() {
        Some(v) => {
            if v.fract() != 0.0 {
                *error = true;
            }
            v.trunc() as i64
        }
        None => {
            *error = true;
            0
        }
    }
}

fn unsigned(value: &TagValue, max: i64, error: &mut bool) -> i64 {
    let v = integer(value, error);
    if v < 0 {
        *error = true;
        0
    } else if v > max {
        *error = true;
        v % (max + 1)
    } else {
        v
    }
}

fn signed(value: &TagValue, min: i64, max: i64, error: &mut bool) -> i64 {
    let v = integer(value, error);
    if v < min || v > max {
        *error = true;
        v % (max + 1)
    } else {
        v
    }
}
