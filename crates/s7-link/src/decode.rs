//! Read result buffer and response decoding.

use crate::address::WireAddress;
use crate::transport::{PollResult, PolledValue};
use s7_common::tag::TagValue;
use serde::{Serialize, Serializer};
use std::collections::HashMap;

/// Prefix the transport puts on values it could not read.
pub const QUALITY_MARKER: &str = "BAD";

/// Placeholder stored for every item after a failed poll.
pub const BAD_VALUE: &str = "BAD 255";

/// Result quality reported to endpoints as the `error` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Quality {
    /// Code 0.
    #[default]
    Good,
    /// Code -1.
    Bad,
}

impl Quality {
    /// Numeric code: 0 or -1.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Good => 0,
            Self::Bad => -1,
        }
    }
}

impl Serialize for Quality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.code())
    }
}

/// Snapshot of the latest poll, shared read-only with every endpoint.
///
/// Overwritten wholesale after every completed read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResultBuffer {
    /// Set when the poll reported bad quality or failed outright.
    pub any_bad: bool,
    /// Values keyed by data form address.
    pub values: HashMap<WireAddress, PolledValue>,
    /// Number of polls folded into this buffer so far; 0 before the first.
    pub sequence: u64,
}

impl ReadResultBuffer {
    /// Buffer holding a completed poll.
    #[must_use]
    pub fn from_poll(poll: PollResult, sequence: u64) -> Self {
        Self {
            any_bad: poll.any_bad,
            values: poll.values,
            sequence,
        }
    }

    /// Buffer marking every polled item bad, written after a failed poll.
    ///
    /// Takes `(address, element count)` pairs; arrays get one marker per
    /// element.
    pub fn bad_list<'a, I>(items: I, sequence: u64) -> Self
    where
        I: IntoIterator<Item = (&'a WireAddress, u32)>,
    {
        let bad = || Some(TagValue::Text(BAD_VALUE.to_string()));
        let values = items
            .into_iter()
            .map(|(address, count)| {
                let value = if count > 1 {
                    PolledValue::Array((0..count).map(|_| bad()).collect())
                } else {
                    PolledValue::Scalar(bad())
                };
                (address.clone(), value)
            })
            .collect();
        Self {
            any_bad: true,
            values,
            sequence,
        }
    }

    /// Returns true if no poll has filled the buffer yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns true if the buffer holds a value for `address`.
    #[must_use]
    pub fn contains(&self, address: &WireAddress) -> bool {
        self.values.contains_key(address)
    }
}

/// Decoded value of one address.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    /// Overall quality.
    pub quality: Quality,
    /// One entry per element; bad elements are `None`.
    pub values: Vec<Option<TagValue>>,
}

impl ReadOutcome {
    /// Outcome for an address with no usable value.
    #[must_use]
    pub fn missing() -> Self {
        Self {
            quality: Quality::Bad,
            values: vec![None],
        }
    }
}

fn is_bad(value: Option<&TagValue>) -> bool {
    match value {
        None => true,
        Some(TagValue::Text(s)) => s.starts_with(QUALITY_MARKER),
        Some(_) => false,
    }
}

/// Extract the value of `address` from the buffer.
///
/// An empty buffer or unknown address decodes as bad with a single missing
/// element. When the buffer is flagged bad, every marker or missing element
/// becomes `None` and a single bad element makes the whole outcome bad.
#[must_use]
pub fn decode(buffer: &ReadResultBuffer, address: &WireAddress) -> ReadOutcome {
    let Some(polled) = buffer.values.get(address) else {
        return ReadOutcome::missing();
    };

    let elements = match polled {
        PolledValue::Scalar(value) => vec![value.clone()],
        PolledValue::Array(values) => values.clone(),
    };

    if !buffer.any_bad {
        return ReadOutcome {
            quality: Quality::Good,
            values: elements,
        };
    }

    let mut quality = Quality::Good;
    let values = elements
        .into_iter()
        .map(|value| {
            if is_bad(value.as_ref()) {
                quality = Quality::Bad;
                None
            } else {
                value
            }
        })
        .collect();
    ReadOutcome { quality, values }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(any_bad: bool, entries: Vec<(&str, PolledValue)>) -> ReadResultBuffer {
        ReadResultBuffer {
            any_bad,
            values: entries
                .into_iter()
                .map(|(k, v)| (WireAddress::from(k), v))
                .collect(),
            sequence: 1,
        }
    }

    #[test]
    fn test_empty_buffer_is_bad() {
        let outcome = decode(&ReadResultBuffer::default(), &"MW0".into());
        assert_eq!(outcome, ReadOutcome::missing());
        assert_eq!(outcome.quality.code(), -1);
    }

    #[test]
    fn test_good_scalar() {
        let buf = buffer(false, vec![("MW0", PolledValue::Scalar(Some(TagValue::Int(7))))]);
        let outcome = decode(&buf, &"MW0".into());
        assert_eq!(outcome.quality, Quality::Good);
        assert_eq!(outcome.values, vec![Some(TagValue::Int(7))]);

        assert_eq!(decode(&buf, &"MW2".into()), ReadOutcome::missing());
    }

    #[test]
    fn test_bad_element_in_array() {
        let buf = buffer(
            true,
            vec![(
                "A",
                PolledValue::Array(vec![
                    Some(TagValue::Int(1)),
                    Some(TagValue::Text(BAD_VALUE.into())),
                    Some(TagValue::Int(3)),
                ]),
            )],
        );
        let outcome = decode(&buf, &"A".into());
        assert_eq!(outcome.quality.code(), -1);
        assert_eq!(
            outcome.values,
            vec![Some(TagValue::Int(1)), None, Some(TagValue::Int(3))]
        );
    }

    #[test]
    fn test_flagged_buffer_with_good_item() {
        let buf = buffer(
            true,
            vec![
                ("A", PolledValue::Scalar(Some(TagValue::Int(5)))),
                ("B", PolledValue::Scalar(Some(TagValue::Text(BAD_VALUE.into())))),
            ],
        );
        assert_eq!(decode(&buf, &"A".into()).quality, Quality::Good);
        assert_eq!(decode(&buf, &"B".into()).quality, Quality::Bad);
    }

    #[test]
    fn test_bad_list_shape() {
        let a = WireAddress::from("MB0.3");
        let b = WireAddress::from("MW4");
        let buf = ReadResultBuffer::bad_list([(&a, 3), (&b, 1)], 9);
        assert!(buf.any_bad);
        assert_eq!(buf.sequence, 9);

        let outcome = decode(&buf, &a);
        assert_eq!(outcome.quality, Quality::Bad);
        assert_eq!(outcome.values, vec![None, None, None]);
        assert_eq!(decode(&buf, &b).values, vec![None]);
    }

    #[test]
    fn test_quality_serializes_as_code() {
        assert_eq!(serde_json::to_string(&Quality::Bad).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Quality::Good).unwrap(), "0");
    }
}
