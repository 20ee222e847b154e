//! Transport abstraction.
//!
//! The connection manager drives a PLC through this trait and never touches
//! sockets itself. A production implementation speaks ISO-on-TCP; the
//! [`crate::simulated`] transport backs the daemon's simulated mode and the
//! tests.

use crate::address::WireAddress;
use async_trait::async_trait;
use s7_common::config::ConnectionTarget;
use s7_common::error::S7Result;
use s7_common::tag::TagValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Numeric connection sub-state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransportState {
    /// No socket.
    Disconnected = 0,
    /// Socket connect in progress.
    Connecting = 1,
    /// TCP established.
    TcpConnected = 2,
    /// RFC1006 connection established, PDU negotiation pending.
    IsoConnected = 3,
    /// PDU negotiated; requests may be sent.
    Connected = 4,
}

impl TransportState {
    /// Parse the numeric sub-state code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Connecting),
            2 => Some(Self::TcpConnected),
            3 => Some(Self::IsoConnected),
            4 => Some(Self::Connected),
            _ => None,
        }
    }

    /// The numeric code.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Value of one polled item: a scalar or one entry per array element.
///
/// Elements may be missing or carry a quality marker string when the PLC
/// reported a bad value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolledValue {
    /// Array item.
    Array(Vec<Option<TagValue>>),
    /// Single value.
    Scalar(Option<TagValue>),
}

/// Outcome of one `read_all_items` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollResult {
    /// Set when at least one item came back with bad quality.
    pub any_bad: bool,
    /// Values keyed by data form address.
    pub values: HashMap<WireAddress, PolledValue>,
}

/// One value passed to `write_items`: a scalar or a whole array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteValue {
    /// Array payload.
    Array(Vec<TagValue>),
    /// Scalar payload.
    Scalar(TagValue),
}

impl WriteValue {
    /// The values as a flat list.
    #[must_use]
    pub fn flatten(&self) -> Vec<TagValue> {
        match self {
            Self::Array(values) => values.clone(),
            Self::Scalar(value) => vec![value.clone()],
        }
    }
}

/// Connection-oriented PLC transport.
///
/// Methods take `&self`; implementations guard their own state so the
/// connection manager can run a read, a write and a state sample
/// concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the connection and complete the handshake.
    async fn connect(&self, target: &ConnectionTarget) -> S7Result<()>;

    /// Close the connection and destroy the socket.
    async fn disconnect(&self);

    /// Add addresses to the transport's polling list.
    async fn add_items(&self, addresses: &[WireAddress]);

    /// Remove addresses from the polling list.
    async fn remove_items(&self, addresses: &[WireAddress]);

    /// Read every item on the polling list.
    async fn read_all_items(&self) -> S7Result<PollResult>;

    /// Write `values[i]` to `addresses[i]`. Returns true if any item was
    /// acknowledged with bad quality.
    async fn write_items(&self, addresses: &[WireAddress], values: &[WriteValue]) -> S7Result<bool>;

    /// Current connection sub-state.
    fn connection_state(&self) -> TransportState;

    /// Returns true while the transport is still establishing a connection.
    fn is_connecting(&self) -> bool;

    /// Returns true once the underlying socket has been destroyed.
    fn is_destroyed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_state_codes() {
        for code in 0..=4 {
            let state = TransportState::from_code(code).unwrap();
            assert_eq!(state.code(), code);
        }
        assert_eq!(TransportState::from_code(5), None);
        assert_eq!(TransportState::IsoConnected.to_string(), "3");
    }

    #[test]
    fn test_write_value_flatten() {
        let array = WriteValue::Array(vec![TagValue::Int(1), TagValue::Int(2)]);
        assert_eq!(array.flatten().len(), 2);
        let scalar = WriteValue::Scalar(TagValue::Bool(true));
        assert_eq!(scalar.flatten(), vec![TagValue::Bool(true)]);
    }

    #[test]
    fn test_polled_value_json_shape() {
        let value = PolledValue::Array(vec![Some(TagValue::Int(1)), None]);
        assert_eq!(serde_json::to_string(&value).unwrap(), "[1,null]");
        let value = PolledValue::Scalar(Some(TagValue::Text("BAD 255".into())));
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"BAD 255\"");
    }
}
