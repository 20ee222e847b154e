//! In-memory transport for simulation and testing.
//!
//! Stores item values in a map keyed by data form address, answers every
//! call after a configurable latency and records each call with its
//! timestamp. Faults are injected through [`SimBehavior`].
//!
//! ```ignore
//! let transport = Arc::new(SimulatedTransport::new());
//! transport.set_behavior(SimBehavior::RefuseConnect);
//! let manager = ConnectionManager::spawn(config, transport.clone());
//! ```

use crate::address::{parse_address, WireAddress};
use crate::transport::{PollResult, PolledValue, Transport, TransportState, WriteValue};
use async_trait::async_trait;
use s7_common::config::ConnectionTarget;
use s7_common::error::{S7Error, S7Result};
use s7_common::tag::{DataType, TagValue};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Configurable behavior for fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimBehavior {
    /// Answer every call normally.
    #[default]
    Normal,
    /// Fail every connect after the latency.
    RefuseConnect,
    /// Never complete a connect.
    HangConnect,
    /// Fail every read after the latency.
    FailReads,
    /// Never complete a read.
    HangReads,
    /// Fail every write after the latency.
    FailWrites,
    /// Never complete a write.
    HangWrites,
    /// Never complete `disconnect`, `add_items` or `remove_items`.
    HangItemCalls,
}

/// A transport call as seen by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `connect`.
    Connect,
    /// `disconnect`.
    Disconnect,
    /// `add_items` with its addresses.
    AddItems(Vec<WireAddress>),
    /// `remove_items` with its addresses.
    RemoveItems(Vec<WireAddress>),
    /// `read_all_items`.
    ReadAllItems,
    /// `write_items` with its addresses.
    WriteItems(Vec<WireAddress>),
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    /// When the call was issued.
    pub at: Instant,
    /// What was called.
    pub call: TransportCall,
}

#[derive(Debug)]
struct SimState {
    behavior: SimBehavior,
    latency: Duration,
    state: TransportState,
    destroyed: bool,
    items: BTreeSet<WireAddress>,
    memory: HashMap<WireAddress, PolledValue>,
    bad: HashSet<WireAddress>,
    calls: Vec<CallRecord>,
}

/// Simulated PLC transport.
#[derive(Debug)]
pub struct SimulatedTransport {
    inner: Mutex<SimState>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// Create a simulator with no latency.
    #[must_use]
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Create a simulator answering every call after `latency`.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Mutex::new(SimState {
                behavior: SimBehavior::Normal,
                latency,
                state: TransportState::Disconnected,
                destroyed: true,
                items: BTreeSet::new(),
                memory: HashMap::new(),
                bad: HashSet::new(),
                calls: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        // State stays consistent across a panicking test thread
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Change the fault injection behavior.
    pub fn set_behavior(&self, behavior: SimBehavior) {
        self.lock().behavior = behavior;
    }

    /// Store a value the next poll will return.
    pub fn set_value(&self, address: impl Into<WireAddress>, value: PolledValue) {
        self.lock().memory.insert(address.into(), value);
    }

    /// Current stored value of an address.
    #[must_use]
    pub fn value(&self, address: &WireAddress) -> Option<PolledValue> {
        self.lock().memory.get(address).cloned()
    }

    /// Report `address` with bad quality on reads and writes.
    pub fn mark_bad(&self, address: impl Into<WireAddress>) {
        self.lock().bad.insert(address.into());
    }

    /// Simulate the PLC dropping the connection.
    pub fn drop_link(&self) {
        let mut inner = self.lock();
        inner.state = TransportState::Disconnected;
        inner.destroyed = true;
    }

    /// Force the reported sub-state.
    pub fn set_state(&self, state: TransportState) {
        self.lock().state = state;
    }

    /// Addresses on the polling list.
    #[must_use]
    pub fn items(&self) -> Vec<WireAddress> {
        self.lock().items.iter().cloned().collect()
    }

    /// Every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.clone()
    }

    /// Timestamps of the recorded calls matching `pred`.
    pub fn call_times(&self, pred: impl Fn(&TransportCall) -> bool) -> Vec<Instant> {
        self.lock()
            .calls
            .iter()
            .filter(|record| pred(&record.call))
            .map(|record| record.at)
            .collect()
    }

    /// Number of recorded calls matching `pred`.
    pub fn call_count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.call_times(pred).len()
    }

    fn record(&self, call: TransportCall) -> (SimBehavior, Duration) {
        let mut inner = self.lock();
        inner.calls.push(CallRecord {
            at: Instant::now(),
            call,
        });
        (inner.behavior, inner.latency)
    }

    async fn hang_if_asked(&self, call: TransportCall) {
        let (behavior, _) = self.record(call);
        if behavior == SimBehavior::HangItemCalls {
            std::future::pending::<()>().await;
        }
    }

    fn ensure_connected(&self) -> S7Result<()> {
        if self.lock().state == TransportState::Connected {
            Ok(())
        } else {
            Err(S7Error::Link("not connected".into()))
        }
    }
}

fn default_value(address: &WireAddress) -> PolledValue {
    let Ok(tag) = parse_address(address.as_str()) else {
        return PolledValue::Scalar(None);
    };
    let value = match tag.datatype() {
        DataType::Bit => TagValue::Bool(false),
        DataType::Char => TagValue::Text(" ".into()),
        DataType::String => TagValue::Text(String::new()),
        DataType::Real => TagValue::Real(0.0),
        _ => TagValue::Int(0),
    };
    if tag.is_array() {
        PolledValue::Array(vec![Some(value); tag.element_count() as usize])
    } else {
        PolledValue::Scalar(Some(value))
    }
}

fn marked_bad(value: &PolledValue) -> PolledValue {
    let bad = || Some(TagValue::Text(crate::decode::BAD_VALUE.into()));
    match value {
        PolledValue::Array(values) => PolledValue::Array(values.iter().map(|_| bad()).collect()),
        PolledValue::Scalar(_) => PolledValue::Scalar(bad()),
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn connect(&self, _target: &ConnectionTarget) -> S7Result<()> {
        let (behavior, latency) = self.record(TransportCall::Connect);
        {
            let mut inner = self.lock();
            inner.state = TransportState::Connecting;
            inner.destroyed = false;
        }
        match behavior {
            SimBehavior::HangConnect => std::future::pending().await,
            SimBehavior::RefuseConnect => {
                tokio::time::sleep(latency).await;
                let mut inner = self.lock();
                inner.state = TransportState::Disconnected;
                inner.destroyed = true;
                Err(S7Error::Link("connection refused".into()))
            }
            _ => {
                tokio::time::sleep(latency).await;
                self.lock().state = TransportState::Connected;
                Ok(())
            }
        }
    }

    async fn disconnect(&self) {
        self.hang_if_asked(TransportCall::Disconnect).await;
        let mut inner = self.lock();
        inner.state = TransportState::Disconnected;
        inner.destroyed = true;
    }

    async fn add_items(&self, addresses: &[WireAddress]) {
        self.hang_if_asked(TransportCall::AddItems(addresses.to_vec())).await;
        self.lock().items.extend(addresses.iter().cloned());
    }

    async fn remove_items(&self, addresses: &[WireAddress]) {
        self.hang_if_asked(TransportCall::RemoveItems(addresses.to_vec())).await;
        let mut inner = self.lock();
        for address in addresses {
            inner.items.remove(address);
        }
    }

    async fn read_all_items(&self) -> S7Result<PollResult> {
        let (behavior, latency) = self.record(TransportCall::ReadAllItems);
        self.ensure_connected()?;
        match behavior {
            SimBehavior::HangReads => std::future::pending().await,
            SimBehavior::FailReads => {
                tokio::time::sleep(latency).await;
                Err(S7Error::Link("read request failed".into()))
            }
            _ => {
                tokio::time::sleep(latency).await;
                self.ensure_connected()?;
                let inner = self.lock();
                let mut result = PollResult::default();
                for address in &inner.items {
                    let value = inner
                        .memory
                        .get(address)
                        .cloned()
                        .unwrap_or_else(|| default_value(address));
                    let value = if inner.bad.contains(address) {
                        result.any_bad = true;
                        marked_bad(&value)
                    } else {
                        value
                    };
                    result.values.insert(address.clone(), value);
                }
                Ok(result)
            }
        }
    }

    async fn write_items(&self, addresses: &[WireAddress], values: &[WriteValue]) -> S7Result<bool> {
        let (behavior, latency) = self.record(TransportCall::WriteItems(addresses.to_vec()));
        self.ensure_connected()?;
        match behavior {
            SimBehavior::HangWrites => std::future::pending().await,
            SimBehavior::FailWrites => {
                tokio::time::sleep(latency).await;
                Err(S7Error::Link("write request failed".into()))
            }
            _ => {
                tokio::time::sleep(latency).await;
                self.ensure_connected()?;
                let mut inner = self.lock();
                let mut any_bad = false;
                for (address, value) in addresses.iter().zip(values) {
                    if inner.bad.contains(address) {
                        any_bad = true;
                        continue;
                    }
                    let stored = match value {
                        WriteValue::Array(vs) => PolledValue::Array(vs.iter().cloned().map(Some).collect()),
                        WriteValue::Scalar(v) => PolledValue::Scalar(Some(v.clone())),
                    };
                    inner.memory.insert(address.clone(), stored);
                }
                Ok(any_bad)
            }
        }
    }

    fn connection_state(&self) -> TransportState {
        self.lock().state
    }

    fn is_connecting(&self) -> bool {
        self.lock().state == TransportState::Connecting
    }

    fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }
}
