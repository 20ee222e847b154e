//! Common utilities for acceptance tests.

#![allow(dead_code)] // Not every helper is used by every test file

use s7_common::config::ConnectionConfig;
use s7_common::tag::{DataType, MemoryArea, TagDescriptor};
use s7_link::{ConnectionManager, ReadOptions, SimulatedTransport, TransportCall};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Slack allowed on paused-clock timing assertions.
pub const TOLERANCE: Duration = Duration::from_millis(5);

/// Connection settings for the simulated line PLC.
pub fn line_config() -> ConnectionConfig {
    ConnectionConfig {
        host: "line1-plc".into(),
        rack: 0,
        slot: 1,
        ..ConnectionConfig::default()
    }
}

/// Spawn a manager over `sim`, returning a shared handle to the simulator.
pub fn spawn(sim: SimulatedTransport) -> (Arc<SimulatedTransport>, ConnectionManager) {
    let sim = Arc::new(sim);
    let manager = ConnectionManager::spawn(&line_config(), sim.clone());
    (sim, manager)
}

/// A marker area tag.
pub fn marker(name: &str, datatype: DataType, offset: u32) -> TagDescriptor {
    TagDescriptor::new(name, MemoryArea::Marker, datatype, offset, 0, 1).unwrap()
}

/// Options for a periodic reader.
pub fn periodic(topic: &str, period: Duration) -> ReadOptions {
    ReadOptions {
        topic: topic.into(),
        period: Some(period),
        trigger_once: false,
    }
}

pub fn is_read(call: &TransportCall) -> bool {
    matches!(call, TransportCall::ReadAllItems)
}

pub fn is_write(call: &TransportCall) -> bool {
    matches!(call, TransportCall::WriteItems(_))
}

pub fn is_connect(call: &TransportCall) -> bool {
    matches!(call, TransportCall::Connect)
}

/// Assert `later - earlier` is `expected` within [`TOLERANCE`].
pub fn assert_gap(earlier: Instant, later: Instant, expected: Duration) {
    let gap = later - earlier;
    assert!(
        gap >= expected && gap < expected + TOLERANCE,
        "gap {gap:?}, expected {expected:?}"
    );
}
