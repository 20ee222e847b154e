//! End-to-end polling scenario.
//!
//! One periodic reader (2s) and one writer share a PLC. After connect the
//! link runs a single seed read, then polls every 1000ms (half the shortest
//! period). A write issued between two polls is served on its own lane and
//! leaves the cyclic grid untouched.

use super::common::{assert_gap, is_connect, is_read, is_write, marker, periodic, spawn};
use s7_common::state::ConnectionState;
use s7_common::tag::{DataType, TagValue};
use s7_link::{PolledValue, Quality, SimulatedTransport, WireAddress};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_periodic_reader_and_writer_share_one_link() {
    let (sim, manager) = spawn(SimulatedTransport::with_latency(Duration::from_millis(20)));
    sim.set_value("MW0", PolledValue::Scalar(Some(TagValue::Int(42))));

    let mut level = manager.register_read(
        marker("level", DataType::Word, 0),
        periodic("line1/level", Duration::from_secs(2)),
    );
    let mut setpoint = manager.register_write(marker("level", DataType::Word, 0), "line1/setpoint");

    manager.wait_for_state(ConnectionState::Connected).await.unwrap();
    let connected_at = Instant::now();

    // Mid-cycle write
    tokio::time::sleep_until(connected_at + Duration::from_millis(1500)).await;
    setpoint.request_write(&[TagValue::Int(7)]);
    let written = setpoint.recv().await.unwrap();
    assert!(written.is_ok(), "write failed: {written:?}");
    assert_eq!(written.topic, "line1/setpoint");
    assert_eq!(written.payload.value, vec![Some(TagValue::Int(7))]);

    tokio::time::sleep_until(connected_at + Duration::from_millis(4100)).await;

    assert_eq!(sim.call_count(is_connect), 1);
    assert_eq!(sim.call_count(is_write), 1);

    // Seed read at connect, then a fixed 1000ms grid
    let reads = sim.call_times(is_read);
    assert_eq!(reads.len(), 5, "reads at {reads:?}");
    assert_gap(connected_at, reads[0], Duration::ZERO);
    for pair in reads.windows(2) {
        assert_gap(pair[0], pair[1], Duration::from_millis(1000));
    }

    let writes = sim.call_times(is_write);
    assert_gap(connected_at, writes[0], Duration::from_millis(1500));

    // The reader decodes the buffer on its own 2s period: the first result
    // predates the write, the second sees it.
    let first = level.recv().await.unwrap();
    assert_eq!(first.topic, "line1/level");
    assert_eq!(first.payload.error, Quality::Good);
    assert_eq!(first.payload.value, vec![Some(TagValue::Int(42))]);
    let second = level.recv().await.unwrap();
    assert_eq!(second.payload.value, vec![Some(TagValue::Int(7))]);
    assert!(level.try_recv().is_none());

    assert_eq!(
        sim.value(&WireAddress::from("MW0")),
        Some(PolledValue::Scalar(Some(TagValue::Int(7))))
    );
    let stats = manager.stats();
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.polls, 5);
    assert_eq!(stats.writes, 1);

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_last_periodic_reader_leaving_stops_cyclic_polls() {
    let (sim, manager) = spawn(SimulatedTransport::new());
    let reader = manager.register_read(
        marker("speed", DataType::Int16, 4),
        periodic("line1/speed", Duration::from_secs(1)),
    );
    manager.wait_for_state(ConnectionState::Connected).await.unwrap();

    // Seed plus polls every 500ms
    tokio::time::sleep(Duration::from_millis(1250)).await;
    assert_eq!(sim.call_count(is_read), 3);

    drop(reader);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(sim.call_count(is_read), 3);
    assert_eq!(manager.state(), ConnectionState::Connected);

    manager.close().await;
}
