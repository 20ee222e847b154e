//! Close safety.
//!
//! Once `close` returns, the transport sees no further calls, whatever the
//! link was doing at the time, and the state stays DISCONNECTED.

use super::common::{is_connect, is_read, marker, periodic, spawn};
use s7_common::error::S7Error;
use s7_common::state::{ConnectionState, LinkStatus};
use s7_common::tag::DataType;
use s7_link::{ReadOptions, SimBehavior, SimulatedTransport, TransportCall};
use std::time::Duration;

fn is_disconnect(call: &TransportCall) -> bool {
    matches!(call, TransportCall::Disconnect)
}

#[tokio::test(start_paused = true)]
async fn test_close_during_reconnect_delay() {
    let sim = SimulatedTransport::new();
    sim.set_behavior(SimBehavior::RefuseConnect);
    let (sim, manager) = spawn(sim);
    let _reader = manager.register_read(
        marker("level", DataType::Word, 0),
        periodic("level", Duration::from_secs(1)),
    );

    manager.wait_for_state(ConnectionState::Error).await.unwrap();
    manager.close().await;
    let calls_at_close = sim.calls().len();

    // Well past several reconnect delays
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sim.calls().len(), calls_at_close);
    assert_eq!(sim.call_count(is_connect), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_close_during_hung_connect() {
    let sim = SimulatedTransport::new();
    sim.set_behavior(SimBehavior::HangConnect);
    let (sim, manager) = spawn(sim);
    let _reader = manager.register_read(marker("level", DataType::Word, 0), ReadOptions::default());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(manager.status(), LinkStatus::Connecting);

    manager.close().await;
    assert_eq!(sim.call_count(is_disconnect), 1);
    let calls_at_close = sim.calls().len();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sim.calls().len(), calls_at_close);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_close_with_read_in_flight() {
    let sim = SimulatedTransport::new();
    let (sim, manager) = spawn(sim);
    let mut reader = manager.register_read(marker("level", DataType::Word, 0), ReadOptions::default());
    manager.wait_for_state(ConnectionState::Connected).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    sim.set_behavior(SimBehavior::HangReads);
    reader.request_read();
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.close().await;

    let result = reader.recv().await.unwrap();
    assert_eq!(result.cause, Some(S7Error::Closed));
    assert_eq!(sim.call_count(is_disconnect), 1);
    let calls_at_close = sim.calls().len();

    // Closing again is a no-op
    manager.close().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(sim.calls().len(), calls_at_close);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_manager_stops_polling() {
    let (sim, manager) = spawn(SimulatedTransport::new());
    let reader = manager.register_read(
        marker("level", DataType::Word, 0),
        periodic("level", Duration::from_secs(1)),
    );
    manager.wait_for_state(ConnectionState::Connected).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    drop(manager);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let reads = sim.call_count(is_read);
    assert_eq!(sim.call_count(is_disconnect), 1);
    assert_eq!(reader.status(), LinkStatus::Disconnected);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sim.call_count(is_read), reads);
}
