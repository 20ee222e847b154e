//! Request scheduling over one transport.
//!
//! Reads and writes each run in their own single-flight lane: a FIFO queue
//! plus at most one call in flight. Every in-flight call is wrapped in the
//! I/O watchdog, so a hung transport surfaces as [`S7Error::Timeout`]
//! instead of stalling the lane.
//!
//! Cyclic polls share the read lane. A cyclic tick that finds the lane busy
//! is skipped, never queued, and never shifts the cycle timer.

use crate::address::WireAddress;
use crate::endpoint::EndpointId;
use crate::transport::{PollResult, Transport, WriteValue};
use s7_common::error::{S7Error, S7Result};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

type CallFuture<T> = Pin<Box<dyn Future<Output = S7Result<T>> + Send>>;

/// Why a read is on the lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadJob {
    /// First poll after a connect.
    Seed,
    /// Cyclic poll.
    Cyclic,
    /// Single-shot read for one endpoint.
    Request(EndpointId),
}

/// A write waiting for or occupying the write lane.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteJob {
    /// Originating endpoint.
    pub endpoint: EndpointId,
    /// Data form address.
    pub address: WireAddress,
    /// Validated payload.
    pub values: Vec<WriteValue>,
    /// Set when validation corrected the payload.
    pub corrected: bool,
}

/// A lane event for the connection manager.
#[derive(Debug)]
pub enum SchedulerEvent {
    /// A read finished, failed or timed out.
    ReadDone(ReadJob, S7Result<PollResult>),
    /// A write finished, failed or timed out.
    WriteDone(WriteJob, S7Result<bool>),
    /// The cyclic timer fired.
    CyclicTick,
}

/// Single-flight FIFO lane.
struct Lane<J, T> {
    queue: VecDeque<J>,
    in_flight: Option<(J, CallFuture<T>)>,
}

impl<J, T> Default for Lane<J, T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            in_flight: None,
        }
    }
}

impl<J, T> Lane<J, T> {
    fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    fn start(&mut self, job: J, call: CallFuture<T>) {
        debug_assert!(self.in_flight.is_none(), "lane already busy");
        self.in_flight = Some((job, call));
    }

    /// Resolves when the in-flight call completes; pending while idle.
    ///
    /// Cancel safe: dropping the future leaves the call in flight.
    async fn completion(&mut self) -> (J, S7Result<T>) {
        let Some((_, call)) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };
        let result = call.await;
        match self.in_flight.take() {
            Some((job, _)) => (job, result),
            None => std::future::pending().await,
        }
    }

    /// Drop the in-flight call and return every job, in-flight first.
    fn drain(&mut self) -> Vec<J> {
        let mut jobs: Vec<J> = self.in_flight.take().map(|(job, _)| job).into_iter().collect();
        jobs.extend(self.queue.drain(..));
        jobs
    }
}

/// Read and write lanes plus the cyclic poll timer.
pub struct RequestScheduler {
    reads: Lane<ReadJob, PollResult>,
    writes: Lane<WriteJob, bool>,
    cyclic: Option<Interval>,
    cyclic_period: Option<Duration>,
    io_timeout: Duration,
}

impl RequestScheduler {
    /// Create an idle scheduler.
    #[must_use]
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            reads: Lane::default(),
            writes: Lane::default(),
            cyclic: None,
            cyclic_period: None,
            io_timeout,
        }
    }

    /// Returns true while a read is in flight.
    #[must_use]
    pub fn read_busy(&self) -> bool {
        self.reads.is_busy()
    }

    /// Returns true while a write is in flight.
    #[must_use]
    pub fn write_busy(&self) -> bool {
        self.writes.is_busy()
    }

    /// Number of queued single-shot reads and writes.
    #[must_use]
    pub fn queued(&self) -> (usize, usize) {
        (self.reads.queue.len(), self.writes.queue.len())
    }

    /// Queue a single-shot read.
    pub fn enqueue_read(&mut self, endpoint: EndpointId) {
        self.reads.queue.push_back(ReadJob::Request(endpoint));
    }

    /// Queue a write.
    pub fn enqueue_write(&mut self, job: WriteJob) {
        self.writes.queue.push_back(job);
    }

    /// Start a seed or cyclic poll if the read lane is idle.
    ///
    /// Returns false if the lane was busy and nothing was started.
    pub fn start_poll(&mut self, job: ReadJob, transport: &Arc<dyn Transport>) -> bool {
        if self.reads.is_busy() {
            return false;
        }
        let call = self.read_call(transport);
        self.reads.start(job, call);
        true
    }

    /// Start the next queued read and write on idle lanes.
    pub fn dispatch(&mut self, transport: &Arc<dyn Transport>) {
        if !self.reads.is_busy() {
            if let Some(job) = self.reads.queue.pop_front() {
                let call = self.read_call(transport);
                self.reads.start(job, call);
            }
        }
        if !self.writes.is_busy() {
            if let Some(job) = self.writes.queue.pop_front() {
                let call = self.write_call(transport, &job);
                self.writes.start(job, call);
            }
        }
    }

    fn read_call(&self, transport: &Arc<dyn Transport>) -> CallFuture<PollResult> {
        let transport = Arc::clone(transport);
        let timeout = self.io_timeout;
        Box::pin(async move {
            tokio::time::timeout(timeout, transport.read_all_items())
                .await
                .unwrap_or_else(|_| Err(timeout_error("read_all_items", timeout)))
        })
    }

    fn write_call(&self, transport: &Arc<dyn Transport>, job: &WriteJob) -> CallFuture<bool> {
        let transport = Arc::clone(transport);
        let timeout = self.io_timeout;
        let addresses = vec![job.address.clone()];
        let values = job.values.clone();
        Box::pin(async move {
            tokio::time::timeout(timeout, transport.write_items(&addresses, &values))
                .await
                .unwrap_or_else(|_| Err(timeout_error("write_items", timeout)))
        })
    }

    /// Start or retune the cyclic timer. The first tick fires one period
    /// from now; an unchanged period leaves a running timer alone.
    pub fn start_cyclic(&mut self, period: Duration) {
        if self.cyclic.is_some() && self.cyclic_period == Some(period) {
            return;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.cyclic = Some(interval);
        self.cyclic_period = Some(period);
    }

    /// Stop the cyclic timer.
    pub fn stop_cyclic(&mut self) {
        self.cyclic = None;
        self.cyclic_period = None;
    }

    /// Period of the running cyclic timer.
    #[must_use]
    pub fn cyclic_period(&self) -> Option<Duration> {
        self.cyclic_period
    }

    /// Drop in-flight calls and return every pending single-shot job.
    ///
    /// Seed and cyclic polls are dropped silently.
    pub fn drain(&mut self) -> (Vec<EndpointId>, Vec<WriteJob>) {
        let reads = self
            .reads
            .drain()
            .into_iter()
            .filter_map(|job| match job {
                ReadJob::Request(endpoint) => Some(endpoint),
                ReadJob::Seed | ReadJob::Cyclic => None,
            })
            .collect();
        (reads, self.writes.drain())
    }

    /// Wait for the next lane completion or cyclic tick.
    ///
    /// Cancel safe.
    pub async fn next_event(&mut self) -> SchedulerEvent {
        tokio::select! {
            (job, result) = self.reads.completion() => SchedulerEvent::ReadDone(job, result),
            (job, result) = self.writes.completion() => SchedulerEvent::WriteDone(job, result),
            _ = tick(&mut self.cyclic) => SchedulerEvent::CyclicTick,
        }
    }
}

/// Wait for the next tick; pending forever while no timer is set.
pub(crate) async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Error for a transport call that outlived its watchdog.
pub(crate) fn timeout_error(operation: &str, timeout: Duration) -> S7Error {
    S7Error::Timeout {
        operation: operation.to_string(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use super::*;
    use crate::simulated::{SimBehavior, SimulatedTransport, TransportCall};
    use s7_common::config::ConnectionTarget;
    use s7_common::tag::TagValue;

    fn assert_elapsed(start: Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    async fn connected(latency: Duration) -> (Arc<SimulatedTransport>, Arc<dyn Transport>) {
        let sim = Arc::new(SimulatedTransport::with_latency(latency));
        let target = ConnectionTarget {
            host: "sim".into(),
            port: 102,
            rack: 0,
            slot: 2,
        };
        sim.connect(&target).await.unwrap();
        let transport: Arc<dyn Transport> = sim.clone();
        (sim, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_are_single_flight() {
        let (sim, transport) = connected(Duration::from_millis(100)).await;
        let mut scheduler = RequestScheduler::new(Duration::from_secs(5));

        scheduler.enqueue_read(EndpointId::new(1));
        scheduler.enqueue_read(EndpointId::new(2));
        scheduler.dispatch(&transport);
        assert!(scheduler.read_busy());
        assert_eq!(scheduler.queued(), (1, 0));

        let mut order = Vec::new();
        while order.len() < 2 {
            if let SchedulerEvent::ReadDone(ReadJob::Request(id), result) = scheduler.next_event().await {
                assert!(result.is_ok());
                order.push(id);
                scheduler.dispatch(&transport);
            }
        }
        assert_eq!(order, vec![EndpointId::new(1), EndpointId::new(2)]);

        let times = sim.call_times(|c| matches!(c, TransportCall::ReadAllItems));
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_refused_while_busy() {
        let (_sim, transport) = connected(Duration::from_millis(50)).await;
        let mut scheduler = RequestScheduler::new(Duration::from_secs(5));

        assert!(scheduler.start_poll(ReadJob::Seed, &transport));
        assert!(!scheduler.start_poll(ReadJob::Cyclic, &transport));
        assert!(matches!(
            scheduler.next_event().await,
            SchedulerEvent::ReadDone(ReadJob::Seed, Ok(_))
        ));
        assert!(!scheduler.read_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_on_hung_read() {
        let (sim, transport) = connected(Duration::ZERO).await;
        sim.set_behavior(SimBehavior::HangReads);
        let mut scheduler = RequestScheduler::new(Duration::from_secs(5));

        let start = Instant::now();
        scheduler.enqueue_read(EndpointId::new(7));
        scheduler.dispatch(&transport);
        match scheduler.next_event().await {
            SchedulerEvent::ReadDone(ReadJob::Request(id), Err(S7Error::Timeout { timeout_ms, .. })) => {
                assert_eq!(id, EndpointId::new(7));
                assert_eq!(timeout_ms, 5000);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_elapsed(start, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_lane_runs_beside_reads() {
        let (sim, transport) = connected(Duration::from_millis(100)).await;
        let mut scheduler = RequestScheduler::new(Duration::from_secs(5));

        scheduler.start_poll(ReadJob::Seed, &transport);
        scheduler.enqueue_write(WriteJob {
            endpoint: EndpointId::new(3),
            address: "MW4".into(),
            values: vec![WriteValue::Scalar(TagValue::Int(12))],
            corrected: false,
        });
        scheduler.dispatch(&transport);
        assert!(scheduler.read_busy());
        assert!(scheduler.write_busy());

        let mut seen = (false, false);
        while seen != (true, true) {
            match scheduler.next_event().await {
                SchedulerEvent::ReadDone(..) => seen.0 = true,
                SchedulerEvent::WriteDone(job, result) => {
                    assert_eq!(job.endpoint, EndpointId::new(3));
                    assert_eq!(result, Ok(false));
                    seen.1 = true;
                }
                SchedulerEvent::CyclicTick => {}
            }
        }
        assert_eq!(sim.call_count(|c| matches!(c, TransportCall::WriteItems(_))), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cyclic_timer() {
        let mut scheduler = RequestScheduler::new(Duration::from_secs(5));
        let start = Instant::now();
        scheduler.start_cyclic(Duration::from_millis(500));
        assert!(matches!(scheduler.next_event().await, SchedulerEvent::CyclicTick));
        assert_elapsed(start, Duration::from_millis(500));
        assert!(matches!(scheduler.next_event().await, SchedulerEvent::CyclicTick));
        assert_elapsed(start, Duration::from_millis(1000));

        scheduler.stop_cyclic();
        assert_eq!(scheduler.cyclic_period(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_pending_requests() {
        let (_sim, transport) = connected(Duration::from_millis(100)).await;
        let mut scheduler = RequestScheduler::new(Duration::from_secs(5));

        scheduler.start_poll(ReadJob::Seed, &transport);
        scheduler.enqueue_read(EndpointId::new(1));
        scheduler.enqueue_read(EndpointId::new(2));
        let (reads, writes) = scheduler.drain();
        assert_eq!(reads, vec![EndpointId::new(1), EndpointId::new(2)]);
        assert!(writes.is_empty());
        assert!(!scheduler.read_busy());
    }
}
