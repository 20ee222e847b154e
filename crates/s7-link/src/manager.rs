//! Connection manager: one actor task per PLC link.
//!
//! The actor owns the transport, the state machine, the polling list and
//! the request scheduler. Endpoints talk to it over a command channel and
//! observe it through watch channels, so no caller ever holds a lock on
//! link state.
//!
//! Timers owned by the actor:
//!
//! - state watch, every `state_poll_interval` while connecting or connected
//! - reconnect, `reconnect_delay` after entering ERROR
//! - cyclic poll, while connected with at least one periodic reader
//! - connect and I/O watchdogs around each in-flight transport call
//!
//! Closing clears all of them before anything else happens, so no transport
//! call is issued after [`ConnectionManager::close`] returns.

use crate::address::WireAddress;
use crate::decode::{Quality, ReadResultBuffer};
use crate::endpoint::{
    EndpointId, ReadEndpoint, ReadOptions, Registration, ResultTemplate, TagResult, WriteEndpoint,
};
use crate::scheduler::{tick, timeout_error, ReadJob, RequestScheduler, SchedulerEvent, WriteJob};
use crate::transport::{Transport, TransportState, WriteValue};
use s7_common::config::{ConnectionConfig, ConnectionTarget, EndpointKind};
use s7_common::error::{S7Error, S7Result};
use s7_common::state::{ConnectionState, LinkStatus, StateMachine};
use s7_common::tag::TagDescriptor;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, trace, warn};

type ConnectFuture = Pin<Box<dyn Future<Output = S7Result<()>> + Send>>;

/// Link notifications, delivered in order to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The connection state changed.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A poll completed and replaced the buffer.
    Polled {
        /// Buffer sequence number.
        sequence: u64,
        /// Whether the poll reported bad quality or failed.
        any_bad: bool,
    },
}

/// Link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Connect attempts started.
    pub connect_attempts: u64,
    /// Connect attempts that succeeded.
    pub connects: u64,
    /// Transitions from CONNECTED to ERROR.
    pub link_losses: u64,
    /// Completed polls, failed ones included.
    pub polls: u64,
    /// Polls with bad quality or a failure.
    pub bad_polls: u64,
    /// Cyclic ticks skipped because a read was in flight.
    pub skipped_cycles: u64,
    /// Completed writes.
    pub writes: u64,
    /// Single-shot requests failed by a link error, close or timeout.
    pub failed_requests: u64,
}

pub(crate) enum Command {
    Register {
        id: EndpointId,
        registration: Registration,
    },
    Deregister {
        id: EndpointId,
    },
    Read {
        id: EndpointId,
    },
    Write {
        job: WriteJob,
    },
    Close {
        done: Option<oneshot::Sender<()>>,
    },
}

/// Endpoint side of the actor's channels.
#[derive(Clone)]
pub(crate) struct LinkHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    buffer: watch::Receiver<Arc<ReadResultBuffer>>,
}

impl LinkHandle {
    /// Returns false once the actor has shut down.
    pub(crate) fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub(crate) fn status(&self) -> LinkStatus {
        self.state.borrow().status()
    }

    pub(crate) fn buffer(&self) -> Arc<ReadResultBuffer> {
        Arc::clone(&self.buffer.borrow())
    }
}

/// Handle of one PLC link.
///
/// Dropping the manager closes the link without waiting; use
/// [`ConnectionManager::close`] to wait for the shutdown.
pub struct ConnectionManager {
    target: ConnectionTarget,
    link: LinkHandle,
    events: broadcast::Sender<LinkEvent>,
    stats: watch::Receiver<LinkStats>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    /// Start the link actor for `config`, driving `transport`.
    ///
    /// Nothing connects until the first endpoint registers.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn spawn(config: &ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let target = config.target();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (buffer_tx, buffer) = watch::channel(Arc::new(ReadResultBuffer::default()));
        let (stats_tx, stats) = watch::channel(LinkStats::default());
        let (events, _) = broadcast::channel(256);

        let actor = LinkActor {
            config: config.clone(),
            target: target.clone(),
            transport,
            commands,
            machine: StateMachine::new(),
            state_tx,
            buffer_tx,
            stats_tx,
            events: events.clone(),
            endpoints: HashMap::new(),
            polling: PollingList::default(),
            scheduler: RequestScheduler::new(config.io_timeout),
            connecting: None,
            watch_timer: None,
            reconnect: None,
            sequence: 0,
            stale: true,
        };
        tokio::spawn(actor.run());

        Self {
            target,
            link: LinkHandle {
                commands: commands_tx,
                state,
                buffer,
            },
            events,
            stats,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> EndpointId {
        EndpointId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The PLC this manager connects to.
    #[must_use]
    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.link.state.borrow()
    }

    /// Coarse link status.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        self.link.status()
    }

    /// Watch the connection state.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.clone()
    }

    /// Receive every state change and poll notification from now on.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// The latest poll buffer.
    #[must_use]
    pub fn buffer(&self) -> Arc<ReadResultBuffer> {
        self.link.buffer()
    }

    /// Current link counters.
    #[must_use]
    pub fn stats(&self) -> LinkStats {
        *self.stats.borrow()
    }

    /// Wait until the link reaches `state`.
    ///
    /// # Errors
    ///
    /// Returns [`S7Error::Closed`] if the manager shuts down first.
    pub async fn wait_for_state(&self, state: ConnectionState) -> S7Result<()> {
        let mut rx = self.link.state.clone();
        loop {
            if *rx.borrow_and_update() == state {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(S7Error::Closed);
            }
        }
    }

    /// Register a read endpoint. The first registration starts connecting.
    #[must_use]
    pub fn register_read(&self, tag: TagDescriptor, options: ReadOptions) -> ReadEndpoint {
        ReadEndpoint::register(self.next_id(), tag, options, self.link.clone())
    }

    /// Register a write endpoint. The first registration starts connecting.
    #[must_use]
    pub fn register_write(&self, tag: TagDescriptor, topic: impl Into<String>) -> WriteEndpoint {
        WriteEndpoint::register(self.next_id(), tag, topic.into(), self.link.clone())
    }

    /// Close the link and wait for the actor to stop.
    ///
    /// Pending requests fail with [`S7Error::Closed`]. The state ends in
    /// DISCONNECTED for good; later requests fail the same way.
    pub async fn close(&self) {
        let (done, finished) = oneshot::channel();
        if self.link.send(Command::Close { done: Some(done) }) {
            let _ = finished.await;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.link.send(Command::Close { done: None });
    }
}

/// Addresses registered with the transport, reference counted per reader.
#[derive(Debug, Default)]
struct PollingList {
    entries: BTreeMap<WireAddress, PollEntry>,
}

#[derive(Debug)]
struct PollEntry {
    readers: usize,
    elements: u32,
}

impl PollingList {
    /// Returns true if the address is new.
    fn add(&mut self, address: &WireAddress, elements: u32) -> bool {
        match self.entries.get_mut(address) {
            Some(entry) => {
                entry.readers += 1;
                false
            }
            None => {
                self.entries
                    .insert(address.clone(), PollEntry { readers: 1, elements });
                true
            }
        }
    }

    /// Returns true if the last reader of the address left.
    fn remove(&mut self, address: &WireAddress) -> bool {
        let Some(entry) = self.entries.get_mut(address) else {
            return false;
        };
        entry.readers -= 1;
        if entry.readers == 0 {
            self.entries.remove(address);
            true
        } else {
            false
        }
    }

    fn addresses(&self) -> Vec<WireAddress> {
        self.entries.keys().cloned().collect()
    }

    fn iter(&self) -> impl Iterator<Item = (&WireAddress, u32)> {
        self.entries.iter().map(|(address, entry)| (address, entry.elements))
    }
}

struct LinkActor {
    config: ConnectionConfig,
    target: ConnectionTarget,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    machine: StateMachine,
    state_tx: watch::Sender<ConnectionState>,
    buffer_tx: watch::Sender<Arc<ReadResultBuffer>>,
    stats_tx: watch::Sender<LinkStats>,
    events: broadcast::Sender<LinkEvent>,
    endpoints: HashMap<EndpointId, Registration>,
    polling: PollingList,
    scheduler: RequestScheduler,
    connecting: Option<ConnectFuture>,
    watch_timer: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    sequence: u64,
    /// The published buffer holds no good values.
    stale: bool,
}

impl LinkActor {
    async fn run(mut self) {
        let done = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close { done }) => break done,
                    Some(command) => self.handle_command(command).await,
                    None => break None,
                },
                result = poll_slot(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result);
                }
                () = tick(&mut self.watch_timer) => self.on_watch_tick(),
                () = poll_slot(&mut self.reconnect) => {
                    self.reconnect = None;
                    self.begin_connect().await;
                }
                event = self.scheduler.next_event() => self.on_scheduler_event(event),
            }
        };

        self.shutdown().await;
        // Drop the command receiver before acknowledging, so requests made
        // after close() returns fail immediately.
        drop(self);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { id, registration } => {
                let address = registration.template.data.clone();
                let is_new = registration.kind == EndpointKind::Read
                    && self.polling.add(&address, registration.elements);
                if is_new && self.machine.state() != ConnectionState::Disconnected {
                    let transport = Arc::clone(&self.transport);
                    let added = [address.clone()];
                    self.bounded("add_items", transport.add_items(&added)).await;
                }
                info!(endpoint = %id, %address, kind = ?registration.kind, "endpoint registered");
                self.endpoints.insert(id, registration);

                if self.machine.state() == ConnectionState::Disconnected && !self.machine.is_closed() {
                    self.begin_connect().await;
                } else {
                    self.update_cyclic();
                }
            }
            Command::Deregister { id } => {
                let Some(registration) = self.endpoints.remove(&id) else {
                    return;
                };
                let address = registration.template.data;
                if registration.kind == EndpointKind::Read
                    && self.polling.remove(&address)
                    && self.machine.state() != ConnectionState::Disconnected
                {
                    let transport = Arc::clone(&self.transport);
                    let removed = [address.clone()];
                    self.bounded("remove_items", transport.remove_items(&removed)).await;
                }
                info!(endpoint = %id, %address, "endpoint deregistered");
                self.update_cyclic();
            }
            Command::Read { id } => {
                if self.machine.state() != ConnectionState::Connected {
                    self.reject(id);
                    return;
                }
                self.scheduler.enqueue_read(id);
                self.scheduler.dispatch(&self.transport);
            }
            Command::Write { job } => {
                if self.machine.state() != ConnectionState::Connected {
                    self.reject(job.endpoint);
                    return;
                }
                self.scheduler.enqueue_write(job);
                self.scheduler.dispatch(&self.transport);
            }
            // Handled by the run loop
            Command::Close { .. } => {}
        }
    }

    fn reject(&mut self, id: EndpointId) {
        debug!(endpoint = %id, state = %self.machine.state(), "request rejected, not connected");
        let cause = S7Error::NoConnection(self.target.to_string());
        self.deliver(id, |template| template.failure(cause));
    }

    fn deliver(&self, id: EndpointId, make: impl FnOnce(&ResultTemplate) -> TagResult) {
        if let Some(registration) = self.endpoints.get(&id) {
            let _ = registration.outbox.send(make(&registration.template));
        }
    }

    fn set_state(&mut self, next: ConnectionState) -> bool {
        let from = self.machine.state();
        match self.machine.transition(next) {
            Ok(()) => {
                self.publish_state(from, next);
                true
            }
            Err(e) => {
                trace!(error = %e, "state change ignored");
                false
            }
        }
    }

    fn publish_state(&self, from: ConnectionState, to: ConnectionState) {
        debug!(plc = %self.target, %from, %to, "state changed");
        self.state_tx.send_replace(to);
        let _ = self.events.send(LinkEvent::StateChanged { from, to });
    }

    /// Await a transport call that has no result, giving up after `io_timeout`.
    async fn bounded(&mut self, operation: &'static str, call: impl Future<Output = ()>) {
        let limit = self.config.io_timeout;
        if tokio::time::timeout(limit, call).await.is_err() {
            warn!(plc = %self.target, operation, timeout_ms = limit.as_millis(), "transport call abandoned");
        }
    }

    async fn begin_connect(&mut self) {
        let reconnect = self.machine.state() == ConnectionState::Error;
        if !self.set_state(ConnectionState::Connecting) {
            return;
        }
        self.stats_tx.send_modify(|s| s.connect_attempts += 1);

        let transport = Arc::clone(&self.transport);
        if reconnect {
            self.bounded("disconnect", transport.disconnect()).await;
        }
        let items = self.polling.addresses();
        if !items.is_empty() {
            self.bounded("add_items", transport.add_items(&items)).await;
        }

        info!(plc = %self.target, items = items.len(), "connecting to PLC");
        let target = self.target.clone();
        let timeout = self.config.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            tokio::time::timeout(timeout, transport.connect(&target))
                .await
                .unwrap_or_else(|_| Err(timeout_error("connect", timeout)))
        }));

        let period = self.config.state_poll_interval;
        let mut watch_timer = tokio::time::interval_at(Instant::now() + period, period);
        watch_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.watch_timer = Some(watch_timer);
    }

    fn on_connect_result(&mut self, result: S7Result<()>) {
        match result {
            Ok(()) => {
                if !self.set_state(ConnectionState::Connected) {
                    return;
                }
                self.stats_tx.send_modify(|s| s.connects += 1);
                info!(plc = %self.target, "PLC connected");
                self.scheduler.start_poll(ReadJob::Seed, &self.transport);
                self.update_cyclic();
            }
            Err(e) => {
                warn!(plc = %self.target, error = %e, "connect failed");
                self.enter_error(e);
            }
        }
    }

    fn on_watch_tick(&mut self) {
        let sample = self.transport.connection_state();
        let state = self.machine.state();
        if state == ConnectionState::Connected {
            if sample != TransportState::Connected || self.transport.is_destroyed() {
                warn!(plc = %self.target, transport_state = %sample, "PLC link lost");
                self.enter_error(S7Error::Link(format!("transport left connected state ({sample})")));
            }
        } else if state.is_connecting() {
            let refined = match sample {
                TransportState::TcpConnected => Some(ConnectionState::TcpConnected),
                TransportState::IsoConnected => Some(ConnectionState::TransportNegotiating),
                _ => None,
            };
            if let Some(next) = refined.filter(|next| *next != state) {
                self.set_state(next);
            }
            trace!(transport_state = %sample, connecting = self.transport.is_connecting(), "handshake in progress");
        }
    }

    fn on_scheduler_event(&mut self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::CyclicTick => {
                if self.machine.state() != ConnectionState::Connected {
                    return;
                }
                if !self.scheduler.start_poll(ReadJob::Cyclic, &self.transport) {
                    trace!("read in flight, cyclic poll skipped");
                    self.stats_tx.send_modify(|s| s.skipped_cycles += 1);
                }
            }
            SchedulerEvent::ReadDone(job, Ok(poll)) => {
                self.sequence += 1;
                let any_bad = poll.any_bad;
                let buffer = Arc::new(ReadResultBuffer::from_poll(poll, self.sequence));
                self.publish_buffer(&buffer);
                if any_bad {
                    debug!(sequence = self.sequence, "poll reported bad quality");
                }
                if let ReadJob::Request(id) = job {
                    self.deliver(id, |template| template.from_buffer(&buffer));
                }
                self.scheduler.dispatch(&self.transport);
            }
            SchedulerEvent::ReadDone(job, Err(e)) => {
                warn!(plc = %self.target, error = %e, ?job, "poll failed");
                self.stats_tx.send_modify(|s| {
                    s.polls += 1;
                    s.bad_polls += 1;
                });
                let buffer = self.publish_bad_list();
                if let ReadJob::Request(id) = job {
                    let cause = e.clone();
                    self.deliver(id, |template| TagResult {
                        cause: Some(cause),
                        ..template.from_buffer(&buffer)
                    });
                    self.stats_tx.send_modify(|s| s.failed_requests += 1);
                }
                self.enter_error(e);
            }
            SchedulerEvent::WriteDone(job, Ok(any_bad)) => {
                self.stats_tx.send_modify(|s| s.writes += 1);
                let quality = if any_bad || job.corrected {
                    Quality::Bad
                } else {
                    Quality::Good
                };
                let cause = if job.corrected {
                    Some(S7Error::Validation(format!("values for {} were corrected", job.address)))
                } else if any_bad {
                    Some(S7Error::Link(format!("bad quality writing {}", job.address)))
                } else {
                    None
                };
                let written: Vec<_> = job
                    .values
                    .iter()
                    .flat_map(WriteValue::flatten)
                    .map(Some)
                    .collect();
                debug!(endpoint = %job.endpoint, address = %job.address, ?quality, "write completed");
                self.deliver(job.endpoint, |template| template.success(quality, written, cause));
                self.scheduler.dispatch(&self.transport);
            }
            SchedulerEvent::WriteDone(job, Err(e)) => {
                warn!(plc = %self.target, error = %e, address = %job.address, "write failed");
                let cause = e.clone();
                self.deliver(job.endpoint, |template| template.failure(cause));
                self.stats_tx.send_modify(|s| s.failed_requests += 1);
                self.enter_error(e);
            }
        }
    }

    fn publish_buffer(&mut self, buffer: &Arc<ReadResultBuffer>) {
        self.stale = false;
        self.buffer_tx.send_replace(Arc::clone(buffer));
        self.stats_tx.send_modify(|s| {
            s.polls += 1;
            if buffer.any_bad {
                s.bad_polls += 1;
            }
        });
        let _ = self.events.send(LinkEvent::Polled {
            sequence: buffer.sequence,
            any_bad: buffer.any_bad,
        });
    }

    /// Overwrite the buffer with bad markers for every polled address.
    fn publish_bad_list(&mut self) -> Arc<ReadResultBuffer> {
        self.sequence += 1;
        let buffer = Arc::new(ReadResultBuffer::bad_list(self.polling.iter(), self.sequence));
        self.stale = true;
        self.buffer_tx.send_replace(Arc::clone(&buffer));
        let _ = self.events.send(LinkEvent::Polled {
            sequence: buffer.sequence,
            any_bad: true,
        });
        buffer
    }

    /// Start, retune or stop cyclic polling for the current readers.
    fn update_cyclic(&mut self) {
        if self.machine.state() != ConnectionState::Connected {
            return;
        }
        let periods: Vec<Duration> = self
            .endpoints
            .values()
            .filter(|r| r.kind == EndpointKind::Read)
            .filter_map(|r| r.period)
            .collect();

        if periods.is_empty() {
            if self.scheduler.cyclic_period().is_some() {
                info!("no periodic readers left, cyclic polling stopped");
                self.scheduler.stop_cyclic();
            }
            return;
        }

        let interval = self.config.cycle_interval(periods);
        if self.scheduler.cyclic_period() != Some(interval) {
            info!(interval_ms = interval.as_millis(), "cyclic polling started");
            self.scheduler.start_cyclic(interval);
        }
    }

    fn fail_pending(&mut self, cause: &S7Error) {
        let (reads, writes) = self.scheduler.drain();
        let failed = reads.len() + writes.len();
        for id in reads {
            self.deliver(id, |template| template.failure(cause.clone()));
        }
        for job in writes {
            self.deliver(job.endpoint, |template| template.failure(cause.clone()));
        }
        if failed > 0 {
            debug!(failed, error = %cause, "pending requests failed");
            self.stats_tx
                .send_modify(|s| s.failed_requests += failed as u64);
        }
    }

    fn enter_error(&mut self, cause: S7Error) {
        let from = self.machine.state();
        if !self.machine.enter_error() {
            trace!(%from, "already failed, error ignored");
            return;
        }
        self.publish_state(from, ConnectionState::Error);
        if from == ConnectionState::Connected {
            self.stats_tx.send_modify(|s| s.link_losses += 1);
        }
        // Periodic readers must not keep decoding values from a lost link
        if !self.stale {
            self.publish_bad_list();
        }
        self.watch_timer = None;
        self.connecting = None;
        self.scheduler.stop_cyclic();
        self.fail_pending(&cause);

        let delay = self.config.reconnect_delay;
        self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
        warn!(plc = %self.target, error = %cause, delay_ms = delay.as_millis(), "link error, reconnect scheduled");
    }

    async fn shutdown(&mut self) {
        let state = self.machine.state();
        self.watch_timer = None;
        self.reconnect = None;
        self.connecting = None;
        self.scheduler.stop_cyclic();
        self.fail_pending(&S7Error::Closed);

        if state == ConnectionState::Connected || state.is_connecting() {
            let transport = Arc::clone(&self.transport);
            self.bounded("disconnect", transport.disconnect()).await;
        }
        self.machine.close();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        if state != ConnectionState::Disconnected {
            let _ = self.events.send(LinkEvent::StateChanged {
                from: state,
                to: ConnectionState::Disconnected,
            });
        }
        info!(plc = %self.target, "connection manager closed");
    }
}

/// Await the future in `slot`; pending forever while the slot is empty.
async fn poll_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

#[cfg(all(test, feature = "simulated"))]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedTransport, TransportCall};
    use s7_common::tag::{DataType, MemoryArea};

    fn word(offset: u32) -> TagDescriptor {
        TagDescriptor::new("w", MemoryArea::Marker, DataType::Word, offset, 0, 1).unwrap()
    }

    #[test]
    fn test_polling_list_refcount() {
        let mut list = PollingList::default();
        let a = WireAddress::from("MW0");
        assert!(list.add(&a, 1));
        assert!(!list.add(&a, 1));
        assert_eq!(list.addresses(), vec![a.clone()]);

        assert!(!list.remove(&a));
        assert!(list.remove(&a));
        assert!(list.addresses().is_empty());
        assert!(!list.remove(&a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_until_first_registration() {
        let sim = Arc::new(SimulatedTransport::new());
        let manager = ConnectionManager::spawn(&ConnectionConfig::default(), sim.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(sim.calls().is_empty());

        let _reader = manager.register_read(word(0), ReadOptions::default());
        manager.wait_for_state(ConnectionState::Connected).await.unwrap();
        assert_eq!(manager.status(), LinkStatus::Connected);
        assert_eq!(sim.items(), vec![WireAddress::from("MW0")]);
        assert_eq!(manager.stats().connects, 1);

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            sim.calls().last().map(|r| r.call.clone()),
            Some(TransportCall::Disconnect)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_removes_item_once() {
        let sim = Arc::new(SimulatedTransport::new());
        let manager = ConnectionManager::spawn(&ConnectionConfig::default(), sim.clone());

        let first = manager.register_read(word(2), ReadOptions::default());
        let second = manager.register_read(word(2), ReadOptions::default());
        manager.wait_for_state(ConnectionState::Connected).await.unwrap();

        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sim.items(), vec![WireAddress::from("MW2")]);

        second.deregister();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sim.items().is_empty());
        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.close().await;
    }
}
