//! Tag endpoints: the per-tag handles callers read and write through.
//!
//! Every endpoint owns an outbox. Results of its requests, including
//! immediate failures, arrive there as [`TagResult`]s in the order they
//! were produced.
//!
//! Periodic read endpoints never touch the transport. They decode the
//! shared poll buffer on their own ticker, so their period is independent
//! of the cyclic poll interval. Single-shot read endpoints queue a fresh
//! poll for every request.

use crate::address::{TagAddresses, WireAddress};
use crate::decode::{decode, Quality, ReadResultBuffer};
use crate::manager::{Command, LinkHandle};
use crate::scheduler::WriteJob;
use crate::validate::validate;
use s7_common::config::EndpointKind;
use s7_common::error::S7Error;
use s7_common::state::LinkStatus;
use s7_common::tag::{TagDescriptor, TagValue};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

/// Delay before the read fired by `trigger_once`.
pub const TRIGGER_ONCE_DELAY: Duration = Duration::from_millis(100);

/// Identifies one registered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointId(u64);

impl EndpointId {
    /// Wrap a raw id.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Options for a read endpoint.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Topic attached to every result.
    pub topic: String,
    /// Decode the poll buffer on this period instead of polling per request.
    pub period: Option<Duration>,
    /// Fire one read shortly after registration.
    pub trigger_once: bool,
}

/// Result payload in its serialized form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultPayload {
    /// Tag name; `None` on failures.
    pub signal: Option<String>,
    /// Path form address; `None` on failures.
    pub path: Option<String>,
    /// 0 on success, -1 on any error or bad quality.
    pub error: Quality,
    /// One entry per element; bad elements are `null`.
    pub value: Vec<Option<TagValue>>,
}

/// One result delivered to an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagResult {
    /// The endpoint's topic.
    pub topic: String,
    /// Result body.
    pub payload: ResultPayload,
    /// What went wrong, if anything; not serialized.
    #[serde(skip)]
    pub cause: Option<S7Error>,
}

impl TagResult {
    /// Returns true for an error code of 0.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.payload.error == Quality::Good
    }
}

/// Builds the results of one endpoint.
#[derive(Debug, Clone)]
pub(crate) struct ResultTemplate {
    topic: String,
    signal: String,
    pub(crate) data: WireAddress,
    path: WireAddress,
}

impl ResultTemplate {
    pub(crate) fn new(topic: String, tag: &TagDescriptor, addresses: &TagAddresses) -> Self {
        Self {
            topic,
            signal: tag.name().to_string(),
            data: addresses.data.clone(),
            path: addresses.path.clone(),
        }
    }

    pub(crate) fn success(
        &self,
        quality: Quality,
        value: Vec<Option<TagValue>>,
        cause: Option<S7Error>,
    ) -> TagResult {
        TagResult {
            topic: self.topic.clone(),
            payload: ResultPayload {
                signal: Some(self.signal.clone()),
                path: Some(self.path.to_string()),
                error: quality,
                value,
            },
            cause,
        }
    }

    pub(crate) fn failure(&self, cause: S7Error) -> TagResult {
        TagResult {
            topic: self.topic.clone(),
            payload: ResultPayload {
                signal: None,
                path: None,
                error: Quality::Bad,
                value: vec![None],
            },
            cause: Some(cause),
        }
    }

    /// Result for the current poll buffer.
    pub(crate) fn from_buffer(&self, buffer: &ReadResultBuffer) -> TagResult {
        if buffer.is_empty() {
            return self.failure(S7Error::StaleBuffer(self.data.to_string()));
        }
        let cause = (!buffer.contains(&self.data))
            .then(|| S7Error::StaleBuffer(self.data.to_string()));
        let outcome = decode(buffer, &self.data);
        self.success(outcome.quality, outcome.values, cause)
    }
}

/// What the connection manager keeps per endpoint.
#[derive(Debug)]
pub(crate) struct Registration {
    pub(crate) kind: EndpointKind,
    pub(crate) period: Option<Duration>,
    /// Values one read of the tag yields.
    pub(crate) elements: u32,
    pub(crate) template: ResultTemplate,
    pub(crate) outbox: mpsc::UnboundedSender<TagResult>,
}

/// Performs one read for a read endpoint; shared with its timer tasks.
#[derive(Clone)]
struct ReadTrigger {
    id: EndpointId,
    periodic: bool,
    template: ResultTemplate,
    link: LinkHandle,
    outbox: mpsc::UnboundedSender<TagResult>,
}

impl ReadTrigger {
    fn fire(&self) {
        let result = if self.periodic {
            self.template.from_buffer(&self.link.buffer())
        } else if self.link.send(Command::Read { id: self.id }) {
            return;
        } else {
            self.template.failure(S7Error::Closed)
        };
        let _ = self.outbox.send(result);
    }
}

/// Handle of a registered read endpoint. Dropping it deregisters.
pub struct ReadEndpoint {
    id: EndpointId,
    tag: TagDescriptor,
    addresses: TagAddresses,
    trigger: ReadTrigger,
    results: mpsc::UnboundedReceiver<TagResult>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReadEndpoint {
    pub(crate) fn register(
        id: EndpointId,
        tag: TagDescriptor,
        options: ReadOptions,
        link: LinkHandle,
    ) -> Self {
        let addresses = TagAddresses::of(&tag);
        let template = ResultTemplate::new(options.topic, &tag, &addresses);
        let (outbox, results) = mpsc::unbounded_channel();
        let period = options.period.filter(|p| !p.is_zero());

        link.send(Command::Register {
            id,
            registration: Registration {
                kind: EndpointKind::Read,
                period,
                elements: tag.element_count(),
                template: template.clone(),
                outbox: outbox.clone(),
            },
        });

        let trigger = ReadTrigger {
            id,
            periodic: period.is_some(),
            template,
            link,
            outbox,
        };

        let mut tasks = Vec::new();
        if let Some(period) = period {
            let ticker = trigger.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    interval.tick().await;
                    ticker.fire();
                }
            }));
        }
        if options.trigger_once {
            let once = trigger.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(TRIGGER_ONCE_DELAY).await;
                once.fire();
            }));
        }

        debug!(endpoint = %id, address = %addresses.data, ?period, "read endpoint registered");
        Self {
            id,
            tag,
            addresses,
            trigger,
            results,
            tasks,
        }
    }

    /// Endpoint id.
    #[must_use]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// The addressed tag.
    #[must_use]
    pub fn tag(&self) -> &TagDescriptor {
        &self.tag
    }

    /// Data and path form addresses.
    #[must_use]
    pub fn addresses(&self) -> &TagAddresses {
        &self.addresses
    }

    /// Returns true if this endpoint decodes the poll buffer on a period.
    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.trigger.periodic
    }

    /// Request one read. The result arrives in the outbox.
    ///
    /// Periodic endpoints answer from the current poll buffer; others
    /// queue a poll, or fail at once when the link is not connected.
    pub fn request_read(&self) {
        self.trigger.fire();
    }

    /// Wait for the next result.
    pub async fn recv(&mut self) -> Option<TagResult> {
        self.results.recv().await
    }

    /// Take the next result if one is ready.
    pub fn try_recv(&mut self) -> Option<TagResult> {
        self.results.try_recv().ok()
    }

    /// Coarse link status.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        self.trigger.link.status()
    }

    /// Deregister; equivalent to dropping the handle.
    pub fn deregister(self) {}
}

impl Drop for ReadEndpoint {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.trigger.link.send(Command::Deregister { id: self.id });
    }
}

impl fmt::Debug for ReadEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadEndpoint")
            .field("id", &self.id)
            .field("address", &self.addresses.data)
            .field("periodic", &self.trigger.periodic)
            .finish_non_exhaustive()
    }
}

/// Handle of a registered write endpoint. Dropping it deregisters.
pub struct WriteEndpoint {
    id: EndpointId,
    tag: TagDescriptor,
    addresses: TagAddresses,
    template: ResultTemplate,
    link: LinkHandle,
    outbox: mpsc::UnboundedSender<TagResult>,
    results: mpsc::UnboundedReceiver<TagResult>,
}

impl WriteEndpoint {
    pub(crate) fn register(id: EndpointId, tag: TagDescriptor, topic: String, link: LinkHandle) -> Self {
        let addresses = TagAddresses::of(&tag);
        let template = ResultTemplate::new(topic, &tag, &addresses);
        let (outbox, results) = mpsc::unbounded_channel();

        link.send(Command::Register {
            id,
            registration: Registration {
                kind: EndpointKind::Write,
                period: None,
                elements: tag.element_count(),
                template: template.clone(),
                outbox: outbox.clone(),
            },
        });

        debug!(endpoint = %id, address = %addresses.data, "write endpoint registered");
        Self {
            id,
            tag,
            addresses,
            template,
            link,
            outbox,
            results,
        }
    }

    /// Endpoint id.
    #[must_use]
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// The addressed tag.
    #[must_use]
    pub fn tag(&self) -> &TagDescriptor {
        &self.tag
    }

    /// Data and path form addresses.
    #[must_use]
    pub fn addresses(&self) -> &TagAddresses {
        &self.addresses
    }

    /// Validate `values` and queue the write. The result arrives in the
    /// outbox.
    ///
    /// Values of the wrong primitive type are rejected without reaching
    /// the transport. Corrected values are written and reported with
    /// error -1.
    pub fn request_write(&self, values: &[TagValue]) {
        let validated = match validate(&self.tag, values) {
            Ok(validated) => validated,
            Err(e) => {
                error!(endpoint = %self.id, error = %e, "write rejected");
                let _ = self.outbox.send(self.template.failure(e));
                return;
            }
        };
        if validated.error {
            debug!(endpoint = %self.id, "write values corrected by validation");
        }

        let job = WriteJob {
            endpoint: self.id,
            address: self.addresses.data.clone(),
            values: validated.values,
            corrected: validated.error,
        };
        if !self.link.send(Command::Write { job }) {
            let _ = self.outbox.send(self.template.failure(S7Error::Closed));
        }
    }

    /// Wait for the next result.
    pub async fn recv(&mut self) -> Option<TagResult> {
        self.results.recv().await
    }

    /// Take the next result if one is ready.
    pub fn try_recv(&mut self) -> Option<TagResult> {
        self.results.try_recv().ok()
    }

    /// Coarse link status.
    #[must_use]
    pub fn status(&self) -> LinkStatus {
        self.link.status()
    }

    /// Deregister; equivalent to dropping the handle.
    pub fn deregister(self) {}
}

impl Drop for WriteEndpoint {
    fn drop(&mut self) {
        self.link.send(Command::Deregister { id: self.id });
    }
}

impl fmt::Debug for WriteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteEndpoint")
            .field("id", &self.id)
            .field("address", &self.addresses.data)
            .finish_non_exhaustive()
    }
}
