//! Middleware → UI boundary.
//!
//! The only code that runs on the middleware delivery context. It builds
//! immutable [`Sample`]s / [`Acknowledgment`]s, pushes them onto a bounded
//! queue and schedules one drain on the UI context. Everything else in the
//! bridge runs on the UI context and reads the queue with
//! [`Ingress::take_all`].
//!
//! ```text
//! middleware thread(s)                       UI context
//! ──────────────────                         ──────────
//! SampleSink::deliver ─┐
//! on_acknowledgment  ──┼─► Mutex<VecDeque> ──► take_all() ──► dispatcher
//! on_connection      ──┘        │
//!                               └─ scheduled.swap(true) ─► UiWaker::wake()
//! ```
//!
//! Overload policy, applied once the queue holds `high_water` items:
//! - a non-priority sample supersedes the oldest queued non-priority
//!   sample of the same topic (removed, new one appended at the tail);
//! - with nothing to supersede and the queue at `capacity`, the
//!   non-priority sample is dropped;
//! - priority samples, acknowledgments, connection events and deadlines
//!   are always queued.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::command::Acknowledgment;
use crate::id::{CorrelationId, RemoteId};
use crate::sample::{RawSample, Sample};
use crate::topic::TopicSpec;
use crate::transport::ConnectionEvent;

/// Cross-context wake primitive: schedules a drain on the UI context.
pub trait UiWaker: Send + Sync {
    /// Returns `false` when the UI context is gone (shutting down).
    fn wake(&self) -> bool;
}

/// Item crossing from the middleware context to the UI context.
#[derive(Debug, Clone)]
pub enum Inbound {
    Sample(Arc<Sample>),
    Ack(Acknowledgment),
    Connection(ConnectionEvent),
    /// Command deadline expired (pushed by the bridge's own timers).
    Deadline(CorrelationId),
}

impl Inbound {
    pub fn is_priority(&self) -> bool {
        match self {
            Inbound::Sample(sample) => sample.priority,
            _ => true,
        }
    }

    fn supersedes(&self, queued: &Inbound) -> bool {
        match (self, queued) {
            (Inbound::Sample(new), Inbound::Sample(old)) => !old.priority && old.topic == new.topic,
            _ => false,
        }
    }
}

/// Queue bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressConfig {
    /// Hard bound for non-priority items.
    pub capacity: usize,
    /// Coalescing starts at this length.
    pub high_water: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self { capacity: 4096, high_water: 3072 }
    }
}

/// Ingress counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngressStats {
    pub enqueued: u64,
    /// Non-priority samples superseded by a newer one of the same topic.
    pub coalesced: u64,
    /// Non-priority samples dropped at capacity.
    pub overflowed: u64,
    /// Items dropped because the UI context was unavailable.
    pub dropped_closed: u64,
    /// Samples not conforming to their topic schema.
    pub rejected: u64,
}

impl IngressStats {
    pub fn merge(&mut self, other: &IngressStats) {
        self.enqueued += other.enqueued;
        self.coalesced += other.coalesced;
        self.overflowed += other.overflowed;
        self.dropped_closed += other.dropped_closed;
        self.rejected += other.rejected;
    }
}

#[derive(Default)]
struct Queue {
    items: VecDeque<Inbound>,
    stats: IngressStats,
}

enum Admission {
    Queued,
    Coalesced,
    Overflowed,
}

impl Queue {
    fn admit(&mut self, item: Inbound, config: &IngressConfig) -> Admission {
        if !item.is_priority() && self.items.len() >= config.high_water {
            if let Some(pos) = self.items.iter().position(|queued| item.supersedes(queued)) {
                self.items.remove(pos);
                self.items.push_back(item);
                self.stats.coalesced += 1;
                return Admission::Coalesced;
            }
            if self.items.len() >= config.capacity {
                self.stats.overflowed += 1;
                return Admission::Overflowed;
            }
        }
        self.items.push_back(item);
        self.stats.enqueued += 1;
        Admission::Queued
    }
}

struct Shared {
    remote: RemoteId,
    config: IngressConfig,
    queue: Mutex<Queue>,
    scheduled: AtomicBool,
    closed: AtomicBool,
    waker: Arc<dyn UiWaker>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        match self.queue.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!(remote = %self.remote, "ingress queue lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Middleware-side handle of one connection session. Cheap to clone,
/// `Send + Sync`.
#[derive(Clone)]
pub struct Ingress {
    shared: Arc<Shared>,
}

impl fmt::Debug for Ingress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ingress")
            .field("remote", &self.shared.remote)
            .field("config", &self.shared.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Ingress {
    pub fn new(remote: RemoteId, config: IngressConfig, waker: Arc<dyn UiWaker>) -> Self {
        Self {
            shared: Arc::new(Shared {
                remote,
                config,
                queue: Mutex::new(Queue::default()),
                scheduled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                waker,
            }),
        }
    }

    pub fn remote(&self) -> &RemoteId {
        &self.shared.remote
    }

    /// Per-topic sink handed to [`Transport::subscribe`](crate::transport::Transport::subscribe).
    pub fn sink(&self, spec: Arc<TopicSpec>) -> SampleSink {
        SampleSink { spec, ingress: self.clone() }
    }

    pub fn on_acknowledgment(&self, ack: Acknowledgment) -> bool {
        self.push(Inbound::Ack(ack))
    }

    pub fn on_connection(&self, event: ConnectionEvent) -> bool {
        self.push(Inbound::Connection(event))
    }

    /// Enqueue and schedule a drain. Never blocks beyond the queue lock.
    /// Returns `false` when the item was dropped.
    pub fn push(&self, item: Inbound) -> bool {
        if self.is_closed() {
            self.shared.lock().stats.dropped_closed += 1;
            tracing::trace!(remote = %self.shared.remote, "ingress closed, dropping item");
            return false;
        }

        let admission = self.shared.lock().admit(item, &self.shared.config);
        match admission {
            Admission::Queued => {}
            Admission::Coalesced => {
                tracing::trace!(remote = %self.shared.remote, "coalesced telemetry sample");
            }
            Admission::Overflowed => {
                tracing::debug!(remote = %self.shared.remote, "ingress at capacity, dropping telemetry sample");
                return false;
            }
        }

        if !self.shared.scheduled.swap(true, Ordering::AcqRel) && !self.shared.waker.wake() {
            tracing::warn!(remote = %self.shared.remote, "UI context unavailable, closing ingress");
            self.close();
            return false;
        }
        true
    }

    /// UI side: pop everything queued, in FIFO order.
    pub fn take_all(&self) -> VecDeque<Inbound> {
        self.shared.scheduled.store(false, Ordering::Release);
        std::mem::take(&mut self.shared.lock().items)
    }

    /// Stop accepting items; anything still queued is discarded and counted.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let mut queue = self.shared.lock();
        let discarded = queue.items.len() as u64;
        queue.items.clear();
        queue.stats.dropped_closed += discarded;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> IngressStats {
        self.shared.lock().stats
    }

    fn count_rejected(&self) {
        self.shared.lock().stats.rejected += 1;
    }
}

/// Per-topic delivery handle given to the transport.
#[derive(Clone, Debug)]
pub struct SampleSink {
    spec: Arc<TopicSpec>,
    ingress: Ingress,
}

impl SampleSink {
    pub fn topic(&self) -> &TopicSpec {
        &self.spec
    }

    /// Called from the middleware context for every sample of this topic.
    pub fn deliver(&self, raw: RawSample) -> bool {
        if let Err(e) = self.spec.check(&raw.fields) {
            tracing::warn!(topic = %self.spec.id, seq = raw.seq, error = %e, "rejecting sample");
            self.ingress.count_rejected();
            return false;
        }
        let sample = Sample {
            topic: self.spec.id.clone(),
            seq: raw.seq,
            captured: raw.captured,
            received: SystemTime::now(),
            priority: self.spec.priority,
            fields: raw.fields,
        };
        self.ingress.push(Inbound::Sample(Arc::new(sample)))
    }
}
