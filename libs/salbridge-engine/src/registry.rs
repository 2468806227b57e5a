use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use salbridge_api::{Sample, TopicId};

type Callback = Box<dyn FnMut(&Sample)>;

struct Slot {
    id: u64,
    active: Rc<Cell<bool>>,
    callback: RefCell<Callback>,
}

impl Slot {
    fn call(&self, sample: &Sample) {
        match self.callback.try_borrow_mut() {
            Ok(mut callback) => callback(sample),
            // a callback publishing into its own topic
            Err(_) => tracing::warn!(topic = %sample.topic, subscriber = self.id, "re-entrant delivery skipped"),
        }
    }
}

#[derive(Default)]
struct TopicEntry {
    last: Option<Arc<Sample>>,
    subscribers: Vec<Rc<Slot>>,
}

/// Handle of one registered callback. Cancelling is idempotent and may
/// happen from inside any callback, including the subscription's own.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: TopicId,
    active: Rc<Cell<bool>>,
}

impl Subscription {
    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Stop deliveries. Takes effect for the very next sample, including
    /// one already being fanned out.
    pub fn cancel(&self) {
        self.active.set(false);
    }
}

/// UI-side subscription registry: topic → subscribers plus the most
/// recent sample of every topic.
///
/// Not `Send`, lives on the UI context only.
#[derive(Default)]
pub struct TopicRegistry {
    topics: HashMap<TopicId, TopicEntry>,
    next_id: u64,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`. A cached sample of the topic is
    /// replayed to the new subscriber before this returns.
    pub fn register<F>(&mut self, topic: &TopicId, callback: F) -> Subscription
    where
        F: FnMut(&Sample) + 'static,
    {
        self.next_id += 1;
        let slot = Rc::new(Slot {
            id: self.next_id,
            active: Rc::new(Cell::new(true)),
            callback: RefCell::new(Box::new(callback)),
        });
        let subscription = Subscription {
            id: slot.id,
            topic: topic.clone(),
            active: slot.active.clone(),
        };

        let entry = self.topics.entry(topic.clone()).or_default();
        entry.subscribers.push(slot.clone());
        if let Some(last) = entry.last.clone() {
            tracing::trace!(topic = %topic, seq = last.seq, "replaying last sample to new subscriber");
            slot.call(&last);
        }
        subscription
    }

    pub fn unregister(&mut self, subscription: &Subscription) {
        subscription.cancel();
        if let Some(entry) = self.topics.get_mut(&subscription.topic) {
            entry.subscribers.retain(|s| s.id != subscription.id);
        }
    }

    /// Cache `sample` as its topic's latest and fan it out to the
    /// subscribers registered at this point. Returns the number of
    /// callbacks invoked.
    pub fn publish(&mut self, sample: Arc<Sample>) -> usize {
        let entry = self.topics.entry(sample.topic.clone()).or_default();
        entry.last = Some(sample.clone());
        entry.subscribers.retain(|s| s.active.get());
        let snapshot = entry.subscribers.clone();

        let mut delivered = 0;
        for slot in snapshot {
            if slot.active.get() {
                slot.call(&sample);
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver every topic's cached sample again to its current subscribers.
    pub fn reemit(&mut self) -> usize {
        let cached: Vec<Arc<Sample>> = self.topics.values().filter_map(|e| e.last.clone()).collect();
        cached.into_iter().map(|sample| self.publish(sample)).sum()
    }

    /// Deliver `topic`'s cached sample again, if there is one.
    pub fn replay(&mut self, topic: &TopicId) -> usize {
        match self.last_sample(topic) {
            Some(last) => self.publish(last),
            None => 0,
        }
    }

    pub fn last_sample(&self, topic: &TopicId) -> Option<Arc<Sample>> {
        self.topics.get(topic).and_then(|e| e.last.clone())
    }

    pub fn subscriber_count(&self, topic: &TopicId) -> usize {
        self.topics
            .get(topic)
            .map(|e| e.subscribers.iter().filter(|s| s.active.get()).count())
            .unwrap_or(0)
    }

    /// Topics with at least one live subscriber.
    pub fn subscribed_topics(&self) -> Vec<TopicId> {
        self.topics
            .iter()
            .filter(|(_, e)| e.subscribers.iter().any(|s| s.active.get()))
            .map(|(id, _)| id.clone())
            .collect()
    }
}
