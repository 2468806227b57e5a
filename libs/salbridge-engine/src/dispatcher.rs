use std::sync::Arc;

use salbridge_api::{Inbound, Ingress, IngressConfig, IngressStats, RemoteId, UiWaker};

use crate::registry::TopicRegistry;

/// UI-side half of the ingress of one remote.
///
/// Owns the ingress of the current connection session. Every `open`
/// creates a fresh ingress so that nothing queued by a closed session can
/// leak into the next one; counters of closed sessions are accumulated.
pub struct Dispatcher {
    remote: RemoteId,
    config: IngressConfig,
    waker: Arc<dyn UiWaker>,
    session: Option<Ingress>,
    closed_sessions: IngressStats,
    drains: u64,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub ingress: IngressStats,
    pub drains: u64,
}

impl Dispatcher {
    pub fn new(remote: RemoteId, config: IngressConfig, waker: Arc<dyn UiWaker>) -> Self {
        Self {
            remote,
            config,
            waker,
            session: None,
            closed_sessions: IngressStats::default(),
            drains: 0,
        }
    }

    /// Start a new session, closing the previous one.
    pub fn open(&mut self) -> Ingress {
        self.close();
        let ingress = Ingress::new(self.remote.clone(), self.config, self.waker.clone());
        self.session = Some(ingress.clone());
        ingress
    }

    /// Close the current session; later middleware deliveries are dropped.
    pub fn close(&mut self) {
        if let Some(ingress) = self.session.take() {
            ingress.close();
            self.closed_sessions.merge(&ingress.stats());
        }
    }

    pub fn session(&self) -> Option<&Ingress> {
        self.session.as_ref()
    }

    /// Take everything queued. Samples are published to `registry` in FIFO
    /// order; acknowledgments, connection events and deadlines are returned,
    /// in the order they arrived, for the caller to route.
    pub fn drain(&mut self, registry: &mut TopicRegistry) -> Vec<Inbound> {
        let Some(ingress) = &self.session else {
            return Vec::new();
        };
        let batch = ingress.take_all();
        if batch.is_empty() {
            return Vec::new();
        }
        self.drains += 1;

        let total = batch.len();
        let mut control = Vec::new();
        for item in batch {
            match item {
                Inbound::Sample(sample) => {
                    registry.publish(sample);
                }
                other => control.push(other),
            }
        }
        tracing::trace!(remote = %self.remote, items = total, control = control.len(), "drained ingress");
        control
    }

    pub fn stats(&self) -> DispatchStats {
        let mut ingress = self.closed_sessions;
        if let Some(session) = &self.session {
            ingress.merge(&session.stats());
        }
        DispatchStats { ingress, drains: self.drains }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::SystemTime;

    use salbridge_api::{
        AckStage, Acknowledgment, CorrelationId, FieldSpec, FieldType, RawSample, Sample, TopicSpec,
    };

    use super::*;

    struct AlwaysAwake;

    impl UiWaker for AlwaysAwake {
        fn wake(&self) -> bool {
            true
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(RemoteId::new("MTM1M3"), IngressConfig::default(), Arc::new(AlwaysAwake))
    }

    fn spec() -> Arc<TopicSpec> {
        Arc::new(TopicSpec::telemetry(
            RemoteId::new("MTM1M3").topic("accelerometerData"),
            vec![FieldSpec::new("angularAccelerationX", FieldType::Float)],
        ))
    }

    fn raw(seq: u64) -> RawSample {
        RawSample::from_json(seq, SystemTime::now(), serde_json::json!({"angularAccelerationX": 0.5}))
    }

    #[test]
    fn publishes_samples_and_returns_control_items() {
        let mut dispatcher = dispatcher();
        let mut registry = TopicRegistry::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let _sub = registry.register(&spec().id, move |sample: &Sample| s.borrow_mut().push(sample.seq));

        let ingress = dispatcher.open();
        let sink = ingress.sink(spec());
        sink.deliver(raw(1));
        ingress.on_acknowledgment(Acknowledgment::new(CorrelationId(9), AckStage::Ack));
        sink.deliver(raw(2));

        let control = dispatcher.drain(&mut registry);
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert_eq!(control.len(), 1);
        assert!(matches!(&control[0], Inbound::Ack(a) if a.correlation == CorrelationId(9)));
        assert!(dispatcher.drain(&mut registry).is_empty());
        assert_eq!(dispatcher.stats().drains, 1);
    }

    #[test]
    fn reopening_discards_previous_session() {
        let mut dispatcher = dispatcher();
        let mut registry = TopicRegistry::new();
        let old = dispatcher.open();
        old.sink(spec()).deliver(raw(1));

        let _new = dispatcher.open();
        assert!(old.is_closed());
        assert!(!old.sink(spec()).deliver(raw(2)));
        assert!(dispatcher.drain(&mut registry).is_empty());
        assert!(registry.last_sample(&spec().id).is_none());

        // counted as of the close
        let stats = dispatcher.stats();
        assert_eq!(stats.ingress.enqueued, 1);
        assert_eq!(stats.ingress.dropped_closed, 1);
        assert_eq!(old.stats().dropped_closed, 2);
    }
}
