use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use salbridge_api::{
    AckStage, Acknowledgment, Command, ConnectionEvent, CorrelationId, Ingress, RawSample, RemoteId, SampleSink,
    Transport, TransportError,
};

/// Scripted controller answer to one command name.
#[derive(Debug, Clone, PartialEq)]
pub enum AckScript {
    /// Ack followed by Complete.
    Complete,
    /// Acknowledge with exactly these stages.
    Steps(Vec<AckStage>),
    Reject(String),
    Fail(String),
    /// Never answer.
    Silent,
}

impl AckScript {
    fn stages(&self) -> Vec<AckStage> {
        match self {
            AckScript::Complete => vec![AckStage::Ack, AckStage::Complete],
            AckScript::Steps(steps) => steps.clone(),
            AckScript::Reject(reason) => vec![AckStage::Rejected { reason: reason.clone() }],
            AckScript::Fail(reason) => vec![AckStage::Ack, AckStage::Failed { reason: reason.clone() }],
            AckScript::Silent => Vec::new(),
        }
    }
}

#[derive(Default)]
struct Link {
    ingress: Option<Ingress>,
    sinks: HashMap<String, SampleSink>,
    seq: HashMap<String, u64>,
}

struct Inner {
    auto_connect: bool,
    links: HashMap<RemoteId, Link>,
    scripts: HashMap<String, AckScript>,
    sent: Vec<Command>,
    cancelled: Vec<CorrelationId>,
}

/// In-process [`Transport`] standing in for the middleware: the test or
/// simulator plays the controller through its methods, from any thread.
pub struct LoopbackTransport {
    inner: Mutex<Inner>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                auto_connect: true,
                links: HashMap::new(),
                scripts: HashMap::new(),
                sent: Vec::new(),
                cancelled: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("loopback transport lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Report the connection as up right when it is opened (default).
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.lock().auto_connect = auto_connect;
    }

    /// Answer commands named `command` with `script`. Unscripted commands complete.
    pub fn script(&self, command: impl Into<String>, script: AckScript) {
        self.lock().scripts.insert(command.into(), script);
    }

    fn ingress(&self, remote: &RemoteId) -> Option<Ingress> {
        self.lock().links.get(remote).and_then(|l| l.ingress.clone())
    }

    pub fn connection_up(&self, remote: &RemoteId) -> bool {
        self.ingress(remote).is_some_and(|i| i.on_connection(ConnectionEvent::Up))
    }

    pub fn connection_down(&self, remote: &RemoteId, reason: impl Into<String>) -> bool {
        self.ingress(remote)
            .is_some_and(|i| i.on_connection(ConnectionEvent::Down { reason: reason.into() }))
    }

    pub fn acknowledge(&self, remote: &RemoteId, correlation: CorrelationId, stage: AckStage) -> bool {
        self.ingress(remote)
            .is_some_and(|i| i.on_acknowledgment(Acknowledgment::new(correlation, stage)))
    }

    /// Publish a sample on a subscribed topic with the next sequence number
    /// and the current time as capture time. Returns `false` when nobody
    /// subscribed the topic or the sample was not accepted.
    pub fn publish(&self, remote: &RemoteId, topic: &str, fields: serde_json::Value) -> bool {
        self.publish_at(remote, topic, SystemTime::now(), fields)
    }

    pub fn publish_at(&self, remote: &RemoteId, topic: &str, captured: SystemTime, fields: serde_json::Value) -> bool {
        let (sink, seq) = {
            let mut inner = self.lock();
            let Some(link) = inner.links.get_mut(remote) else {
                return false;
            };
            let Some(sink) = link.sinks.get(topic).cloned() else {
                return false;
            };
            let seq = link.seq.entry(topic.to_string()).or_insert(0);
            *seq += 1;
            (sink, *seq)
        };
        // deliver outside the lock, the way a middleware listener would
        sink.deliver(RawSample::from_json(seq, captured, fields))
    }

    pub fn sent_commands(&self) -> Vec<Command> {
        self.lock().sent.clone()
    }

    pub fn cancelled(&self) -> Vec<CorrelationId> {
        self.lock().cancelled.clone()
    }

    pub fn subscriptions(&self, remote: &RemoteId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .lock()
            .links
            .get(remote)
            .map(|l| l.sinks.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub fn is_open(&self, remote: &RemoteId) -> bool {
        self.lock().links.contains_key(remote)
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, remote: &RemoteId, ingress: Ingress) -> Result<(), TransportError> {
        let auto_connect = {
            let mut inner = self.lock();
            let link = inner.links.entry(remote.clone()).or_default();
            link.ingress = Some(ingress.clone());
            link.sinks.clear();
            inner.auto_connect
        };
        tracing::debug!(remote = %remote, auto_connect, "loopback opened");
        if auto_connect {
            ingress.on_connection(ConnectionEvent::Up);
        }
        Ok(())
    }

    fn subscribe(&self, remote: &RemoteId, sink: SampleSink) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let link = inner
            .links
            .get_mut(remote)
            .ok_or_else(|| TransportError::connection(format!("{remote} not open")))?;
        link.sinks.insert(sink.topic().id.name.clone(), sink);
        Ok(())
    }

    fn send_command(&self, command: &Command) -> Result<(), TransportError> {
        let (ingress, stages) = {
            let mut inner = self.lock();
            let ingress = inner
                .links
                .get(&command.remote)
                .and_then(|l| l.ingress.clone())
                .ok_or_else(|| TransportError::connection(format!("{} not open", command.remote)))?;
            let stages = inner
                .scripts
                .get(&command.name)
                .map(AckScript::stages)
                .unwrap_or_else(|| AckScript::Complete.stages());
            inner.sent.push(command.clone());
            (ingress, stages)
        };
        for stage in stages {
            ingress.on_acknowledgment(Acknowledgment::new(command.correlation, stage));
        }
        Ok(())
    }

    fn cancel_command(&self, _remote: &RemoteId, correlation: CorrelationId) -> Result<(), TransportError> {
        self.lock().cancelled.push(correlation);
        Ok(())
    }

    fn close(&self, remote: &RemoteId) {
        self.lock().links.remove(remote);
        tracing::debug!(remote = %remote, "loopback closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use salbridge_api::{Inbound, IngressConfig, TopicSpec, UiWaker};

    use super::*;

    struct AlwaysAwake;

    impl UiWaker for AlwaysAwake {
        fn wake(&self) -> bool {
            true
        }
    }

    #[test]
    fn scripted_acks_land_in_ingress() {
        let transport = LoopbackTransport::new();
        transport.set_auto_connect(false);
        transport.script("lowerM1M3", AckScript::Reject("not raised".into()));
        let remote = RemoteId::new("MTM1M3");
        let ingress = Ingress::new(remote.clone(), IngressConfig::default(), Arc::new(AlwaysAwake));
        transport.open(&remote, ingress.clone()).unwrap();

        let command = Command {
            remote: remote.clone(),
            name: "lowerM1M3".into(),
            args: Default::default(),
            correlation: CorrelationId(77),
            timeout: std::time::Duration::from_secs(1),
        };
        transport.send_command(&command).unwrap();
        let items = ingress.take_all();
        assert!(matches!(
            items.front(),
            Some(Inbound::Ack(a)) if a.stage == AckStage::Rejected { reason: "not raised".into() }
        ));
    }

    #[test]
    fn publish_requires_a_subscription() {
        let transport = LoopbackTransport::new();
        let remote = RemoteId::new("MTM1M3");
        let ingress = Ingress::new(remote.clone(), IngressConfig::default(), Arc::new(AlwaysAwake));
        transport.open(&remote, ingress.clone()).unwrap();
        assert!(!transport.publish(&remote, "heartbeat", serde_json::json!({})));

        let spec = Arc::new(TopicSpec::event(remote.topic("heartbeat"), Vec::new()));
        transport.subscribe(&remote, ingress.sink(spec)).unwrap();
        assert!(transport.publish(&remote, "heartbeat", serde_json::json!({})));
        assert!(transport.publish(&remote, "heartbeat", serde_json::json!({})));
        let seqs: Vec<u64> = ingress
            .take_all()
            .into_iter()
            .filter_map(|i| match i {
                Inbound::Sample(s) => Some(s.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }
}
