use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use serde_json::json;
use tokio::time::Instant;

use salbridge_api::{
    ConnectionEvent, FieldSpec, FieldType, Fields, Inbound, IngressConfig, RemoteId, Sample, TopicId, TopicSpec,
    Transport, TransportError, UiWaker,
};

use crate::config::{BridgeConfig, CommandConfig, LivenessConfig, RemoteConfig};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::error::{BridgeError, CommandError};
use crate::liveness::LivenessMonitor;
use crate::registry::{Subscription, TopicRegistry};
use crate::sequencer::{CommandHandle, CommandRequest, Sequencer, SequencerStats};

/// Local topic carrying the remote's liveness transitions.
pub const LIVENESS_TOPIC: &str = "bridge.liveness";

/// Connection state of a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteState {
    Disconnected,
    Connecting,
    Connected,
    /// Heartbeats missing; commands are refused until the next heartbeat.
    Stale,
}

impl RemoteState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteState::Disconnected => "disconnected",
            RemoteState::Connecting => "connecting",
            RemoteState::Connected => "connected",
            RemoteState::Stale => "stale",
        }
    }
}

/// Per-remote settings, usually taken from [`BridgeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RemoteSettings {
    pub ingress: IngressConfig,
    pub liveness: LivenessConfig,
    pub commands: CommandConfig,
}

impl From<&BridgeConfig> for RemoteSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            ingress: config.dispatch.ingress(),
            liveness: config.liveness.clone(),
            commands: config.commands.clone(),
        }
    }
}

/// Combined counters of one remote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub dispatch: DispatchStats,
    pub commands: SequencerStats,
}

/// UI-side handle of one remote SAL component.
///
/// All methods must be called from the UI context. Subscriber and
/// completion callbacks run from inside [`drain`](Self::drain),
/// [`tick`](Self::tick) and the other `&mut self` methods, so they must not
/// re-borrow the handle; defer such work with `spawn_local`.
pub struct RemoteHandle {
    id: RemoteId,
    transport: Arc<dyn Transport>,
    liveness_config: LivenessConfig,
    state: RemoteState,
    topics: BTreeMap<String, Arc<TopicSpec>>,
    /// Topics with a middleware subscription wanted.
    wanted: BTreeSet<String>,
    /// Topics subscribed at the middleware in the current session.
    active: BTreeSet<String>,
    registry: TopicRegistry,
    dispatcher: Dispatcher,
    sequencer: Sequencer,
    liveness: LivenessMonitor,
    liveness_seq: u64,
    /// Set once the heartbeat schema was declared over the built-in one.
    heartbeat_declared: bool,
    /// Sessions that reached CONNECTED.
    sessions: u64,
    _heartbeat: Subscription,
}

impl RemoteHandle {
    pub fn new(id: RemoteId, transport: Arc<dyn Transport>, waker: Arc<dyn UiWaker>, settings: RemoteSettings) -> Self {
        let mut registry = TopicRegistry::new();
        let liveness = LivenessMonitor::new(&settings.liveness);
        let heartbeat_topic = settings.liveness.heartbeat_topic.clone();
        let heartbeat = registry.register(&id.topic(heartbeat_topic.clone()), liveness.callback());

        let mut topics = BTreeMap::new();
        topics.insert(
            heartbeat_topic.clone(),
            Arc::new(TopicSpec::event(id.topic(heartbeat_topic.clone()), Vec::new())),
        );
        topics.insert(
            LIVENESS_TOPIC.to_string(),
            Arc::new(TopicSpec::event(
                id.topic(LIVENESS_TOPIC),
                vec![
                    FieldSpec::new("state", FieldType::String),
                    FieldSpec::new("since_last_heartbeat_ms", FieldType::Any),
                ],
            )),
        );

        Self {
            dispatcher: Dispatcher::new(id.clone(), settings.ingress, waker),
            sequencer: Sequencer::new(
                id.clone(),
                settings.commands.default_timeout(),
                settings.commands.recent_resolved,
            ),
            id,
            transport,
            liveness_config: settings.liveness,
            state: RemoteState::Disconnected,
            topics,
            wanted: BTreeSet::from([heartbeat_topic]),
            active: BTreeSet::new(),
            registry,
            liveness,
            liveness_seq: 0,
            heartbeat_declared: false,
            sessions: 0,
            _heartbeat: heartbeat,
        }
    }

    /// Build a handle and declare the configured topics.
    pub fn from_config(
        remote: &RemoteConfig,
        config: &BridgeConfig,
        transport: Arc<dyn Transport>,
        waker: Arc<dyn UiWaker>,
    ) -> Result<Self, BridgeError> {
        let mut handle = Self::new(remote.remote_id()?, transport, waker, RemoteSettings::from(config));
        for spec in remote.topic_specs()? {
            handle.declare(spec)?;
        }
        Ok(handle)
    }

    pub fn id(&self) -> &RemoteId {
        &self.id
    }

    pub fn state(&self) -> RemoteState {
        self.state
    }

    /// Declare a topic schema. Redeclaring the same schema is a no-op.
    ///
    /// The heartbeat topic starts with a schema-less built-in declaration
    /// which one explicit declaration may replace. [`LIVENESS_TOPIC`] is
    /// owned by the handle and can't be declared.
    pub fn declare(&mut self, spec: TopicSpec) -> Result<(), BridgeError> {
        if spec.id.remote != self.id {
            return Err(BridgeError::ForeignTopic { remote: self.id.clone(), topic: spec.id.to_string() });
        }
        if spec.id.name == LIVENESS_TOPIC {
            return Err(BridgeError::ReservedTopic(spec.id.to_string()));
        }
        let overrides_heartbeat = spec.id.name == self.liveness_config.heartbeat_topic && !self.heartbeat_declared;
        if let Some(existing) = self.topics.get(&spec.id.name) {
            if **existing == spec {
                self.heartbeat_declared |= overrides_heartbeat;
                return Ok(());
            }
            if !overrides_heartbeat {
                return Err(BridgeError::TopicRedeclared(spec.id.to_string()));
            }
        }
        tracing::debug!(topic = %spec.id, kind = ?spec.kind, priority = spec.priority, "topic declared");
        let name = spec.id.name.clone();
        let spec = Arc::new(spec);
        self.topics.insert(name.clone(), spec.clone());
        if overrides_heartbeat {
            self.heartbeat_declared = true;
            // a live middleware subscription switches to the new schema
            if self.active.remove(&name) && self.is_up() {
                self.subscribe_remote(&spec)?;
            }
        }
        Ok(())
    }

    /// Declared topics, including the heartbeat and liveness ones.
    pub fn topics(&self) -> Vec<Arc<TopicSpec>> {
        self.topics.values().cloned().collect()
    }

    /// Register a subscriber. The topic's latest sample, if any, is replayed
    /// before this returns. Subscriptions survive disconnects.
    pub fn subscribe<F>(&mut self, topic: &str, callback: F) -> Result<Subscription, BridgeError>
    where
        F: FnMut(&Sample) + 'static,
    {
        if self.state == RemoteState::Disconnected {
            return Err(BridgeError::SubscriptionOnDisconnectedRemote {
                remote: self.id.clone(),
                topic: topic.to_string(),
            });
        }
        let spec = self
            .topics
            .get(topic)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownTopic(self.id.topic(topic).to_string()))?;

        let subscription = self.registry.register(&spec.id, callback);
        if topic != LIVENESS_TOPIC && self.wanted.insert(topic.to_string()) && self.is_up() {
            if let Err(e) = self.subscribe_remote(&spec) {
                self.wanted.remove(topic);
                self.registry.unregister(&subscription);
                return Err(e.into());
            }
        }
        Ok(subscription)
    }

    pub fn unsubscribe(&mut self, subscription: &Subscription) {
        self.registry.unregister(subscription);
    }

    pub fn last_sample(&self, topic: &str) -> Option<Arc<Sample>> {
        self.registry.last_sample(&self.id.topic(topic))
    }

    /// Deliver the latest sample of every topic again to its subscribers,
    /// e.g. after a view was rebuilt.
    pub fn reemit(&mut self) -> usize {
        self.registry.reemit()
    }

    /// DISCONNECTED → CONNECTING. The transport reports completion with
    /// [`ConnectionEvent::Up`].
    pub fn connect(&mut self) -> Result<(), BridgeError> {
        if self.state != RemoteState::Disconnected {
            return Err(BridgeError::InvalidTransition {
                remote: self.id.clone(),
                from: self.state,
                to: RemoteState::Connecting,
            });
        }
        let ingress = self.dispatcher.open();
        if let Err(e) = self.transport.open(&self.id, ingress) {
            self.dispatcher.close();
            return Err(BridgeError::from(e).with_context(format!("connecting {}", self.id)));
        }
        self.transition(RemoteState::Connecting);
        Ok(())
    }

    /// Any state → DISCONNECTED. Pending commands fail with
    /// [`CommandError::Disconnected`]; subscriptions stay registered.
    pub fn disconnect(&mut self) {
        if self.state == RemoteState::Disconnected {
            return;
        }
        self.transport.close(&self.id);
        self.lose_connection();
    }

    fn lose_connection(&mut self) {
        self.dispatcher.close();
        self.active.clear();
        self.transition(RemoteState::Disconnected);
        self.sequencer.fail_all(CommandError::Disconnected);
    }

    /// Process everything the middleware queued since the last drain.
    /// Returns the number of control items routed.
    pub fn drain(&mut self) -> usize {
        let control = self.dispatcher.drain(&mut self.registry);
        let routed = control.len();
        for item in control {
            match item {
                Inbound::Ack(ack) => self.sequencer.on_acknowledgment(ack),
                Inbound::Deadline(correlation) => self.sequencer.on_deadline(correlation),
                Inbound::Connection(event) => self.on_connection(event),
                // published by the dispatcher
                Inbound::Sample(_) => {}
            }
        }
        if self.state == RemoteState::Stale && self.liveness.recovered() {
            tracing::info!(remote = %self.id, "heartbeat resumed");
            self.liveness.reset(Instant::now());
            self.transition(RemoteState::Connected);
        }
        routed
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        match (event, self.state) {
            (ConnectionEvent::Up, RemoteState::Connecting) => {
                self.liveness.reset(Instant::now());
                self.sessions += 1;
                self.transition(RemoteState::Connected);
                self.subscribe_wanted();
                if self.sessions > 1 {
                    self.replay_wanted();
                }
            }
            (ConnectionEvent::Up, state) => {
                tracing::debug!(remote = %self.id, ?state, "ignoring connection up");
            }
            (ConnectionEvent::Down { reason }, RemoteState::Disconnected) => {
                tracing::debug!(remote = %self.id, %reason, "ignoring connection down");
            }
            (ConnectionEvent::Down { reason }, _) => {
                tracing::warn!(remote = %self.id, %reason, "connection lost");
                self.transport.close(&self.id);
                self.lose_connection();
            }
        }
    }

    /// Periodic housekeeping: command deadline sweep and heartbeat check.
    pub fn tick(&mut self, now: Instant) {
        self.sequencer.expire(now);
        if self.state == RemoteState::Connected && self.liveness.is_overdue(now) {
            tracing::warn!(
                remote = %self.id,
                since_last_ms = self.liveness.since_last(now).map(|d| d.as_millis() as u64),
                "heartbeat missing, remote stale"
            );
            self.liveness.mark_stale();
            self.transition(RemoteState::Stale);
            self.sequencer.fail_all(CommandError::Disconnected);
        }
    }

    /// Issue a command with default options.
    pub fn issue(&mut self, name: &str, args: Fields) -> CommandHandle {
        self.issue_with(CommandRequest::new(name).args(args))
    }

    pub fn issue_with(&mut self, request: CommandRequest) -> CommandHandle {
        let ingress = match self.state {
            RemoteState::Connected => self.dispatcher.session(),
            _ => None,
        };
        self.sequencer.issue(self.transport.as_ref(), ingress, request)
    }

    /// Cancel a pending command. Returns `false` if it was already resolved.
    pub fn cancel(&mut self, handle: &CommandHandle) -> bool {
        self.sequencer.cancel(self.transport.as_ref(), handle.correlation())
    }

    pub fn pending_commands(&self) -> Vec<String> {
        self.sequencer.pending().into_iter().map(|(_, name)| name).collect()
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn stats(&self) -> RemoteStats {
        RemoteStats {
            dispatch: self.dispatcher.stats(),
            commands: self.sequencer.stats(),
        }
    }

    /// Close the session for good, at UI shutdown.
    pub fn shutdown(&mut self) {
        self.disconnect();
        self.dispatcher.close();
    }

    fn is_up(&self) -> bool {
        matches!(self.state, RemoteState::Connected | RemoteState::Stale)
    }

    fn subscribe_remote(&mut self, spec: &Arc<TopicSpec>) -> Result<(), TransportError> {
        let Some(ingress) = self.dispatcher.session() else {
            return Ok(());
        };
        self.transport.subscribe(&self.id, ingress.sink(spec.clone()))?;
        self.active.insert(spec.id.name.clone());
        tracing::debug!(topic = %spec.id, "subscribed at middleware");
        Ok(())
    }

    fn subscribe_wanted(&mut self) {
        let missing: Vec<Arc<TopicSpec>> = self
            .wanted
            .iter()
            .filter(|name| !self.active.contains(*name))
            .filter_map(|name| self.topics.get(name).cloned())
            .collect();
        for spec in missing {
            if let Err(e) = self.subscribe_remote(&spec) {
                tracing::warn!(topic = %spec.id, error = %e, "middleware subscription failed");
            }
        }
    }

    /// Hand the last-known sample of every middleware topic back to its
    /// subscribers after a reconnect. Heartbeats are left out so a cached
    /// one doesn't count as a fresh beat.
    fn replay_wanted(&mut self) {
        let topics: Vec<TopicId> = self
            .wanted
            .iter()
            .filter(|name| **name != self.liveness_config.heartbeat_topic)
            .map(|name| self.id.topic(name.as_str()))
            .collect();
        let replayed: usize = topics.iter().map(|topic| self.registry.replay(topic)).sum();
        if replayed > 0 {
            tracing::debug!(remote = %self.id, replayed, "replayed last-known samples after reconnect");
        }
    }

    fn transition(&mut self, to: RemoteState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        tracing::info!(remote = %self.id, from = from.as_str(), to = to.as_str(), "remote state changed");
        self.publish_liveness();
    }

    fn publish_liveness(&mut self) {
        self.liveness_seq += 1;
        let since = self
            .liveness
            .since_last(Instant::now())
            .map(|d| json!(d.as_millis() as u64))
            .unwrap_or(serde_json::Value::Null);
        let mut fields = Fields::new();
        fields.insert("state".into(), json!(self.state.as_str()));
        fields.insert("since_last_heartbeat_ms".into(), since);

        let now = SystemTime::now();
        let topic = self.liveness_topic();
        self.registry.publish(Arc::new(Sample {
            topic,
            seq: self.liveness_seq,
            captured: now,
            received: now,
            priority: true,
            fields,
        }));
    }

    fn liveness_topic(&self) -> TopicId {
        self.id.topic(LIVENESS_TOPIC)
    }

    /// Heartbeat timing in effect.
    pub fn liveness_config(&self) -> &LivenessConfig {
        &self.liveness_config
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use salbridge_api::{AckStage, TopicKind};
    use serde_json::json;

    use super::*;
    use crate::loopback::{AckScript, LoopbackTransport};
    use crate::ui_loop::NotifyWaker;

    fn setup() -> (RemoteHandle, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let remote = RemoteId::new("MTM1M3");
        let mut handle = RemoteHandle::new(remote.clone(), transport.clone(), NotifyWaker::new(), RemoteSettings::default());
        handle
            .declare(TopicSpec::event(
                remote.topic("detailedState"),
                vec![FieldSpec::new("detailedState", FieldType::Int)],
            ))
            .unwrap();
        (handle, transport)
    }

    fn connected() -> (RemoteHandle, Arc<LoopbackTransport>) {
        let (mut handle, transport) = setup();
        handle.connect().unwrap();
        handle.drain();
        assert_eq!(handle.state(), RemoteState::Connected);
        (handle, transport)
    }

    #[test]
    fn subscribe_while_disconnected_is_rejected() {
        let (mut handle, _) = setup();
        let err = handle.subscribe("detailedState", |_| {}).unwrap_err();
        assert!(matches!(err, BridgeError::SubscriptionOnDisconnectedRemote { .. }));
    }

    #[test]
    fn unknown_topic_is_rejected() {
        let (mut handle, _) = connected();
        assert!(matches!(handle.subscribe("nope", |_| {}), Err(BridgeError::UnknownTopic(_))));
    }

    #[test]
    fn redeclaring_with_other_schema_fails() {
        let (mut handle, _) = setup();
        let other = TopicSpec::telemetry(handle.id().topic("detailedState"), Vec::new());
        assert!(matches!(handle.declare(other), Err(BridgeError::TopicRedeclared(_))));
        let same = TopicSpec::event(
            handle.id().topic("detailedState"),
            vec![FieldSpec::new("detailedState", FieldType::Int)],
        );
        assert!(handle.declare(same).is_ok());
    }

    #[test]
    fn second_connect_is_an_invalid_transition() {
        let (mut handle, transport) = setup();
        transport.set_auto_connect(false);
        handle.connect().unwrap();
        assert_eq!(handle.state(), RemoteState::Connecting);
        assert!(matches!(handle.connect(), Err(BridgeError::InvalidTransition { .. })));
    }

    #[test]
    fn subscriptions_made_while_connecting_reach_the_middleware_on_connect() {
        let (mut handle, transport) = setup();
        transport.set_auto_connect(false);
        handle.connect().unwrap();
        let _sub = handle.subscribe("detailedState", |_| {}).unwrap();
        assert!(transport.subscriptions(handle.id()).is_empty());

        transport.connection_up(handle.id());
        handle.drain();
        let subscribed = transport.subscriptions(handle.id());
        assert!(subscribed.contains(&"detailedState".to_string()));
        assert!(subscribed.contains(&"heartbeat".to_string()));
    }

    #[test]
    fn liveness_topic_follows_state_transitions() {
        let (mut handle, transport) = setup();
        transport.set_auto_connect(false);
        handle.connect().unwrap();

        let states = Rc::new(RefCell::new(Vec::new()));
        let s = states.clone();
        let _sub = handle
            .subscribe(LIVENESS_TOPIC, move |sample: &Sample| {
                s.borrow_mut().push(sample.get_str("state").unwrap_or_default().to_string())
            })
            .unwrap();
        transport.connection_up(handle.id());
        handle.drain();
        handle.disconnect();

        assert_eq!(*states.borrow(), vec!["connecting", "connected", "disconnected"]);
        assert!(transport.subscriptions(handle.id()).is_empty());
    }

    #[test]
    fn remote_down_fails_pending_and_keeps_subscriptions() {
        let (mut handle, transport) = connected();
        transport.script("raiseM1M3", AckScript::Silent);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let _sub = handle
            .subscribe("detailedState", move |sample: &Sample| s.borrow_mut().push(sample.seq))
            .unwrap();
        let command = handle.issue("raiseM1M3", Fields::new());

        transport.connection_down(handle.id(), "participant lost");
        handle.drain();
        assert_eq!(handle.state(), RemoteState::Disconnected);
        assert_eq!(command.result(), Some(Err(CommandError::Disconnected)));

        handle.connect().unwrap();
        handle.drain();
        transport.publish(handle.id(), "detailedState", json!({"detailedState": 3}));
        handle.drain();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn commands_complete_through_loopback_script() {
        let (mut handle, transport) = connected();
        transport.script(
            "enable",
            AckScript::Steps(vec![
                AckStage::Ack,
                AckStage::InProgress { percent: Some(50.0), duration: None },
                AckStage::Complete,
            ]),
        );
        let command = handle.issue("enable", Fields::new());
        assert_eq!(handle.pending_commands(), vec!["enable".to_string()]);
        handle.drain();
        assert_eq!(command.result(), Some(Ok(())));
        assert!(handle.pending_commands().is_empty());
    }

    #[test]
    fn issue_when_not_connected_fails_immediately() {
        let (mut handle, transport) = setup();
        let command = handle.issue("enable", Fields::new());
        assert_eq!(command.result(), Some(Err(CommandError::Disconnected)));
        assert!(transport.sent_commands().is_empty());
    }

    #[test]
    fn topics_lists_declared_and_builtin() {
        let (handle, _) = setup();
        let names: Vec<String> = handle.topics().iter().map(|t| t.id.name.clone()).collect();
        assert_eq!(names, vec!["bridge.liveness", "detailedState", "heartbeat"]);
        assert!(handle.topics().iter().all(|t| t.kind == TopicKind::Event));
    }

    #[test]
    fn reconnect_replays_last_known_samples() {
        let (mut handle, transport) = connected();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let _sub = handle
            .subscribe("detailedState", move |sample: &Sample| s.borrow_mut().push(sample.get("detailedState").cloned()))
            .unwrap();
        transport.publish(handle.id(), "heartbeat", json!({}));
        transport.publish(handle.id(), "detailedState", json!({"detailedState": 2}));
        handle.drain();
        assert_eq!(handle.liveness().heartbeats(), 1);

        handle.disconnect();
        handle.connect().unwrap();
        handle.drain();
        assert_eq!(handle.state(), RemoteState::Connected);
        assert_eq!(*seen.borrow(), vec![Some(json!(2)), Some(json!(2))]);
        // the cached heartbeat is not a new beat
        assert_eq!(handle.liveness().heartbeats(), 1);
    }

    #[test]
    fn first_connect_replays_nothing() {
        let (mut handle, transport) = setup();
        transport.set_auto_connect(false);
        handle.connect().unwrap();
        let calls = Rc::new(RefCell::new(0));
        let c = calls.clone();
        let _sub = handle.subscribe("detailedState", move |_| *c.borrow_mut() += 1).unwrap();
        transport.connection_up(handle.id());
        handle.drain();
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn configured_heartbeat_schema_replaces_builtin() {
        let config = BridgeConfig::parse(
            r#"
            [[remotes]]
            name = "MTM1M3"

            [[remotes.topics]]
            name = "heartbeat"
            kind = "event"
            fields = [{ name = "heartbeat", type = "bool" }]
            "#,
        )
        .unwrap();
        let transport = Arc::new(LoopbackTransport::new());
        let mut handle = RemoteHandle::from_config(&config.remotes[0], &config, transport.clone(), NotifyWaker::new()).unwrap();
        let heartbeat = handle.topics().into_iter().find(|t| t.id.name == "heartbeat").unwrap();
        assert_eq!(heartbeat.fields, vec![FieldSpec::new("heartbeat", FieldType::Bool)]);

        // only the built-in placeholder may be replaced
        let other = TopicSpec::event(handle.id().topic("heartbeat"), Vec::new());
        assert!(matches!(handle.declare(other), Err(BridgeError::TopicRedeclared(_))));

        handle.connect().unwrap();
        handle.drain();
        transport.publish(handle.id(), "heartbeat", json!({"heartbeat": true}));
        handle.drain();
        assert_eq!(handle.liveness().heartbeats(), 1);
    }

    #[test]
    fn liveness_topic_cannot_be_declared() {
        let (mut handle, _) = setup();
        let spec = TopicSpec::event(handle.id().topic(LIVENESS_TOPIC), Vec::new());
        assert!(matches!(handle.declare(spec), Err(BridgeError::ReservedTopic(_))));
    }
}
