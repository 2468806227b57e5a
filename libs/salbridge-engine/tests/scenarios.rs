use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::LocalSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use salbridge_api::{AckStage, FieldSpec, FieldType, Fields, IngressConfig, RemoteId, Sample, TopicSpec};
use salbridge_engine::{
    AckScript, CommandError, CommandRequest, CommandStatus, LoopbackTransport, NotifyWaker, RemoteHandle,
    RemoteSettings, RemoteState, UiLoop,
};

fn remote() -> RemoteId {
    RemoteId::new("MTM1M3")
}

fn handle_with(settings: RemoteSettings, waker: Arc<NotifyWaker>) -> (RemoteHandle, Arc<LoopbackTransport>) {
    let transport = Arc::new(LoopbackTransport::new());
    let mut handle = RemoteHandle::new(remote(), transport.clone(), waker, settings);
    handle
        .declare(TopicSpec::telemetry(
            remote().topic("forceActuatorData"),
            vec![FieldSpec::new("zForce", FieldType::Array)],
        ))
        .unwrap();
    handle
        .declare(TopicSpec::event(
            remote().topic("forceActuatorWarning"),
            vec![FieldSpec::new("anyWarning", FieldType::Bool)],
        ))
        .unwrap();
    (handle, transport)
}

fn connected(settings: RemoteSettings) -> (RemoteHandle, Arc<LoopbackTransport>) {
    let (mut handle, transport) = handle_with(settings, NotifyWaker::new());
    handle.connect().unwrap();
    handle.drain();
    assert_eq!(handle.state(), RemoteState::Connected);
    (handle, transport)
}

fn seq_recorder(handle: &mut RemoteHandle, topic: &str) -> (Rc<RefCell<Vec<u64>>>, salbridge_engine::Subscription) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let s = seen.clone();
    let sub = handle
        .subscribe(topic, move |sample: &Sample| s.borrow_mut().push(sample.seq))
        .unwrap();
    (seen, sub)
}

#[tokio::test(start_paused = true)]
async fn samples_of_one_topic_arrive_in_publish_order() {
    let (mut handle, transport) = connected(RemoteSettings::default());
    let (seen, _sub) = seq_recorder(&mut handle, "forceActuatorData");

    for _ in 0..3 {
        assert!(transport.publish(&remote(), "forceActuatorData", json!({"zForce": [1.0, 2.0]})));
    }
    handle.drain();
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn late_subscriber_gets_last_sample_first() {
    let (mut handle, transport) = connected(RemoteSettings::default());
    let (_early, _sub) = seq_recorder(&mut handle, "forceActuatorData");
    transport.publish(&remote(), "forceActuatorData", json!({"zForce": []}));
    transport.publish(&remote(), "forceActuatorData", json!({"zForce": []}));
    handle.drain();

    let (late, _late_sub) = seq_recorder(&mut handle, "forceActuatorData");
    transport.publish(&remote(), "forceActuatorData", json!({"zForce": []}));
    handle.drain();
    assert_eq!(*late.borrow(), vec![2, 3]);
}

#[tokio::test(start_paused = true)]
async fn overload_coalesces_telemetry_but_keeps_every_event() {
    let settings = RemoteSettings {
        ingress: IngressConfig { capacity: 8, high_water: 4 },
        ..Default::default()
    };
    let (mut handle, transport) = connected(settings);
    let (forces, _f) = seq_recorder(&mut handle, "forceActuatorData");
    let (warnings, _w) = seq_recorder(&mut handle, "forceActuatorWarning");

    for i in 0..100 {
        transport.publish(&remote(), "forceActuatorData", json!({"zForce": [i]}));
        if i % 10 == 0 {
            transport.publish(&remote(), "forceActuatorWarning", json!({"anyWarning": true}));
        }
    }
    handle.drain();

    assert_eq!(*warnings.borrow(), (1..=10).collect::<Vec<u64>>());
    let forces = forces.borrow();
    assert!(forces.windows(2).all(|w| w[0] < w[1]), "reordered: {forces:?}");
    assert_eq!(forces.last(), Some(&100));
    assert!(forces.len() < 100);
    assert!(handle.stats().dispatch.ingress.coalesced > 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_command_times_out_exactly_once_at_deadline() {
    let (mut handle, transport) = connected(RemoteSettings::default());
    transport.script("MOVE", AckScript::Silent);

    let resolutions = Rc::new(Cell::new(0));
    let r = resolutions.clone();
    let command = handle.issue_with(
        CommandRequest::new("MOVE")
            .timeout(Duration::from_secs(2))
            .on_complete(move |_| r.set(r.get() + 1)),
    );

    sleep(Duration::from_millis(1999)).await;
    handle.drain();
    handle.tick(Instant::now());
    assert_eq!(command.status(), CommandStatus::Pending);

    sleep(Duration::from_millis(2)).await;
    handle.drain();
    handle.tick(Instant::now());
    assert_eq!(command.result(), Some(Err(CommandError::Timeout)));

    // a late acknowledgment changes nothing
    transport.acknowledge(&remote(), command.correlation(), AckStage::Complete);
    sleep(Duration::from_secs(5)).await;
    handle.drain();
    handle.tick(Instant::now());
    assert_eq!(resolutions.get(), 1);
    assert_eq!(command.result(), Some(Err(CommandError::Timeout)));
    assert_eq!(handle.stats().commands.unmatched_acks, 1);
}

#[tokio::test(start_paused = true)]
async fn busy_command_is_rejected_without_reaching_the_transport() {
    let (mut handle, transport) = connected(RemoteSettings::default());
    transport.script("raiseM1M3", AckScript::Silent);

    let first = handle.issue("raiseM1M3", Fields::new());
    let second = handle.issue("raiseM1M3", Fields::new());
    assert_eq!(second.result(), Some(Err(CommandError::Busy("raiseM1M3".into()))));
    assert!(second.result().is_some_and(|r| r.unwrap_err().is_rejection()));
    assert_eq!(transport.sent_commands().len(), 1);
    assert!(!first.is_resolved());
}

#[tokio::test(start_paused = true)]
async fn disconnect_fails_pending_and_discards_late_acks() {
    let (mut handle, transport) = connected(RemoteSettings::default());
    transport.script("raiseM1M3", AckScript::Silent);
    transport.script("enableHardpointChase", AckScript::Steps(vec![AckStage::Ack]));
    let raise = handle.issue("raiseM1M3", Fields::new());
    let chase = handle.issue("enableHardpointChase", Fields::new());
    handle.drain();
    assert_eq!(chase.status(), CommandStatus::Accepted);

    handle.disconnect();
    assert_eq!(handle.state(), RemoteState::Disconnected);
    assert_eq!(raise.result(), Some(Err(CommandError::Disconnected)));
    assert_eq!(chase.result(), Some(Err(CommandError::Disconnected)));

    // the old session is closed, acknowledgments can't reach the handle
    assert!(!transport.acknowledge(&remote(), raise.correlation(), AckStage::Complete));
    handle.drain();
    assert_eq!(raise.result(), Some(Err(CommandError::Disconnected)));
}

#[tokio::test(start_paused = true)]
async fn missed_heartbeats_turn_remote_stale_until_next_heartbeat() {
    let (mut handle, transport) = connected(RemoteSettings::default());
    transport.script("raiseM1M3", AckScript::Silent);
    assert!(transport.publish(&remote(), "heartbeat", json!({})));
    handle.drain();
    let pending = handle.issue("raiseM1M3", Fields::new());

    sleep(Duration::from_millis(3000)).await;
    handle.tick(Instant::now());
    assert_eq!(handle.state(), RemoteState::Connected);

    sleep(Duration::from_millis(100)).await;
    handle.tick(Instant::now());
    assert_eq!(handle.state(), RemoteState::Stale);
    assert_eq!(pending.result(), Some(Err(CommandError::Disconnected)));
    assert_eq!(
        handle.issue("raiseM1M3", Fields::new()).result(),
        Some(Err(CommandError::Disconnected))
    );

    transport.publish(&remote(), "heartbeat", json!({}));
    handle.drain();
    assert_eq!(handle.state(), RemoteState::Connected);
    assert_eq!(handle.liveness().heartbeats(), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_subscriptions_and_replays_last_known() {
    let (mut handle, transport) = connected(RemoteSettings::default());
    let (seen, _sub) = seq_recorder(&mut handle, "forceActuatorWarning");
    let warnings = Rc::new(RefCell::new(Vec::new()));
    let w = warnings.clone();
    let _values = handle
        .subscribe("forceActuatorWarning", move |sample: &Sample| w.borrow_mut().push(sample.get("anyWarning").cloned()))
        .unwrap();
    transport.publish(&remote(), "forceActuatorWarning", json!({"anyWarning": false}));
    handle.drain();

    handle.disconnect();
    handle.connect().unwrap();
    handle.drain();
    assert!(transport.subscriptions(&remote()).contains(&"forceActuatorWarning".to_string()));
    assert_eq!(*seen.borrow(), vec![1, 1]);

    // the new session numbers its samples from 1 again
    transport.publish(&remote(), "forceActuatorWarning", json!({"anyWarning": true}));
    handle.drain();
    assert_eq!(*seen.borrow(), vec![1, 1, 1]);
    assert_eq!(*warnings.borrow(), vec![Some(json!(false)), Some(json!(false)), Some(json!(true))]);

    assert_eq!(handle.reemit(), 2);
    assert_eq!(*seen.borrow(), vec![1, 1, 1, 1]);
}

#[tokio::test(start_paused = true)]
async fn ui_loop_drains_on_wake_and_shuts_down() {
    LocalSet::new()
        .run_until(async {
            let mut ui = UiLoop::new(Duration::from_millis(100));
            let (handle, transport) = handle_with(RemoteSettings::default(), ui.waker());
            let handle = Rc::new(RefCell::new(handle));
            ui.add(handle.clone());
            handle.borrow_mut().connect().unwrap();

            let ui = Rc::new(ui);
            let token = CancellationToken::new();
            let runner = {
                let ui = ui.clone();
                let token = token.clone();
                tokio::task::spawn_local(async move { ui.run(token).await })
            };

            sleep(Duration::from_millis(10)).await;
            assert_eq!(handle.borrow().state(), RemoteState::Connected);

            let (seen, _sub) = seq_recorder(&mut handle.borrow_mut(), "forceActuatorWarning");
            transport.publish(&remote(), "forceActuatorWarning", json!({"anyWarning": true}));
            sleep(Duration::from_millis(10)).await;
            assert_eq!(*seen.borrow(), vec![1]);

            sleep(Duration::from_millis(3200)).await;
            assert_eq!(handle.borrow().state(), RemoteState::Stale);

            token.cancel();
            runner.await.unwrap();
            assert_eq!(handle.borrow().state(), RemoteState::Disconnected);
            assert!(!transport.publish(&remote(), "forceActuatorWarning", json!({"anyWarning": true})));
        })
        .await;
}
