use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

use salbridge_api::{AckStage, FieldSpec, FieldType, RemoteId, Sample, TopicSpec};
use salbridge_engine::{
    AckScript, BridgeConfig, CommandRequest, FieldGate, LoopbackTransport, RemoteHandle, RemoteSettings, UiLoop,
    LIVENESS_TOPIC,
};

#[derive(Parser)]
#[command(name = "salbridge-sim", about = "Drive the topic bridge against a simulated M1M3 controller")]
struct Cli {
    /// Path to TOML configuration file. Built-in M1M3 topics when omitted.
    #[arg(long, env = "SALBRIDGE_CONFIG")]
    config: Option<String>,

    /// Stop after this many seconds.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Telemetry rate of the simulated controller.
    #[arg(long, default_value_t = 50)]
    rate_hz: u32,

    /// Stop heartbeats after this many seconds, to watch the remote go stale.
    #[arg(long)]
    heartbeat_secs: Option<u64>,
}

fn builtin_handle(config: &BridgeConfig, transport: Arc<LoopbackTransport>, ui: &UiLoop) -> RemoteHandle {
    let remote = RemoteId::new("MTM1M3");
    let mut handle = RemoteHandle::new(remote.clone(), transport, ui.waker(), RemoteSettings::from(config));
    let specs = [
        TopicSpec::telemetry(
            remote.topic("forceActuatorData"),
            vec![FieldSpec::new("zForce", FieldType::Array)],
        ),
        TopicSpec::event(
            remote.topic("detailedState"),
            vec![FieldSpec::new("detailedState", FieldType::Int)],
        ),
    ];
    for spec in specs {
        if let Err(e) = handle.declare(spec) {
            tracing::warn!(error = %e, "topic declaration failed");
        }
    }
    handle
}

/// Simulated controller, on its own thread like a middleware listener.
fn spawn_controller(
    transport: Arc<LoopbackTransport>,
    remote: RemoteId,
    rate_hz: u32,
    heartbeat_for: Option<Duration>,
    token: CancellationToken,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let period = Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1)));
        let started = std::time::Instant::now();
        let mut last_heartbeat = None::<std::time::Instant>;
        let mut tick: u64 = 0;

        while !token.is_cancelled() {
            let now = std::time::Instant::now();
            let beating = heartbeat_for.is_none_or(|limit| now.duration_since(started) < limit);
            if beating && last_heartbeat.is_none_or(|t| now.duration_since(t) >= Duration::from_secs(1)) {
                transport.publish(&remote, "heartbeat", json!({}));
                last_heartbeat = Some(now);
            }
            let phase = tick as f64 * period.as_secs_f64();
            let forces: Vec<f64> = (0..156).map(|i| 1000.0 + 50.0 * (phase + i as f64 * 0.1).sin()).collect();
            transport.publish(&remote, "forceActuatorData", json!({ "zForce": forces }));
            if tick % u64::from(rate_hz.max(1) * 2) == 0 {
                transport.publish(&remote, "detailedState", json!({ "detailedState": (tick / 100) % 4 }));
            }
            tick += 1;
            std::thread::sleep(period);
        }
        tracing::info!(samples = tick, "simulated controller stopped");
    })
}

fn attach_views(handle: &mut RemoteHandle) -> Vec<salbridge_engine::Subscription> {
    let mut subscriptions = Vec::new();

    let views: [(&str, Box<dyn FnMut(&Sample)>); 2] = [
        (
            "forceActuatorData",
            Box::new(|sample: &Sample| {
                if sample.seq % 250 == 0 {
                    let mean = sample
                        .get("zForce")
                        .and_then(|v| v.as_array())
                        .map(|a| a.iter().filter_map(|x| x.as_f64()).sum::<f64>() / a.len().max(1) as f64);
                    tracing::info!(seq = sample.seq, ?mean, "force actuator data");
                }
            }),
        ),
        (
            LIVENESS_TOPIC,
            Box::new(|sample: &Sample| {
                tracing::info!(
                    state = sample.get_str("state").unwrap_or("?"),
                    since_last_heartbeat_ms = ?sample.get("since_last_heartbeat_ms"),
                    "liveness"
                );
            }),
        ),
    ];
    for (topic, view) in views {
        match handle.subscribe(topic, view) {
            Ok(sub) => subscriptions.push(sub),
            Err(e) => tracing::warn!(topic, error = %e, "subscription failed"),
        }
    }

    let gate = FieldGate::new("detailedState", vec![json!(1), json!(2)]);
    gate.on_change(|enabled| tracing::info!(enabled, "raise button"));
    match handle.subscribe("detailedState", gate.callback()) {
        Ok(sub) => subscriptions.push(sub),
        Err(e) => tracing::warn!(error = %e, "gate subscription failed"),
    }
    subscriptions
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            tracing::info!(config = %path, "loading configuration");
            match BridgeConfig::load(path) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, "failed to load config");
                    std::process::exit(1);
                }
            }
        }
        None => BridgeConfig::default(),
    };

    let transport = Arc::new(LoopbackTransport::new());
    transport.script(
        "raiseM1M3",
        AckScript::Steps(vec![
            AckStage::Ack,
            AckStage::InProgress { percent: Some(50.0), duration: Some(Duration::from_secs(2)) },
            AckStage::Complete,
        ]),
    );

    let mut ui = UiLoop::new(Duration::from_millis(100));
    let mut handles = Vec::new();
    if config.remotes.is_empty() {
        handles.push(builtin_handle(&config, transport.clone(), &ui));
    }
    for remote in &config.remotes {
        match RemoteHandle::from_config(remote, &config, transport.clone(), ui.waker()) {
            Ok(h) => handles.push(h),
            Err(e) => {
                tracing::error!(remote = %remote.name, error = %e, "invalid remote");
                std::process::exit(1);
            }
        }
    }

    let token = CancellationToken::new();
    let mut controllers = Vec::new();
    let mut subscriptions = Vec::new();
    for mut handle in handles {
        if let Err(e) = handle.connect() {
            tracing::error!(remote = %handle.id(), error = %e, "connect failed");
            continue;
        }
        subscriptions.extend(attach_views(&mut handle));
        controllers.push(spawn_controller(
            transport.clone(),
            handle.id().clone(),
            cli.rate_hz,
            cli.heartbeat_secs.map(Duration::from_secs),
            token.child_token(),
        ));
        ui.add(Rc::new(RefCell::new(handle)));
    }

    let ui = Rc::new(ui);
    let local = LocalSet::new();
    local
        .run_until(async {
            let runner = tokio::task::spawn_local({
                let ui = ui.clone();
                let token = token.clone();
                async move { ui.run(token).await }
            });

            // let the connection come up before commanding
            tokio::time::sleep(Duration::from_millis(500)).await;
            for remote in ui.remotes() {
                let mut command = remote.borrow_mut().issue_with(
                    CommandRequest::new("raiseM1M3")
                        .arg("bypassReferencePosition", false)
                        .on_complete(|result| tracing::info!(?result, "raiseM1M3 resolved")),
                );
                tokio::task::spawn_local(async move {
                    let result = command.wait().await;
                    tracing::info!(correlation = %command.correlation(), ?result, "raiseM1M3 awaited");
                });
            }

            tracing::info!(duration_secs = cli.duration_secs, "simulation running, press Ctrl+C to stop");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(cli.duration_secs)) => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down..."),
            }
            token.cancel();
            if let Err(e) = runner.await {
                tracing::error!(error = %e, "UI loop task failed");
            }
        })
        .await;

    for remote in ui.remotes() {
        let remote = remote.borrow();
        tracing::info!(remote = %remote.id(), stats = ?remote.stats(), "final counters");
    }
    drop(subscriptions);
    for controller in controllers {
        let _ = controller.join();
    }
}
