//! UI-side half of the SAL topic bridge.
//!
//! A [`RemoteHandle`] per remote component owns its subscription registry,
//! dispatcher, command sequencer and liveness monitor. A [`UiLoop`] drains
//! and ticks the handles on the UI context.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod group;
pub mod liveness;
pub mod loopback;
pub mod registry;
pub mod remote;
pub mod sequencer;
pub mod ui_loop;

pub use config::BridgeConfig;
pub use error::{BridgeError, CommandError};
pub use gate::FieldGate;
pub use group::{GroupHandle, issue_group};
pub use liveness::{LivenessMonitor, SkewLevel};
pub use loopback::{AckScript, LoopbackTransport};
pub use registry::{Subscription, TopicRegistry};
pub use remote::{LIVENESS_TOPIC, RemoteHandle, RemoteSettings, RemoteState, RemoteStats};
pub use sequencer::{CommandHandle, CommandRequest, CommandResult, CommandStatus};
pub use ui_loop::{NotifyWaker, UiLoop};
