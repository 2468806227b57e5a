use std::time::Duration;

use serde::Deserialize;

use salbridge_api::{FieldSpec, IngressConfig, RemoteId, TopicKind, TopicSpec};

use crate::error::BridgeError;

/// Root configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub liveness: LivenessConfig,

    #[serde(default)]
    pub commands: CommandConfig,

    /// Remote component definitions.
    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

/// Ingress queue bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_high_water")]
    pub high_water: usize,
}

fn default_capacity() -> usize {
    4096
}
fn default_high_water() -> usize {
    3072
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            high_water: default_high_water(),
        }
    }
}

impl DispatchConfig {
    pub fn ingress(&self) -> IngressConfig {
        IngressConfig {
            capacity: self.capacity,
            high_water: self.high_water,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_heartbeat_topic")]
    pub heartbeat_topic: String,
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,
    /// Consecutive missed heartbeats before the remote turns stale.
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_skew_warning_ms")]
    pub skew_warning_ms: u64,
    #[serde(default = "default_skew_error_ms")]
    pub skew_error_ms: u64,
}

fn default_heartbeat_topic() -> String {
    "heartbeat".into()
}
fn default_heartbeat_period_ms() -> u64 {
    1000
}
fn default_missed_heartbeats() -> u32 {
    3
}
fn default_skew_warning_ms() -> u64 {
    10
}
fn default_skew_error_ms() -> u64 {
    500
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_topic: default_heartbeat_topic(),
            heartbeat_period_ms: default_heartbeat_period_ms(),
            missed_heartbeats: default_missed_heartbeats(),
            skew_warning_ms: default_skew_warning_ms(),
            skew_error_ms: default_skew_error_ms(),
        }
    }
}

impl LivenessConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    /// `missed_heartbeats × heartbeat_period`.
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_period() * self.missed_heartbeats
    }

    pub fn skew_warning(&self) -> Duration {
        Duration::from_millis(self.skew_warning_ms)
    }

    pub fn skew_error(&self) -> Duration {
        Duration::from_millis(self.skew_error_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How many resolved correlation ids are remembered to classify late acknowledgments.
    #[serde(default = "default_recent_resolved")]
    pub recent_resolved: usize,
}

fn default_timeout_ms() -> u64 {
    10_000
}
fn default_recent_resolved() -> usize {
    256
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            recent_resolved: default_recent_resolved(),
        }
    }
}

impl CommandConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub name: String,
    #[serde(default)]
    pub index: Option<u32>,
    /// The component is indexed (several instances), `index` is mandatory.
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub kind: TopicKind,
    /// Overrides the kind's default (events priority, telemetry not).
    #[serde(default)]
    pub priority: Option<bool>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl RemoteConfig {
    pub fn remote_id(&self) -> Result<RemoteId, BridgeError> {
        match (self.indexed, self.index) {
            (true, None) => Err(BridgeError::Config(format!(
                "remote '{}' is indexed, but index wasn't provided",
                self.name
            ))),
            (_, Some(index)) => Ok(RemoteId::indexed(self.name.clone(), index)),
            (false, None) => Ok(RemoteId::new(self.name.clone())),
        }
    }

    /// Topic declarations for this remote.
    pub fn topic_specs(&self) -> Result<Vec<TopicSpec>, BridgeError> {
        let remote = self.remote_id()?;
        Ok(self
            .topics
            .iter()
            .map(|t| {
                let id = remote.topic(t.name.clone());
                let spec = match t.kind {
                    TopicKind::Telemetry => TopicSpec::telemetry(id, t.fields.clone()),
                    TopicKind::Event => TopicSpec::event(id, t.fields.clone()),
                };
                match t.priority {
                    Some(priority) => spec.with_priority(priority),
                    None => spec,
                }
            })
            .collect())
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, BridgeError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| BridgeError::Config(format!("{path}: {e}")))?;
        Self::parse(&content).map_err(|e| e.with_context(path))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, BridgeError> {
        let config: BridgeConfig =
            toml::from_str(toml_str).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.dispatch.capacity == 0 {
            return Err(BridgeError::Config("dispatch.capacity must be positive".into()));
        }
        if self.dispatch.high_water > self.dispatch.capacity {
            return Err(BridgeError::Config(format!(
                "dispatch.high_water ({}) exceeds dispatch.capacity ({})",
                self.dispatch.high_water, self.dispatch.capacity
            )));
        }
        if self.liveness.missed_heartbeats == 0 || self.liveness.heartbeat_period_ms == 0 {
            return Err(BridgeError::Config(
                "liveness.heartbeat_period_ms and liveness.missed_heartbeats must be positive".into(),
            ));
        }
        for remote in &self.remotes {
            remote.remote_id()?;
        }
        Ok(())
    }
}
