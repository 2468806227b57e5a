use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::id::TopicId;

/// Field name → value map of one sample.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Immutable telemetry/event sample.
///
/// Built on the middleware side, shared with every subscriber behind an
/// `Arc`. Subscribers only ever see `&Sample`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub topic: TopicId,
    /// Sequence number assigned by the source, monotonically increasing per topic.
    pub seq: u64,
    /// Capture time on the controller clock.
    pub captured: SystemTime,
    /// Local time the middleware handed the sample over.
    pub received: SystemTime,
    pub priority: bool,
    pub fields: Fields,
}

impl Sample {
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.fields.get(field).and_then(serde_json::Value::as_f64)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(serde_json::Value::as_str)
    }

    /// Signed `received − captured` in seconds.
    pub fn transit_skew(&self) -> f64 {
        match self.received.duration_since(self.captured) {
            Ok(d) => d.as_secs_f64(),
            Err(e) => -e.duration().as_secs_f64(),
        }
    }
}

/// Sample as handed over by a transport binding, before the bridge
/// stamps topic, priority and receive time.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub seq: u64,
    pub captured: SystemTime,
    pub fields: Fields,
}

impl RawSample {
    pub fn new(seq: u64, captured: SystemTime, fields: Fields) -> Self {
        Self { seq, captured, fields }
    }

    /// Build from a JSON object; non-object values yield an empty field map.
    pub fn from_json(seq: u64, captured: SystemTime, value: serde_json::Value) -> Self {
        let fields = match value {
            serde_json::Value::Object(map) => map,
            _ => Fields::new(),
        };
        Self { seq, captured, fields }
    }
}

/// Convert a SAL style float timestamp (seconds since the Unix epoch) into `SystemTime`.
pub fn from_unix_secs(secs: f64) -> SystemTime {
    if secs.is_finite() && secs >= 0.0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs_f64(secs)
    } else {
        SystemTime::UNIX_EPOCH
    }
}
