use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Remote component address: SAL component name plus optional index
/// (`MTM1M3`, `MTVMS:1`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteId {
    pub name: String,
    #[serde(default)]
    pub index: Option<u32>,
}

impl RemoteId {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), index: None }
    }

    pub fn indexed(name: impl Into<String>, index: u32) -> Self {
        Self { name: name.into(), index: Some(index) }
    }

    /// Topic on this remote.
    pub fn topic(&self, name: impl Into<String>) -> TopicId {
        TopicId { remote: self.clone(), name: name.into() }
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "{}:{index}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Topic address: remote component + topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId {
    pub remote: RemoteId,
    pub name: String,
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote, self.name)
    }
}

/// Identifier correlating a command with its acknowledgment stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

static NEXT_CORRELATION: AtomicU64 = AtomicU64::new(1);

impl CorrelationId {
    /// Allocate the next process-wide unique id.
    pub fn next() -> Self {
        Self(NEXT_CORRELATION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
