use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::id::{CorrelationId, RemoteId};
use crate::sample::Fields;

/// Command as forwarded to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub remote: RemoteId,
    pub name: String,
    pub args: Fields,
    pub correlation: CorrelationId,
    /// Time allowed for a terminal acknowledgment.
    pub timeout: Duration,
}

/// One step of a command's acknowledgment lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum AckStage {
    /// Accepted by the controller.
    Ack,
    /// Executing; may repeat with fresh progress hints.
    InProgress {
        #[serde(default)]
        percent: Option<f32>,
        #[serde(default)]
        duration: Option<Duration>,
    },
    Complete,
    Failed { reason: String },
    Rejected { reason: String },
}

impl AckStage {
    /// Ordering rank. Stages of one command must not decrease.
    pub fn rank(&self) -> u8 {
        match self {
            AckStage::Ack => 1,
            AckStage::InProgress { .. } => 2,
            AckStage::Complete | AckStage::Failed { .. } | AckStage::Rejected { .. } => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }
}

/// Acknowledgment update for a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgment {
    pub correlation: CorrelationId,
    pub stage: AckStage,
    pub arrived: SystemTime,
}

impl Acknowledgment {
    pub fn new(correlation: CorrelationId, stage: AckStage) -> Self {
        Self { correlation, stage, arrived: SystemTime::now() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ranks_are_monotonic_through_lifecycle() {
        let lifecycle = [
            AckStage::Ack,
            AckStage::InProgress { percent: Some(10.0), duration: None },
            AckStage::InProgress { percent: Some(80.0), duration: None },
            AckStage::Complete,
        ];
        assert!(lifecycle.windows(2).all(|w| w[0].rank() <= w[1].rank()));
        assert!(AckStage::Rejected { reason: "busy".into() }.is_terminal());
        assert!(!AckStage::Ack.is_terminal());
    }
}
