use salbridge_api::{RemoteId, TransportError};

use crate::remote::RemoteState;

/// Synchronous bridge API errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("config error: {0}")]
    Config(String),

    #[error("remote {remote} is disconnected, subscription to '{topic}' rejected")]
    SubscriptionOnDisconnectedRemote { remote: RemoteId, topic: String },

    #[error("topic not declared: {0}")]
    UnknownTopic(String),

    #[error("topic '{0}' already declared with a different schema")]
    TopicRedeclared(String),

    #[error("topic '{0}' is reserved by the bridge and cannot be declared")]
    ReservedTopic(String),

    #[error("topic '{topic}' does not belong to remote {remote}")]
    ForeignTopic { remote: RemoteId, topic: String },

    #[error("remote {remote}: cannot go from {from:?} to {to:?}")]
    InvalidTransition { remote: RemoteId, from: RemoteState, to: RemoteState },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Add context to the error.
    ///
    /// For `Transport` variant, context is added to the inner `TransportError`.
    /// For message variants, context is prepended to the message.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            BridgeError::Transport(e) => BridgeError::Transport(e.with_context(ctx)),
            BridgeError::Config(msg) => BridgeError::Config(format!("{ctx}: {msg}")),
            BridgeError::UnknownTopic(msg) => BridgeError::UnknownTopic(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

/// Terminal failure of a command. Every command-path error ends up here,
/// as the resolution of the command's handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Remote not connected at issue time, or lost while pending.
    #[error("remote disconnected")]
    Disconnected,

    #[error("no terminal acknowledgment before the deadline")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    /// A command of the same name is still pending on this remote.
    #[error("command '{0}' is already pending")]
    Busy(String),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("failed: {0}")]
    Failed(String),

    #[error("transport: {0}")]
    Transport(String),
}

impl CommandError {
    /// `REJECTED` resolutions (never executed) as opposed to `FAILED` ones.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CommandError::Busy(_) | CommandError::Rejected(_))
    }
}
