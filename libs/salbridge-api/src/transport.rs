use crate::command::Command;
use crate::error::TransportError;
use crate::id::{CorrelationId, RemoteId};
use crate::ingress::{Ingress, SampleSink};

/// Connection state change reported by the middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Participant discovered the remote, topics can flow.
    Up,
    /// Remote lost.
    Down { reason: String },
}

/// Pub/sub middleware binding.
///
/// The bridge calls these from the UI context; implementations must not
/// block. Everything the middleware produces (samples, acknowledgments,
/// connection events) goes back through the [`Ingress`] handed over in
/// [`open`](Transport::open) and the per-topic [`SampleSink`]s, from
/// whatever thread the middleware delivers on.
pub trait Transport: Send + Sync {
    /// Start connecting to `remote`. Completion is reported as
    /// [`ConnectionEvent::Up`] through `ingress`.
    fn open(&self, remote: &RemoteId, ingress: Ingress) -> Result<(), TransportError>;

    /// Start delivering samples of `sink.topic()` into `sink`. Called once
    /// per topic per connection.
    fn subscribe(&self, remote: &RemoteId, sink: SampleSink) -> Result<(), TransportError>;

    /// Send a command. Acknowledgments carry `command.correlation`.
    fn send_command(&self, command: &Command) -> Result<(), TransportError>;

    /// Best-effort cancel notice for a pending command.
    fn cancel_command(&self, remote: &RemoteId, correlation: CorrelationId) -> Result<(), TransportError> {
        let _ = (remote, correlation);
        Err(TransportError::unsupported("cancel not supported"))
    }

    /// Drop the connection; no further deliveries are expected.
    fn close(&self, remote: &RemoteId);
}
