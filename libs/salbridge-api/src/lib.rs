//! Shared types of the SAL topic bridge: identifiers, topic declarations,
//! samples, commands and acknowledgments, the [`transport::Transport`]
//! trait a middleware binding implements, and the middleware-side
//! [`ingress::Ingress`] handle.

pub mod command;
pub mod error;
pub mod id;
pub mod ingress;
pub mod sample;
pub mod topic;
pub mod transport;

pub use command::{AckStage, Acknowledgment, Command};
pub use error::{SampleError, TransportError};
pub use id::{CorrelationId, RemoteId, TopicId};
pub use ingress::{Inbound, Ingress, IngressConfig, IngressStats, SampleSink, UiWaker};
pub use sample::{Fields, RawSample, Sample};
pub use topic::{FieldSpec, FieldType, TopicKind, TopicSpec};
pub use transport::{ConnectionEvent, Transport};
