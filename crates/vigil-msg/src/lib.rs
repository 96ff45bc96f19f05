//! ---
//! vigil_section: "02-messaging-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Broker interface, wire types and text codecs."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
#![warn(missing_docs)]

pub mod broker;
pub mod codec;
pub mod logging;
pub mod memory;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by broker implementations and the codec.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessagingError {
    /// The broker connection is not open.
    #[error("broker connection is not open")]
    NotConnected,
    /// The transport reported a failure (connection refused, send failed, ...).
    #[error("transport failure: {0}")]
    Transport(String),
    /// The destination name is empty or otherwise unusable.
    #[error("unknown destination `{0}`")]
    UnknownDestination(String),
    /// A JSON payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Json(String),
    /// A reply payload did not have the expected shape.
    #[error("malformed reply: {0}")]
    MalformedReply(String),
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        MessagingError::Json(err.to_string())
    }
}

pub use broker::{
    ensure_destination, Broker, Delivery, Destination, EphemeralAddress, FailureHandler,
    PublishOptions, SubscriptionId, TopicStream,
};
pub use codec::{
    classify_reply, decode, decode_batch, encode, encode_error, encode_progress, ReplyFrame,
};
pub use logging::{log_message, MessageDirection};
pub use memory::{InMemoryBroker, QueueConsumer, QueuedMessage, EPHEMERAL_PREFIX};
pub use types::{
    AlarmValue, BroadcastMessage, BroadcastMessageType, Envelope, ErrorReport, Heartbeat,
    ProgressReport, ReportEnvelope,
    SupervisionEntity, SupervisionEvent, SupervisionStatus, TagQuality, TagValueUpdate,
    TopicRegistration,
};
