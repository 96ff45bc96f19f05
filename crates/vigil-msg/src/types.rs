//! ---
//! vigil_section: "02-messaging-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Broker interface, wire types and text codecs."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Schema version carried by every request envelope.
pub const SCHEMA_VERSION: u16 = 1;

/// Envelope wrapping a request on its way to a server queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Unique identifier for tracing a request through the server.
    pub id: Uuid,
    /// Version of the schema used by the payload.
    pub schema_version: u16,
    /// Timestamp when the envelope was created.
    pub timestamp: DateTime<Utc>,
    /// The request itself.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wrap `payload` in a fresh envelope.
    pub fn new(payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Where a tag listener receives its updates from: a broker topic plus the
/// entity id whose updates it wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicRegistration {
    /// Broker topic carrying the updates.
    pub topic: String,
    /// Tag identifier the listener is interested in.
    pub id: u64,
}

impl TopicRegistration {
    /// Construct a registration descriptor.
    pub fn new(topic: impl Into<String>, id: u64) -> Self {
        Self {
            topic: topic.into(),
            id,
        }
    }

    /// A descriptor without a usable topic name cannot be subscribed.
    pub fn is_valid(&self) -> bool {
        !self.topic.trim().is_empty()
    }
}

/// Quality attached to a tag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagQuality {
    /// Value is valid.
    #[default]
    Ok,
    /// Value was flagged invalid by the acquisition layer.
    Invalid,
    /// No value has been received yet.
    Uninitialised,
    /// The source equipment cannot be reached.
    Inaccessible,
}

/// Value update published for one tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagValueUpdate {
    /// Tag identifier.
    pub tag_id: u64,
    /// Current value.
    pub value: JsonValue,
    /// Quality of the value.
    #[serde(default)]
    pub quality: TagQuality,
    /// Timestamp set by the data source, if any.
    #[serde(default)]
    pub source_timestamp: Option<DateTime<Utc>>,
    /// Timestamp set by the server when the update was published.
    pub server_timestamp: DateTime<Utc>,
    /// Free text attached by the server.
    #[serde(default)]
    pub description: String,
}

impl TagValueUpdate {
    /// Construct an update with OK quality and the current server time.
    pub fn new(tag_id: u64, value: JsonValue) -> Self {
        Self {
            tag_id,
            value,
            quality: TagQuality::Ok,
            source_timestamp: None,
            server_timestamp: Utc::now(),
            description: String::new(),
        }
    }
}

/// Kind of entity a supervision event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionEntity {
    /// A data acquisition process.
    Process,
    /// A piece of equipment attached to a process.
    Equipment,
    /// A sub-equipment attached to an equipment.
    SubEquipment,
}

/// Status reported for a supervised entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionStatus {
    /// Starting up.
    StartUp,
    /// Running normally.
    Running,
    /// Running in local mode.
    RunningLocal,
    /// Stopped on request.
    Stopped,
    /// Not responding.
    Down,
    /// Status cannot be determined.
    Uncertain,
}

/// Status change notification for a supervised entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionEvent {
    /// Entity kind.
    pub entity: SupervisionEntity,
    /// Entity identifier.
    pub entity_id: u64,
    /// New status.
    pub status: SupervisionStatus,
    /// When the status changed.
    pub timestamp: DateTime<Utc>,
    /// Human readable explanation.
    #[serde(default)]
    pub message: String,
}

impl SupervisionEvent {
    /// Construct an event stamped with the current time.
    pub fn new(
        entity: SupervisionEntity,
        entity_id: u64,
        status: SupervisionStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            entity,
            entity_id,
            status,
            timestamp: Utc::now(),
            message: message.into(),
        }
    }
}

/// Periodic liveness signal published by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Host the server runs on.
    pub host_name: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl Heartbeat {
    /// Construct a heartbeat stamped with the current time.
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Severity of an operator broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastMessageType {
    /// Informational notice.
    Info,
    /// Something operators should look at.
    Warn,
    /// A server side failure.
    Error,
}

/// Administrative message sent to every connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    /// Severity.
    pub message_type: BroadcastMessageType,
    /// Who sent it.
    pub sender: String,
    /// Free text for operators.
    pub message: String,
    /// When it was sent.
    pub timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    /// Construct a broadcast stamped with the current time.
    pub fn new(
        message_type: BroadcastMessageType,
        sender: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            sender: sender.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Alarm state change published on the alarm topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmValue {
    /// Alarm identifier.
    pub alarm_id: u64,
    /// Tag the alarm is attached to.
    pub tag_id: u64,
    /// Fault family (first part of the alarm triplet).
    pub fault_family: String,
    /// Fault member (second part of the alarm triplet).
    pub fault_member: String,
    /// Fault code (third part of the alarm triplet).
    pub fault_code: i32,
    /// Whether the alarm is currently raised.
    pub active: bool,
    /// When the alarm changed state.
    pub timestamp: DateTime<Utc>,
    /// Additional information from the alarm source.
    #[serde(default)]
    pub info: Option<String>,
}

/// Intermediate status of a long-running server operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    /// Operation currently executing (1-based).
    pub current_operation: u32,
    /// Number of operations in the request.
    pub total_operations: u32,
    /// Part of the current operation executing (1-based).
    #[serde(default)]
    pub current_part: u32,
    /// Number of parts in the current operation.
    #[serde(default)]
    pub total_parts: u32,
    /// What the server is doing.
    #[serde(default)]
    pub description: String,
}

/// Terminal failure reported by the server for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Server supplied error text.
    pub error_message: String,
}

/// Report element as it appears inside a reply array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "report_type", rename_all = "snake_case")]
pub enum ReportEnvelope {
    /// Intermediate progress.
    Progress(ProgressReport),
    /// Terminal error.
    Error(ErrorReport),
}
