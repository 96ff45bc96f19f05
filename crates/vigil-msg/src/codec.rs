//! ---
//! vigil_section: "02-messaging-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Broker interface, wire types and text codecs."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! JSON text codec for payloads exchanged with the server.
//!
//! Reply channels carry JSON arrays. The first element decides what the
//! message is: a `report_type: "progress"` object is an intermediate
//! report, `report_type: "error"` is a terminal failure and anything else
//! (including an empty array) is the terminal result collection.
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::types::{ErrorReport, ProgressReport, ReportEnvelope};
use crate::{MessagingError, Result};

/// Encode a value to its text payload.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a text payload.
pub fn decode<T: DeserializeOwned>(payload: &str) -> Result<T> {
    Ok(serde_json::from_str(payload)?)
}

/// Decode a payload that is either a JSON array of `T` or a single `T`.
pub fn decode_batch<T: DeserializeOwned>(payload: &str) -> Result<Vec<T>> {
    let value: JsonValue = serde_json::from_str(payload)?;
    match value {
        JsonValue::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(MessagingError::from))
            .collect(),
        single => Ok(vec![serde_json::from_value(single)?]),
    }
}

/// One classified message from a reply channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyFrame {
    /// Intermediate progress, more messages follow.
    Progress(ProgressReport),
    /// Terminal failure reported by the server.
    Error(ErrorReport),
    /// Terminal result collection, still undecoded.
    Result(JsonValue),
}

impl ReplyFrame {
    /// Whether this frame ends the reply stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplyFrame::Progress(_))
    }

    /// Decode a result frame into its typed collection.
    pub fn into_results<T: DeserializeOwned>(self) -> Result<Vec<T>> {
        match self {
            ReplyFrame::Result(value) => Ok(serde_json::from_value(value)?),
            other => Err(MessagingError::MalformedReply(format!(
                "expected result collection, found {}",
                other.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ReplyFrame::Progress(_) => "progress report",
            ReplyFrame::Error(_) => "error report",
            ReplyFrame::Result(_) => "result",
        }
    }
}

/// Classify a reply payload by its shape.
pub fn classify_reply(payload: &str) -> Result<ReplyFrame> {
    let value: JsonValue = serde_json::from_str(payload)?;
    let JsonValue::Array(items) = &value else {
        return Err(MessagingError::MalformedReply(
            "reply payload is not a JSON array".into(),
        ));
    };

    let report_type = items
        .first()
        .and_then(|first| first.get("report_type"))
        .and_then(JsonValue::as_str);
    if !matches!(report_type, Some("progress" | "error")) {
        return Ok(ReplyFrame::Result(value));
    }

    let first = items[0].clone();
    match serde_json::from_value::<ReportEnvelope>(first) {
        Ok(ReportEnvelope::Progress(report)) => Ok(ReplyFrame::Progress(report)),
        Ok(ReportEnvelope::Error(report)) => Ok(ReplyFrame::Error(report)),
        Err(err) => Err(MessagingError::MalformedReply(format!(
            "unreadable report: {err}"
        ))),
    }
}

/// Encode a progress report as a reply payload.
pub fn encode_progress(report: &ProgressReport) -> Result<String> {
    encode(&[ReportEnvelope::Progress(report.clone())])
}

/// Encode an error report as a reply payload.
pub fn encode_error(message: impl Into<String>) -> Result<String> {
    encode(&[ReportEnvelope::Error(ErrorReport {
        error_message: message.into(),
    })])
}
