//! ---
//! vigil_section: "02-messaging-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Broker interface, wire types and text codecs."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
use tracing::debug;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message published to the broker.
    Outbound,
    /// Message received on a topic consumer.
    Inbound,
    /// Message received on an ephemeral reply address.
    Reply,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, destination: &str, payload: &str) {
    debug!(
        destination,
        bytes = payload.len(),
        direction = ?direction,
        "messaging activity"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_message_without_subscriber_is_noop() {
        log_message(MessageDirection::Outbound, "vigil.client.request", "[]");
        log_message(MessageDirection::Reply, "reply-1", "[1]");
    }
}
