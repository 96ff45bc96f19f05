//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;
use vigil_msg::MessagingError;

/// Shared result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced to gateway callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A registration or request argument is unusable.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
    /// `replace_listener` was given a listener that is not bound anywhere.
    #[error("listener is not registered")]
    ListenerNotRegistered,
    /// The operation needs an open broker connection.
    #[error("gateway is not connected to the broker")]
    NotConnected,
    /// The gateway has been stopped.
    #[error("gateway has been shut down")]
    Shutdown,
    /// The broker rejected an operation.
    #[error("transport failure: {0}")]
    Transport(#[from] MessagingError),
    /// No usable reply arrived before the deadline.
    #[error(
        "no reply from `{destination}` within {timeout:?} ({undecodable_replies} undecodable replies)"
    )]
    RequestTimeout {
        /// Queue the request was sent to.
        destination: String,
        /// Timeout that elapsed.
        timeout: Duration,
        /// Replies that arrived but could not be decoded.
        undecodable_replies: usize,
    },
    /// The server answered with a terminal error report.
    #[error("{message}")]
    Application {
        /// Server supplied error text, verbatim.
        message: String,
    },
    /// Configuration could not be parsed or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// Metric registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl GatewayError {
    /// Label used for the `outcome` dimension of request metrics.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            GatewayError::RequestTimeout { .. } => "timeout",
            GatewayError::Application { .. } => "application_error",
            GatewayError::Transport(_) | GatewayError::NotConnected => "transport_error",
            _ => "rejected",
        }
    }

    /// Whether the call reached the server and was refused by it.
    pub fn is_application(&self) -> bool {
        matches!(self, GatewayError::Application { .. })
    }

    /// Whether the call ran out of time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, GatewayError::RequestTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_error_displays_server_text_verbatim() {
        let err = GatewayError::Application {
            message: "error occurred".into(),
        };
        assert_eq!(err.to_string(), "error occurred");
        assert!(err.is_application());
        assert_eq!(err.outcome_label(), "application_error");
    }

    #[test]
    fn timeout_mentions_destination_and_duration() {
        let err = GatewayError::RequestTimeout {
            destination: "vigil.client.request".into(),
            timeout: Duration::from_millis(250),
            undecodable_replies: 0,
        };
        let text = err.to_string();
        assert!(text.contains("vigil.client.request"));
        assert!(text.contains("250ms"));
        assert!(err.is_timeout());
    }

    #[test]
    fn messaging_errors_convert_to_transport() {
        let err: GatewayError = MessagingError::NotConnected.into();
        assert!(matches!(err, GatewayError::Transport(_)));
        assert_eq!(err.outcome_label(), "transport_error");
    }
}
