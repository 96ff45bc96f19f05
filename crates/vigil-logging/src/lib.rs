//! ---
//! vigil_section: "03-logging"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Structured logging adapters for gateway components."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
#![warn(missing_docs)]

use tracing::Level;
use tracing_subscriber::{fmt as subscriber_fmt, prelude::*, EnvFilter, Registry};

pub mod macros;

#[doc(hidden)]
pub use tracing;

/// Install a baseline tracing subscriber if the process has none yet.
///
/// Embedding applications normally own their subscriber; this exists for
/// tests and small tools. `RUST_LOG` directives are honoured on top of an
/// INFO default.
pub fn init() {
    let _ = Registry::default()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(subscriber_fmt::layer().with_test_writer())
        .try_init();
}

/// Structured context attached to gateway log events by the `gw_*` macros.
#[derive(Debug, Default, Clone)]
pub struct LogContext<'a> {
    /// Broker topic the event relates to.
    pub topic: Option<&'a str>,
    /// Tag or entity identifier bound to the topic.
    pub tag_id: Option<u64>,
    /// Request destination queue.
    pub destination: Option<&'a str>,
    /// Listener family (tag, supervision, connection, ...).
    pub listener: Option<&'a str>,
}

impl<'a> LogContext<'a> {
    /// Create an empty logging context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a topic name.
    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Attach a tag identifier.
    pub fn with_tag(mut self, tag_id: u64) -> Self {
        self.tag_id = Some(tag_id);
        self
    }

    /// Attach a request destination.
    pub fn with_destination(mut self, destination: &'a str) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Attach the listener family.
    pub fn with_listener(mut self, listener: &'a str) -> Self {
        self.listener = Some(listener);
        self
    }
}

/// Outcome used when emitting connection lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// The transition completed.
    Success,
    /// The transition failed or was aborted.
    Fault,
}

impl LifecycleOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            LifecycleOutcome::Success => "success",
            LifecycleOutcome::Fault => "fault",
        }
    }
}

/// Emit a standardized lifecycle event (connect, disconnect, stop, ...).
pub fn log_lifecycle_event(event: &str, message: &str, outcome: LifecycleOutcome) {
    match outcome {
        LifecycleOutcome::Success => tracing::info!(
            event,
            outcome = outcome.as_str(),
            message = %message
        ),
        LifecycleOutcome::Fault => tracing::error!(
            event,
            outcome = outcome.as_str(),
            message = %message
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macros_emit_without_panic() {
        init();
        let ctx = LogContext::new()
            .with_topic("vigil.tag.1")
            .with_tag(1)
            .with_listener("tag");
        gw_info!(context = ctx.clone(), "listener bound");
        gw_debug!("debug message");
        gw_warn!(context = ctx.clone(), "slow listener: {} ms", 250);
        gw_error!(context = ctx, "listener failed: {}", "boom");
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }

    #[test]
    fn lifecycle_helper_emits() {
        init();
        log_lifecycle_event("connection.open", "broker connected", LifecycleOutcome::Success);
        log_lifecycle_event("connection.lost", "transport failed", LifecycleOutcome::Fault);
    }
}
