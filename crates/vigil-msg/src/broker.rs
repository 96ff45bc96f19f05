//! ---
//! vigil_section: "02-messaging-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Broker interface, wire types and text codecs."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::{MessagingError, Result};

/// Identifier of one broker-level topic consumer.
pub type SubscriptionId = u64;

/// Callback invoked by a broker when the connection fails underneath it.
pub type FailureHandler = Arc<dyn Fn(MessagingError) + Send + Sync>;

/// Target of a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Point-to-point queue, one consumer receives each message.
    Queue(String),
    /// Publish/subscribe topic, every current subscriber receives each message.
    Topic(String),
}

impl Destination {
    /// Name of the queue or topic.
    pub fn name(&self) -> &str {
        match self {
            Destination::Queue(name) | Destination::Topic(name) => name,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(name) => write!(f, "queue://{name}"),
            Destination::Topic(name) => write!(f, "topic://{name}"),
        }
    }
}

/// Per-message publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Address the receiver should answer on.
    pub reply_to: Option<String>,
    /// Lifetime after which an undelivered message is discarded.
    pub time_to_live: Option<Duration>,
}

impl PublishOptions {
    /// Options carrying a reply address.
    pub fn with_reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Options carrying a message lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Text payload.
    pub payload: String,
    /// Reply address set by the publisher, if any.
    pub reply_to: Option<String>,
}

/// Broker-level topic consumer. Dropping the receiver does not unsubscribe;
/// call [`Broker::unsubscribe`] with `id`.
#[derive(Debug)]
pub struct TopicStream {
    /// Consumer identifier.
    pub id: SubscriptionId,
    /// Topic the consumer is attached to.
    pub topic: String,
    /// Messages in broker arrival order.
    pub messages: UnboundedReceiver<Delivery>,
}

/// Temporary reply destination. Closed by the broker when released or when
/// the connection drops.
#[derive(Debug)]
pub struct EphemeralAddress {
    /// Address to put in [`PublishOptions::reply_to`].
    pub address: String,
    /// Replies in arrival order.
    pub messages: UnboundedReceiver<Delivery>,
}

/// Broker collaborator consumed by the gateway.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open the connection.
    async fn connect(&self) -> Result<()>;

    /// Close the connection, dropping every consumer and ephemeral address.
    async fn close(&self) -> Result<()>;

    /// Send a text payload to a queue or topic.
    async fn publish(
        &self,
        destination: &Destination,
        payload: &str,
        options: PublishOptions,
    ) -> Result<()>;

    /// Attach a new consumer to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<TopicStream>;

    /// Detach a consumer. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    /// Allocate a reply destination.
    async fn create_ephemeral_address(&self) -> Result<EphemeralAddress>;

    /// Release a reply destination. Messages sent to it afterwards are dropped.
    fn release_ephemeral_address(&self, address: &str);

    /// Install the connection-level failure callback.
    fn set_failure_handler(&self, handler: FailureHandler);

    /// Human-readable broker name for logging/metrics.
    fn name(&self) -> &'static str;
}

/// Reject empty destination names before they reach a broker.
pub fn ensure_destination(destination: &Destination) -> Result<()> {
    if destination.name().trim().is_empty() {
        return Err(MessagingError::UnknownDestination(destination.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_display_includes_scheme() {
        assert_eq!(
            Destination::Queue("vigil.client.request".into()).to_string(),
            "queue://vigil.client.request"
        );
        assert_eq!(Destination::Topic("t".into()).name(), "t");
    }

    #[test]
    fn blank_destination_is_rejected() {
        let err = ensure_destination(&Destination::Queue(" ".into())).unwrap_err();
        assert!(matches!(err, MessagingError::UnknownDestination(_)));
    }

    #[test]
    fn publish_options_builders_compose() {
        let opts = PublishOptions::default()
            .with_reply_to("reply-1")
            .with_ttl(Duration::from_secs(4));
        assert_eq!(opts.reply_to.as_deref(), Some("reply-1"));
        assert_eq!(opts.time_to_live, Some(Duration::from_secs(4)));
    }
}
