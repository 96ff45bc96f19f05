//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! Tag value updates routed to the listeners bound to each tag id.
//!
//! Several tags may share one topic; every update is delivered only to
//! bindings whose id matches the update's `tag_id`.
use tracing::trace;
use vigil_logging::{gw_warn, LogContext};
use vigil_msg::{decode, TagValueUpdate};

use crate::listener::{guarded, ListenerKind, TagUpdateListener};
use crate::metrics::GatewayMetrics;
use crate::registry::{Binding, SubscriptionRegistry, TopicHandler};

/// Registry of tag listeners keyed by per-entity topics.
pub type TagUpdateDispatcher = SubscriptionRegistry<dyn TagUpdateListener, TagUpdateHandler>;

/// Decodes value updates and calls the listeners bound to the update's tag.
pub struct TagUpdateHandler {
    metrics: Option<GatewayMetrics>,
}

impl TagUpdateHandler {
    /// Create a handler reporting to `metrics`.
    pub fn new(metrics: Option<GatewayMetrics>) -> Self {
        Self { metrics }
    }
}

impl TopicHandler<dyn TagUpdateListener> for TagUpdateHandler {
    fn deliver(&self, topic: &str, payload: &str, bindings: &[Binding<dyn TagUpdateListener>]) {
        let update: TagValueUpdate = match decode(payload) {
            Ok(update) => update,
            Err(err) => {
                let ctx = LogContext::new().with_topic(topic).with_listener("tag");
                gw_warn!(context = ctx, "dropping undecodable tag update: {}", err);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_decode_failure(ListenerKind::Tag.as_str());
                }
                return;
            }
        };

        let ctx = LogContext::new().with_topic(topic).with_tag(update.tag_id);
        for binding in bindings.iter().filter(|b| b.id == update.tag_id) {
            let accepted = guarded(ListenerKind::Tag, &ctx, self.metrics.as_ref(), || {
                binding.listener.on_update(&update)
            });
            if let Some(metrics) = &self.metrics {
                metrics.inc_delivery(ListenerKind::Tag.as_str());
            }
            trace!(topic, tag_id = update.tag_id, ?accepted, "tag update delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use vigil_msg::{
        encode, Broker, Destination, InMemoryBroker, PublishOptions, TopicRegistration,
    };

    use super::*;
    use crate::config::ReconnectConfig;
    use crate::connection::ConnectionManager;
    use crate::error::GatewayError;

    struct Fixture {
        broker: InMemoryBroker,
        connection: Arc<ConnectionManager>,
        tags: Arc<TagUpdateDispatcher>,
    }

    async fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        let connection =
            ConnectionManager::new(Arc::new(broker.clone()), ReconnectConfig::default(), None)
                .expect("connection");
        let tags = TagUpdateDispatcher::new(connection.clone(), TagUpdateHandler::new(None), None);
        connection.start().await.expect("start");
        Fixture {
            broker,
            connection,
            tags,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, Arc<dyn TagUpdateListener>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let listener: Arc<dyn TagUpdateListener> = Arc::new(move |_: &TagValueUpdate| {
            seen.fetch_add(1, Ordering::SeqCst);
            true
        });
        (count, listener)
    }

    async fn publish(broker: &InMemoryBroker, topic: &str, tag_id: u64) {
        let payload = encode(&TagValueUpdate::new(tag_id, json!(1.5))).expect("encode");
        broker
            .publish(&Destination::Topic(topic.into()), &payload, PublishOptions::default())
            .await
            .expect("publish");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn topic_subscription_is_refcounted() {
        let f = fixture().await;
        let (_, a) = counter();
        let (_, b) = counter();
        let registration = TopicRegistration::new("vigil.tag.eq-1", 1);

        f.tags.register(a.clone(), &registration).await.expect("register a");
        f.tags.register(b.clone(), &registration).await.expect("register b");
        assert_eq!(f.broker.subscriber_count("vigil.tag.eq-1"), 1);
        assert_eq!(f.tags.topic_listener_counts()["vigil.tag.eq-1"], 2);

        assert!(f.tags.unregister(&a));
        assert_eq!(f.broker.subscriber_count("vigil.tag.eq-1"), 1);
        assert!(f.tags.unregister(&b));
        assert_eq!(f.broker.subscriber_count("vigil.tag.eq-1"), 0);
        assert!(f.tags.topic_listener_counts().is_empty());
        assert!(!f.tags.unregister(&b));
    }

    #[tokio::test]
    async fn updates_reach_only_listeners_bound_to_the_tag() {
        let f = fixture().await;
        let (one_count, one) = counter();
        let (two_count, two) = counter();
        f.tags
            .register(one, &TopicRegistration::new("vigil.tag.eq-1", 1))
            .await
            .expect("register");
        f.tags
            .register(two, &TopicRegistration::new("vigil.tag.eq-1", 2))
            .await
            .expect("register");

        publish(&f.broker, "vigil.tag.eq-1", 1).await;
        publish(&f.broker, "vigil.tag.eq-1", 1).await;
        settle().await;
        assert_eq!(one_count.load(Ordering::SeqCst), 2);
        assert_eq!(two_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reregistering_moves_the_binding() {
        let f = fixture().await;
        let (count, listener) = counter();
        f.tags
            .register(listener.clone(), &TopicRegistration::new("vigil.tag.a", 1))
            .await
            .expect("register");
        f.tags
            .register(listener.clone(), &TopicRegistration::new("vigil.tag.b", 1))
            .await
            .expect("re-register");

        assert_eq!(f.broker.subscriber_count("vigil.tag.a"), 0);
        assert_eq!(f.broker.subscriber_count("vigil.tag.b"), 1);
        publish(&f.broker, "vigil.tag.b", 1).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blank_topic_is_rejected() {
        let f = fixture().await;
        let (_, listener) = counter();
        let err = f
            .tags
            .register(listener.clone(), &TopicRegistration::new("", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRegistration(_)));
        assert!(!f.tags.is_registered(&listener));
    }

    #[tokio::test]
    async fn replace_keeps_the_broker_subscription() {
        let f = fixture().await;
        let (old_count, old) = counter();
        let (new_count, new) = counter();
        let registration = TopicRegistration::new("vigil.tag.eq-7", 7);
        f.tags.register(old.clone(), &registration).await.expect("register");
        let connects = f.broker.connect_attempts();

        f.tags.replace(&old, new.clone()).expect("replace");
        assert!(!f.tags.is_registered(&old));
        assert!(f.tags.is_registered(&new));
        assert_eq!(f.broker.subscriber_count("vigil.tag.eq-7"), 1);
        assert_eq!(f.broker.connect_attempts(), connects);

        publish(&f.broker, "vigil.tag.eq-7", 7).await;
        settle().await;
        assert_eq!(old_count.load(Ordering::SeqCst), 0);
        assert_eq!(new_count.load(Ordering::SeqCst), 1);

        assert!(matches!(
            f.tags.replace(&old, new.clone()),
            Err(GatewayError::ListenerNotRegistered)
        ));
    }

    #[tokio::test]
    async fn registrations_while_disconnected_attach_on_reconnect() {
        let f = fixture().await;
        f.broker.set_connect_failures(1);
        f.broker.fail_connection("link down");
        let (count, listener) = counter();
        f.tags
            .register(listener, &TopicRegistration::new("vigil.tag.eq-3", 3))
            .await
            .expect("register while down");
        assert_eq!(f.broker.subscriber_count("vigil.tag.eq-3"), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.broker.subscriber_count("vigil.tag.eq-3") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reattached");
        assert!(f.connection.is_connected());

        publish(&f.broker, "vigil.tag.eq-3", 3).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_block_others() {
        let f = fixture().await;
        let faulty: Arc<dyn TagUpdateListener> =
            Arc::new(|_: &TagValueUpdate| -> bool { panic!("listener bug") });
        let (count, healthy) = counter();
        let registration = TopicRegistration::new("vigil.tag.eq-9", 9);
        f.tags.register(faulty, &registration).await.expect("register");
        f.tags.register(healthy, &registration).await.expect("register");

        publish(&f.broker, "vigil.tag.eq-9", 9).await;
        publish(&f.broker, "vigil.tag.eq-9", 9).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsubscribe_failure_triggers_reconnection() {
        let f = fixture().await;
        let (_, listener) = counter();
        f.tags
            .register(listener.clone(), &TopicRegistration::new("vigil.tag.eq-4", 4))
            .await
            .expect("register");
        let attempts = f.broker.connect_attempts();

        f.broker.set_fail_unsubscribe(true);
        assert!(f.tags.unregister(&listener));
        f.broker.set_fail_unsubscribe(false);

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.broker.connect_attempts() == attempts || !f.connection.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnected");
        assert!(!f.tags.is_registered(&listener));
    }
}
