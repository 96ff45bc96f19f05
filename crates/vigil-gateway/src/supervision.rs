//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! Fan-out of one well-known topic to every registered listener.
//!
//! Supervision, heartbeat and broadcast topics are subscribed for the whole
//! gateway lifetime. The alarm topic is only held while somebody listens.
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use vigil_logging::{gw_warn, LogContext};
use vigil_msg::{
    decode_batch, AlarmValue, BroadcastMessage, Heartbeat, SubscriptionId, SupervisionEvent,
};

use crate::connection::{ConnectionManager, SubscriptionRefresher};
use crate::error::{GatewayError, Result};
use crate::listener::{
    guarded, AlarmListener, BroadcastMessageListener, HeartbeatListener, ListenerKind,
    ListenerSet, SupervisionListener,
};
use crate::metrics::GatewayMetrics;
use crate::registry::{release_consumer, spawn_consumer, Attachment};

/// Event family carried by a fan-out topic.
pub trait FanoutKind: Send + Sync + 'static {
    /// Decoded event.
    type Event: DeserializeOwned + Send;
    /// Listener interface.
    type Listener: ?Sized + Send + Sync + 'static;
    /// Label for logs and metrics.
    const KIND: ListenerKind;
    /// Call `listener` for `event`.
    fn notify(listener: &Self::Listener, event: &Self::Event);
}

/// Supervision events.
pub struct Supervision;

impl FanoutKind for Supervision {
    type Event = SupervisionEvent;
    type Listener = dyn SupervisionListener;
    const KIND: ListenerKind = ListenerKind::Supervision;

    fn notify(listener: &Self::Listener, event: &Self::Event) {
        listener.on_supervision_event(event);
    }
}

/// Server heartbeats.
pub struct Heartbeats;

impl FanoutKind for Heartbeats {
    type Event = Heartbeat;
    type Listener = dyn HeartbeatListener;
    const KIND: ListenerKind = ListenerKind::Heartbeat;

    fn notify(listener: &Self::Listener, event: &Self::Event) {
        listener.on_heartbeat(event);
    }
}

/// Alarm updates.
pub struct Alarms;

impl FanoutKind for Alarms {
    type Event = AlarmValue;
    type Listener = dyn AlarmListener;
    const KIND: ListenerKind = ListenerKind::Alarm;

    fn notify(listener: &Self::Listener, event: &Self::Event) {
        listener.on_alarm(event);
    }
}

/// Administrative broadcasts.
pub struct BroadcastMessages;

impl FanoutKind for BroadcastMessages {
    type Event = BroadcastMessage;
    type Listener = dyn BroadcastMessageListener;
    const KIND: ListenerKind = ListenerKind::Broadcast;

    fn notify(listener: &Self::Listener, event: &Self::Event) {
        listener.on_broadcast(event);
    }
}

/// When the broker subscription is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// For as long as the gateway is connected.
    Eager,
    /// Only while at least one listener is registered.
    Lazy,
}

struct FanoutInner<L: ?Sized> {
    listeners: ListenerSet<L>,
    attachment: Attachment,
    next_token: u64,
    closed: bool,
}

impl<L: ?Sized> FanoutInner<L> {
    fn wanted(&self, mode: SubscriptionMode) -> bool {
        !self.closed && (mode == SubscriptionMode::Eager || !self.listeners.is_empty())
    }

    fn begin_attach(&mut self) -> u64 {
        self.next_token += 1;
        self.attachment = Attachment::Attaching(self.next_token);
        self.next_token
    }
}

/// Identity-keyed listener set fed from one topic.
pub struct TopicFanout<K: FanoutKind> {
    topic: String,
    mode: SubscriptionMode,
    connection: Arc<ConnectionManager>,
    metrics: Option<GatewayMetrics>,
    inner: Arc<Mutex<FanoutInner<K::Listener>>>,
    _kind: PhantomData<K>,
}

/// Supervision fan-out, subscribed for the gateway lifetime.
pub type SupervisionDispatcher = TopicFanout<Supervision>;
/// Heartbeat fan-out, subscribed for the gateway lifetime.
pub type HeartbeatDispatcher = TopicFanout<Heartbeats>;
/// Alarm fan-out, subscribed on demand.
pub type AlarmDispatcher = TopicFanout<Alarms>;
/// Broadcast fan-out, subscribed for the gateway lifetime.
pub type BroadcastDispatcher = TopicFanout<BroadcastMessages>;

impl<K: FanoutKind> TopicFanout<K> {
    /// Create a fan-out for `topic` and enrol it for reattachment.
    pub fn new(
        topic: impl Into<String>,
        mode: SubscriptionMode,
        connection: Arc<ConnectionManager>,
        metrics: Option<GatewayMetrics>,
    ) -> Arc<Self> {
        let fanout = Arc::new(Self {
            topic: topic.into(),
            mode,
            connection,
            metrics,
            inner: Arc::new(Mutex::new(FanoutInner {
                listeners: ListenerSet::new(),
                attachment: Attachment::Detached,
                next_token: 0,
                closed: false,
            })),
            _kind: PhantomData,
        });
        fanout.connection.add_refresher(&fanout);
        fanout
    }

    /// Topic this fan-out listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Add a listener. Returns `false` if it was already registered.
    pub async fn register(&self, listener: Arc<K::Listener>) -> Result<bool> {
        let (inserted, token) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(GatewayError::Shutdown);
            }
            let inserted = inner.listeners.insert(listener);
            let attach = inserted
                && matches!(inner.attachment, Attachment::Detached)
                && inner.wanted(self.mode)
                && self.connection.is_connected();
            (inserted, attach.then(|| inner.begin_attach()))
        };
        if let Some(token) = token {
            if let Err(err) = self.attach(token).await {
                let ctx = LogContext::new().with_topic(&self.topic);
                gw_warn!(context = ctx, "subscription deferred until reconnection: {}", err);
                if let GatewayError::Transport(cause) = err {
                    self.connection.on_transport_failure(cause);
                }
            }
        }
        Ok(inserted)
    }

    /// Remove a listener. In lazy mode the last removal drops the broker
    /// subscription.
    pub fn unregister(&self, listener: &Arc<K::Listener>) -> bool {
        let (removed, released) = {
            let mut inner = self.inner.lock();
            let removed = inner.listeners.remove(listener);
            let released = if removed && !inner.wanted(self.mode) {
                inner.attachment.detach(self.metrics.as_ref())
            } else {
                None
            };
            (removed, released)
        };
        if let Some(id) = released {
            release_consumer(&self.connection, &self.topic, id);
        }
        removed
    }

    /// Whether `listener` is registered.
    pub fn is_registered(&self, listener: &Arc<K::Listener>) -> bool {
        self.inner.lock().listeners.contains(listener)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Drop every listener and refuse new ones.
    pub fn clear_listeners(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.listeners.clear();
    }

    /// Unsubscribe from the broker.
    pub fn teardown(&self) -> Result<()> {
        let released = self.inner.lock().attachment.detach(self.metrics.as_ref());
        if let Some(id) = released {
            self.connection.broker().unsubscribe(id)?;
        }
        Ok(())
    }

    async fn attach(&self, token: u64) -> Result<()> {
        let subscribed = self.connection.broker().subscribe(&self.topic).await;
        let mut inner = self.inner.lock();
        let still_wanted = matches!(inner.attachment, Attachment::Attaching(t) if t == token);
        let stream = match subscribed {
            Ok(stream) => stream,
            Err(err) => {
                if still_wanted {
                    inner.attachment = Attachment::Detached;
                }
                return Err(err.into());
            }
        };
        if !still_wanted || !inner.wanted(self.mode) {
            if still_wanted {
                inner.attachment = Attachment::Detached;
            }
            drop(inner);
            release_consumer(&self.connection, &self.topic, stream.id);
            return Ok(());
        }

        let id = stream.id;
        let task = spawn_consumer(stream, self.delivery(id));
        inner.attachment = Attachment::Attached { id, task };
        if let Some(metrics) = &self.metrics {
            metrics.add_active_topics(1);
        }
        debug!(topic = %self.topic, subscription = id, "fan-out topic attached");
        Ok(())
    }

    fn delivery(&self, id: SubscriptionId) -> impl FnMut(&str) -> bool + Send + 'static {
        let inner: Weak<Mutex<FanoutInner<K::Listener>>> = Arc::downgrade(&self.inner);
        let topic = self.topic.clone();
        let metrics = self.metrics.clone();
        move |payload: &str| {
            let Some(inner) = inner.upgrade() else {
                return false;
            };
            let listeners = {
                let inner = inner.lock();
                if !inner.attachment.is_attached_as(id) {
                    return false;
                }
                inner.listeners.snapshot()
            };
            let ctx = LogContext::new().with_topic(&topic);
            let events: Vec<K::Event> = match decode_batch(payload) {
                Ok(events) => events,
                Err(err) => {
                    gw_warn!(
                        context = ctx.clone().with_listener(K::KIND.as_str()),
                        "dropping undecodable payload: {}",
                        err
                    );
                    if let Some(metrics) = &metrics {
                        metrics.inc_decode_failure(K::KIND.as_str());
                    }
                    return true;
                }
            };
            for event in &events {
                for listener in &listeners {
                    guarded(K::KIND, &ctx, metrics.as_ref(), || {
                        K::notify(listener, event)
                    });
                    if let Some(metrics) = &metrics {
                        metrics.inc_delivery(K::KIND.as_str());
                    }
                }
            }
            true
        }
    }
}

#[async_trait]
impl<K: FanoutKind> SubscriptionRefresher for TopicFanout<K> {
    fn connection_lost(&self) {
        let stale = self.inner.lock().attachment.detach(self.metrics.as_ref());
        if let Some(id) = stale {
            if let Err(err) = self.connection.broker().unsubscribe(id) {
                debug!(topic = %self.topic, error = %err, "stale consumer already gone");
            }
        }
    }

    async fn reattach(&self) -> Result<()> {
        let token = {
            let mut inner = self.inner.lock();
            if !matches!(inner.attachment, Attachment::Detached) || !inner.wanted(self.mode) {
                return Ok(());
            }
            inner.begin_attach()
        };
        self.attach(token).await.map_err(|err| {
            warn!(topic = %self.topic, error = %err, "failed to reattach fan-out topic");
            err
        })
    }
}

impl<K: FanoutKind> Drop for TopicFanout<K> {
    fn drop(&mut self) {
        if let Some(id) = self.inner.lock().attachment.detach(self.metrics.as_ref()) {
            let _ = self.connection.broker().unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use vigil_msg::{
        encode, Broker, Destination, InMemoryBroker, PublishOptions, SupervisionEntity,
        SupervisionStatus,
    };

    use super::*;
    use crate::config::ReconnectConfig;

    fn connection(broker: &InMemoryBroker) -> Arc<ConnectionManager> {
        ConnectionManager::new(Arc::new(broker.clone()), ReconnectConfig::default(), None)
            .expect("connection")
    }

    fn supervision_counter() -> (Arc<AtomicUsize>, Arc<dyn SupervisionListener>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let listener: Arc<dyn SupervisionListener> = Arc::new(move |_: &SupervisionEvent| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    async fn publish<T: serde::Serialize>(broker: &InMemoryBroker, topic: &str, value: &T) {
        let payload = encode(value).expect("encode");
        broker
            .publish(&Destination::Topic(topic.into()), &payload, PublishOptions::default())
            .await
            .expect("publish");
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn eager_topic_is_held_without_listeners() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        let fanout = SupervisionDispatcher::new(
            "vigil.client.supervision",
            SubscriptionMode::Eager,
            connection.clone(),
            None,
        );
        connection.start().await.expect("start");
        assert_eq!(broker.subscriber_count("vigil.client.supervision"), 1);

        let (_, listener) = supervision_counter();
        fanout.register(listener.clone()).await.expect("register");
        assert!(fanout.unregister(&listener));
        assert_eq!(broker.subscriber_count("vigil.client.supervision"), 1);

        fanout.teardown().expect("teardown");
        assert_eq!(broker.subscriber_count("vigil.client.supervision"), 0);
    }

    #[tokio::test]
    async fn batch_is_delivered_to_every_listener() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        let fanout = SupervisionDispatcher::new(
            "vigil.client.supervision",
            SubscriptionMode::Eager,
            connection.clone(),
            None,
        );
        connection.start().await.expect("start");

        let (a_count, a) = supervision_counter();
        let (b_count, b) = supervision_counter();
        assert!(fanout.register(a.clone()).await.expect("register"));
        assert!(fanout.register(b).await.expect("register"));
        assert!(!fanout.register(a).await.expect("duplicate"));

        let batch = vec![
            SupervisionEvent::new(SupervisionEntity::Process, 1, SupervisionStatus::Running, ""),
            SupervisionEvent::new(SupervisionEntity::Equipment, 2, SupervisionStatus::Down, ""),
        ];
        publish(&broker, "vigil.client.supervision", &batch).await;
        settle().await;
        assert_eq!(a_count.load(Ordering::SeqCst), 2);
        assert_eq!(b_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lazy_topic_follows_listener_count() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        let alarms = AlarmDispatcher::new(
            "vigil.client.alarm",
            SubscriptionMode::Lazy,
            connection.clone(),
            None,
        );
        connection.start().await.expect("start");
        assert_eq!(broker.subscriber_count("vigil.client.alarm"), 0);

        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let listener: Arc<dyn AlarmListener> = Arc::new(move |alarm: &AlarmValue| {
            assert!(alarm.active);
            seen.fetch_add(1, Ordering::SeqCst);
        });
        alarms.register(listener.clone()).await.expect("register");
        assert_eq!(broker.subscriber_count("vigil.client.alarm"), 1);

        let alarm = AlarmValue {
            alarm_id: 11,
            tag_id: 5,
            fault_family: "PUMP".into(),
            fault_member: "P-101".into(),
            fault_code: 3,
            active: true,
            timestamp: Utc::now(),
            info: None,
        };
        publish(&broker, "vigil.client.alarm", &alarm).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(alarms.unregister(&listener));
        assert_eq!(broker.subscriber_count("vigil.client.alarm"), 0);
        assert_eq!(alarms.listener_count(), 0);
    }

    #[tokio::test]
    async fn heartbeat_resubscribes_after_reconnection() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        let heartbeats = HeartbeatDispatcher::new(
            "vigil.client.heartbeat",
            SubscriptionMode::Eager,
            connection.clone(),
            None,
        );
        connection.start().await.expect("start");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        heartbeats
            .register(Arc::new(move |_: &Heartbeat| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .expect("register");

        broker.fail_connection("link down");
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.subscriber_count("vigil.client.heartbeat") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("resubscribed");

        publish(&broker, "vigil.client.heartbeat", &Heartbeat::new("server-a")).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_skipped() {
        let broker = InMemoryBroker::new();
        let connection = connection(&broker);
        let fanout = SupervisionDispatcher::new(
            "vigil.client.supervision",
            SubscriptionMode::Eager,
            connection.clone(),
            None,
        );
        connection.start().await.expect("start");
        let (count, listener) = supervision_counter();
        fanout.register(listener).await.expect("register");

        broker.deliver(
            &Destination::Topic("vigil.client.supervision".into()),
            "{not json",
            PublishOptions::default(),
        );
        let event =
            SupervisionEvent::new(SupervisionEntity::Process, 1, SupervisionStatus::Stopped, "");
        publish(&broker, "vigil.client.supervision", &event).await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
