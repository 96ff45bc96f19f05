//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! Refcounted topic subscriptions shared by dynamically bound listeners.
//!
//! A broker subscription exists for a topic exactly while at least one
//! listener is bound to it. Each attached topic is drained by one task, so
//! listeners see messages in broker arrival order. Listener bindings are
//! read under a short lock and callbacks run on the copy.
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vigil_logging::{gw_warn, LogContext};
use vigil_msg::{log_message, MessageDirection, SubscriptionId, TopicRegistration, TopicStream};

use crate::connection::{ConnectionManager, SubscriptionRefresher};
use crate::error::{GatewayError, Result};
use crate::listener::ListenerKey;
use crate::metrics::GatewayMetrics;

/// A listener together with the entity id it asked for.
pub struct Binding<L: ?Sized> {
    /// The listener.
    pub listener: Arc<L>,
    /// Entity id from the registration descriptor.
    pub id: u64,
}

impl<L: ?Sized> Binding<L> {
    fn key(&self) -> ListenerKey {
        ListenerKey::of(&self.listener)
    }
}

impl<L: ?Sized> Clone for Binding<L> {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
            id: self.id,
        }
    }
}

/// Turns one topic payload into listener callbacks.
pub trait TopicHandler<L: ?Sized>: Send + Sync + 'static {
    /// Deliver `payload` to `bindings`, a snapshot taken for this message.
    fn deliver(&self, topic: &str, payload: &str, bindings: &[Binding<L>]);
}

/// Broker-side state of one tracked subscription.
pub(crate) enum Attachment {
    /// No broker consumer.
    Detached,
    /// A subscribe call identified by the token is in flight.
    Attaching(u64),
    /// Consumer `id` is drained by `task`.
    Attached {
        id: SubscriptionId,
        task: JoinHandle<()>,
    },
}

impl Attachment {
    pub(crate) fn is_attached_as(&self, subscription: SubscriptionId) -> bool {
        matches!(self, Attachment::Attached { id, .. } if *id == subscription)
    }

    /// Reset to `Detached`, stopping the drain task. Returns the consumer id
    /// the broker may still hold.
    pub(crate) fn detach(&mut self, metrics: Option<&GatewayMetrics>) -> Option<SubscriptionId> {
        match std::mem::replace(self, Attachment::Detached) {
            Attachment::Attached { id, task } => {
                task.abort();
                if let Some(metrics) = metrics {
                    metrics.add_active_topics(-1);
                }
                Some(id)
            }
            _ => None,
        }
    }
}

/// Drain `stream` on its own task, handing each payload to `on_message`
/// until it returns `false` or the broker closes the stream.
pub(crate) fn spawn_consumer<F>(mut stream: TopicStream, mut on_message: F) -> JoinHandle<()>
where
    F: FnMut(&str) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(delivery) = stream.messages.recv().await {
            log_message(MessageDirection::Inbound, &stream.topic, &delivery.payload);
            if !on_message(&delivery.payload) {
                break;
            }
        }
        debug!(topic = %stream.topic, subscription = stream.id, "topic consumer finished");
    })
}

/// Unsubscribe a consumer that is no longer wanted. A broker refusal while
/// connected is treated as a connection failure so the reconnect cycle
/// rebuilds a consistent set of subscriptions.
pub(crate) fn release_consumer(connection: &ConnectionManager, topic: &str, id: SubscriptionId) {
    if let Err(err) = connection.broker().unsubscribe(id) {
        let ctx = LogContext::new().with_topic(topic);
        gw_warn!(context = ctx, "failed to unsubscribe consumer {}: {}", id, err);
        if connection.is_connected() {
            connection.on_transport_failure(err);
        }
    }
}

struct TopicEntry<L: ?Sized> {
    bindings: Vec<Binding<L>>,
    attachment: Attachment,
}

struct RegistryInner<L: ?Sized> {
    topics: HashMap<String, TopicEntry<L>>,
    listeners: HashMap<ListenerKey, String>,
    next_token: u64,
    closed: bool,
}

impl<L: ?Sized> RegistryInner<L> {
    fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Drop the binding for `key` from `topic`, removing the topic entry when
    /// it becomes empty. Returns the consumer to release, if any.
    fn unbind(
        &mut self,
        key: ListenerKey,
        topic: &str,
        metrics: Option<&GatewayMetrics>,
    ) -> Option<SubscriptionId> {
        let entry = self.topics.get_mut(topic)?;
        entry.bindings.retain(|binding| binding.key() != key);
        if !entry.bindings.is_empty() {
            return None;
        }
        let mut entry = self.topics.remove(topic)?;
        entry.attachment.detach(metrics)
    }
}

/// Topic → listener registry with refcounted broker subscriptions.
pub struct SubscriptionRegistry<L: ?Sized, H> {
    connection: Arc<ConnectionManager>,
    handler: Arc<H>,
    metrics: Option<GatewayMetrics>,
    inner: Arc<Mutex<RegistryInner<L>>>,
}

impl<L, H> SubscriptionRegistry<L, H>
where
    L: ?Sized + Send + Sync + 'static,
    H: TopicHandler<L>,
{
    /// Create a registry and enrol it for reattachment after reconnection.
    pub fn new(
        connection: Arc<ConnectionManager>,
        handler: H,
        metrics: Option<GatewayMetrics>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            connection,
            handler: Arc::new(handler),
            metrics,
            inner: Arc::new(Mutex::new(RegistryInner {
                topics: HashMap::new(),
                listeners: HashMap::new(),
                next_token: 0,
                closed: false,
            })),
        });
        registry.connection.add_refresher(&registry);
        registry
    }

    /// Bind `listener` to the registration's topic and id, subscribing at the
    /// broker if this is the topic's first listener. A listener already bound
    /// elsewhere is moved.
    pub async fn register(
        &self,
        listener: Arc<L>,
        registration: &TopicRegistration,
    ) -> Result<bool> {
        if !registration.is_valid() {
            return Err(GatewayError::InvalidRegistration(
                "topic name must not be empty".into(),
            ));
        }
        let key = ListenerKey::of(&listener);
        let topic = registration.topic.clone();

        let (released, token) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(GatewayError::Shutdown);
            }
            let previous = inner.listeners.remove(&key);
            if let Some(entry) = previous
                .as_ref()
                .filter(|old| **old == topic)
                .and_then(|_| inner.topics.get_mut(&topic))
            {
                entry.bindings.retain(|binding| binding.key() != key);
            }

            let token = inner.next_token();
            let entry = inner.topics.entry(topic.clone()).or_insert_with(|| TopicEntry {
                bindings: Vec::new(),
                attachment: Attachment::Detached,
            });
            entry.bindings.push(Binding {
                listener,
                id: registration.id,
            });
            // Read under the registry lock: a reconnect that completes later
            // reattaches this entry in its second pass.
            let attach = matches!(entry.attachment, Attachment::Detached)
                && self.connection.is_connected();
            if attach {
                entry.attachment = Attachment::Attaching(token);
            }
            inner.listeners.insert(key, topic.clone());

            let released = match previous {
                Some(old) if old != topic => inner
                    .unbind(key, &old, self.metrics.as_ref())
                    .map(|id| (old, id)),
                _ => None,
            };
            (released, attach.then_some(token))
        };

        if let Some((old_topic, id)) = released {
            release_consumer(&self.connection, &old_topic, id);
        }
        if let Some(token) = token {
            if let Err(err) = self.attach(&topic, token).await {
                let ctx = LogContext::new().with_topic(&topic).with_tag(registration.id);
                gw_warn!(context = ctx, "subscription deferred until reconnection: {}", err);
                if let GatewayError::Transport(cause) = err {
                    self.connection.on_transport_failure(cause);
                }
            }
        }
        Ok(true)
    }

    /// Remove `listener` from whatever topic it is bound to, tearing the
    /// broker subscription down when it was the last one.
    pub fn unregister(&self, listener: &Arc<L>) -> bool {
        let key = ListenerKey::of(listener);
        let released = {
            let mut inner = self.inner.lock();
            let Some(topic) = inner.listeners.remove(&key) else {
                return false;
            };
            inner
                .unbind(key, &topic, self.metrics.as_ref())
                .map(|id| (topic, id))
        };
        if let Some((topic, id)) = released {
            release_consumer(&self.connection, &topic, id);
        }
        true
    }

    /// Hand `old`'s binding to `new` in place. The topic keeps its broker
    /// subscription and no message is delivered to both or neither.
    pub fn replace(&self, old: &Arc<L>, new: Arc<L>) -> Result<()> {
        let old_key = ListenerKey::of(old);
        let new_key = ListenerKey::of(&new);
        if old_key == new_key {
            return if self.is_registered(old) {
                Ok(())
            } else {
                Err(GatewayError::ListenerNotRegistered)
            };
        }

        let released = {
            let mut inner = self.inner.lock();
            let Some(topic) = inner.listeners.remove(&old_key) else {
                return Err(GatewayError::ListenerNotRegistered);
            };

            let mut released = None;
            if let Some(previous) = inner.listeners.remove(&new_key) {
                if previous == topic {
                    if let Some(entry) = inner.topics.get_mut(&topic) {
                        entry.bindings.retain(|binding| binding.key() != new_key);
                    }
                } else {
                    released = inner
                        .unbind(new_key, &previous, self.metrics.as_ref())
                        .map(|id| (previous, id));
                }
            }

            if let Some(binding) = inner
                .topics
                .get_mut(&topic)
                .and_then(|entry| entry.bindings.iter_mut().find(|b| b.key() == old_key))
            {
                binding.listener = new;
            }
            inner.listeners.insert(new_key, topic);
            released
        };

        if let Some((topic, id)) = released {
            release_consumer(&self.connection, &topic, id);
        }
        Ok(())
    }

    /// Whether `listener` is bound to any topic.
    pub fn is_registered(&self, listener: &Arc<L>) -> bool {
        self.inner
            .lock()
            .listeners
            .contains_key(&ListenerKey::of(listener))
    }

    /// Number of listeners bound to each tracked topic.
    pub fn topic_listener_counts(&self) -> HashMap<String, usize> {
        self.inner
            .lock()
            .topics
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.bindings.len()))
            .collect()
    }

    /// Unbind every listener and refuse new registrations. Subscriptions are
    /// kept until [`teardown`](Self::teardown).
    pub fn clear_listeners(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.listeners.clear();
        for entry in inner.topics.values_mut() {
            entry.bindings.clear();
        }
    }

    /// Unsubscribe every topic. Each consumer is released even if an earlier
    /// one failed; the first failure is returned.
    pub fn teardown(&self) -> Result<()> {
        let detached: Vec<(String, SubscriptionId)> = {
            let mut inner = self.inner.lock();
            let metrics = self.metrics.as_ref();
            inner
                .topics
                .drain()
                .filter_map(|(topic, mut entry)| {
                    entry.attachment.detach(metrics).map(|id| (topic, id))
                })
                .collect()
        };
        let mut first_error = None;
        for (topic, id) in detached {
            if let Err(err) = self.connection.broker().unsubscribe(id) {
                warn!(topic = %topic, error = %err, "failed to unsubscribe during teardown");
                first_error.get_or_insert(GatewayError::Transport(err));
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn attach(&self, topic: &str, token: u64) -> Result<()> {
        let subscribed = self.connection.broker().subscribe(topic).await;
        let mut inner = self.inner.lock();
        let stream = match subscribed {
            Ok(stream) => stream,
            Err(err) => {
                if let Some(entry) = inner.topics.get_mut(topic) {
                    if matches!(entry.attachment, Attachment::Attaching(t) if t == token) {
                        entry.attachment = Attachment::Detached;
                    }
                }
                return Err(err.into());
            }
        };

        let current = inner
            .topics
            .get_mut(topic)
            .filter(|entry| matches!(entry.attachment, Attachment::Attaching(t) if t == token));
        let Some(entry) = current else {
            drop(inner);
            debug!(topic, "subscription no longer wanted");
            release_consumer(&self.connection, topic, stream.id);
            return Ok(());
        };

        let id = stream.id;
        let task = spawn_consumer(stream, self.delivery(topic.to_string(), id));
        entry.attachment = Attachment::Attached { id, task };
        if let Some(metrics) = &self.metrics {
            metrics.add_active_topics(1);
        }
        debug!(topic, subscription = id, "topic attached");
        Ok(())
    }

    fn delivery(
        &self,
        topic: String,
        id: SubscriptionId,
    ) -> impl FnMut(&str) -> bool + Send + 'static {
        let inner: Weak<Mutex<RegistryInner<L>>> = Arc::downgrade(&self.inner);
        let handler = self.handler.clone();
        move |payload: &str| {
            let Some(inner) = inner.upgrade() else {
                return false;
            };
            let bindings = {
                let inner = inner.lock();
                match inner.topics.get(&topic) {
                    Some(entry) if entry.attachment.is_attached_as(id) => entry.bindings.clone(),
                    _ => return false,
                }
            };
            handler.deliver(&topic, payload, &bindings);
            true
        }
    }
}

#[async_trait]
impl<L, H> SubscriptionRefresher for SubscriptionRegistry<L, H>
where
    L: ?Sized + Send + Sync + 'static,
    H: TopicHandler<L>,
{
    fn connection_lost(&self) {
        let stale: Vec<(String, SubscriptionId)> = {
            let mut inner = self.inner.lock();
            let metrics = self.metrics.as_ref();
            inner
                .topics
                .iter_mut()
                .filter_map(|(topic, entry)| {
                    entry.attachment.detach(metrics).map(|id| (topic.clone(), id))
                })
                .collect()
        };
        for (topic, id) in stale {
            if let Err(err) = self.connection.broker().unsubscribe(id) {
                debug!(topic = %topic, error = %err, "stale consumer already gone");
            }
        }
    }

    async fn reattach(&self) -> Result<()> {
        let pending: Vec<(String, u64)> = {
            let mut inner = self.inner.lock();
            let mut pending = Vec::new();
            let mut token = inner.next_token;
            for (topic, entry) in inner.topics.iter_mut() {
                if matches!(entry.attachment, Attachment::Detached) && !entry.bindings.is_empty() {
                    token += 1;
                    entry.attachment = Attachment::Attaching(token);
                    pending.push((topic.clone(), token));
                }
            }
            inner.next_token = token;
            pending
        };

        let mut first_error = None;
        for (topic, token) in pending {
            if let Err(err) = self.attach(&topic, token).await {
                warn!(topic = %topic, error = %err, "failed to reattach topic");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl<L: ?Sized, H> Drop for SubscriptionRegistry<L, H> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for entry in inner.topics.values_mut() {
            if let Some(id) = entry.attachment.detach(self.metrics.as_ref()) {
                let _ = self.connection.broker().unsubscribe(id);
            }
        }
    }
}
