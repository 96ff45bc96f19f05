//! ---
//! vigil_section: "02-messaging-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Broker interface, wire types and text codecs."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! In-process broker used by tests and single-process integration.
//!
//! One instance plays both sides: the gateway talks to it through
//! [`Broker`], a simulated server consumes queues with
//! [`InMemoryBroker::consume_queue`] and answers with
//! [`InMemoryBroker::deliver`], which does not need an open client
//! connection.
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{
    ensure_destination, Broker, Delivery, Destination, EphemeralAddress, FailureHandler,
    PublishOptions, SubscriptionId, TopicStream,
};
use crate::logging::{log_message, MessageDirection};
use crate::{MessagingError, Result};

/// Prefix of every address handed out by [`Broker::create_ephemeral_address`].
pub const EPHEMERAL_PREFIX: &str = "temp-queue://";

/// Message waiting on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Text payload.
    pub payload: String,
    /// Reply address set by the publisher.
    pub reply_to: Option<String>,
    /// Point after which the message is discarded unread.
    pub expires_at: Option<Instant>,
}

impl QueuedMessage {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<QueuedMessage>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    connected: bool,
    next_subscription: SubscriptionId,
    topics: HashMap<String, Vec<(SubscriptionId, UnboundedSender<Delivery>)>>,
    queues: HashMap<String, QueueState>,
    ephemeral: HashMap<String, UnboundedSender<Delivery>>,
    failure_handler: Option<FailureHandler>,
    connect_failures: u32,
    connect_attempts: u32,
    fail_unsubscribe: bool,
}

impl State {
    fn drop_consumers(&mut self) {
        self.topics.clear();
        self.ephemeral.clear();
    }

    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }
}

/// In-memory broker backed by a mutex protected state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    /// Create a disconnected broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connection attempts fail.
    pub fn set_connect_failures(&self, count: u32) {
        self.state.lock().connect_failures = count;
    }

    /// Make every subsequent unsubscribe call fail.
    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.state.lock().fail_unsubscribe = fail;
    }

    /// Number of connection attempts observed so far.
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Whether a client connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Number of consumers attached to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map(|subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Number of ephemeral addresses not yet released.
    pub fn ephemeral_count(&self) -> usize {
        self.state.lock().ephemeral.len()
    }

    /// Number of unexpired messages waiting on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.iter().filter(|m| !m.expired(now)).count())
            .unwrap_or(0)
    }

    /// Attach a consumer to a queue. Works regardless of the client connection.
    pub fn consume_queue(&self, queue: &str) -> QueueConsumer {
        let notify = self.state.lock().queue(queue).notify.clone();
        QueueConsumer {
            queue: queue.to_string(),
            state: self.state.clone(),
            notify,
        }
    }

    /// Route a message to its destination without requiring a client
    /// connection. Messages to released reply addresses are dropped.
    pub fn deliver(&self, destination: &Destination, payload: &str, options: PublishOptions) {
        let mut state = self.state.lock();
        match destination {
            Destination::Topic(topic) => {
                if let Some(subs) = state.topics.get_mut(topic) {
                    subs.retain(|(_, tx)| {
                        tx.send(Delivery {
                            payload: payload.to_string(),
                            reply_to: options.reply_to.clone(),
                        })
                        .is_ok()
                    });
                }
            }
            Destination::Queue(name) => {
                if let Some(tx) = state.ephemeral.get(name) {
                    let _ = tx.send(Delivery {
                        payload: payload.to_string(),
                        reply_to: options.reply_to.clone(),
                    });
                    return;
                }
                if name.starts_with(EPHEMERAL_PREFIX) {
                    debug!(destination = %name, "dropping message for released reply address");
                    return;
                }
                let expires_at = options.time_to_live.map(|ttl| Instant::now() + ttl);
                let queue = state.queue(name);
                queue.backlog.push_back(QueuedMessage {
                    payload: payload.to_string(),
                    reply_to: options.reply_to,
                    expires_at,
                });
                queue.notify.notify_one();
            }
        }
    }

    /// Simulate a connection drop: consumers and reply addresses are
    /// discarded and the failure handler is invoked.
    pub fn fail_connection(&self, cause: &str) {
        {
            let mut state = self.state.lock();
            state.connected = false;
            state.drop_consumers();
        }
        warn!(cause, "in-memory broker connection failed");
        self.report_failure(cause);
    }

    /// Invoke the failure handler without touching connection state, as a
    /// redundant failure report from another source would.
    pub fn report_failure(&self, cause: &str) {
        let handler = self.state.lock().failure_handler.clone();
        if let Some(handler) = handler {
            handler(MessagingError::Transport(cause.to_string()));
        }
    }

    fn ensure_connected(state: &State) -> Result<()> {
        if state.connected {
            Ok(())
        } else {
            Err(MessagingError::NotConnected)
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(MessagingError::Transport("connection refused".into()));
        }
        state.connected = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.connected = false;
        state.drop_consumers();
        Ok(())
    }

    async fn publish(
        &self,
        destination: &Destination,
        payload: &str,
        options: PublishOptions,
    ) -> Result<()> {
        ensure_destination(destination)?;
        Self::ensure_connected(&self.state.lock())?;
        log_message(MessageDirection::Outbound, destination.name(), payload);
        self.deliver(destination, payload, options);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicStream> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        state.next_subscription += 1;
        let id = state.next_subscription;
        let (tx, rx) = unbounded_channel();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));
        Ok(TopicStream {
            id,
            topic: topic.to_string(),
            messages: rx,
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_unsubscribe {
            return Err(MessagingError::Transport("unsubscribe rejected".into()));
        }
        for subs in state.topics.values_mut() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        state.topics.retain(|_, subs| !subs.is_empty());
        Ok(())
    }

    async fn create_ephemeral_address(&self) -> Result<EphemeralAddress> {
        let mut state = self.state.lock();
        Self::ensure_connected(&state)?;
        let address = format!("{EPHEMERAL_PREFIX}{}", Uuid::new_v4());
        let (tx, rx) = unbounded_channel();
        state.ephemeral.insert(address.clone(), tx);
        Ok(EphemeralAddress {
            address,
            messages: rx,
        })
    }

    fn release_ephemeral_address(&self, address: &str) {
        self.state.lock().ephemeral.remove(address);
    }

    fn set_failure_handler(&self, handler: FailureHandler) {
        self.state.lock().failure_handler = Some(handler);
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Consumer attached to one queue of an [`InMemoryBroker`].
pub struct QueueConsumer {
    queue: String,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl QueueConsumer {
    /// Queue name.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Take the next unexpired message without waiting.
    pub fn try_recv(&self) -> Option<QueuedMessage> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let queue = state.queue(&self.queue);
        while let Some(message) = queue.backlog.pop_front() {
            if message.expired(now) {
                debug!(queue = %self.queue, "discarding expired queue message");
                continue;
            }
            return Some(message);
        }
        None
    }

    /// Wait for the next unexpired message.
    pub async fn recv(&self) -> QueuedMessage {
        loop {
            if let Some(message) = self.try_recv() {
                return message;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn topic_delivery_reaches_every_subscriber_in_order() {
        let broker = InMemoryBroker::new();
        broker.connect().await.expect("connect");
        let mut a = broker.subscribe("t").await.expect("subscribe");
        let mut b = broker.subscribe("t").await.expect("subscribe");

        let topic = Destination::Topic("t".into());
        for payload in ["1", "2"] {
            broker
                .publish(&topic, payload, PublishOptions::default())
                .await
                .expect("publish");
        }

        for stream in [&mut a, &mut b] {
            assert_eq!(stream.messages.recv().await.map(|d| d.payload), Some("1".into()));
            assert_eq!(stream.messages.recv().await.map(|d| d.payload), Some("2".into()));
        }
    }

    #[tokio::test]
    async fn operations_require_connection() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.subscribe("t").await,
            Err(MessagingError::NotConnected)
        ));
        assert!(matches!(
            broker
                .publish(&Destination::Queue("q".into()), "x", PublishOptions::default())
                .await,
            Err(MessagingError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_queue_messages_are_skipped() {
        let broker = InMemoryBroker::new();
        broker.connect().await.expect("connect");
        let queue = Destination::Queue("q".into());
        broker
            .publish(
                &queue,
                "stale",
                PublishOptions::default().with_ttl(Duration::from_millis(10)),
            )
            .await
            .expect("publish");
        broker
            .publish(&queue, "fresh", PublishOptions::default())
            .await
            .expect("publish");

        tokio::time::advance(Duration::from_millis(20)).await;
        let consumer = broker.consume_queue("q");
        assert_eq!(consumer.recv().await.payload, "fresh");
        assert!(consumer.try_recv().is_none());
    }

    #[tokio::test]
    async fn released_reply_address_drops_messages() {
        let broker = InMemoryBroker::new();
        broker.connect().await.expect("connect");
        let mut reply = broker.create_ephemeral_address().await.expect("address");
        broker.release_ephemeral_address(&reply.address);
        broker.deliver(
            &Destination::Queue(reply.address.clone()),
            "late",
            PublishOptions::default(),
        );
        assert_eq!(broker.ephemeral_count(), 0);
        assert!(reply.messages.recv().await.is_none());
        assert_eq!(broker.queue_depth(&reply.address), 0);
    }

    #[tokio::test]
    async fn fail_connection_closes_streams_and_notifies() {
        let broker = InMemoryBroker::new();
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        broker.set_failure_handler(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        broker.connect().await.expect("connect");
        let mut stream = broker.subscribe("t").await.expect("subscribe");

        broker.fail_connection("link down");
        assert!(!broker.is_connected());
        assert!(stream.messages.recv().await.is_none());
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn injected_connect_failures_are_consumed() {
        let broker = InMemoryBroker::new();
        broker.set_connect_failures(2);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        broker.connect().await.expect("third attempt succeeds");
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn unsubscribe_detaches_consumer() {
        let broker = InMemoryBroker::new();
        broker.connect().await.expect("connect");
        let stream = broker.subscribe("t").await.expect("subscribe");
        assert_eq!(broker.subscriber_count("t"), 1);
        broker.unsubscribe(stream.id).expect("unsubscribe");
        assert_eq!(broker.subscriber_count("t"), 0);
    }
}
