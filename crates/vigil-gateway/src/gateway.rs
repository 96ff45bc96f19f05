//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! Public surface composing the connection, dispatchers and fan-outs.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};
use vigil_logging::{log_lifecycle_event, LifecycleOutcome};
use vigil_msg::{Broker, Destination, MessagingError, PublishOptions, TopicRegistration};

use crate::config::GatewayConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{GatewayError, Result};
use crate::listener::{
    AlarmListener, BroadcastMessageListener, ConnectionListener, HeartbeatListener,
    RequestReportListener, SupervisionListener, TagUpdateListener,
};
use crate::metrics::{GatewayMetrics, SharedRegistry};
use crate::request::RequestDispatcher;
use crate::supervision::{
    AlarmDispatcher, BroadcastDispatcher, HeartbeatDispatcher, SubscriptionMode,
    SupervisionDispatcher,
};
use crate::tag_update::{TagUpdateDispatcher, TagUpdateHandler};

/// Client gateway over one broker connection.
pub struct Gateway {
    config: GatewayConfig,
    connection: Arc<ConnectionManager>,
    tags: Arc<TagUpdateDispatcher>,
    supervision: Arc<SupervisionDispatcher>,
    heartbeats: Arc<HeartbeatDispatcher>,
    broadcasts: Arc<BroadcastDispatcher>,
    alarms: Arc<AlarmDispatcher>,
    requests: RequestDispatcher,
    metrics: Option<GatewayMetrics>,
}

impl Gateway {
    /// Build a gateway without metrics. Must be called inside a tokio runtime.
    pub fn new(broker: Arc<dyn Broker>, config: GatewayConfig) -> Result<Self> {
        Self::build(broker, config, None)
    }

    /// Build a gateway whose metrics are registered in `registry`.
    pub fn with_metrics(
        broker: Arc<dyn Broker>,
        config: GatewayConfig,
        registry: SharedRegistry,
    ) -> Result<Self> {
        let metrics = GatewayMetrics::register(registry)?;
        Self::build(broker, config, Some(metrics))
    }

    fn build(
        broker: Arc<dyn Broker>,
        config: GatewayConfig,
        metrics: Option<GatewayMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let connection = ConnectionManager::new(broker, config.reconnect, metrics.clone())?;

        // Refreshers reattach in creation order: tag topics first, then the
        // well-known topics.
        let tags = TagUpdateDispatcher::new(
            connection.clone(),
            TagUpdateHandler::new(metrics.clone()),
            metrics.clone(),
        );
        let supervision = SupervisionDispatcher::new(
            config.supervision_topic.clone(),
            SubscriptionMode::Eager,
            connection.clone(),
            metrics.clone(),
        );
        let heartbeats = HeartbeatDispatcher::new(
            config.heartbeat_topic.clone(),
            SubscriptionMode::Eager,
            connection.clone(),
            metrics.clone(),
        );
        let broadcasts = BroadcastDispatcher::new(
            config.broadcast_topic.clone(),
            SubscriptionMode::Eager,
            connection.clone(),
            metrics.clone(),
        );
        let alarms = AlarmDispatcher::new(
            config.alarm_topic.clone(),
            SubscriptionMode::Lazy,
            connection.clone(),
            metrics.clone(),
        );
        let requests =
            RequestDispatcher::new(connection.clone(), config.reply_ttl_factor, metrics.clone());

        Ok(Self {
            config,
            connection,
            tags,
            supervision,
            heartbeats,
            broadcasts,
            alarms,
            requests,
            metrics,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Metrics handle, when the gateway was built with one.
    pub fn metrics(&self) -> Option<&GatewayMetrics> {
        self.metrics.as_ref()
    }

    /// Connect to the broker and attach the lifetime subscriptions. When the
    /// first attempt fails the gateway keeps reconnecting in the background
    /// and the error is returned.
    pub async fn start(&self) -> Result<()> {
        info!(broker = self.connection.broker().name(), "starting gateway");
        self.connection.start().await
    }

    /// Stop for good: drop every listener, release every subscription, then
    /// close the connection. Each step runs even if an earlier one failed;
    /// the first failure is returned.
    pub async fn stop(&self) -> Result<()> {
        if !self.connection.mark_shutdown() {
            return Ok(());
        }

        self.tags.clear_listeners();
        self.supervision.clear_listeners();
        self.heartbeats.clear_listeners();
        self.broadcasts.clear_listeners();
        self.alarms.clear_listeners();
        self.connection.clear_listeners();

        let mut first_error: Option<GatewayError> = None;
        for teardown in [
            self.tags.teardown(),
            self.supervision.teardown(),
            self.heartbeats.teardown(),
            self.broadcasts.teardown(),
            self.alarms.teardown(),
        ] {
            if let Err(err) = teardown {
                warn!(error = %err, "subscription teardown failed during stop");
                first_error.get_or_insert(err);
            }
        }
        if let Err(err) = self.connection.close().await {
            warn!(error = %err, "closing the broker connection failed");
            first_error.get_or_insert(err);
        }

        let outcome = if first_error.is_some() {
            LifecycleOutcome::Fault
        } else {
            LifecycleOutcome::Success
        };
        log_lifecycle_event("gateway.stop", "gateway stopped", outcome);
        first_error.map_or(Ok(()), Err)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Bind a tag listener to the registration's topic and tag id.
    pub async fn register_update_listener(
        &self,
        listener: Arc<dyn TagUpdateListener>,
        registration: &TopicRegistration,
    ) -> Result<bool> {
        self.tags.register(listener, registration).await
    }

    /// Remove a tag listener. Returns `false` if it was not registered.
    pub fn unregister_update_listener(&self, listener: &Arc<dyn TagUpdateListener>) -> bool {
        self.tags.unregister(listener)
    }

    /// Hand `old`'s binding to `new` without touching the broker subscription.
    pub fn replace_listener(
        &self,
        old: &Arc<dyn TagUpdateListener>,
        new: Arc<dyn TagUpdateListener>,
    ) -> Result<()> {
        self.tags.replace(old, new)
    }

    /// Whether a tag listener is bound to any topic.
    pub fn is_registered(&self, listener: &Arc<dyn TagUpdateListener>) -> bool {
        self.tags.is_registered(listener)
    }

    /// Number of tag listeners bound to each topic.
    pub fn topic_listener_counts(&self) -> HashMap<String, usize> {
        self.tags.topic_listener_counts()
    }

    /// Add a supervision listener.
    pub async fn register_supervision_listener(
        &self,
        listener: Arc<dyn SupervisionListener>,
    ) -> Result<bool> {
        self.supervision.register(listener).await
    }

    /// Remove a supervision listener.
    pub fn unregister_supervision_listener(&self, listener: &Arc<dyn SupervisionListener>) -> bool {
        self.supervision.unregister(listener)
    }

    /// Add a heartbeat listener.
    pub async fn register_heartbeat_listener(
        &self,
        listener: Arc<dyn HeartbeatListener>,
    ) -> Result<bool> {
        self.heartbeats.register(listener).await
    }

    /// Remove a heartbeat listener.
    pub fn unregister_heartbeat_listener(&self, listener: &Arc<dyn HeartbeatListener>) -> bool {
        self.heartbeats.unregister(listener)
    }

    /// Add a listener for administrative broadcasts.
    pub async fn register_broadcast_message_listener(
        &self,
        listener: Arc<dyn BroadcastMessageListener>,
    ) -> Result<bool> {
        self.broadcasts.register(listener).await
    }

    /// Remove a broadcast listener.
    pub fn unregister_broadcast_message_listener(
        &self,
        listener: &Arc<dyn BroadcastMessageListener>,
    ) -> bool {
        self.broadcasts.unregister(listener)
    }

    /// Add an alarm listener; the first one subscribes the alarm topic.
    pub async fn register_alarm_listener(&self, listener: Arc<dyn AlarmListener>) -> Result<bool> {
        self.alarms.register(listener).await
    }

    /// Remove an alarm listener; the last one releases the alarm topic.
    pub fn unregister_alarm_listener(&self, listener: &Arc<dyn AlarmListener>) -> bool {
        self.alarms.unregister(listener)
    }

    /// Add a connection listener. It is told the current state immediately.
    pub fn register_connection_listener(
        &self,
        listener: Arc<dyn ConnectionListener>,
    ) -> Result<bool> {
        if self.connection.state() == ConnectionState::Shutdown {
            return Err(GatewayError::Shutdown);
        }
        Ok(self.connection.register_listener(listener))
    }

    /// Remove a connection listener.
    pub fn unregister_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.connection.unregister_listener(listener)
    }

    /// Send `request` to `destination` and wait up to `timeout` for the
    /// result collection.
    pub async fn send<Req, T>(
        &self,
        request: &Req,
        destination: &str,
        timeout: Duration,
    ) -> Result<Vec<T>>
    where
        Req: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.requests.send(request, destination, timeout).await
    }

    /// Like [`send`](Self::send), reporting progress and server errors to
    /// `listener` while waiting.
    pub async fn send_with_progress<Req, T>(
        &self,
        request: &Req,
        destination: &str,
        timeout: Duration,
        listener: Arc<dyn RequestReportListener>,
    ) -> Result<Vec<T>>
    where
        Req: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.requests
            .send_with_progress(request, destination, timeout, listener)
            .await
    }

    /// Send to the configured request queue with the configured timeout.
    pub async fn send_default<Req, T>(&self, request: &Req) -> Result<Vec<T>>
    where
        Req: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        self.requests
            .send(request, &self.config.request_queue, self.config.request_timeout)
            .await
    }

    /// Publish a text message to `topic` with the configured topic lifetime.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        match self.connection.state() {
            ConnectionState::Connected => {}
            ConnectionState::Shutdown => return Err(GatewayError::Shutdown),
            _ => return Err(GatewayError::NotConnected),
        }
        let options = PublishOptions::default().with_ttl(self.config.topic_message_ttl);
        let published = self
            .connection
            .broker()
            .publish(&Destination::Topic(topic.to_string()), payload, options)
            .await;
        if let Err(err) = published {
            warn!(topic, error = %err, "failed to publish to topic");
            if matches!(err, MessagingError::Transport(_) | MessagingError::NotConnected) {
                self.connection.on_transport_failure(err.clone());
            }
            return Err(err.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("connection", &self.connection)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
