//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! Synchronous request/reply emulated over one-way queues.
//!
//! Every call gets its own ephemeral reply address and an absolute
//! deadline fixed at entry. The address is released exactly once: when a
//! terminal reply is consumed, when the deadline passes, or when the
//! pending request is dropped.
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::debug;
use vigil_logging::{gw_warn, LogContext};
use vigil_msg::{
    encode, log_message, Broker, Destination, EphemeralAddress, Envelope, MessageDirection,
    MessagingError, PublishOptions,
};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{GatewayError, Result};
use crate::listener::RequestReportListener;
use crate::metrics::GatewayMetrics;
use crate::progress::ProgressStreamDecoder;

/// One request waiting for its reply stream.
pub struct PendingRequest {
    broker: Arc<dyn Broker>,
    destination: String,
    timeout: Duration,
    deadline: Instant,
    reply: EphemeralAddress,
    undecodable_replies: usize,
    resolved: bool,
}

impl PendingRequest {
    /// Queue the request was published to.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Reply address allocated for this call.
    pub fn reply_address(&self) -> &str {
        &self.reply.address
    }

    /// Absolute deadline of the call.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the reply address has been released.
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Wait for the next reply payload. Returns `None` once the deadline
    /// has passed or the request is already resolved.
    pub async fn next_reply(&mut self) -> Option<String> {
        if self.resolved {
            return None;
        }
        match timeout_at(self.deadline, self.reply.messages.recv()).await {
            Ok(Some(delivery)) => {
                log_message(MessageDirection::Reply, &self.reply.address, &delivery.payload);
                Some(delivery.payload)
            }
            Ok(None) => {
                // The broker dropped the address with the connection. A
                // reconnect does not revive it, so only the deadline is left.
                debug!(
                    destination = %self.destination,
                    "reply channel closed, waiting for deadline"
                );
                sleep_until(self.deadline).await;
                None
            }
            Err(_) => None,
        }
    }

    /// Count a reply that could not be decoded.
    pub fn note_undecodable(&mut self) {
        self.undecodable_replies += 1;
    }

    /// Release the reply address. Returns `false` if it was already released.
    pub fn resolve(&mut self) -> bool {
        if self.resolved {
            return false;
        }
        self.resolved = true;
        self.broker.release_ephemeral_address(&self.reply.address);
        self.reply.messages.close();
        true
    }

    /// Resolve the request as timed out.
    pub fn timeout_error(&mut self) -> GatewayError {
        self.resolve();
        GatewayError::RequestTimeout {
            destination: self.destination.clone(),
            timeout: self.timeout,
            undecodable_replies: self.undecodable_replies,
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.resolve();
    }
}

/// Publishes requests and hands back their pending reply streams.
pub struct RequestDispatcher {
    connection: Arc<ConnectionManager>,
    reply_ttl_factor: u32,
    metrics: Option<GatewayMetrics>,
}

impl RequestDispatcher {
    /// Create a dispatcher. Requests live for `reply_ttl_factor` times their
    /// timeout on the broker.
    pub fn new(
        connection: Arc<ConnectionManager>,
        reply_ttl_factor: u32,
        metrics: Option<GatewayMetrics>,
    ) -> Self {
        Self {
            connection,
            reply_ttl_factor: reply_ttl_factor.max(1),
            metrics,
        }
    }

    /// Publish `request` to `destination` and return the call waiting for
    /// its replies.
    pub async fn dispatch<Req>(
        &self,
        request: &Req,
        destination: &str,
        timeout: Duration,
    ) -> Result<PendingRequest>
    where
        Req: Serialize + ?Sized + Sync,
    {
        if destination.trim().is_empty() {
            return Err(GatewayError::InvalidRegistration(
                "request destination must not be empty".into(),
            ));
        }
        if timeout.is_zero() {
            return Err(GatewayError::InvalidRegistration(
                "request timeout must be positive".into(),
            ));
        }
        let deadline = Instant::now() + timeout;
        match self.connection.state() {
            ConnectionState::Connected => {}
            ConnectionState::Shutdown => return Err(GatewayError::Shutdown),
            _ => return Err(GatewayError::NotConnected),
        }

        let payload = encode(&Envelope::new(request))?;
        let broker = self.connection.broker().clone();
        let reply = broker.create_ephemeral_address().await?;
        let mut pending = PendingRequest {
            broker: broker.clone(),
            destination: destination.to_string(),
            timeout,
            deadline,
            reply,
            undecodable_replies: 0,
            resolved: false,
        };

        let options = PublishOptions::default()
            .with_reply_to(pending.reply.address.clone())
            .with_ttl(timeout.saturating_mul(self.reply_ttl_factor));
        let queue = Destination::Queue(destination.to_string());
        let published = timeout_at(deadline, broker.publish(&queue, &payload, options)).await;
        match published {
            Ok(Ok(())) => {
                log_message(MessageDirection::Outbound, destination, &payload);
                Ok(pending)
            }
            Ok(Err(err)) => {
                pending.resolve();
                let ctx = LogContext::new().with_destination(destination);
                gw_warn!(context = ctx, "failed to publish request: {}", err);
                if matches!(err, MessagingError::Transport(_) | MessagingError::NotConnected) {
                    self.connection.on_transport_failure(err.clone());
                }
                Err(err.into())
            }
            Err(_) => Err(pending.timeout_error()),
        }
    }

    /// Send `request` and wait for its result collection. Progress reports
    /// on the reply channel are skipped.
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
        let decoder = ProgressStreamDecoder::new(None, self.metrics.clone());
        self.round_trip(request, destination, timeout, &decoder).await
    }

    /// Send `request` and report intermediate progress to `listener`.
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
        let decoder = ProgressStreamDecoder::new(Some(listener), self.metrics.clone());
        self.round_trip(request, destination, timeout, &decoder).await
    }

    async fn round_trip<Req, T>(
        &self,
        request: &Req,
        destination: &str,
        timeout: Duration,
        decoder: &ProgressStreamDecoder,
    ) -> Result<Vec<T>>
    where
        Req: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let started = Instant::now();
        let outcome = match self.dispatch(request, destination, timeout).await {
            Ok(mut pending) => decoder.drive(&mut pending).await,
            Err(err) => Err(err),
        };
        if let Some(metrics) = &self.metrics {
            let label = match &outcome {
                Ok(_) => "success",
                Err(err) => err.outcome_label(),
            };
            metrics.observe_request(label, started.elapsed());
        }
        outcome
    }
}
