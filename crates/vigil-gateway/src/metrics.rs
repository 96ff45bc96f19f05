//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    self, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::error::Result;

/// Shared registry type used across components.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Metrics published by the gateway.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: SharedRegistry,
    requests_total: IntCounterVec,
    request_latency_seconds: Histogram,
    deliveries_total: IntCounterVec,
    listener_failures_total: IntCounterVec,
    decode_failures_total: IntCounterVec,
    reconnect_attempts_total: IntCounter,
    reconnects_total: IntCounter,
    active_topics: IntGauge,
}

impl GatewayMetrics {
    /// Register the gateway metric family against the provided registry.
    pub fn register(registry: SharedRegistry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new(
                "vigil_gateway_requests_total",
                "Requests sent through the gateway by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "vigil_gateway_request_latency_seconds",
                "Round trip time of completed requests",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 16)?),
        )?;
        registry.register(Box::new(request_latency_seconds.clone()))?;

        let deliveries_total = IntCounterVec::new(
            Opts::new(
                "vigil_gateway_deliveries_total",
                "Messages delivered to listeners by listener kind",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(deliveries_total.clone()))?;

        let listener_failures_total = IntCounterVec::new(
            Opts::new(
                "vigil_gateway_listener_failures_total",
                "Listener callbacks that panicked",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(listener_failures_total.clone()))?;

        let decode_failures_total = IntCounterVec::new(
            Opts::new(
                "vigil_gateway_decode_failures_total",
                "Inbound payloads that could not be decoded",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(decode_failures_total.clone()))?;

        let reconnect_attempts_total = IntCounter::with_opts(Opts::new(
            "vigil_gateway_reconnect_attempts_total",
            "Connection attempts made by the reconnect loop",
        ))?;
        registry.register(Box::new(reconnect_attempts_total.clone()))?;

        let reconnects_total = IntCounter::with_opts(Opts::new(
            "vigil_gateway_reconnects_total",
            "Outages recovered by the reconnect loop",
        ))?;
        registry.register(Box::new(reconnects_total.clone()))?;

        let active_topics = IntGauge::with_opts(Opts::new(
            "vigil_gateway_active_topics",
            "Broker topic subscriptions currently held",
        ))?;
        registry.register(Box::new(active_topics.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_latency_seconds,
            deliveries_total,
            listener_failures_total,
            decode_failures_total,
            reconnect_attempts_total,
            reconnects_total,
            active_topics,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Record a finished request.
    pub fn observe_request(&self, outcome: &str, elapsed: Duration) {
        self.requests_total.with_label_values(&[outcome]).inc();
        if outcome == "success" {
            self.request_latency_seconds.observe(elapsed.as_secs_f64());
        }
    }

    /// Count a message handed to a listener family.
    pub fn inc_delivery(&self, kind: &str) {
        self.deliveries_total.with_label_values(&[kind]).inc();
    }

    /// Count a panicking listener callback.
    pub fn inc_listener_failure(&self, kind: &str) {
        self.listener_failures_total.with_label_values(&[kind]).inc();
    }

    /// Count an undecodable payload.
    pub fn inc_decode_failure(&self, kind: &str) {
        self.decode_failures_total.with_label_values(&[kind]).inc();
    }

    /// Count one reconnection attempt.
    pub fn inc_reconnect_attempt(&self) {
        self.reconnect_attempts_total.inc();
    }

    /// Count one recovered outage.
    pub fn inc_reconnect(&self) {
        self.reconnects_total.inc();
    }

    /// Adjust the number of held topic subscriptions.
    pub fn add_active_topics(&self, delta: i64) {
        self.active_topics.add(delta);
    }
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}
