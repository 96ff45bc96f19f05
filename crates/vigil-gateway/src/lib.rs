//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
#![warn(missing_docs)]

//! Client side of the vigil messaging platform.
//!
//! [`Gateway`] turns a bare [`vigil_msg::Broker`] into request/reply calls
//! with progress streaming, refcounted topic fan-out to application
//! listeners, and a connection that reattaches every live subscription
//! after an outage.

pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod listener;
pub mod metrics;
pub mod progress;
pub mod registry;
pub mod request;
pub mod supervision;
pub mod tag_update;

pub use config::{GatewayConfig, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState, SubscriptionRefresher};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use listener::{
    AlarmListener, BroadcastMessageListener, ConnectionListener, HeartbeatListener, ListenerKey,
    ListenerKind, ListenerSet, RequestReportListener, SupervisionListener, TagUpdateListener,
};
pub use metrics::{new_registry, GatewayMetrics, SharedRegistry};
pub use progress::ProgressStreamDecoder;
pub use registry::{Binding, SubscriptionRegistry, TopicHandler};
pub use request::{PendingRequest, RequestDispatcher};
pub use supervision::{
    AlarmDispatcher, Alarms, BroadcastDispatcher, BroadcastMessages, FanoutKind,
    HeartbeatDispatcher, Heartbeats, SubscriptionMode, Supervision, SupervisionDispatcher,
    TopicFanout,
};
pub use tag_update::{TagUpdateDispatcher, TagUpdateHandler};

/// Commonly used items for applications embedding the gateway.
pub mod prelude {
    pub use super::config::GatewayConfig;
    pub use super::connection::ConnectionState;
    pub use super::error::{GatewayError, Result};
    pub use super::gateway::Gateway;
    pub use super::listener::{
        AlarmListener, BroadcastMessageListener, ConnectionListener, HeartbeatListener,
        RequestReportListener, SupervisionListener, TagUpdateListener,
    };
}
