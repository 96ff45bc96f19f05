//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! Listener callbacks and the identity-keyed sets that hold them.
//!
//! Listeners are owned by the application and shared with the gateway as
//! `Arc`s. Two structurally identical listeners are still two subscribers:
//! membership is decided by allocation identity, never by value.
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use vigil_logging::{gw_error, LogContext};
use vigil_msg::{
    AlarmValue, BroadcastMessage, ErrorReport, Heartbeat, ProgressReport, SupervisionEvent,
    TagValueUpdate,
};

use crate::metrics::GatewayMetrics;

/// Receives value updates for the tag it is bound to.
pub trait TagUpdateListener: Send + Sync {
    /// Called once per update. The return value is for the listener's own
    /// bookkeeping and is ignored by the gateway.
    fn on_update(&self, update: &TagValueUpdate) -> bool;
}

/// Receives supervision events.
pub trait SupervisionListener: Send + Sync {
    /// Called once per event of every delivered batch.
    fn on_supervision_event(&self, event: &SupervisionEvent);
}

/// Receives server heartbeats.
pub trait HeartbeatListener: Send + Sync {
    /// Called once per heartbeat.
    fn on_heartbeat(&self, heartbeat: &Heartbeat);
}

/// Receives alarm updates.
pub trait AlarmListener: Send + Sync {
    /// Called once per alarm update.
    fn on_alarm(&self, alarm: &AlarmValue);
}

/// Receives administrative broadcasts.
pub trait BroadcastMessageListener: Send + Sync {
    /// Called once per broadcast.
    fn on_broadcast(&self, message: &BroadcastMessage);
}

/// Follows the broker connection.
pub trait ConnectionListener: Send + Sync {
    /// The connection is (again) usable and subscriptions are attached.
    fn on_connect(&self);
    /// The connection was lost or has not been established yet.
    fn on_disconnect(&self);
}

/// Follows a long-running request.
pub trait RequestReportListener: Send + Sync {
    /// An intermediate progress report arrived.
    fn on_progress(&self, report: &ProgressReport);
    /// The server reported a terminal failure.
    fn on_error(&self, report: &ErrorReport);
}

impl<F> TagUpdateListener for F
where
    F: Fn(&TagValueUpdate) -> bool + Send + Sync,
{
    fn on_update(&self, update: &TagValueUpdate) -> bool {
        self(update)
    }
}

impl<F> SupervisionListener for F
where
    F: Fn(&SupervisionEvent) + Send + Sync,
{
    fn on_supervision_event(&self, event: &SupervisionEvent) {
        self(event)
    }
}

impl<F> HeartbeatListener for F
where
    F: Fn(&Heartbeat) + Send + Sync,
{
    fn on_heartbeat(&self, heartbeat: &Heartbeat) {
        self(heartbeat)
    }
}

impl<F> AlarmListener for F
where
    F: Fn(&AlarmValue) + Send + Sync,
{
    fn on_alarm(&self, alarm: &AlarmValue) {
        self(alarm)
    }
}

impl<F> BroadcastMessageListener for F
where
    F: Fn(&BroadcastMessage) + Send + Sync,
{
    fn on_broadcast(&self, message: &BroadcastMessage) {
        self(message)
    }
}

/// Identity of a shared listener: the address of its allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(usize);

impl ListenerKey {
    /// Key of the allocation behind `listener`.
    pub fn of<L: ?Sized>(listener: &Arc<L>) -> Self {
        Self(Arc::as_ptr(listener) as *const () as usize)
    }
}

/// Ordered set of listeners keyed by identity.
///
/// The set keeps its `Arc`s alive, so a key cannot be reused by another
/// allocation while its listener is a member.
pub struct ListenerSet<L: ?Sized> {
    entries: Vec<Arc<L>>,
}

impl<L: ?Sized> ListenerSet<L> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Add a listener. Returns `false` if this exact listener is already present.
    pub fn insert(&mut self, listener: Arc<L>) -> bool {
        if self.contains(&listener) {
            return false;
        }
        self.entries.push(listener);
        true
    }

    /// Remove a listener. Returns `false` if it was not present.
    pub fn remove(&mut self, listener: &Arc<L>) -> bool {
        let key = ListenerKey::of(listener);
        let before = self.entries.len();
        self.entries.retain(|entry| ListenerKey::of(entry) != key);
        self.entries.len() != before
    }

    /// Whether this exact listener is present.
    pub fn contains(&self, listener: &Arc<L>) -> bool {
        let key = ListenerKey::of(listener);
        self.entries.iter().any(|entry| ListenerKey::of(entry) == key)
    }

    /// Copy of the current members in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.entries.clone()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set has no members.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every member.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener families, used for log context and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Tag value updates.
    Tag,
    /// Supervision events.
    Supervision,
    /// Server heartbeats.
    Heartbeat,
    /// Alarm updates.
    Alarm,
    /// Administrative broadcasts.
    Broadcast,
    /// Connection state changes.
    Connection,
    /// Request progress and error reports.
    Report,
}

impl ListenerKind {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerKind::Tag => "tag",
            ListenerKind::Supervision => "supervision",
            ListenerKind::Heartbeat => "heartbeat",
            ListenerKind::Alarm => "alarm",
            ListenerKind::Broadcast => "broadcast",
            ListenerKind::Connection => "connection",
            ListenerKind::Report => "report",
        }
    }
}

/// Invoke one listener callback, containing a panic to that call.
///
/// Returns `None` when the callback panicked; the failure is logged with
/// `context` and counted under `kind`.
pub fn guarded<R>(
    kind: ListenerKind,
    context: &LogContext<'_>,
    metrics: Option<&GatewayMetrics>,
    call: impl FnOnce() -> R,
) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let ctx = context.clone().with_listener(kind.as_str());
            gw_error!(
                context = ctx,
                "listener callback failed: {}",
                panic_message(payload.as_ref())
            );
            if let Some(metrics) = metrics {
                metrics.inc_listener_failure(kind.as_str());
            }
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}
