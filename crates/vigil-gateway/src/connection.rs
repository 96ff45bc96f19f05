//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! Ownership of the single broker connection.
//!
//! State transitions happen under one lock, so a burst of failure reports
//! for the same outage produces exactly one disconnect notification and
//! one reconnect loop. The loop retries with jittered exponential backoff
//! until it succeeds or the manager is shut down.
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use vigil_logging::{log_lifecycle_event, LifecycleOutcome, LogContext};
use vigil_msg::{Broker, MessagingError};

use crate::config::ReconnectConfig;
use crate::error::{GatewayError, Result};
use crate::listener::{guarded, ConnectionListener, ListenerKind, ListenerSet};
use crate::metrics::GatewayMetrics;

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected; a reconnect loop may be waiting.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected with subscriptions attached.
    Connected,
    /// Stopped for good.
    Shutdown,
}

impl ConnectionState {
    /// Stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component holding broker subscriptions that must survive reconnection.
#[async_trait]
pub trait SubscriptionRefresher: Send + Sync {
    /// The broker dropped every consumer; forget them.
    fn connection_lost(&self);

    /// Attach every subscription that is tracked but not attached.
    async fn reattach(&self) -> Result<()>;
}

#[derive(Clone, Copy)]
enum Notification {
    Connect,
    Disconnect,
}

/// How a connection attempt ended once the broker accepted it.
enum Attempt {
    Connected,
    /// The link dropped while subscriptions were being attached.
    Lost(MessagingError),
    Stopped,
}

/// Owns the broker connection and drives reconnection.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    policy: ReconnectConfig,
    metrics: Option<GatewayMetrics>,
    runtime: Handle,
    state: Mutex<ConnectionState>,
    // Failure reported during `Connecting`; only touched with `state` held.
    pending_failure: Mutex<Option<MessagingError>>,
    listeners: Mutex<ListenerSet<dyn ConnectionListener>>,
    refreshers: Mutex<Vec<Weak<dyn SubscriptionRefresher>>>,
    shutdown: watch::Sender<bool>,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    /// Create a manager for `broker`. Must be called inside a tokio runtime;
    /// the runtime is kept for reconnect loops triggered from broker threads.
    pub fn new(
        broker: Arc<dyn Broker>,
        policy: ReconnectConfig,
        metrics: Option<GatewayMetrics>,
    ) -> Result<Arc<Self>> {
        let runtime = Handle::try_current().map_err(|_| {
            GatewayError::Config("the gateway must be created inside a tokio runtime".into())
        })?;
        let (shutdown, _) = watch::channel(false);
        let manager = Arc::new_cyclic(|this| Self {
            broker,
            policy,
            metrics,
            runtime,
            state: Mutex::new(ConnectionState::Disconnected),
            pending_failure: Mutex::new(None),
            listeners: Mutex::new(ListenerSet::new()),
            refreshers: Mutex::new(Vec::new()),
            shutdown,
            this: this.clone(),
        });

        let weak = Arc::downgrade(&manager);
        manager.broker.set_failure_handler(Arc::new(move |cause| {
            if let Some(manager) = weak.upgrade() {
                manager.on_transport_failure(cause);
            }
        }));
        Ok(manager)
    }

    /// Broker behind this connection.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Whether the connection is usable.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Track a component whose subscriptions are rebuilt after reconnection.
    /// Refreshers run in registration order.
    pub fn add_refresher<R: SubscriptionRefresher + 'static>(&self, refresher: &Arc<R>) {
        let weak = Arc::downgrade(refresher);
        let weak: Weak<dyn SubscriptionRefresher> = weak;
        self.refreshers.lock().push(weak);
    }

    /// Open the connection. On failure a background reconnect loop is
    /// scheduled and the error is returned.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Shutdown => return Err(GatewayError::Shutdown),
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Disconnected => {
                    *state = ConnectionState::Connecting;
                    self.pending_failure.lock().take();
                }
            }
        }

        match self.establish().await {
            Ok(()) => match self.finish_connecting() {
                Attempt::Connected => {
                    let late = self.reattach_all().await;
                    log_lifecycle_event(
                        "connection.open",
                        &format!("connected via {}", self.broker.name()),
                        LifecycleOutcome::Success,
                    );
                    self.notify(Notification::Connect);
                    if let Err(GatewayError::Transport(cause)) = late {
                        self.on_transport_failure(cause);
                    }
                    Ok(())
                }
                Attempt::Lost(cause) => {
                    log_lifecycle_event(
                        "connection.open",
                        &format!("connection lost while attaching subscriptions: {cause}"),
                        LifecycleOutcome::Fault,
                    );
                    self.refresh_lost();
                    self.spawn_reconnect();
                    Err(GatewayError::Transport(cause))
                }
                Attempt::Stopped => Err(GatewayError::Shutdown),
            },
            Err(err) => {
                log_lifecycle_event(
                    "connection.open",
                    &format!("initial connection failed: {err}"),
                    LifecycleOutcome::Fault,
                );
                self.refresh_lost();
                if self.transition(ConnectionState::Connecting, ConnectionState::Disconnected) {
                    self.spawn_reconnect();
                }
                Err(err)
            }
        }
    }

    /// Handle a connection failure reported by the broker or a component.
    ///
    /// Safe to call concurrently and repeatedly; only the call that moves the
    /// state out of `Connected` acts on it. A report arriving while a
    /// connection attempt is in flight fails that attempt instead.
    pub fn on_transport_failure(&self, cause: MessagingError) {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Connected => *state = ConnectionState::Disconnected,
                ConnectionState::Connecting => {
                    debug!(error = %cause, "transport failure during connection attempt");
                    self.pending_failure.lock().get_or_insert(cause);
                    return;
                }
                _ => {
                    debug!(state = %*state, error = %cause, "ignoring transport failure report");
                    return;
                }
            }
        }
        log_lifecycle_event(
            "connection.lost",
            &format!("transport failure: {cause}"),
            LifecycleOutcome::Fault,
        );
        self.refresh_lost();
        self.notify(Notification::Disconnect);
        self.spawn_reconnect();
    }

    /// Add a listener and replay the current state to it: `on_connect` when
    /// connected, `on_disconnect` otherwise. Returns `false` if it was
    /// already registered.
    pub fn register_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        if !self.listeners.lock().insert(listener.clone()) {
            return false;
        }
        let ctx = LogContext::new();
        let connected = self.is_connected();
        guarded(
            ListenerKind::Connection,
            &ctx,
            self.metrics.as_ref(),
            || {
                if connected {
                    listener.on_connect()
                } else {
                    listener.on_disconnect()
                }
            },
        );
        true
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn unregister_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.listeners.lock().remove(listener)
    }

    /// Whether `listener` is registered.
    pub fn is_listener_registered(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.listeners.lock().contains(listener)
    }

    /// Drop every connection listener.
    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    /// Enter the terminal state and cancel any reconnect loop. Returns
    /// `false` if the manager was already shut down.
    pub fn mark_shutdown(&self) -> bool {
        let previous = std::mem::replace(&mut *self.state.lock(), ConnectionState::Shutdown);
        let _ = self.shutdown.send(true);
        previous != ConnectionState::Shutdown
    }

    /// Close the broker connection.
    pub async fn close(&self) -> Result<()> {
        self.broker.close().await?;
        log_lifecycle_event(
            "connection.close",
            "broker connection closed",
            LifecycleOutcome::Success,
        );
        Ok(())
    }

    /// Shut down and close the connection. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.mark_shutdown() {
            return Ok(());
        }
        self.close().await
    }

    async fn establish(&self) -> Result<()> {
        self.broker.connect().await?;
        self.reattach_all().await
    }

    async fn reattach_all(&self) -> Result<()> {
        let refreshers: Vec<_> = self
            .refreshers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        let mut first_error = None;
        for refresher in refreshers {
            if let Err(err) = refresher.reattach().await {
                warn!(error = %err, "failed to reattach subscriptions");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn refresh_lost(&self) {
        let refreshers: Vec<_> = self
            .refreshers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for refresher in refreshers {
            refresher.connection_lost();
        }
    }

    fn begin_connecting(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ConnectionState::Disconnected {
            return false;
        }
        *state = ConnectionState::Connecting;
        self.pending_failure.lock().take();
        true
    }

    fn finish_connecting(&self) -> Attempt {
        let mut state = self.state.lock();
        if *state != ConnectionState::Connecting {
            return Attempt::Stopped;
        }
        if let Some(cause) = self.pending_failure.lock().take() {
            *state = ConnectionState::Disconnected;
            return Attempt::Lost(cause);
        }
        *state = ConnectionState::Connected;
        Attempt::Connected
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn notify(&self, notification: Notification) {
        let listeners = self.listeners.lock().snapshot();
        let ctx = LogContext::new();
        for listener in listeners {
            guarded(
                ListenerKind::Connection,
                &ctx,
                self.metrics.as_ref(),
                || match notification {
                    Notification::Connect => listener.on_connect(),
                    Notification::Disconnect => listener.on_disconnect(),
                },
            );
        }
    }

    fn spawn_reconnect(&self) {
        if let Some(this) = self.this.upgrade() {
            self.runtime.spawn(this.reconnect_loop());
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut rng = StdRng::from_entropy();
        let mut attempt: u32 = 0;

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                return;
            }
            if !self.begin_connecting() {
                debug!(state = %self.state(), "reconnect loop yielding");
                return;
            }
            attempt += 1;
            if let Some(metrics) = &self.metrics {
                metrics.inc_reconnect_attempt();
            }
            info!(attempt, broker = self.broker.name(), "attempting broker reconnection");

            match self.establish().await {
                Ok(()) => match self.finish_connecting() {
                    Attempt::Connected => {
                        if let Some(metrics) = &self.metrics {
                            metrics.inc_reconnect();
                        }
                        // Topics registered while connecting were left detached.
                        let late = self.reattach_all().await;
                        log_lifecycle_event(
                            "connection.restored",
                            &format!("reconnected after {attempt} attempt(s)"),
                            LifecycleOutcome::Success,
                        );
                        self.notify(Notification::Connect);
                        if let Err(GatewayError::Transport(cause)) = late {
                            self.on_transport_failure(cause);
                        }
                        return;
                    }
                    Attempt::Lost(cause) => {
                        warn!(attempt, error = %cause, "connection lost while reattaching");
                        self.refresh_lost();
                    }
                    Attempt::Stopped => return,
                },
                Err(err) => {
                    warn!(attempt, error = %err, "broker reconnection attempt failed");
                    self.refresh_lost();
                    if !self.transition(ConnectionState::Connecting, ConnectionState::Disconnected)
                    {
                        return;
                    }
                }
            }

            let delay = self.policy.backoff_delay(attempt, &mut rng);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("broker", &self.broker.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use vigil_msg::InMemoryBroker;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
    }

    impl ConnectionListener for Recorder {
        fn on_connect(&self) {
            self.events.lock().push("connect");
        }

        fn on_disconnect(&self) {
            self.events.lock().push("disconnect");
        }
    }

    struct CountingRefresher {
        lost: AtomicUsize,
        reattached: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionRefresher for CountingRefresher {
        fn connection_lost(&self) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }

        async fn reattach(&self) -> Result<()> {
            self.reattached.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy() -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: Duration::ZERO,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    #[tokio::test]
    async fn start_connects_and_replays_state_to_late_listeners() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), fast_policy(), None)
            .expect("manager");

        let early = Arc::new(Recorder::default());
        assert!(manager.register_listener(early.clone()));
        manager.start().await.expect("start");
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(*early.events.lock(), vec!["disconnect", "connect"]);

        let late = Arc::new(Recorder::default());
        manager.register_listener(late.clone());
        assert_eq!(*late.events.lock(), vec!["connect"]);
        assert!(!manager.register_listener(late.clone()));
    }

    #[tokio::test]
    async fn failed_start_schedules_reconnection() {
        let broker = InMemoryBroker::new();
        broker.set_connect_failures(2);
        let manager = ConnectionManager::new(Arc::new(broker.clone()), fast_policy(), None)
            .expect("manager");

        assert!(manager.start().await.is_err());
        wait_until(|| manager.is_connected()).await;
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn redundant_failures_cause_one_cycle() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), fast_policy(), None)
            .expect("manager");
        let refresher = Arc::new(CountingRefresher {
            lost: AtomicUsize::new(0),
            reattached: AtomicUsize::new(0),
        });
        manager.add_refresher(&refresher);
        manager.start().await.expect("start");

        let recorder = Arc::new(Recorder::default());
        manager.register_listener(recorder.clone());
        recorder.events.lock().clear();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager.on_transport_failure(MessagingError::Transport("reset".into()));
                })
            })
            .collect();
        for handle in handles {
            handle.await.expect("failure task");
        }
        wait_until(|| recorder.events.lock().len() >= 2).await;
        sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(*recorder.events.lock(), vec!["disconnect", "connect"]);
        assert_eq!(refresher.lost.load(Ordering::SeqCst), 1);
        // start and reconnect each run a connect pass and a late pass
        assert_eq!(refresher.reattached.load(Ordering::SeqCst), 4);
    }

    struct DroppingRefresher {
        broker: InMemoryBroker,
        dropped: AtomicBool,
    }

    #[async_trait]
    impl SubscriptionRefresher for DroppingRefresher {
        fn connection_lost(&self) {}

        async fn reattach(&self) -> Result<()> {
            if !self.dropped.swap(true, Ordering::SeqCst) {
                self.broker.fail_connection("dropped while attaching");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failure_while_connecting_is_retried() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), fast_policy(), None)
            .expect("manager");
        let refresher = Arc::new(DroppingRefresher {
            broker: broker.clone(),
            dropped: AtomicBool::new(false),
        });
        manager.add_refresher(&refresher);
        let recorder = Arc::new(Recorder::default());
        manager.register_listener(recorder.clone());

        assert!(matches!(
            manager.start().await,
            Err(GatewayError::Transport(_))
        ));
        wait_until(|| manager.is_connected()).await;

        assert!(broker.is_connected());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(*recorder.events.lock(), vec!["disconnect", "connect"]);
    }

    #[tokio::test]
    async fn stop_is_terminal_and_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(broker.clone()), fast_policy(), None)
            .expect("manager");
        manager.start().await.expect("start");
        manager.stop().await.expect("stop");
        manager.stop().await.expect("second stop");
        assert_eq!(manager.state(), ConnectionState::Shutdown);
        assert!(!broker.is_connected());
        assert!(matches!(manager.start().await, Err(GatewayError::Shutdown)));

        manager.on_transport_failure(MessagingError::Transport("late".into()));
        assert_eq!(manager.state(), ConnectionState::Shutdown);
    }

    #[tokio::test]
    async fn stop_cancels_pending_reconnection() {
        let broker = InMemoryBroker::new();
        broker.set_connect_failures(u32::MAX);
        let policy = ReconnectConfig {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            jitter: Duration::ZERO,
        };
        let manager =
            ConnectionManager::new(Arc::new(broker.clone()), policy, None).expect("manager");
        assert!(manager.start().await.is_err());
        manager.stop().await.expect("stop");
        sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state(), ConnectionState::Shutdown);
    }

    #[test]
    fn construction_outside_runtime_is_rejected() {
        let broker = InMemoryBroker::new();
        let result = ConnectionManager::new(Arc::new(broker), fast_policy(), None);
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
