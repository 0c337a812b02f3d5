// Connection lifecycle: initial connect, health, background reconnect, close
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::brokers::{BrokerChannel, BrokerConnector};
use crate::config::BusConfig;
use crate::error::{EventBusError, Result, TransportError};
use crate::routing::{ExchangeKind, RoutingTable};

/// Snapshot of the transport as seen by the connection manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub connected: bool,
    pub last_error: Option<String>,
    /// Failed attempts since the last successful connect.
    pub attempts: u32,
}

/// One established connection. The generation increases on every
/// reconnect, so consumers can tell a fresh session from the one they
/// were bound to.
#[derive(Clone)]
pub struct Session {
    pub generation: u64,
    pub channel: Arc<dyn BrokerChannel>,
}

/// Name of the queue collecting everything sent to a dead-letter exchange.
pub fn dead_letter_queue(exchange: &str) -> String {
    format!("{exchange}_queue")
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    connector: Arc<dyn BrokerConnector>,
    config: BusConfig,
    routes: RoutingTable,
    state: RwLock<ConnectionState>,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
    generation: AtomicU64,
    sessions: watch::Sender<Option<Session>>,
    failure: Notify,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Connect and declare the topology for `routes`.
    ///
    /// Makes `connect_attempts` immediate attempts, each bounded by
    /// `connect_timeout`. Once this returns, reconnects happen in the
    /// background until [`close`](Self::close).
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        config: BusConfig,
        routes: RoutingTable,
    ) -> Result<Self> {
        config.validate()?;

        let (sessions, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            connector,
            config,
            routes,
            state: RwLock::new(ConnectionState::default()),
            channel: RwLock::new(None),
            generation: AtomicU64::new(0),
            sessions,
            failure: Notify::new(),
            closed: AtomicBool::new(false),
            shutdown,
        });

        let attempts = shared.config.connect_attempts;
        let mut reason = String::new();
        for attempt in 1..=attempts {
            match shared.establish().await {
                Ok(()) => {
                    info!(
                        url = %shared.config.url,
                        service = %shared.config.service_name,
                        attempt,
                        "Connected to message broker"
                    );
                    let supervisor = tokio::spawn(shared.clone().supervise());
                    return Ok(Self {
                        shared,
                        supervisor: Mutex::new(Some(supervisor)),
                    });
                }
                Err(err @ EventBusError::Topology(_)) => {
                    error!(error = %err, "Broker topology conflicts with the routing table");
                    return Err(err);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Broker connection attempt failed");
                    shared.record_failure(&err);
                    reason = err.to_string();
                }
            }
        }

        Err(TransportError::Unreachable { attempts, reason }.into())
    }

    /// True only when the connection and channel are open and the manager
    /// considers the session live. Never blocks on I/O.
    pub fn is_healthy(&self) -> bool {
        self.shared.is_healthy()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.shared.routes
    }

    /// Current channel, if connected.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.shared.channel.read().clone()
    }

    /// Watch the live session; `None` while disconnected or closed.
    pub fn sessions(&self) -> watch::Receiver<Option<Session>> {
        self.shared.sessions.subscribe()
    }

    /// Tell the supervisor a call observed a transport failure, so it checks
    /// the connection now instead of at the next interval.
    pub fn report_failure(&self, err: &TransportError) {
        debug!(error = %err, "Transport failure reported");
        self.shared.failure.notify_one();
    }

    /// Stop reconnecting and release the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.shutdown.send_replace(true);

        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(err) = handle.await {
                warn!(error = %err, "Connection supervisor ended abnormally");
            }
        }

        self.shared.sessions.send_replace(None);
        let channel = self.shared.channel.write().take();
        {
            let mut state = self.shared.state.write();
            state.connected = false;
            state.last_error = None;
        }

        if let Some(channel) = channel {
            channel.close().await?;
        }
        info!(service = %self.shared.config.service_name, "Broker connection closed");
        Ok(())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.get_mut().take() {
            handle.abort();
        }
    }
}

impl Shared {
    fn is_healthy(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || !self.state.read().connected {
            return false;
        }
        self.channel_is_open()
    }

    fn channel_is_open(&self) -> bool {
        self.channel
            .read()
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }

    fn record_failure(&self, err: &EventBusError) {
        let mut state = self.state.write();
        state.connected = false;
        state.attempts = state.attempts.saturating_add(1);
        state.last_error = Some(err.to_string());
    }

    /// Open a channel, declare topology, publish the new session.
    async fn establish(&self) -> Result<()> {
        let timeout = self.config.connect_timeout();
        let channel = tokio::time::timeout(timeout, async {
            let channel = self.connector.connect(&self.config.url).await?;
            if let Err(err) = self.declare_topology(channel.as_ref()).await {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Closing half-initialised channel failed");
                }
                return Err(err);
            }
            Ok(channel)
        })
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.channel.write() = Some(channel.clone());
        {
            let mut state = self.state.write();
            state.connected = true;
            state.attempts = 0;
            state.last_error = None;
        }
        self.sessions.send_replace(Some(Session { generation, channel }));
        debug!(generation, "Broker session established");
        Ok(())
    }

    /// Idempotent; safe to repeat on every reconnect.
    async fn declare_topology(&self, channel: &dyn BrokerChannel) -> Result<()> {
        let dead_letter_exchange = self.config.dead_letter_exchange.as_deref();
        let queue_type = self.config.queue_type;
        if let Some(exchange) = dead_letter_exchange {
            let queue = dead_letter_queue(exchange);
            channel.declare_exchange(exchange, ExchangeKind::Fanout).await?;
            channel.declare_queue(&queue, None, queue_type).await?;
            channel.bind_queue(&queue, exchange, "").await?;
        }

        for exchange in self.routes.exchanges() {
            channel.declare_exchange(&exchange.name, exchange.kind).await?;
        }
        for queue in self.routes.queues().keys() {
            channel.declare_queue(queue, dead_letter_exchange, queue_type).await?;
        }
        for (kind, route) in self.routes.iter() {
            channel
                .bind_queue(&route.queue, &route.exchange.name, &route.routing_key)
                .await?;
            debug!(kind = %kind, exchange = %route.exchange.name, queue = %route.queue, "Route bound");
        }
        Ok(())
    }

    async fn mark_disconnected(&self) {
        let was_connected = {
            let mut state = self.state.write();
            let was_connected = state.connected;
            state.connected = false;
            if state.last_error.is_none() {
                state.last_error = Some("broker connection lost".to_string());
            }
            was_connected
        };
        self.sessions.send_replace(None);

        let stale = self.channel.write().take();
        if let Some(channel) = stale {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Closing stale channel failed");
            }
        }
        if was_connected {
            warn!(service = %self.config.service_name, "Broker connection lost; reconnecting in background");
        }
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.health_check_interval();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.failure.notified() => {}
                _ = shutdown.changed() => break,
            }
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            if self.channel_is_open() {
                continue;
            }

            self.mark_disconnected().await;
            if !self.reconnect(&mut shutdown).await {
                break;
            }
        }
        debug!("Connection supervisor stopped");
    }

    /// Retry with exponential backoff until connected or closed. Returns
    /// false when stopped by `close`.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let backoff = self.config.backoff();
        let mut delay = backoff.initial;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return false,
            }
            if self.closed.load(Ordering::Acquire) {
                return false;
            }

            let attempt = {
                let mut state = self.state.write();
                state.attempts = state.attempts.saturating_add(1);
                state.attempts
            };
            match self.establish().await {
                Ok(()) => {
                    info!(attempt, "Reconnected to message broker");
                    return true;
                }
                Err(err) => {
                    delay = backoff.next_delay(delay);
                    if matches!(err, EventBusError::Topology(_)) {
                        error!(attempt, error = %err, "Topology declaration failed during reconnect");
                    } else {
                        warn!(
                            attempt,
                            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %err,
                            "Reconnect attempt failed"
                        );
                    }
                    self.state.write().last_error = Some(err.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::MemoryBroker;
    use crate::routing::DEFAULT_EXCHANGE;
    use std::time::Duration;

    fn fast_config() -> BusConfig {
        BusConfig {
            backoff_initial_ms: 10,
            backoff_max_ms: 40,
            health_check_interval_ms: 10,
            connect_timeout_ms: 500,
            ..BusConfig::default()
        }
    }

    async fn connect(broker: &MemoryBroker, config: BusConfig) -> Result<ConnectionManager> {
        let routes = config.routing_table();
        ConnectionManager::connect(Arc::new(broker.clone()), config, routes).await
    }

    async fn eventually(check: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn connect_declares_topology() {
        let broker = MemoryBroker::new();
        let config = fast_config().with_dead_letter_exchange("dead_letters");
        let manager = connect(&broker, config).await.unwrap();

        assert!(manager.is_healthy());
        assert_eq!(broker.exchange_kind(DEFAULT_EXCHANGE), Some(ExchangeKind::Direct));
        assert_eq!(broker.exchange_kind("dead_letters"), Some(ExchangeKind::Fanout));
        assert!(manager.sessions().borrow().is_some());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_broker_fails_fast() {
        let broker = MemoryBroker::new();
        broker.sever();
        let result = connect(&broker, fast_config()).await;
        assert!(matches!(
            result,
            Err(EventBusError::Transport(TransportError::Unreachable { attempts: 3, .. }))
        ));
    }

    #[tokio::test]
    async fn conflicting_topology_is_fatal() {
        let broker = MemoryBroker::new();
        let channel = broker.connect("memory://").await.unwrap();
        channel
            .declare_exchange(DEFAULT_EXCHANGE, ExchangeKind::Fanout)
            .await
            .unwrap();

        let result = connect(&broker, fast_config()).await;
        assert!(matches!(result, Err(EventBusError::Topology(_))));
    }

    #[tokio::test]
    async fn health_follows_transport_and_recovers() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker, fast_config()).await.unwrap();
        let first = manager.sessions().borrow().as_ref().map(|s| s.generation);

        broker.sever();
        assert!(!manager.is_healthy());
        assert!(eventually(|| !manager.state().connected).await);

        broker.restore();
        assert!(eventually(|| manager.is_healthy()).await);
        let state = manager.state();
        assert_eq!(state.attempts, 0);
        assert!(state.last_error.is_none());

        let second = manager.sessions().borrow().as_ref().map(|s| s.generation);
        assert!(second > first);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_reconnecting() {
        let broker = MemoryBroker::new();
        let manager = connect(&broker, fast_config()).await.unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();
        assert!(!manager.is_healthy());
        assert!(manager.is_closed());

        let connections = broker.connection_count();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(broker.connection_count(), connections);
    }
}
