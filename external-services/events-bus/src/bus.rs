// Bus client: the single entry point a service holds
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::brokers::{AmqpConnector, BrokerConnector};
use crate::config::BusConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::Result;
use crate::event::{Envelope, EventKind};
use crate::handlers::EventHandler;
use crate::publisher::Publisher;
use crate::routing::RoutingTable;
use crate::subscriber::{Dispatcher, SubscriptionState};

/// Connection manager, publisher and dispatcher behind one handle.
///
/// Cheap to clone; every clone shares the same connection.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<BusInner>,
}

struct BusInner {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    dispatcher: Dispatcher,
}

impl BusClient {
    /// Connect to RabbitMQ at `config.url`.
    pub async fn connect(config: BusConfig, routes: RoutingTable) -> Result<Self> {
        let connector = AmqpConnector::new().with_connection_name(&config.service_name);
        Self::connect_with(Arc::new(connector), config, routes).await
    }

    /// Connect through any transport, e.g. [`MemoryBroker`](crate::brokers::MemoryBroker).
    pub async fn connect_with(
        connector: Arc<dyn BrokerConnector>,
        config: BusConfig,
        routes: RoutingTable,
    ) -> Result<Self> {
        let service = config.service_name.clone();
        let connection = Arc::new(ConnectionManager::connect(connector, config, routes).await?);
        info!(service = %service, routes = connection.routes().len(), "Bus client ready");

        Ok(Self {
            inner: Arc::new(BusInner {
                publisher: Publisher::new(connection.clone()),
                dispatcher: Dispatcher::new(connection.clone()),
                connection,
            }),
        })
    }

    /// Publish `payload` as `kind` and wait for the broker confirm.
    /// Returns the envelope that was sent.
    pub async fn publish(&self, kind: EventKind, payload: Value) -> Result<Envelope> {
        self.inner.publisher.publish(kind, payload).await
    }

    /// Serialize a typed payload and publish it.
    pub async fn publish_as<T: Serialize>(&self, kind: EventKind, payload: &T) -> Result<Envelope> {
        let payload = serde_json::to_value(payload)?;
        self.publish(kind, payload).await
    }

    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.inner.publisher.publish_envelope(envelope).await
    }

    pub async fn subscribe<H: EventHandler>(&self, kind: EventKind, handler: H) -> Result<()> {
        self.inner.dispatcher.subscribe(kind, handler).await
    }

    pub async fn unsubscribe(&self, kind: EventKind) -> Result<()> {
        self.inner.dispatcher.unsubscribe(kind).await
    }

    pub fn subscription_state(&self, kind: EventKind) -> SubscriptionState {
        self.inner.dispatcher.subscription_state(kind)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.in_flight()
    }

    /// Safe to call from liveness endpoints: never blocks, never fails.
    pub fn is_healthy(&self) -> bool {
        self.inner.connection.is_healthy()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn routes(&self) -> &RoutingTable {
        self.inner.connection.routes()
    }

    pub fn config(&self) -> &BusConfig {
        self.inner.connection.config()
    }

    /// Drain consumers (bounded by `drain_timeout`), then close the
    /// connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.inner.dispatcher.shutdown().await;
        self.inner.connection.close().await
    }
}
