// Fire-and-confirm publishing
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::brokers::OutboundMessage;
use crate::connection::ConnectionManager;
use crate::error::{EventBusError, Result, TransportError};
use crate::event::{Envelope, EventKind};
use crate::routing::Route;

/// Publishes envelopes and waits for the broker confirm.
///
/// Writes are serialised on one lock, so publishes from this instance reach
/// the broker in call order. Nothing is buffered while disconnected.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    write_lock: Mutex<()>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            write_lock: Mutex::new(()),
        }
    }

    /// Stamp a new envelope for `kind` and publish it.
    ///
    /// # Errors
    /// `UnknownRoute` before any I/O when `kind` is not routed,
    /// `Transport` when the bus is unhealthy, the confirm times out or the
    /// broker refuses the message.
    pub async fn publish(&self, kind: EventKind, payload: Value) -> Result<Envelope> {
        let route = self.connection.routes().route(kind)?;
        let envelope = Envelope::new(kind, payload);
        self.send(route, &envelope).await?;
        Ok(envelope)
    }

    /// Publish an existing envelope unchanged, keeping its `deliveryId` and
    /// `occurredAt`.
    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<()> {
        let route = self.connection.routes().route(envelope.kind())?;
        self.send(route, envelope).await
    }

    async fn send(&self, route: &Route, envelope: &Envelope) -> Result<()> {
        if self.connection.is_closed() {
            return Err(TransportError::Closed.into());
        }
        if !self.connection.is_healthy() {
            return Err(TransportError::NotConnected.into());
        }

        let message = OutboundMessage {
            message_id: envelope.delivery_id().to_string(),
            timestamp_millis: envelope.occurred_at_millis(),
            body: envelope.encode()?,
        };

        let _guard = self.write_lock.lock().await;
        let channel = self
            .connection
            .channel()
            .ok_or(EventBusError::Transport(TransportError::NotConnected))?;

        let timeout = self.connection.config().ack_timeout();
        let outcome = tokio::time::timeout(
            timeout,
            channel.publish(&route.exchange.name, &route.routing_key, message),
        )
        .await
        .map_err(|_| EventBusError::Transport(TransportError::Timeout(timeout)))
        .and_then(|confirmed| confirmed);

        match outcome {
            Ok(()) => {
                debug!(
                    kind = %envelope.kind(),
                    delivery_id = %envelope.delivery_id(),
                    routing_key = %route.routing_key,
                    "Event published"
                );
                Ok(())
            }
            Err(EventBusError::Transport(err)) => {
                warn!(kind = %envelope.kind(), error = %err, "Publish failed");
                if !matches!(err, TransportError::Nacked(_)) {
                    self.connection.report_failure(&err);
                }
                Err(err.into())
            }
            Err(err) => Err(err),
        }
    }
}
