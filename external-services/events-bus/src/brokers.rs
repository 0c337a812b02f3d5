// Broker transports (AMQP, in-memory)
//
// The connection manager, publisher and dispatcher only talk to these traits,
// so the same lifecycle runs against RabbitMQ in production and against
// `MemoryBroker` in tests.
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::routing::ExchangeKind;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpConnector;
pub use memory::MemoryBroker;

/// Queue flavour. Quorum queues count redeliveries on the message
/// (`x-delivery-count`), so the retry limit holds across replicas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    #[default]
    Classic,
    Quorum,
}

/// Opens one transport connection with a single channel.
#[async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerChannel>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub timestamp_millis: i64,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> std::result::Result<(), TransportError>;
    async fn nack(&self, requeue: bool) -> std::result::Result<(), TransportError>;
}

pub struct InboundDelivery {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub redelivered: bool,
    /// Previous delivery attempts, when the broker tracks them
    /// (`x-delivery-count` on quorum queues).
    pub delivery_count: Option<u32>,
    pub acker: Box<dyn DeliveryAcker>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("delivery_count", &self.delivery_count)
            .field("len", &self.body.len())
            .finish()
    }
}

/// Ends when the consumer is cancelled or the channel goes away.
pub type DeliveryStream = BoxStream<'static, std::result::Result<InboundDelivery, TransportError>>;

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Connection and channel are both open. Must not block.
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
        queue_type: QueueType,
    ) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Returns once the broker confirmed the message.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
