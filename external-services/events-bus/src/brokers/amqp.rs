// RabbitMQ transport over lapin
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use super::{
    BrokerChannel, BrokerConnector, DeliveryAcker, DeliveryStream, InboundDelivery, OutboundMessage, QueueType,
};
use crate::error::{EventBusError, Result, TransportError};
use crate::routing::ExchangeKind;

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const DEAD_LETTER_HEADER: &str = "x-dead-letter-exchange";
const QUEUE_TYPE_ARGUMENT: &str = "x-queue-type";

/// Connects to RabbitMQ with publisher confirms enabled on the channel.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.properties = self.properties.with_connection_name(name.to_string().into());
        self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(url, self.properties.clone())
            .await
            .map_err(transport_error)?;
        let channel = connection.create_channel().await.map_err(transport_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(transport_error)?;

        info!(channel_id = channel.id(), "AMQP channel opened with publisher confirms");
        Ok(Arc::new(AmqpChannel { connection, channel }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
        queue_type: QueueType,
    ) -> Result<()> {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = dead_letter_exchange {
            arguments.insert(
                DEAD_LETTER_HEADER.into(),
                AMQPValue::LongString(exchange.to_string().into()),
            );
        }
        // Classic queues are declared without the argument so existing
        // queues declared before it existed still match.
        if queue_type == QueueType::Quorum {
            arguments.insert(
                QUEUE_TYPE_ARGUMENT.into(),
                AMQPValue::LongString("quorum".to_string().into()),
            );
        }

        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map_err(declare_error)?;
        debug!(queue = name, messages = queue.message_count(), "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_message_id(message.message_id.into())
            .with_timestamp(u64::try_from(message.timestamp_millis / 1000).unwrap_or_default())
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(transport_error)?
            .await
            .map_err(transport_error)?;

        if confirmation.is_nack() {
            return Err(TransportError::Nacked(format!("{exchange}/{routing_key}")).into());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(transport_error)?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_error)?;

        let deliveries = consumer.map(|delivery| match delivery {
            Ok(delivery) => Ok(inbound(delivery)),
            Err(err) => Err(channel_failure(err)),
        });
        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(transport_error)
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "client shutdown").await.map_err(transport_error)?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "client shutdown")
                .await
                .map_err(transport_error)?;
        }
        Ok(())
    }
}

fn inbound(delivery: Delivery) -> InboundDelivery {
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string());
    let delivery_count = delivery.properties.headers().as_ref().and_then(|headers| {
        headers
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
            .and_then(|(_, value)| header_count(value))
    });

    InboundDelivery {
        body: delivery.data,
        message_id,
        redelivered: delivery.redelivered,
        delivery_count,
        acker: Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    }
}

fn header_count(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        _ => None,
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> std::result::Result<(), TransportError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(channel_failure)
    }

    async fn nack(&self, requeue: bool) -> std::result::Result<(), TransportError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(channel_failure)
    }
}

fn channel_failure(err: lapin::Error) -> TransportError {
    TransportError::Channel(err.to_string())
}

fn transport_error(err: lapin::Error) -> EventBusError {
    channel_failure(err).into()
}

/// Inequivalent redeclarations come back as PRECONDITION_FAILED and are not
/// fixed by reconnecting.
fn declare_error(err: lapin::Error) -> EventBusError {
    match &err {
        lapin::Error::ProtocolError(protocol)
            if matches!(
                protocol.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                    | AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)
            ) =>
        {
            EventBusError::Topology(protocol.to_string())
        }
        _ => transport_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_count_accepts_integer_encodings() {
        assert_eq!(header_count(&AMQPValue::LongLongInt(2)), Some(2));
        assert_eq!(header_count(&AMQPValue::LongInt(1)), Some(1));
        assert_eq!(header_count(&AMQPValue::LongLongInt(-1)), None);
        assert_eq!(header_count(&AMQPValue::Boolean(true)), None);
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_transport_error() {
        let result = AmqpConnector::new().connect("amqp://127.0.0.1:1").await;
        assert!(matches!(result, Err(EventBusError::Transport(_))));
    }
}
