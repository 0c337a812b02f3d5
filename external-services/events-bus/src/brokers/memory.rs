//! In-process broker for tests and single-process deployments.
//!
//! Mirrors the AMQP semantics the bus depends on:
//! - direct / topic / fanout exchanges with queue bindings
//! - per-queue FIFO with explicit ack, nack-with-requeue and dead-lettering
//! - consumer prefetch
//! - unacked messages of a closed or severed channel go back to the queue
//!
//! [`MemoryBroker::sever`] and [`MemoryBroker::restore`] simulate losing and
//! regaining the transport.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::{
    BrokerChannel, BrokerConnector, DeliveryAcker, DeliveryStream, InboundDelivery, OutboundMessage, QueueType,
};
use crate::error::{EventBusError, Result, TransportError};
use crate::routing::ExchangeKind;

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
}

#[derive(Default)]
struct State {
    available: bool,
    track_delivery_count: bool,
    hold_confirms: bool,
    next_channel_id: u64,
    next_delivery_tag: u64,
    open_channels: HashSet<u64>,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    connections: usize,
    published: usize,
    rejected: usize,
}

#[derive(PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Clone)]
struct StoredMessage {
    message_id: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
    deliveries: u32,
}

#[derive(Default)]
struct Queue {
    dead_letter_exchange: Option<String>,
    queue_type: QueueType,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: HashMap<String, ConsumerSlot>,
}

struct Unacked {
    message: StoredMessage,
    channel_id: u64,
    consumer_tag: String,
}

struct ConsumerSlot {
    channel_id: u64,
    prefetch: u16,
    outstanding: usize,
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

enum Next {
    Delivery(InboundDelivery),
    Wait,
    Closed,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker emulating classic queues (no delivery-count header).
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    available: true,
                    ..State::default()
                }),
                changed,
            }),
        }
    }

    /// Broker emulating quorum queues, which report previous delivery
    /// attempts on every redelivery.
    pub fn quorum() -> Self {
        let broker = Self::new();
        broker.inner.state.lock().track_delivery_count = true;
        broker
    }

    /// Drop every connection and refuse new ones until [`restore`](Self::restore).
    pub fn sever(&self) {
        {
            let mut state = self.inner.state.lock();
            state.available = false;
            state.open_channels.clear();
            for queue in state.queues.values_mut() {
                queue.requeue_where(|_| true);
                queue.consumers.clear();
            }
        }
        debug!("Memory broker severed");
        self.notify();
    }

    pub fn restore(&self) {
        self.inner.state.lock().available = true;
        debug!("Memory broker restored");
        self.notify();
    }

    pub fn is_available(&self) -> bool {
        self.inner.state.lock().available
    }

    /// Stop confirming publishes, so publishers hit their ack timeout.
    pub fn hold_confirms(&self, hold: bool) {
        self.inner.state.lock().hold_confirms = hold;
    }

    /// Route raw bytes as if another producer had published them.
    pub fn inject_raw(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<()> {
        let mut state = self.inner.state.lock();
        let message = StoredMessage {
            message_id: format!("raw-{}", state.published),
            routing_key: routing_key.to_string(),
            body,
            redelivered: false,
            deliveries: 0,
        };
        state.route(exchange, routing_key, message)?;
        drop(state);
        self.notify();
        Ok(())
    }

    pub fn published_count(&self) -> usize {
        self.inner.state.lock().published
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().connections
    }

    /// Messages negatively acknowledged without requeue.
    pub fn rejected_count(&self) -> usize {
        self.inner.state.lock().rejected
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner.state.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.inner.state.lock().exchanges.get(exchange).copied()
    }

    fn notify(&self) {
        self.inner.changed.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn close_channel(&self, channel_id: u64) {
        {
            let mut state = self.inner.state.lock();
            state.open_channels.remove(&channel_id);
            for queue in state.queues.values_mut() {
                queue.requeue_where(|entry| entry.channel_id == channel_id);
                queue.consumers.retain(|_, slot| slot.channel_id != channel_id);
            }
        }
        self.notify();
    }

    fn settle(
        &self,
        queue_name: &str,
        delivery_tag: u64,
        channel_id: u64,
        settlement: Settlement,
    ) -> std::result::Result<(), TransportError> {
        let mut state = self.inner.state.lock();
        if !state.available || !state.open_channels.contains(&channel_id) {
            return Err(TransportError::Channel("channel closed before settlement".to_string()));
        }

        let queue = state.queues.get_mut(queue_name).ok_or_else(|| {
            TransportError::Channel(format!("NOT_FOUND - no queue '{queue_name}'"))
        })?;
        let entry = queue.unacked.remove(&delivery_tag).ok_or_else(|| {
            TransportError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"))
        })?;
        if let Some(slot) = queue.consumers.get_mut(&entry.consumer_tag) {
            slot.outstanding = slot.outstanding.saturating_sub(1);
        }

        match settlement {
            Settlement::Ack => {}
            Settlement::Requeue => {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Settlement::Discard => {
                let dead_letter_exchange = queue.dead_letter_exchange.clone();
                state.rejected += 1;
                if let Some(exchange) = dead_letter_exchange {
                    let mut message = entry.message;
                    message.redelivered = false;
                    let routing_key = message.routing_key.clone();
                    if let Err(err) = state.route(&exchange, &routing_key, message) {
                        debug!(error = %err, "Dead-letter exchange rejected message");
                    }
                }
            }
        }

        drop(state);
        self.notify();
        Ok(())
    }

    fn next_delivery(&self, cursor: &Cursor) -> Next {
        let mut state = self.inner.state.lock();
        if !state.available || !state.open_channels.contains(&cursor.channel_id) {
            return Next::Closed;
        }

        let delivery_tag = state.next_delivery_tag + 1;
        let broker_counts = state.track_delivery_count;
        let Some(queue) = state.queues.get_mut(&cursor.queue) else {
            return Next::Closed;
        };
        let track_delivery_count = broker_counts || queue.queue_type == QueueType::Quorum;
        let Some(slot) = queue.consumers.get_mut(&cursor.consumer_tag) else {
            return Next::Closed;
        };
        if slot.prefetch != 0 && slot.outstanding >= usize::from(slot.prefetch) {
            return Next::Wait;
        }
        let Some(mut message) = queue.ready.pop_front() else {
            return Next::Wait;
        };
        slot.outstanding += 1;

        let previous_deliveries = message.deliveries;
        message.deliveries += 1;
        queue.unacked.insert(
            delivery_tag,
            Unacked {
                message: message.clone(),
                channel_id: cursor.channel_id,
                consumer_tag: cursor.consumer_tag.clone(),
            },
        );
        state.next_delivery_tag = delivery_tag;

        Next::Delivery(InboundDelivery {
            body: message.body,
            message_id: Some(message.message_id),
            redelivered: message.redelivered,
            delivery_count: track_delivery_count.then_some(previous_deliveries),
            acker: Box::new(MemoryAcker {
                broker: self.clone(),
                queue: cursor.queue.clone(),
                delivery_tag,
                channel_id: cursor.channel_id,
            }),
        })
    }
}

impl State {
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> std::result::Result<(), TransportError> {
        let kind = *self.exchanges.get(exchange).ok_or_else(|| {
            TransportError::Channel(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;

        let mut targets: Vec<&str> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && !targets.contains(&binding.queue.as_str()) {
                targets.push(binding.queue.as_str());
            }
        }

        let targets: Vec<String> = targets.into_iter().map(str::to_string).collect();
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(())
    }
}

impl Queue {
    /// Return matching unacked messages to the head of the queue in their
    /// original delivery order.
    fn requeue_where(&mut self, predicate: impl Fn(&Unacked) -> bool) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.into_iter().rev() {
            if let Some(entry) = self.unacked.remove(&tag) {
                let mut message = entry.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || key.split_first().is_some_and(|(_, tail)| matches(pattern, tail))
            }
            (Some((&"*", rest)), Some((_, tail))) => matches(rest, tail),
            (Some((word, rest)), Some((head, tail))) => word == head && matches(rest, tail),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.inner.state.lock();
        if !state.available {
            return Err(TransportError::Channel("connection refused".to_string()).into());
        }
        state.next_channel_id += 1;
        let channel_id = state.next_channel_id;
        state.open_channels.insert(channel_id);
        state.connections += 1;

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            channel_id,
        }))
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    channel_id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<()> {
        if state.available && state.open_channels.contains(&self.channel_id) {
            Ok(())
        } else {
            Err(TransportError::NotConnected.into())
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        let state = self.broker.inner.state.lock();
        state.available && state.open_channels.contains(&self.channel_id)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.broker.inner.state.lock();
        self.ensure_open(&state)?;
        match state.exchanges.get(name) {
            Some(existing) if *existing != kind => Err(EventBusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}': \
                 received '{kind}' but current is '{existing}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
        queue_type: QueueType,
    ) -> Result<()> {
        let mut state = self.broker.inner.state.lock();
        self.ensure_open(&state)?;
        match state.queues.get(name) {
            Some(existing) if existing.dead_letter_exchange.as_deref() != dead_letter_exchange => {
                Err(EventBusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-exchange' for queue '{name}'"
                )))
            }
            Some(existing) if existing.queue_type != queue_type => Err(EventBusError::Topology(format!(
                "PRECONDITION_FAILED - inequivalent arg 'x-queue-type' for queue '{name}'"
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    Queue {
                        dead_letter_exchange: dead_letter_exchange.map(str::to_string),
                        queue_type,
                        ..Queue::default()
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.broker.inner.state.lock();
        self.ensure_open(&state)?;
        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(EventBusError::Topology(format!(
                "NOT_FOUND - cannot bind '{queue}' to '{exchange}'"
            )));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutboundMessage) -> Result<()> {
        let hold = {
            let mut state = self.broker.inner.state.lock();
            self.ensure_open(&state)?;
            if state.hold_confirms {
                true
            } else {
                state.route(
                    exchange,
                    routing_key,
                    StoredMessage {
                        message_id: message.message_id,
                        routing_key: routing_key.to_string(),
                        body: message.body,
                        redelivered: false,
                        deliveries: 0,
                    },
                )?;
                state.published += 1;
                false
            }
        };

        if hold {
            std::future::pending::<()>().await;
        }
        self.broker.notify();
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        {
            let mut state = self.broker.inner.state.lock();
            self.ensure_open(&state)?;
            let target = state.queues.get_mut(queue).ok_or_else(|| {
                EventBusError::Topology(format!("NOT_FOUND - no queue '{queue}'"))
            })?;
            if target.consumers.contains_key(consumer_tag) {
                return Err(TransportError::Channel(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
                ))
                .into());
            }
            target.consumers.insert(
                consumer_tag.to_string(),
                ConsumerSlot {
                    channel_id: self.channel_id,
                    prefetch,
                    outstanding: 0,
                },
            );
        }

        let cursor = Cursor {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            channel_id: self.channel_id,
        };

        let deliveries = stream::unfold(cursor, |cursor| async move {
            loop {
                let mut changed = cursor.broker.inner.changed.subscribe();
                match cursor.broker.next_delivery(&cursor) {
                    Next::Delivery(delivery) => return Some((Ok(delivery), cursor)),
                    Next::Closed => return None,
                    Next::Wait => {}
                }
                if changed.changed().await.is_err() {
                    return None;
                }
            }
        });

        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        {
            let mut state = self.broker.inner.state.lock();
            for queue in state.queues.values_mut() {
                queue
                    .consumers
                    .retain(|tag, slot| !(tag == consumer_tag && slot.channel_id == self.channel_id));
            }
        }
        self.broker.notify();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_channel(self.channel_id);
        Ok(())
    }
}

struct Cursor {
    broker: MemoryBroker,
    queue: String,
    consumer_tag: String,
    channel_id: u64,
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    delivery_tag: u64,
    channel_id: u64,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> std::result::Result<(), TransportError> {
        self.broker
            .settle(&self.queue, self.delivery_tag, self.channel_id, Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> std::result::Result<(), TransportError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Discard
        };
        self.broker
            .settle(&self.queue, self.delivery_tag, self.channel_id, settlement)
    }
}
