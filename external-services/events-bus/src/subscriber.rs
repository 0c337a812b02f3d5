// Consumer dispatch: one consumer per queue, handlers keyed by event kind
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::brokers::{BrokerChannel, DeliveryAcker, DeliveryStream, InboundDelivery};
use crate::connection::{ConnectionManager, Session};
use crate::error::{EventBusError, Result, TransportError};
use crate::event::{Envelope, EventKind};
use crate::handlers::{EventHandler, HandlerError};

/// Local attempt counts kept at most. Forgetting an entry only lowers a local
/// count; brokers that report `x-delivery-count` are unaffected.
const ATTEMPT_LEDGER_CAPACITY: usize = 10_000;

/// Lifecycle of one kind's subscription.
///
/// Transport loss does not move this state: the binding is logical and is
/// re-established on reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Unbound,
    Bound,
    Draining,
    Closed,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Unbound => "unbound",
            SubscriptionState::Bound => "bound",
            SubscriptionState::Draining => "draining",
            SubscriptionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Routes deliveries to registered handlers and settles them by outcome.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    connection: Arc<ConnectionManager>,
    handlers: DashMap<EventKind, Arc<dyn EventHandler>>,
    states: DashMap<EventKind, SubscriptionState>,
    /// Local attempt counts, for brokers that do not report redeliveries.
    attempts: parking_lot::Mutex<AttemptLedger>,
    /// Handler invocations currently running.
    running: AtomicUsize,
    consumers: Mutex<HashMap<String, QueueConsumer>>,
    consumer_seq: AtomicU64,
    closed: AtomicBool,
}

struct QueueConsumer {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    permits: Arc<Semaphore>,
    bound: Arc<AtomicBool>,
}

impl QueueConsumer {
    async fn stop(self, queue: &str) {
        self.stop.send_replace(true);
        if let Err(err) = self.task.await {
            warn!(queue = %queue, error = %err, "Consumer task ended abnormally");
        }
    }
}

impl Dispatcher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connection,
                handlers: DashMap::new(),
                states: DashMap::new(),
                attempts: parking_lot::Mutex::new(AttemptLedger::new(ATTEMPT_LEDGER_CAPACITY)),
                running: AtomicUsize::new(0),
                consumers: Mutex::new(HashMap::new()),
                consumer_seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register `handler` for `kind` and make sure its queue is consumed.
    ///
    /// A second registration for the same kind replaces the first.
    pub async fn subscribe<H: EventHandler>(&self, kind: EventKind, handler: H) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed.into());
        }
        let queue = self.inner.connection.routes().route(kind)?.queue.clone();

        let mut consumers = self.inner.consumers.lock().await;
        if self.inner.handlers.insert(kind, Arc::new(handler)).is_some() {
            warn!(kind = %kind, "Handler replaced; the last registration wins");
        }

        if let Some(consumer) = consumers.get(&queue) {
            let state = if consumer.bound.load(Ordering::Acquire) {
                SubscriptionState::Bound
            } else {
                SubscriptionState::Unbound
            };
            self.inner.states.insert(kind, state);
        } else {
            self.inner.states.insert(kind, SubscriptionState::Unbound);
            let consumer = self.spawn_consumer(&queue).await;
            consumers.insert(queue.clone(), consumer);
        }

        info!(kind = %kind, queue = %queue, "Subscribed");
        Ok(())
    }

    /// Remove the handler for `kind`. The queue's consumer is cancelled once
    /// no kind on it has a handler; handlers already running finish.
    pub async fn unsubscribe(&self, kind: EventKind) -> Result<()> {
        let queue = self.inner.connection.routes().route(kind)?.queue.clone();

        let mut consumers = self.inner.consumers.lock().await;
        if self.inner.handlers.remove(&kind).is_none() {
            return Ok(());
        }
        self.inner.states.insert(kind, SubscriptionState::Draining);

        if !self.inner.queue_has_handlers(&queue) {
            if let Some(consumer) = consumers.remove(&queue) {
                consumer.stop(&queue).await;
            }
        }

        self.inner.states.insert(kind, SubscriptionState::Closed);
        info!(kind = %kind, queue = %queue, "Unsubscribed");
        Ok(())
    }

    pub fn subscription_state(&self, kind: EventKind) -> SubscriptionState {
        self.inner
            .states
            .get(&kind)
            .map_or(SubscriptionState::Unbound, |state| *state)
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.inner.handlers.contains_key(&kind)
    }

    /// Handler invocations currently running across all queues.
    pub fn in_flight(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Cancel every consumer and wait up to `drain_timeout` for running
    /// handlers. Handlers still running afterwards are abandoned, not killed.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let kinds: Vec<EventKind> = self.inner.handlers.iter().map(|entry| *entry.key()).collect();
        for kind in &kinds {
            self.inner.states.insert(*kind, SubscriptionState::Draining);
        }

        let consumers = std::mem::take(&mut *self.inner.consumers.lock().await);
        let mut permits = Vec::with_capacity(consumers.len());
        for (queue, consumer) in consumers {
            permits.push(consumer.permits.clone());
            consumer.stop(&queue).await;
        }

        let capacity = u32::from(self.inner.connection.config().max_in_flight);
        let drain_timeout = self.inner.connection.config().drain_timeout();
        let drained = tokio::time::timeout(drain_timeout, async {
            for semaphore in &permits {
                if let Ok(all) = semaphore.acquire_many(capacity).await {
                    all.forget();
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                timeout_ms = u64::try_from(drain_timeout.as_millis()).unwrap_or(u64::MAX),
                "Drain timed out; abandoning in-flight handlers"
            );
        }

        self.inner.handlers.clear();
        for kind in kinds {
            self.inner.states.insert(kind, SubscriptionState::Closed);
        }
        info!("Dispatcher shut down");
    }

    async fn spawn_consumer(&self, queue: &str) -> QueueConsumer {
        let (stop, stop_rx) = watch::channel(false);
        let worker = QueueWorker {
            inner: self.inner.clone(),
            queue: queue.to_string(),
            permits: Arc::new(Semaphore::new(usize::from(
                self.inner.connection.config().max_in_flight,
            ))),
            bound: Arc::new(AtomicBool::new(false)),
        };

        let session = self.inner.connection.sessions().borrow().clone();
        let initial = match session {
            Some(session) => match worker.bind(&session).await {
                Ok(binding) => Some(binding),
                Err(err) => {
                    warn!(queue = %queue, error = %err, "Initial consumer bind failed; will retry");
                    None
                }
            },
            None => None,
        };

        let permits = worker.permits.clone();
        let bound = worker.bound.clone();
        let task = tokio::spawn(worker.run(stop_rx, initial));
        QueueConsumer {
            stop,
            task,
            permits,
            bound,
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Ok(consumers) = self.inner.consumers.try_lock() {
            for consumer in consumers.values() {
                consumer.stop.send_replace(true);
            }
        }
    }
}

impl DispatcherInner {
    fn queue_has_handlers(&self, queue: &str) -> bool {
        self.connection
            .routes()
            .queues()
            .get(queue)
            .is_some_and(|kinds| kinds.iter().any(|kind| self.handlers.contains_key(kind)))
    }

    fn mark_bound(&self, queue: &str) {
        if let Some(kinds) = self.connection.routes().queues().get(queue) {
            for kind in kinds {
                if self.handlers.contains_key(kind) {
                    self.states.insert(*kind, SubscriptionState::Bound);
                }
            }
        }
    }

    fn consumer_tag(&self, queue: &str, generation: u64) -> String {
        let seq = self.consumer_seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "{}-{}-g{}-{}",
            self.connection.config().service_name,
            queue,
            generation,
            seq
        )
    }

    /// 1-based attempt number for this delivery.
    fn next_attempt(&self, delivery_id: Uuid, redelivered: bool, delivery_count: Option<u32>) -> u32 {
        let local = self.attempts.lock().record(delivery_id, redelivered);
        delivery_count.map_or(local, |previous| previous.saturating_add(1).max(local))
    }
}

/// Bounded map of delivery id to local attempt count, oldest entries
/// evicted first. Each entry carries the stamp of its latest insertion so a
/// stale queue slot never evicts a re-inserted id.
struct AttemptLedger {
    counts: HashMap<Uuid, (u32, u64)>,
    order: VecDeque<(Uuid, u64)>,
    next_stamp: u64,
    capacity: usize,
}

impl AttemptLedger {
    fn new(capacity: usize) -> Self {
        Self {
            counts: HashMap::new(),
            order: VecDeque::new(),
            next_stamp: 0,
            capacity: capacity.max(1),
        }
    }

    /// A first delivery (`redelivered == false`) starts the count over:
    /// whatever an earlier run recorded belongs to a settled message.
    fn record(&mut self, id: Uuid, redelivered: bool) -> u32 {
        if !redelivered {
            self.counts.remove(&id);
        }
        if let Some((count, _)) = self.counts.get_mut(&id) {
            *count = count.saturating_add(1);
            return *count;
        }

        let stamp = self.next_stamp;
        self.next_stamp = self.next_stamp.wrapping_add(1);
        self.counts.insert(id, (1, stamp));
        self.order.push_back((id, stamp));
        while self.order.len() > self.capacity {
            if let Some((oldest, stamp)) = self.order.pop_front() {
                if self.counts.get(&oldest).is_some_and(|(_, current)| *current == stamp) {
                    self.counts.remove(&oldest);
                }
            }
        }
        1
    }

    fn forget(&mut self, id: &Uuid) {
        self.counts.remove(id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.counts.len()
    }
}

/// Counts one running handler for as long as it lives.
struct RunningHandler<'a>(&'a AtomicUsize);

impl<'a> RunningHandler<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RunningHandler<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Binding {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
    tag: String,
    deliveries: DeliveryStream,
}

enum PumpEnd {
    Stopped,
    Interrupted,
}

/// Decided synchronously when a delivery is pulled, so an unsubscribe
/// racing with dispatch cannot strand a message that already has a handler.
enum Work {
    Handle {
        envelope: Envelope,
        handler: Arc<dyn EventHandler>,
        redelivered: bool,
        delivery_count: Option<u32>,
    },
    Reject(String),
    Skip(EventKind),
}

#[derive(Clone)]
struct QueueWorker {
    inner: Arc<DispatcherInner>,
    queue: String,
    permits: Arc<Semaphore>,
    bound: Arc<AtomicBool>,
}

impl QueueWorker {
    async fn bind(&self, session: &Session) -> Result<Binding> {
        let tag = self.inner.consumer_tag(&self.queue, session.generation);
        let prefetch = self.inner.connection.config().max_in_flight;
        let deliveries = session.channel.consume(&self.queue, &tag, prefetch).await?;

        self.bound.store(true, Ordering::Release);
        self.inner.mark_bound(&self.queue);
        info!(
            queue = %self.queue,
            consumer_tag = %tag,
            generation = session.generation,
            "Consumer bound"
        );
        Ok(Binding {
            generation: session.generation,
            channel: session.channel.clone(),
            tag,
            deliveries,
        })
    }

    async fn run(self, mut stop: watch::Receiver<bool>, mut binding: Option<Binding>) {
        let mut sessions = self.inner.connection.sessions();
        let mut last_generation = binding.as_ref().map_or(0, |b| b.generation);

        loop {
            let mut current = match binding.take() {
                Some(current) => current,
                None => {
                    let Some(session) = next_session(&mut sessions, &mut stop, last_generation).await else {
                        break;
                    };
                    last_generation = session.generation;
                    match self.bind(&session).await {
                        Ok(current) => current,
                        Err(err) => {
                            warn!(queue = %self.queue, error = %err, "Consumer bind failed; waiting for the next session");
                            if let EventBusError::Transport(transport) = &err {
                                self.inner.connection.report_failure(transport);
                            }
                            continue;
                        }
                    }
                }
            };

            match self.pump(&mut current.deliveries, &mut stop).await {
                PumpEnd::Stopped => {
                    if current.channel.is_open() {
                        if let Err(err) = current.channel.cancel(&current.tag).await {
                            debug!(queue = %self.queue, error = %err, "Consumer cancel failed");
                        }
                    }
                    break;
                }
                PumpEnd::Interrupted => {
                    warn!(queue = %self.queue, "Consumer interrupted; rebinding after reconnect");
                    self.inner.connection.report_failure(&TransportError::Channel(format!(
                        "consumer on {} ended",
                        self.queue
                    )));
                }
            }
        }
        debug!(queue = %self.queue, "Consumer stopped");
    }

    /// Pull deliveries while a permit is free. Holding back here is the
    /// backpressure: nothing is pulled past the in-flight cap.
    async fn pump(&self, deliveries: &mut DeliveryStream, stop: &mut watch::Receiver<bool>) -> PumpEnd {
        loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return PumpEnd::Stopped,
                },
                _ = stop.changed() => return PumpEnd::Stopped,
            };

            let next = tokio::select! {
                next = deliveries.next() => next,
                _ = stop.changed() => return PumpEnd::Stopped,
            };

            match next {
                Some(Ok(delivery)) => self.dispatch(delivery, permit),
                Some(Err(err)) => {
                    warn!(queue = %self.queue, error = %err, "Delivery stream failed");
                    return self.end_of_stream(stop);
                }
                None => return self.end_of_stream(stop),
            }
        }
    }

    fn end_of_stream(&self, stop: &watch::Receiver<bool>) -> PumpEnd {
        if *stop.borrow() {
            PumpEnd::Stopped
        } else {
            PumpEnd::Interrupted
        }
    }

    fn dispatch(&self, delivery: InboundDelivery, permit: OwnedSemaphorePermit) {
        let InboundDelivery {
            body,
            redelivered,
            delivery_count,
            acker,
            ..
        } = delivery;
        let work = self.classify(&body, redelivered, delivery_count);

        let worker = self.clone();
        tokio::spawn(async move {
            match work {
                Work::Handle {
                    envelope,
                    handler,
                    redelivered,
                    delivery_count,
                } => {
                    let _running = RunningHandler::enter(&worker.inner.running);
                    worker
                        .process(envelope, handler, redelivered, delivery_count, acker)
                        .await;
                }
                Work::Reject(reason) => {
                    worker.settle(acker.nack(false).await, &reason);
                }
                Work::Skip(kind) => {
                    debug!(queue = %worker.queue, kind = %kind, "Ignoring event routed to another queue");
                    worker.settle(acker.ack().await, "skip");
                }
            }
            drop(permit);
        });
    }

    fn classify(&self, body: &[u8], redelivered: bool, delivery_count: Option<u32>) -> Work {
        let envelope = match Envelope::decode(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(queue = %self.queue, error = %err, "Poison message: undecodable envelope rejected");
                return Work::Reject("undecodable envelope".to_string());
            }
        };

        let kind = envelope.kind();
        let routed_here = self
            .inner
            .connection
            .routes()
            .route(kind)
            .is_ok_and(|route| route.queue == self.queue);
        if !routed_here {
            return Work::Skip(kind);
        }

        match self.inner.handlers.get(&kind).map(|entry| entry.value().clone()) {
            Some(handler) => Work::Handle {
                envelope,
                handler,
                redelivered,
                delivery_count,
            },
            None => {
                warn!(queue = %self.queue, kind = %kind, "No handler registered for kind; message rejected");
                Work::Reject(format!("no handler for {kind}"))
            }
        }
    }

    async fn process(
        &self,
        envelope: Envelope,
        handler: Arc<dyn EventHandler>,
        redelivered: bool,
        delivery_count: Option<u32>,
        acker: Box<dyn DeliveryAcker>,
    ) {
        let kind = envelope.kind();
        let delivery_id = envelope.delivery_id();
        let attempt = self.inner.next_attempt(delivery_id, redelivered, delivery_count);
        let limit = self.inner.connection.config().retry_limit_for(kind);

        let result = AssertUnwindSafe(handler.handle(envelope))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::failed("handler panicked")));

        let (settled, requeued) = match result {
            Ok(()) => {
                debug!(kind = %kind, delivery_id = %delivery_id, attempt, "Event handled");
                (acker.ack().await, false)
            }
            Err(err) if !err.is_retryable() => {
                error!(kind = %kind, delivery_id = %delivery_id, error = %err, "Handler rejected message; dead-lettering");
                (acker.nack(false).await, false)
            }
            Err(err) if attempt < limit => {
                warn!(kind = %kind, delivery_id = %delivery_id, attempt, limit, error = %err, "Handler failed; requeueing");
                (acker.nack(true).await, true)
            }
            Err(err) => {
                error!(kind = %kind, delivery_id = %delivery_id, attempt, limit, error = %err, "Retry limit reached; dead-lettering");
                (acker.nack(false).await, false)
            }
        };

        if !requeued {
            self.inner.attempts.lock().forget(&delivery_id);
        }
        self.settle(settled, kind.as_str());
    }

    fn settle(&self, settled: std::result::Result<(), TransportError>, context: &str) {
        if let Err(err) = settled {
            warn!(queue = %self.queue, context, error = %err, "Settlement failed; the broker will redeliver");
            self.inner.connection.report_failure(&err);
        }
    }
}

/// Wait for a session newer than `after`. `None` once stopped.
async fn next_session(
    sessions: &mut watch::Receiver<Option<Session>>,
    stop: &mut watch::Receiver<bool>,
    after: u64,
) -> Option<Session> {
    loop {
        if *stop.borrow() {
            return None;
        }
        let candidate = sessions
            .borrow_and_update()
            .clone()
            .filter(|session| session.generation > after);
        if candidate.is_some() {
            return candidate;
        }

        tokio::select! {
            changed = sessions.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            changed = stop.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brokers::MemoryBroker;
    use crate::config::BusConfig;
    use crate::handlers::handler_fn;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Fixture {
        broker: MemoryBroker,
        connection: Arc<ConnectionManager>,
        dispatcher: Dispatcher,
    }

    async fn fixture(config: BusConfig) -> Fixture {
        let broker = MemoryBroker::new();
        let routes = config.routing_table();
        let connection = Arc::new(
            ConnectionManager::connect(Arc::new(broker.clone()), config, routes)
                .await
                .unwrap(),
        );
        let dispatcher = Dispatcher::new(connection.clone());
        Fixture {
            broker,
            connection,
            dispatcher,
        }
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

    fn publish(fixture: &Fixture, envelope: &Envelope) {
        let route = fixture.connection.routes().route(envelope.kind()).unwrap();
        fixture
            .broker
            .inject_raw(&route.exchange.name, &route.routing_key, envelope.encode().unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn states_move_through_lifecycle() {
        let fixture = fixture(BusConfig::default()).await;
        let dispatcher = &fixture.dispatcher;
        assert_eq!(dispatcher.subscription_state(EventKind::UserCreated), SubscriptionState::Unbound);

        dispatcher
            .subscribe(EventKind::UserCreated, handler_fn(|_| async { Ok(()) }))
            .await
            .unwrap();
        assert_eq!(dispatcher.subscription_state(EventKind::UserCreated), SubscriptionState::Bound);
        assert_eq!(fixture.broker.consumer_count("training_events"), 1);

        dispatcher.unsubscribe(EventKind::UserCreated).await.unwrap();
        assert_eq!(dispatcher.subscription_state(EventKind::UserCreated), SubscriptionState::Closed);
        assert_eq!(fixture.broker.consumer_count("training_events"), 0);
    }

    #[tokio::test]
    async fn kinds_sharing_a_queue_share_one_consumer() {
        let fixture = fixture(BusConfig::default()).await;
        let dispatcher = &fixture.dispatcher;
        for kind in [EventKind::UserCreated, EventKind::UserDeleted] {
            dispatcher
                .subscribe(kind, handler_fn(|_| async { Ok(()) }))
                .await
                .unwrap();
        }
        assert_eq!(fixture.broker.consumer_count("training_events"), 1);

        dispatcher.unsubscribe(EventKind::UserCreated).await.unwrap();
        assert_eq!(fixture.broker.consumer_count("training_events"), 1);
        assert_eq!(dispatcher.subscription_state(EventKind::UserDeleted), SubscriptionState::Bound);
    }

    #[tokio::test]
    async fn second_registration_replaces_first() {
        let fixture = fixture(BusConfig::default()).await;
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        for counter in [first.clone(), second.clone()] {
            fixture
                .dispatcher
                .subscribe(
                    EventKind::ReferenceDeleted,
                    handler_fn(move |_| {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                )
                .await
                .unwrap();
        }

        publish(&fixture, &Envelope::new(EventKind::ReferenceDeleted, json!({ "id": 1 })));
        assert!(eventually(|| second.load(Ordering::SeqCst) == 1).await);
        assert_eq!(first.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn poison_message_is_rejected_without_requeue() {
        let fixture = fixture(BusConfig::default()).await;
        fixture
            .dispatcher
            .subscribe(EventKind::TrainingCreated, handler_fn(|_| async { Ok(()) }))
            .await
            .unwrap();

        fixture
            .broker
            .inject_raw("microservice_exchange", "TRAINING_CREATED", b"{not json".to_vec())
            .unwrap();

        assert!(eventually(|| fixture.broker.rejected_count() == 1).await);
        assert_eq!(fixture.broker.queue_depth("notes_events"), 0);
    }

    #[tokio::test]
    async fn rejected_handler_error_skips_retries() {
        let config = BusConfig::default().with_dead_letter_exchange("dead_letters");
        let fixture = fixture(config).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        fixture
            .dispatcher
            .subscribe(
                EventKind::UserUpdated,
                handler_fn(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(HandlerError::rejected("unknown user"))
                    }
                }),
            )
            .await
            .unwrap();

        publish(&fixture, &Envelope::new(EventKind::UserUpdated, json!({ "userId": "x" })));
        assert!(eventually(|| fixture.broker.queue_depth("dead_letters_queue") == 1).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_cap_holds_back_deliveries() {
        let config = BusConfig {
            max_in_flight: 2,
            ..BusConfig::default()
        };
        let fixture = fixture(config).await;
        let release = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(AtomicUsize::new(0));

        let (gate, counter) = (release.clone(), started.clone());
        fixture
            .dispatcher
            .subscribe(
                EventKind::TrainingUpdated,
                handler_fn(move |_| {
                    let (gate, counter) = (gate.clone(), counter.clone());
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        for id in 0..5 {
            publish(&fixture, &Envelope::new(EventKind::TrainingUpdated, json!({ "id": id })));
        }

        assert!(eventually(|| started.load(Ordering::SeqCst) == 2).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.dispatcher.in_flight(), 2);
        assert_eq!(fixture.broker.queue_depth("notes_events"), 3);

        release.notify_one();
        assert!(eventually(|| started.load(Ordering::SeqCst) == 3).await);
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_handlers() {
        let fixture = fixture(BusConfig::default()).await;
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        fixture
            .dispatcher
            .subscribe(
                EventKind::UserCreated,
                handler_fn(move |_| {
                    let flag = flag.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        flag.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        publish(&fixture, &Envelope::new(EventKind::UserCreated, json!({ "userId": "1" })));
        assert!(eventually(|| fixture.broker.unacked_count("training_events") == 1).await);

        fixture.dispatcher.shutdown().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(fixture.dispatcher.subscription_state(EventKind::UserCreated), SubscriptionState::Closed);
        assert!(matches!(
            fixture
                .dispatcher
                .subscribe(EventKind::UserCreated, handler_fn(|_| async { Ok(()) }))
                .await,
            Err(EventBusError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn attempt_prefers_broker_delivery_count() {
        let fixture = fixture(BusConfig::default()).await;
        let inner = &fixture.dispatcher.inner;
        let id = Uuid::new_v4();

        assert_eq!(inner.next_attempt(id, false, None), 1);
        assert_eq!(inner.next_attempt(id, true, None), 2);
        assert_eq!(inner.next_attempt(id, true, Some(4)), 5);
        assert_eq!(inner.next_attempt(Uuid::new_v4(), false, Some(0)), 1);
    }

    #[test]
    fn first_delivery_restarts_the_local_count() {
        let mut ledger = AttemptLedger::new(16);
        let id = Uuid::new_v4();
        assert_eq!(ledger.record(id, false), 1);
        assert_eq!(ledger.record(id, true), 2);
        // Settled elsewhere, then published again under the same id.
        assert_eq!(ledger.record(id, false), 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn attempt_ledger_is_bounded() {
        let mut ledger = AttemptLedger::new(3);
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            ledger.record(*id, false);
        }
        assert_eq!(ledger.len(), 3);
        assert!(!ledger.counts.contains_key(&ids[0]));
        assert!(ledger.counts.contains_key(&ids[4]));

        // Re-recording a live id leaves a stale slot that must not evict it.
        ledger.record(ids[2], false);
        ledger.record(Uuid::new_v4(), false);
        assert!(ledger.counts.contains_key(&ids[2]));
        assert!(ledger.len() <= 3);
    }

    #[tokio::test]
    async fn idle_consumer_reports_nothing_in_flight() {
        let fixture = fixture(BusConfig::default()).await;
        fixture
            .dispatcher
            .subscribe(EventKind::UserCreated, handler_fn(|_| async { Ok(()) }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fixture.dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn entry_left_by_message_settled_elsewhere_is_replaced() {
        let fixture = fixture(BusConfig::default()).await;
        let inner = &fixture.dispatcher.inner;
        let envelope = Envelope::new(EventKind::UserCreated, json!({ "userId": "7" }));

        // This replica saw a failing first attempt and then lost the message.
        assert_eq!(inner.next_attempt(envelope.delivery_id(), false, None), 1);
        assert_eq!(inner.attempts.lock().len(), 1);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        fixture
            .dispatcher
            .subscribe(
                EventKind::UserCreated,
                handler_fn(move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();
        publish(&fixture, &envelope);

        assert!(eventually(|| calls.load(Ordering::SeqCst) == 1).await);
        assert!(eventually(|| fixture.broker.unacked_count("training_events") == 0).await);
        assert!(eventually(|| inner.attempts.lock().len() == 0).await);
    }
}
