// Consumer handler contract
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::event::Envelope;

#[derive(Error, Debug)]
pub enum HandlerError {
    /// Business failure; the message is requeued until the retry limit.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler recognised the message as unprocessable. It goes to the
    /// dead-letter path without further attempts.
    #[error("message rejected by handler: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        HandlerError::Rejected(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, HandlerError::Rejected(_))
    }
}

/// Processes one delivered envelope.
///
/// Delivery is at-least-once: implementations must tolerate seeing the same
/// `delivery_id` more than once (see [`Idempotent`]).
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        (**self).handle(envelope).await
    }
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        (self.f)(envelope).await
    }
}

/// Skips envelopes whose `delivery_id` was already handled successfully.
///
/// Remembers the most recent `capacity` ids; older ids are forgotten. A
/// delivery that arrives while another copy is still running waits for that
/// run to settle, then is skipped if it succeeded or runs if it failed.
pub struct Idempotent<H> {
    inner: H,
    seen: Mutex<SeenWindow>,
}

struct SeenWindow {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    /// Ids with a run in progress; receivers wake when it settles.
    running: HashMap<Uuid, watch::Sender<bool>>,
    capacity: usize,
}

enum Claim {
    Done,
    Running(watch::Receiver<bool>),
    Claimed,
}

impl SeenWindow {
    fn contains(&self, id: &Uuid) -> bool {
        self.ids.contains(id)
    }

    fn claim(&mut self, id: Uuid) -> Claim {
        if self.contains(&id) {
            return Claim::Done;
        }
        if let Some(running) = self.running.get(&id) {
            return Claim::Running(running.subscribe());
        }
        self.running.insert(id, watch::channel(false).0);
        Claim::Claimed
    }

    fn insert(&mut self, id: Uuid) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

/// Releases a claimed id when the run ends, including by panic.
struct RunGuard<'a> {
    seen: &'a Mutex<SeenWindow>,
    id: Uuid,
    succeeded: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let released = {
            let mut seen = self.seen.lock();
            if self.succeeded {
                seen.insert(self.id);
            }
            seen.running.remove(&self.id)
        };
        if let Some(waiters) = released {
            waiters.send_replace(true);
        }
    }
}

impl<H: EventHandler> Idempotent<H> {
    pub fn new(inner: H, capacity: usize) -> Self {
        Self {
            inner,
            seen: Mutex::new(SeenWindow {
                order: VecDeque::new(),
                ids: HashSet::new(),
                running: HashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }
}

#[async_trait]
impl<H: EventHandler> EventHandler for Idempotent<H> {
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        let delivery_id = envelope.delivery_id();
        loop {
            let claim = self.seen.lock().claim(delivery_id);
            match claim {
                Claim::Done => {
                    debug!(delivery_id = %delivery_id, "Skipping duplicate delivery");
                    return Ok(());
                }
                Claim::Running(mut settled) => {
                    debug!(delivery_id = %delivery_id, "Duplicate delivery waiting for the running copy");
                    // A closed channel also means the run is over.
                    let _ = settled.wait_for(|done| *done).await;
                }
                Claim::Claimed => {
                    let mut guard = RunGuard {
                        seen: &self.seen,
                        id: delivery_id,
                        succeeded: false,
                    };
                    let result = self.inner.handle(envelope).await;
                    guard.succeeded = result.is_ok();
                    return result;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(calls: Arc<AtomicUsize>) -> impl EventHandler {
        handler_fn(move |_envelope| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn idempotent_skips_repeated_delivery_id() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = Idempotent::new(counting_handler(calls.clone()), 16);
        let envelope = Envelope::new(EventKind::UserCreated, json!({ "userId": "1" }));

        handler.handle(envelope.clone()).await.unwrap();
        handler.handle(envelope).await.unwrap();
        handler
            .handle(Envelope::new(EventKind::UserCreated, json!({ "userId": "1" })))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idempotent_does_not_remember_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = Idempotent::new(
            handler_fn(move |_envelope| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(HandlerError::failed("first attempt"))
                    } else {
                        Ok(())
                    }
                }
            }),
            16,
        );
        let envelope = Envelope::new(EventKind::ReferenceDeleted, json!({ "id": 7 }));

        assert!(handler.handle(envelope.clone()).await.is_err());
        handler.handle(envelope).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idempotent_holds_copy_arriving_mid_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let (counter, release) = (calls.clone(), gate.clone());
        let handler = Arc::new(Idempotent::new(
            handler_fn(move |_envelope| {
                let (counter, release) = (counter.clone(), release.clone());
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(())
                }
            }),
            16,
        ));
        let envelope = Envelope::new(EventKind::TrainingCreated, json!({ "id": 3 }));

        let first = tokio::spawn({
            let (handler, envelope) = (handler.clone(), envelope.clone());
            async move { handler.handle(envelope).await }
        });
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let handler = handler.clone();
            async move { handler.handle(envelope).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        gate.notify_one();
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idempotent_reruns_copy_when_running_copy_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        let (counter, release) = (calls.clone(), gate.clone());
        let handler = Arc::new(Idempotent::new(
            handler_fn(move |_envelope| {
                let (counter, release) = (counter.clone(), release.clone());
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        release.notified().await;
                        return Err(HandlerError::failed("store offline"));
                    }
                    Ok(())
                }
            }),
            16,
        ));
        let envelope = Envelope::new(EventKind::UserDeleted, json!({ "userId": "9" }));

        let first = tokio::spawn({
            let (handler, envelope) = (handler.clone(), envelope.clone());
            async move { handler.handle(envelope).await }
        });
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let handler = handler.clone();
            async move { handler.handle(envelope).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        gate.notify_one();
        assert!(first.await.unwrap().is_err());
        second.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn seen_window_is_bounded() {
        let mut window = SeenWindow {
            order: VecDeque::new(),
            ids: HashSet::new(),
            running: HashMap::new(),
            capacity: 2,
        };
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            window.insert(*id);
        }
        assert!(!window.contains(&ids[0]));
        assert!(window.contains(&ids[1]));
        assert!(window.contains(&ids[2]));
    }

    #[test]
    fn rejected_errors_are_not_retryable() {
        assert!(!HandlerError::rejected("bad id").is_retryable());
        assert!(HandlerError::failed("db down").is_retryable());
    }
}
