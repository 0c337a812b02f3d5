// Bus configuration, loaded from RABBITMQ_* environment variables
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::brokers::QueueType;
use crate::error::{EventBusError, Result};
use crate::event::EventKind;
use crate::routing::{ExchangeKind, RoutingTable, DEFAULT_EXCHANGE};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker URL
    pub url: String,
    /// Exchange used by the standard routing table
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    /// Used for consumer tags and log fields
    pub service_name: String,
    /// Immediate attempts made by `connect` before giving up
    pub connect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// How often the supervisor re-checks transport health
    pub health_check_interval_ms: u64,
    /// Concurrent handler invocations per subscription
    pub max_in_flight: u16,
    /// Bound on the wait for a publisher confirm
    pub ack_timeout_ms: u64,
    /// Bound on the wait for in-flight handlers during close
    pub drain_timeout_ms: u64,
    /// Delivery attempts before a failing message is dead-lettered
    pub retry_limit: u32,
    pub retry_limits: HashMap<EventKind, u32>,
    /// Optional sink for poison messages
    pub dead_letter_exchange: Option<String>,
    /// `quorum` moves the attempt count onto the message itself
    pub queue_type: QueueType,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://rabbitmq:5672".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            exchange_kind: ExchangeKind::Direct,
            service_name: "service".to_string(),
            connect_attempts: 3,
            connect_timeout_ms: 5_000,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            health_check_interval_ms: 1_000,
            max_in_flight: 10,
            ack_timeout_ms: 5_000,
            drain_timeout_ms: 10_000,
            retry_limit: 3,
            retry_limits: HashMap::new(),
            dead_letter_exchange: None,
            queue_type: QueueType::Classic,
        }
    }
}

impl BusConfig {
    /// Load from `RABBITMQ_*` variables, e.g. `RABBITMQ_URL`,
    /// `RABBITMQ_MAX_IN_FLIGHT`. Unset keys keep their defaults.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("RABBITMQ").try_parsing(true))
            .build()?;
        let config: BusConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_retry_limit(mut self, kind: EventKind, limit: u32) -> Self {
        self.retry_limits.insert(kind, limit);
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(EventBusError::Config("broker url is empty".to_string()));
        }
        if self.connect_attempts == 0 {
            return Err(EventBusError::Config("connect_attempts must be at least 1".to_string()));
        }
        if self.max_in_flight == 0 {
            return Err(EventBusError::Config("max_in_flight must be at least 1".to_string()));
        }
        if self.retry_limit == 0 || self.retry_limits.values().any(|limit| *limit == 0) {
            return Err(EventBusError::Config("retry limits must be at least 1".to_string()));
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(EventBusError::Config(format!(
                "invalid backoff bounds {}ms..{}ms",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }

    /// Standard taxonomy on the configured exchange.
    pub fn routing_table(&self) -> RoutingTable {
        RoutingTable::standard_with(&self.exchange, self.exchange_kind)
    }

    pub fn retry_limit_for(&self, kind: EventKind) -> u32 {
        self.retry_limits.get(&kind).copied().unwrap_or(self.retry_limit)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Exponential backoff, doubling from `initial` up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}
