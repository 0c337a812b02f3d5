//! Cross-service event messaging for the training platform
//!
//! The auth, notes, reference and training services share no process, only
//! a broker and this crate. It provides:
//! - A closed set of event kinds and the wire envelope
//!   (`kind`, `payload`, `occurredAt`, `deliveryId`)
//! - A static routing table mapping each kind to exchange, queue and routing key
//! - A connection manager with background reconnect and a non-blocking health signal
//! - Fire-and-confirm publishing, bounded by an ack timeout
//! - Consumer dispatch with bounded in-flight handlers, requeue up to a
//!   per-kind retry limit, and dead-lettering of poison messages
//! - Pluggable transports: RabbitMQ (lapin) and an in-memory broker
//!
//! # Delivery contract
//!
//! Delivery is at-least-once. A message may be redelivered after a reconnect;
//! handlers deduplicate on `deliveryId` (see [`Idempotent`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use events_bus::{handler_fn, BusClient, BusConfig, EventKind, TrainingRef};
//! use serde_json::json;
//!
//! # async fn run() -> events_bus::Result<()> {
//! let config = BusConfig::from_env()?.with_service_name("notes-service");
//! let routes = config.routing_table();
//! let bus = BusClient::connect(config, routes).await?;
//!
//! bus.subscribe(
//!     EventKind::TrainingCreated,
//!     handler_fn(|envelope| async move {
//!         let training: TrainingRef = envelope
//!             .payload_as()
//!             .map_err(|err| events_bus::HandlerError::rejected(err.to_string()))?;
//!         tracing::info!(id = training.id, "Training created");
//!         Ok(())
//!     }),
//! )
//! .await?;
//!
//! bus.publish(EventKind::TrainingCreated, json!({ "id": 42, "type": "free" })).await?;
//! bus.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod brokers;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handlers;
pub mod health;
pub mod publisher;
pub mod routing;
pub mod subscriber;

pub use brokers::{AmqpConnector, BrokerChannel, BrokerConnector, MemoryBroker, QueueType};
pub use bus::*;
pub use self::config::{BackoffPolicy, BusConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::*;
pub use event::*;
pub use handlers::*;
pub use publisher::*;
pub use routing::*;
pub use subscriber::*;
