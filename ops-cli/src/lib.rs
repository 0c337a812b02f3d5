/// Operations CLI for the platform event bus
///
/// `busctl` talks to the same broker and routing table as the services:
/// - **publish**: send one event and wait for the broker confirm
/// - **listen**: consume and print events of one kind
/// - **topology**: print the kind -> exchange / queue / routing key table
/// - **health**: one-shot liveness check, non-zero exit when not ok
/// - **serve-health**: expose `GET /health` for orchestrator probes
///
/// Broker settings come from `RABBITMQ_*` variables (a `.env` file is read
/// first); `--url` overrides `RABBITMQ_URL`.
pub mod cli;
pub mod commands;
pub mod server;

pub use cli::{Cli, Command};
