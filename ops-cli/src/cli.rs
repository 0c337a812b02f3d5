use clap::{Parser, Subcommand};
use events_bus::EventKind;
use serde_json::Value;

/// Operate the platform event bus
#[derive(Parser, Debug)]
#[command(name = "busctl")]
#[command(about = "Publish, consume and health-check events on the platform bus", version)]
pub struct Cli {
    /// Broker URL
    #[arg(long, env = "RABBITMQ_URL", global = true)]
    pub url: Option<String>,

    /// Name used for consumer tags and the broker connection
    #[arg(long, default_value = "busctl", global = true)]
    pub service_name: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish one event and wait for the broker confirm
    Publish {
        /// Event kind, e.g. TRAINING_CREATED
        #[arg(long)]
        kind: EventKind,

        /// JSON payload
        #[arg(long, default_value = "{}", value_parser = parse_payload)]
        payload: Value,
    },

    /// Consume events of one kind and print each envelope as a JSON line.
    /// Competes with the owning service for messages on the same queue.
    Listen {
        #[arg(long)]
        kind: EventKind,

        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
    },

    /// Print the routing table
    Topology {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check broker liveness once; exits non-zero unless ok
    Health,

    /// Serve the liveness report on GET /health
    ServeHealth {
        /// Bind address
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
}

fn parse_payload(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|err| format!("payload is not valid JSON: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_parses_kind_and_payload() {
        let cli = Cli::try_parse_from([
            "busctl",
            "publish",
            "--kind",
            "TRAINING_CREATED",
            "--payload",
            r#"{"id":42,"type":"free"}"#,
        ])
        .unwrap();

        match cli.command {
            Command::Publish { kind, payload } => {
                assert_eq!(kind, EventKind::TrainingCreated);
                assert_eq!(payload, json!({ "id": 42, "type": "free" }));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(Cli::try_parse_from(["busctl", "listen", "--kind", "USER_RENAMED"]).is_err());
    }

    #[test]
    fn invalid_payload_is_rejected() {
        let parsed = Cli::try_parse_from(["busctl", "publish", "--kind", "USER_CREATED", "--payload", "{"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn serve_health_defaults() {
        let cli = Cli::try_parse_from(["busctl", "serve-health"]).unwrap();
        assert!(matches!(cli.command, Command::ServeHealth { port: 8080, .. }));
    }
}
