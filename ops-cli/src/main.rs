use clap::Parser;

use ops_cli::{commands, Cli};
use telemetry::LoggingConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; the environment may already be set.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let logging = if cli.json_logs {
        LoggingConfig::json()
    } else {
        LoggingConfig::default()
    };
    telemetry::init_logging(&logging.verbose(cli.verbose))?;

    commands::run(cli).await
}
