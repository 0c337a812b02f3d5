//! Observability primitives shared by the platform services
//!
//! - Structured logging with `tracing`, plain or JSON output
//! - Liveness reports built from dependency probes (broker, database, ...)
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telemetry::{FnProbe, HealthProbe, LivenessReport, LoggingConfig};
//!
//! # async fn run() -> telemetry::Result<()> {
//! telemetry::init_logging(&LoggingConfig::default())?;
//!
//! let database: Arc<dyn HealthProbe> = Arc::new(FnProbe::new("database", || async { Ok(true) }));
//! let report = LivenessReport::evaluate(&[database]).await;
//! println!("{}", serde_json::to_string(&report).unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod health;
pub mod logging;

pub use error::*;
pub use health::*;
pub use logging::{init as init_logging, LogFormat, LoggingConfig};
