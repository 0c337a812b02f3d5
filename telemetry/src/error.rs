use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Logging initialization failed: {0}")]
    LoggingInit(String),

    #[error("Health probe {probe} failed: {message}")]
    Probe { probe: String, message: String },

    #[error("Internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl TelemetryError {
    pub fn probe(probe: impl Into<String>, message: impl Into<String>) -> Self {
        TelemetryError::Probe {
            probe: probe.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TelemetryError>;
