use std::time::Duration;

use thiserror::Error;

use crate::event::EventKind;
use crate::handlers::HandlerError;

/// Failures of the broker connection or channel.
///
/// These are recovered in the background by the reconnect loop; they only
/// surface synchronously to the call that was in flight when they happened.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("broker connection is not established")]
    NotConnected,

    #[error("broker unreachable after {attempts} attempt(s): {reason}")]
    Unreachable { attempts: u32, reason: String },

    #[error("timed out after {0:?} waiting for the broker")]
    Timeout(Duration),

    #[error("broker refused the message: {0}")]
    Nacked(String),

    #[error("bus client has been closed")]
    Closed,

    #[error("channel failure: {0}")]
    Channel(String),
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Publishing or subscribing a kind the routing table does not know.
    /// This is a wiring mistake and is never retried.
    #[error("no route registered for event kind {0}")]
    UnknownRoute(EventKind),

    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("event handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// Conflicting exchange/queue declarations. Fatal for `connect`.
    #[error("topology declaration failed: {0}")]
    Topology(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EventBusError {
    /// True for failures the caller may reasonably retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, EventBusError::Transport(err) if *err != TransportError::Closed)
    }
}

impl From<config::ConfigError> for EventBusError {
    fn from(err: config::ConfigError) -> Self {
        EventBusError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EventBusError>;
