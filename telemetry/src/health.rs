// Liveness reporting over dependency probes
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    /// Every dependency is reachable
    Ok,
    /// At least one dependency is down; the process itself is running
    Degraded,
    /// A probe itself failed
    Error,
}

impl LivenessStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, LivenessStatus::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Connected,
    Disconnected,
}

impl From<bool> for ServiceStatus {
    fn from(connected: bool) -> Self {
        if connected {
            ServiceStatus::Connected
        } else {
            ServiceStatus::Disconnected
        }
    }
}

/// A dependency a liveness endpoint reports on.
///
/// `check` must be cheap and must not wait on the dependency's in-flight
/// work; liveness endpoints call it on every request.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<bool>;
}

/// Probe backed by an async closure.
pub struct FnProbe<F> {
    name: String,
    check: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self) -> Result<bool> {
        (self.check)().await
    }
}

/// Body of a service's `/health` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessReport {
    pub status: LivenessStatus,
    /// RFC 3339
    pub timestamp: String,
    pub services: BTreeMap<String, ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LivenessReport {
    /// Run every probe and fold the results:
    /// all up is `ok`, any down is `degraded`, any probe error is `error`
    /// with every service reported disconnected.
    pub async fn evaluate(probes: &[Arc<dyn HealthProbe>]) -> Self {
        let mut services = BTreeMap::new();
        let mut failure = None;

        for probe in probes {
            match probe.check().await {
                Ok(connected) => {
                    services.insert(probe.name().to_string(), ServiceStatus::from(connected));
                }
                Err(err) => {
                    warn!(probe = probe.name(), error = %err, "Health probe failed");
                    services.insert(probe.name().to_string(), ServiceStatus::Disconnected);
                    failure.get_or_insert_with(|| err.to_string());
                }
            }
        }

        let status = if failure.is_some() {
            for status in services.values_mut() {
                *status = ServiceStatus::Disconnected;
            }
            LivenessStatus::Error
        } else if services.values().all(|status| *status == ServiceStatus::Connected) {
            LivenessStatus::Ok
        } else {
            LivenessStatus::Degraded
        };

        Self {
            status,
            timestamp: Utc::now().to_rfc3339(),
            services,
            error: failure,
        }
    }
}
