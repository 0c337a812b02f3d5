use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use telemetry::{HealthProbe, LivenessReport, LivenessStatus, ServiceStatus};
use tracing::info;

#[derive(Clone)]
pub struct HealthState {
    probes: Arc<Vec<Arc<dyn HealthProbe>>>,
}

pub fn router(probes: Vec<Arc<dyn HealthProbe>>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(HealthState {
            probes: Arc::new(probes),
        })
}

/// 200 when every probe is up, 503 otherwise. The body is the report
/// either way.
pub async fn health_check(State(state): State<HealthState>) -> (StatusCode, Json<LivenessReport>) {
    let report = LivenessReport::evaluate(&state.probes).await;
    let code = if report.status.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

pub async fn serve(addr: SocketAddr, probes: Vec<Arc<dyn HealthProbe>>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(%addr, "Health check available at http://{addr}/health");

    axum::serve(listener, router(probes))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("health server error")
}

/// Report for when the bus could not even be constructed. The broker being
/// down is a degraded dependency, not a failed check.
pub fn unreachable_report(error: &str) -> LivenessReport {
    let mut services = BTreeMap::new();
    services.insert(events_bus::health::PROBE_NAME.to_string(), ServiceStatus::Disconnected);
    LivenessReport {
        status: LivenessStatus::Degraded,
        timestamp: Utc::now().to_rfc3339(),
        services,
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use telemetry::{FnProbe, TelemetryError};

    fn state(probes: Vec<Arc<dyn HealthProbe>>) -> State<HealthState> {
        State(HealthState {
            probes: Arc::new(probes),
        })
    }

    #[tokio::test]
    async fn healthy_bus_answers_200() {
        let probes: Vec<Arc<dyn HealthProbe>> =
            vec![Arc::new(FnProbe::new("rabbitmq", || async { Ok(true) }))];

        let (code, Json(report)) = health_check(state(probes)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(report.status, LivenessStatus::Ok);
        assert_eq!(report.services["rabbitmq"], ServiceStatus::Connected);
    }

    #[tokio::test]
    async fn lost_broker_answers_503_degraded() {
        let probes: Vec<Arc<dyn HealthProbe>> =
            vec![Arc::new(FnProbe::new("rabbitmq", || async { Ok(false) }))];

        let (code, Json(report)) = health_check(state(probes)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.status, LivenessStatus::Degraded);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn failing_probe_answers_503_error() {
        let probes: Vec<Arc<dyn HealthProbe>> = vec![Arc::new(FnProbe::new("rabbitmq", || async {
            Err(TelemetryError::probe("rabbitmq", "channel poisoned"))
        }))];

        let (code, Json(report)) = health_check(state(probes)).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(report.status, LivenessStatus::Error);
        assert!(report.error.is_some());
    }

    #[test]
    fn unreachable_broker_is_degraded_with_reason() {
        let report = unreachable_report("connection refused");
        assert_eq!(report.status, LivenessStatus::Degraded);
        assert_eq!(report.services["rabbitmq"], ServiceStatus::Disconnected);
        assert_eq!(report.error.as_deref(), Some("connection refused"));
    }
}
