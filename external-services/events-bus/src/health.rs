// Liveness probe for the broker connection
use async_trait::async_trait;
use telemetry::HealthProbe;

use crate::bus::BusClient;

/// Service name the bus reports under in liveness responses.
pub const PROBE_NAME: &str = "rabbitmq";

#[async_trait]
impl HealthProbe for BusClient {
    fn name(&self) -> &str {
        PROBE_NAME
    }

    async fn check(&self) -> telemetry::Result<bool> {
        Ok(self.is_healthy())
    }
}
