//! Power telemetry sampled on every node and forwarded to the root.

use std::sync::Arc;

use common::{CustomSubtype, MessageKind};
use serde::Serialize;
use serde_json::json;

use crate::config::TelemetryConfig;
use crate::mesh::MeshTransport;
use crate::role::DeviceState;

/// One reading of the power monitor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerReading {
    /// Volts.
    pub bus_voltage: f32,
    /// Millivolts.
    pub shunt_voltage: f32,
    /// Milliamps.
    pub current: f32,
    /// Milliwatts.
    pub power: f32,
}

pub trait PowerSampler: Send + Sync {
    fn sample(&self) -> anyhow::Result<PowerReading>;
}

/// Measurement document the upstream time-series store expects.
pub fn measurement(config: &TelemetryConfig, reading: &PowerReading, timestamp: i64) -> serde_json::Value {
    json!({
        "measurement": "power_manager",
        "tags": {
            "region": config.region,
            "city": config.city,
        },
        "fields": reading,
        "timestamp": timestamp,
    })
}

pub struct TelemetryReporter {
    pub transport: Arc<dyn MeshTransport>,
    pub sampler: Arc<dyn PowerSampler>,
    pub state: DeviceState,
    pub config: TelemetryConfig,
}

impl TelemetryReporter {
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            "telemetry: reporting every {} ms",
            self.config.interval().as_millis()
        );
        let mut ticker = tokio::time::interval(self.config.interval());

        while self.state.is_linked() {
            tokio::select! {
                _ = self.state.link_lost() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.report().await {
                warn!("telemetry: <{:#}> report", e);
            }
        }

        info!("telemetry: stopped");
        Ok(())
    }

    async fn report(&self) -> anyhow::Result<()> {
        let reading = self.sampler.sample()?;
        let document = measurement(&self.config, &reading, chrono::Utc::now().timestamp());
        let payload = serde_json::to_vec(&document)?;
        debug!("telemetry: {}", String::from_utf8_lossy(&payload));

        self.transport
            .write_to_root(MessageKind::Custom(CustomSubtype::TelemetryForward), &payload)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_document() {
        let config = TelemetryConfig::default();
        let reading = PowerReading {
            bus_voltage: 5.0,
            shunt_voltage: 0.5,
            current: 120.0,
            power: 600.0,
        };
        let doc = measurement(&config, &reading, 1_700_000_000);

        assert_eq!(doc["measurement"], "power_manager");
        assert_eq!(doc["tags"]["region"], "sicily");
        assert_eq!(doc["tags"]["city"], "messina");
        assert_eq!(doc["fields"]["bus_voltage"], 5.0);
        assert_eq!(doc["fields"]["current"], 120.0);
        assert_eq!(doc["timestamp"], 1_700_000_000i64);
    }
}
