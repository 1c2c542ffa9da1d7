use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Error};
use common::MeshAddress;
use serde::{Deserialize, Serialize};

/// Depth of the root in the mesh tree.
pub const ROOT_LAYER: i32 = 1;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub broker: BrokerConfig,
    pub ota: OtaConfig,
    pub mesh: MeshConfig,
    pub telemetry: TelemetryConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub client_id: String,
    /// Topic carrying `{"ota_endpoint": ...}` commands.
    pub command_topic: String,
    /// Topic node telemetry is forwarded to.
    pub telemetry_topic: String,
    /// Topic receiving one report per distribution cycle.
    pub status_topic: String,
    pub retain_telemetry: bool,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    /// Attempts at opening the firmware url before the cycle fails. `None`
    /// keeps retrying for as long as the device is root.
    pub open_retry_limit: Option<u32>,
    pub open_retry_backoff_ms: u64,
    /// Devices to upgrade, as `aa:bb:cc:dd:ee:ff`. Empty means every node.
    pub targets: Vec<String>,
    /// Whole-request timeout for the firmware download. Unset by default, so
    /// a stalled server stalls the cycle.
    pub http_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub root_layer: i32,
    pub restart_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub region: String,
    pub city: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    /// Non-root devices in the simulated mesh.
    pub nodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broker: BrokerConfig::default(),
            ota: OtaConfig::default(),
            mesh: MeshConfig::default(),
            telemetry: TelemetryConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://broker.mqttdashboard.com:1883".to_string(),
            client_id: "mesh-ota-gateway".to_string(),
            command_topic: "/unime/fcrlab/ponmetro/smartagriculture/ota/endpoint".to_string(),
            telemetry_topic: "/unime/fcrlab/ponmetro/smartagriculture/reading".to_string(),
            status_topic: "/unime/fcrlab/ponmetro/smartagriculture/ota/status".to_string(),
            retain_telemetry: true,
            keep_alive_secs: 30,
        }
    }
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            open_retry_limit: Some(30),
            open_retry_backoff_ms: 1000,
            targets: Vec::new(),
            http_timeout_secs: None,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            root_layer: ROOT_LAYER,
            restart_delay_ms: 3000,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 1000,
            region: "sicily".to_string(),
            city: "messina".to_string(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { nodes: 3 }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        let path = path.as_ref();
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Config =
            ron::from_str(&config).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Config, Error> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }
}

impl OtaConfig {
    /// Distribution targets, broadcast when none are configured.
    pub fn target_addresses(&self) -> Result<Vec<MeshAddress>, Error> {
        if self.targets.is_empty() {
            return Ok(vec![MeshAddress::BROADCAST]);
        }
        self.targets
            .iter()
            .map(|target| {
                target
                    .parse::<MeshAddress>()
                    .map_err(|e| anyhow::anyhow!("ota target {target:?}: {e}"))
            })
            .collect()
    }

    pub fn open_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.open_retry_backoff_ms)
    }

    pub fn http_timeout(&self) -> Option<Duration> {
        self.http_timeout_secs.map(Duration::from_secs)
    }
}

impl MeshConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load() {
        let path = std::env::temp_dir().join(format!("gateway-config-{}.ron", std::process::id()));
        std::fs::write(
            &path,
            r#"(
    log_level: "debug",
    broker: (
        url: "mqtt://localhost:1883",
        command_topic: "ota/cmd",
    ),
    ota: (
        open_retry_limit: None,
        targets: ["24:0a:c4:00:00:02"],
    ),
)"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.broker.url, "mqtt://localhost:1883");
        assert_eq!(config.broker.command_topic, "ota/cmd");
        // Untouched fields keep their defaults
        assert_eq!(config.broker.telemetry_topic, BrokerConfig::default().telemetry_topic);
        assert_eq!(config.ota.open_retry_limit, None);
        assert_eq!(config.ota.open_retry_backoff_ms, 1000);
        assert_eq!(config.mesh, MeshConfig::default());
        assert_eq!(
            config.ota.target_addresses().unwrap(),
            vec![MeshAddress::new([0x24, 0x0a, 0xc4, 0, 0, 2])]
        );
    }

    #[test]
    fn test_missing_file_defaults() {
        let config = Config::load_or_default("/nonexistent/gateway.ron").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_targets_default_to_broadcast() {
        let ota = OtaConfig::default();
        assert_eq!(ota.target_addresses().unwrap(), vec![MeshAddress::BROADCAST]);
    }

    #[test]
    fn test_bad_target_rejected() {
        let ota = OtaConfig {
            targets: vec!["not-a-mac".to_string()],
            ..OtaConfig::default()
        };
        assert!(ota.target_addresses().is_err());
    }
}
