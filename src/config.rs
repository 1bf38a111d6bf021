//! Service configuration, loaded from YAML.

use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::directory::ContainerId;

const LOCAL_ENV: &str = "local";
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 10;

/// Telemetry export settings.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enable_metrics: bool,
    /// OpenTelemetry collector gRPC endpoint. Defaults to the
    /// OTEL_EXPORTER_OTLP_ENDPOINT env var or localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Metrics export interval in seconds.
    #[serde_inline_default(Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS))]
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
        }
    }
}

/// Top-level configuration for the control plane service.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    /// Identifier of this storage node.
    #[serde_inline_default("caskstore-node".to_string())]
    pub node_id: String,
    /// Number of storage containers on this node.
    #[serde_inline_default(8usize)]
    pub containers: usize,
    /// Container ids are `<prefix>-NNN`, 1-based, zero-padded so lexical
    /// order is numeric order.
    #[serde_inline_default("cask".to_string())]
    pub container_prefix: String,
    /// Default concurrency cap for compaction runs triggered by the service
    /// itself.
    #[serde_inline_default(1usize)]
    pub max_compaction_concurrency: usize,
    /// When set, the service admits an unqualified compaction run this
    /// often. Unset means compaction is operator-driven only.
    #[serde(default)]
    pub auto_compaction_interval_secs: Option<u64>,
    /// Bind address for the HTTP monitoring server.
    #[serde_inline_default("0.0.0.0:7171".to_string())]
    pub monitoring_addr: String,
    /// Deployment environment; anything but "local" switches to structured
    /// logging.
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            node_id: "caskstore-node".to_string(),
            containers: 8,
            container_prefix: "cask".to_string(),
            max_compaction_concurrency: 1,
            auto_compaction_interval_secs: None,
            monitoring_addr: "0.0.0.0:7171".to_string(),
            env: LOCAL_ENV.to_string(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_path(path: &str) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    fn from_yaml_str(config_str: &str) -> Result<Self> {
        let mut config: ControlPlaneConfig = serde_saphyr::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.containers == 0 {
            return Err(anyhow::anyhow!("containers must be at least 1"));
        }
        if self.max_compaction_concurrency == 0 {
            return Err(anyhow::anyhow!(
                "max_compaction_concurrency must be at least 1"
            ));
        }
        if self.monitoring_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "monitoring_addr is not a socket address: {}",
                self.monitoring_addr
            ));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    /// The container fleet this node hosts, in directory order.
    pub fn container_ids(&self) -> Vec<ContainerId> {
        (1..=self.containers)
            .map(|i| ContainerId::new(format!("{}-{i:03}", self.container_prefix)))
            .collect()
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
