//! Mesh configuration
//!
//! Loaded from an optional YAML file named by `MESH_CONFIG`, then
//! overridden field by field from `MESH_*` environment variables.

use crate::error::{MeshError, Result};
use anyhow::Context;
use mesh_api::LoadBalanceStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Which latency probe the monitor loop uses
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyProbeKind {
    #[default]
    Tcp,
    Simulated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Monitor loop period, also the expected heartbeat cadence
    pub heartbeat_interval_secs: u64,
    /// Max heartbeat age for an instance to be offered to routing
    pub aliveness_window_secs: u64,
    /// Max heartbeat age before an instance is removed by the sweep
    pub dead_threshold_secs: u64,
    /// Consecutive failures that open a breaker
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
    pub load_balance_strategy: LoadBalanceStrategy,
    /// Upper bound on every registry store call
    pub store_timeout_ms: u64,
    /// Sleep after a failed monitor cycle
    pub monitor_backoff_secs: u64,
    pub latency_ttl_secs: u64,
    pub region_health_ttl_secs: u64,
    pub latency_probe: LatencyProbeKind,
    pub listen_addr: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            aliveness_window_secs: 60,
            dead_threshold_secs: 120,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 60,
            load_balance_strategy: LoadBalanceStrategy::RoundRobin,
            store_timeout_ms: 500,
            monitor_backoff_secs: 60,
            latency_ttl_secs: 3600,
            region_health_ttl_secs: 300,
            latency_probe: LatencyProbeKind::Tcp,
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl MeshConfig {
    /// Load from `MESH_CONFIG` (if set) and the process environment
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("MESH_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        info!("Loaded mesh configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `MESH_*` overrides resolved through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(name: &str, raw: String) -> Result<T> {
            raw.trim().parse().map_err(|_| {
                MeshError::InvalidConfiguration(format!("{} has invalid value {:?}", name, raw))
            })
        }

        if let Some(v) = lookup("MESH_HEARTBEAT_INTERVAL_SECS") {
            self.heartbeat_interval_secs = parse("MESH_HEARTBEAT_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("MESH_ALIVENESS_WINDOW_SECS") {
            self.aliveness_window_secs = parse("MESH_ALIVENESS_WINDOW_SECS", v)?;
        }
        if let Some(v) = lookup("MESH_DEAD_THRESHOLD_SECS") {
            self.dead_threshold_secs = parse("MESH_DEAD_THRESHOLD_SECS", v)?;
        }
        if let Some(v) = lookup("MESH_CIRCUIT_BREAKER_THRESHOLD") {
            self.circuit_breaker_threshold = parse("MESH_CIRCUIT_BREAKER_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("MESH_CIRCUIT_BREAKER_COOLDOWN_SECS") {
            self.circuit_breaker_cooldown_secs = parse("MESH_CIRCUIT_BREAKER_COOLDOWN_SECS", v)?;
        }
        if let Some(v) = lookup("MESH_LOAD_BALANCE_STRATEGY") {
            self.load_balance_strategy = v.parse::<LoadBalanceStrategy>()?;
        }
        if let Some(v) = lookup("MESH_STORE_TIMEOUT_MS") {
            self.store_timeout_ms = parse("MESH_STORE_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("MESH_LATENCY_PROBE") {
            self.latency_probe = match v.trim().to_ascii_lowercase().as_str() {
                "tcp" => LatencyProbeKind::Tcp,
                "simulated" => LatencyProbeKind::Simulated,
                _ => {
                    return Err(MeshError::InvalidConfiguration(format!(
                        "MESH_LATENCY_PROBE has invalid value {:?}",
                        v
                    )))
                }
            };
        }
        if let Some(v) = lookup("MESH_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        Ok(())
    }

    /// Reject settings the liveness and breaker logic cannot honour
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("aliveness_window_secs", self.aliveness_window_secs),
            ("dead_threshold_secs", self.dead_threshold_secs),
            ("circuit_breaker_cooldown_secs", self.circuit_breaker_cooldown_secs),
            ("monitor_backoff_secs", self.monitor_backoff_secs),
            ("latency_ttl_secs", self.latency_ttl_secs),
            ("region_health_ttl_secs", self.region_health_ttl_secs),
            ("store_timeout_ms", self.store_timeout_ms / 1000),
        ];
        for (name, secs) in durations {
            if secs > MAX_DURATION_SECS {
                return Err(MeshError::InvalidConfiguration(format!(
                    "{} exceeds the maximum of {}s",
                    name, MAX_DURATION_SECS
                )));
            }
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(MeshError::InvalidConfiguration(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(MeshError::InvalidConfiguration(
                "circuit_breaker_threshold must be positive".to_string(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(MeshError::InvalidConfiguration(
                "store_timeout_ms must be positive".to_string(),
            ));
        }
        if self.aliveness_window_secs == 0 || self.aliveness_window_secs >= self.dead_threshold_secs {
            return Err(MeshError::InvalidConfiguration(format!(
                "aliveness window ({}s) must be positive and below the dead threshold ({}s)",
                self.aliveness_window_secs, self.dead_threshold_secs
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn aliveness_window(&self) -> chrono::Duration {
        signed_secs(self.aliveness_window_secs)
    }

    pub fn dead_threshold(&self) -> chrono::Duration {
        signed_secs(self.dead_threshold_secs)
    }

    pub fn circuit_breaker_cooldown(&self) -> chrono::Duration {
        signed_secs(self.circuit_breaker_cooldown_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn monitor_backoff(&self) -> Duration {
        Duration::from_secs(self.monitor_backoff_secs)
    }

    pub fn latency_ttl(&self) -> Duration {
        Duration::from_secs(self.latency_ttl_secs)
    }

    pub fn region_health_ttl(&self) -> Duration {
        Duration::from_secs(self.region_health_ttl_secs)
    }
}

/// Upper bound on every duration setting (one year)
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

fn signed_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}
