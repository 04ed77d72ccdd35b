//! Service instance records

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Liveness status derived from heartbeat recency
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl InstanceStatus {
    /// Weight of this status when averaging health across instances
    pub fn health_value(&self) -> f64 {
        match self {
            InstanceStatus::Healthy => 1.0,
            InstanceStatus::Degraded => 0.5,
            InstanceStatus::Unhealthy => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Healthy => "healthy",
            InstanceStatus::Degraded => "degraded",
            InstanceStatus::Unhealthy => "unhealthy",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered service instance
///
/// `status` is a display value. It is recomputed from `last_heartbeat`
/// whenever the record is read and is never the basis for removal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,

    /// Opaque key/value metadata supplied at registration
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    /// Self-reported load, lower means less loaded
    #[serde(default)]
    pub load_score: f64,

    /// Hosting region, only set for global-tier instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<String>,
}

impl ServiceInstance {
    /// Build the deterministic id used for a service/host/port triple
    ///
    /// Each part is length-prefixed before hashing, so no two distinct
    /// triples share a name even when names and hosts contain separators.
    pub fn make_id(service_name: &str, host: &str, port: u16) -> String {
        let name = format!(
            "{}:{}{}:{}{}",
            service_name.len(),
            service_name,
            host.len(),
            host,
            port
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    /// Create a fresh, healthy instance record
    pub fn new(
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        now: DateTime<Utc>,
    ) -> Self {
        let service_name = service_name.into();
        let host = host.into();
        Self {
            instance_id: Self::make_id(&service_name, &host, port),
            service_name,
            host,
            port,
            status: InstanceStatus::Healthy,
            last_heartbeat: now,
            metadata: BTreeMap::new(),
            load_score: 0.0,
            region_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_region(mut self, region_id: impl Into<String>) -> Self {
        self.region_id = Some(region_id.into());
        self
    }

    /// `host:port` address the caller should dial
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Time elapsed since the last heartbeat
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_heartbeat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_instance_is_healthy() {
        let now = Utc::now();
        let instance = ServiceInstance::new("checkout", "10.0.0.1", 8080, now);
        assert_eq!(
            instance.instance_id,
            ServiceInstance::make_id("checkout", "10.0.0.1", 8080)
        );
        assert_eq!(instance.status, InstanceStatus::Healthy);
        assert_eq!(instance.load_score, 0.0);
        assert_eq!(instance.address(), "10.0.0.1:8080");
        assert!(instance.region_id.is_none());
    }

    #[test]
    fn test_make_id_is_stable_and_unambiguous() {
        assert_eq!(
            ServiceInstance::make_id("user-api", "pod1", 80),
            ServiceInstance::make_id("user-api", "pod1", 80)
        );
        assert_ne!(
            ServiceInstance::make_id("user-api", "pod1", 80),
            ServiceInstance::make_id("user", "api-pod1", 80)
        );
        assert_ne!(
            ServiceInstance::make_id("svc", "host1", 80),
            ServiceInstance::make_id("svc", "host", 180)
        );
        assert!(Uuid::parse_str(&ServiceInstance::make_id("svc", "host", 80)).is_ok());
    }

    #[test]
    fn test_heartbeat_age() {
        let now = Utc::now();
        let mut instance = ServiceInstance::new("checkout", "10.0.0.1", 8080, now);
        instance.last_heartbeat = now - Duration::seconds(59);
        assert_eq!(instance.heartbeat_age(now).num_seconds(), 59);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&InstanceStatus::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        assert_eq!(InstanceStatus::Unhealthy.health_value(), 0.0);
    }
}
