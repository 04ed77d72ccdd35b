//! Region metadata and aggregated region health

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Geographic coordinates in decimal degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Operational status of a region
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Maintenance,
    #[default]
    Unknown,
}

impl RegionStatus {
    /// Classify a region by the share of healthy instances it hosts
    ///
    /// >= 80% healthy, [50, 80) degraded, < 50% unhealthy, no instances unknown.
    pub fn from_health(total_instances: usize, health_percentage: f64) -> Self {
        if total_instances == 0 {
            RegionStatus::Unknown
        } else if health_percentage >= 80.0 {
            RegionStatus::Healthy
        } else if health_percentage >= 50.0 {
            RegionStatus::Degraded
        } else {
            RegionStatus::Unhealthy
        }
    }
}

/// A deployment region
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub region_id: String,
    pub name: String,
    pub country_code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,

    #[serde(default)]
    pub capacity: u32,

    #[serde(default)]
    pub current_load: f64,

    #[serde(default)]
    pub status: RegionStatus,

    /// `host:port` a latency probe connects to when measuring this region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_endpoint: Option<String>,
}

impl Region {
    pub fn new(
        region_id: impl Into<String>,
        name: impl Into<String>,
        country_code: impl Into<String>,
        coordinates: Option<Coordinates>,
    ) -> Self {
        Self {
            region_id: region_id.into(),
            name: name.into(),
            country_code: country_code.into(),
            coordinates,
            capacity: 0,
            current_load: 0.0,
            status: RegionStatus::Unknown,
            probe_endpoint: None,
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_probe_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.probe_endpoint = Some(endpoint.into());
        self
    }

    /// Regions under maintenance never receive routed traffic
    pub fn is_routable(&self) -> bool {
        self.status != RegionStatus::Maintenance
    }
}

/// Health of a region aggregated over every instance it hosts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionHealth {
    pub region_id: String,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub degraded_instances: usize,
    pub unhealthy_instances: usize,
    pub health_percentage: f64,
    pub average_load: f64,
    pub status: RegionStatus,
    pub computed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_status_thresholds() {
        assert_eq!(RegionStatus::from_health(0, 0.0), RegionStatus::Unknown);
        assert_eq!(RegionStatus::from_health(10, 100.0), RegionStatus::Healthy);
        assert_eq!(RegionStatus::from_health(10, 80.0), RegionStatus::Healthy);
        assert_eq!(RegionStatus::from_health(10, 79.9), RegionStatus::Degraded);
        assert_eq!(RegionStatus::from_health(10, 50.0), RegionStatus::Degraded);
        assert_eq!(RegionStatus::from_health(10, 49.9), RegionStatus::Unhealthy);
    }

    #[test]
    fn test_maintenance_is_not_routable() {
        let mut region = Region::new("eu-west-1", "Ireland", "IE", None);
        assert!(region.is_routable());
        region.status = RegionStatus::Maintenance;
        assert!(!region.is_routable());
    }
}
