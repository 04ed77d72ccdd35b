//! Region metadata and the inter-region latency matrix

use mesh_api::{Coordinates, Region, RegionHealth, RegionStatus};
use mesh_core::{keys, MeshError, Result, StoreHandle};
use std::time::Duration;
use tracing::{debug, info};

/// RegionDirectory stores regions and latency samples in the registry store
pub struct RegionDirectory {
    store: StoreHandle,
    latency_ttl: Duration,
    health_ttl: Duration,
}

impl RegionDirectory {
    pub fn new(store: StoreHandle, latency_ttl: Duration, health_ttl: Duration) -> Self {
        Self {
            store,
            latency_ttl,
            health_ttl,
        }
    }

    /// Create or replace a region record
    pub async fn upsert_region(&self, region: &Region) -> Result<()> {
        self.store
            .set(&keys::region(&region.region_id), serde_json::to_string(region)?, None)
            .await?;
        self.store.sadd(keys::REGIONS, &region.region_id).await?;
        debug!("Upserted region {}", region.region_id);
        Ok(())
    }

    pub async fn get_region(&self, region_id: &str) -> Result<Option<Region>> {
        match self.store.get(&keys::region(region_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// All known regions, sorted by id
    pub async fn list_regions(&self) -> Result<Vec<Region>> {
        let mut regions = Vec::new();
        for region_id in self.store.smembers(keys::REGIONS).await? {
            if let Some(region) = self.get_region(&region_id).await? {
                regions.push(region);
            }
        }
        regions.sort_by(|a, b| a.region_id.cmp(&b.region_id));
        Ok(regions)
    }

    pub async fn remove_region(&self, region_id: &str) -> Result<bool> {
        self.store.srem(keys::REGIONS, region_id).await?;
        Ok(self.store.delete(&keys::region(region_id)).await?)
    }

    /// Take a region out of (or back into) routing
    pub async fn set_region_maintenance(&self, region_id: &str, maintenance: bool) -> Result<Region> {
        let mut region = self
            .get_region(region_id)
            .await?
            .ok_or_else(|| MeshError::NotFound(format!("region {}", region_id)))?;

        region.status = if maintenance {
            RegionStatus::Maintenance
        } else {
            // The next monitor cycle recomputes the real status
            RegionStatus::Unknown
        };
        self.upsert_region(&region).await?;
        info!(
            "Region {} maintenance {}",
            region_id,
            if maintenance { "enabled" } else { "disabled" }
        );
        Ok(region)
    }

    /// Fold a fresh health aggregate into the region record
    ///
    /// Regions under maintenance keep their status.
    pub async fn apply_health(&self, health: &RegionHealth) -> Result<()> {
        let mut region = match self.get_region(&health.region_id).await? {
            Some(region) => region,
            None => return Ok(()),
        };
        if region.status != RegionStatus::Maintenance {
            region.status = health.status;
        }
        region.current_load = health.average_load;
        self.upsert_region(&region).await
    }

    /// Persist a region-health snapshot with the configured TTL
    pub async fn store_health_snapshot(&self, health: &RegionHealth) -> Result<()> {
        self.store
            .set(
                &keys::region_health(&health.region_id),
                serde_json::to_string(health)?,
                Some(self.health_ttl),
            )
            .await?;
        Ok(())
    }

    /// Last persisted snapshot, if it has not expired
    pub async fn cached_health(&self, region_id: &str) -> Result<Option<RegionHealth>> {
        match self.store.get(&keys::region_health(region_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Record a directed latency sample
    pub async fn update_latency(&self, from: &str, to: &str, latency_ms: f64) -> Result<()> {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            return Err(MeshError::InvalidConfiguration(format!(
                "latency sample {} -> {} must be a non-negative number, got {}",
                from, to, latency_ms
            )));
        }
        self.store
            .set(
                &keys::latency(from, to),
                latency_ms.to_string(),
                Some(self.latency_ttl),
            )
            .await?;
        Ok(())
    }

    /// Latest sample from `from` to `to`
    ///
    /// Missing or expired samples are unknown, never zero. Traffic that
    /// stays inside one region is taken as 0 ms.
    pub async fn latency(&self, from: &str, to: &str) -> Result<Option<f64>> {
        if from == to {
            return Ok(Some(0.0));
        }
        Ok(self
            .store
            .get(&keys::latency(from, to))
            .await?
            .and_then(|raw| raw.parse::<f64>().ok()))
    }
}

/// Well-known regions used to seed an empty directory
pub fn default_regions() -> Vec<Region> {
    vec![
        Region::new("us-east-1", "US East (N. Virginia)", "US", Some(Coordinates::new(38.9072, -77.0369)))
            .with_capacity(1000),
        Region::new("us-west-2", "US West (Oregon)", "US", Some(Coordinates::new(45.5152, -122.6784)))
            .with_capacity(1000),
        Region::new("eu-west-1", "EU (Ireland)", "IE", Some(Coordinates::new(53.3498, -6.2603)))
            .with_capacity(800),
        Region::new("eu-central-1", "EU (Frankfurt)", "DE", Some(Coordinates::new(50.1109, 8.6821)))
            .with_capacity(800),
        Region::new("ap-southeast-1", "Asia Pacific (Singapore)", "SG", Some(Coordinates::new(1.3521, 103.8198)))
            .with_capacity(600),
        Region::new("ap-northeast-1", "Asia Pacific (Tokyo)", "JP", Some(Coordinates::new(35.6762, 139.6503)))
            .with_capacity(600),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mesh_core::{ManualClock, MemoryStore};
    use std::sync::Arc;

    fn directory() -> (Arc<ManualClock>, RegionDirectory) {
        let clock = Arc::new(ManualClock::default());
        let store = StoreHandle::new(
            Arc::new(MemoryStore::with_clock(clock.clone())),
            Duration::from_millis(500),
        );
        (
            clock,
            RegionDirectory::new(store, Duration::from_secs(3600), Duration::from_secs(300)),
        )
    }

    #[tokio::test]
    async fn test_upsert_and_list_sorted() {
        let (_clock, dir) = directory();
        for region in default_regions() {
            dir.upsert_region(&region).await.unwrap();
        }
        let regions = dir.list_regions().await.unwrap();
        assert_eq!(regions.len(), 6);
        assert_eq!(regions[0].region_id, "ap-northeast-1");
        assert_eq!(regions[5].region_id, "us-west-2");
    }

    #[tokio::test]
    async fn test_latency_ttl() {
        let (clock, dir) = directory();
        dir.update_latency("us-east-1", "eu-west-1", 78.0).await.unwrap();
        assert_eq!(dir.latency("us-east-1", "eu-west-1").await.unwrap(), Some(78.0));
        // Directed: the reverse sample is unknown
        assert_eq!(dir.latency("eu-west-1", "us-east-1").await.unwrap(), None);

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(dir.latency("us-east-1", "eu-west-1").await.unwrap(), None);
        assert_eq!(dir.latency("eu-west-1", "eu-west-1").await.unwrap(), Some(0.0));
    }

    #[tokio::test]
    async fn test_invalid_latency_rejected() {
        let (_clock, dir) = directory();
        assert!(dir.update_latency("a", "b", -1.0).await.is_err());
        assert!(dir.update_latency("a", "b", f64::NAN).await.is_err());
    }

    #[tokio::test]
    async fn test_maintenance_survives_health_updates() {
        let (_clock, dir) = directory();
        dir.upsert_region(&default_regions()[0]).await.unwrap();
        dir.set_region_maintenance("us-east-1", true).await.unwrap();

        let health = RegionHealth {
            region_id: "us-east-1".to_string(),
            total_instances: 4,
            healthy_instances: 4,
            degraded_instances: 0,
            unhealthy_instances: 0,
            health_percentage: 100.0,
            average_load: 0.4,
            status: RegionStatus::Healthy,
            computed_at: Utc::now(),
        };
        dir.apply_health(&health).await.unwrap();

        let region = dir.get_region("us-east-1").await.unwrap().unwrap();
        assert_eq!(region.status, RegionStatus::Maintenance);
        assert_eq!(region.current_load, 0.4);

        dir.set_region_maintenance("us-east-1", false).await.unwrap();
        dir.apply_health(&health).await.unwrap();
        let region = dir.get_region("us-east-1").await.unwrap().unwrap();
        assert_eq!(region.status, RegionStatus::Healthy);
    }

    #[tokio::test]
    async fn test_maintenance_unknown_region() {
        let (_clock, dir) = directory();
        let err = dir.set_region_maintenance("mars-1", true).await.unwrap_err();
        assert!(matches!(err, MeshError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_health_snapshot_expires() {
        let (clock, dir) = directory();
        let health = RegionHealth {
            region_id: "eu-west-1".to_string(),
            total_instances: 0,
            healthy_instances: 0,
            degraded_instances: 0,
            unhealthy_instances: 0,
            health_percentage: 0.0,
            average_load: 0.0,
            status: RegionStatus::Unknown,
            computed_at: Utc::now(),
        };
        dir.store_health_snapshot(&health).await.unwrap();
        assert!(dir.cached_health("eu-west-1").await.unwrap().is_some());
        clock.advance(chrono::Duration::minutes(5));
        assert!(dir.cached_health("eu-west-1").await.unwrap().is_none());
    }
}
