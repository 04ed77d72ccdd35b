//! Heartbeat-based liveness
//!
//! Two tiers: an instance older than the aliveness window is no longer
//! offered to routing, and one older than the dead threshold is removed
//! from the registry by the sweep.

use crate::config::MeshConfig;
use crate::error::Result;
use crate::registry::ServiceRegistrar;
use chrono::{DateTime, Duration, Utc};
use mesh_api::{InstanceStatus, RegionHealth, RegionStatus, ServiceInstance};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Thresholds that turn a heartbeat age into a status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub aliveness_window: Duration,
    pub dead_threshold: Duration,
}

impl LivenessPolicy {
    pub fn from_config(config: &MeshConfig) -> Self {
        Self {
            aliveness_window: config.aliveness_window(),
            dead_threshold: config.dead_threshold(),
        }
    }

    pub fn status(&self, age: Duration) -> InstanceStatus {
        if self.is_alive(age) {
            InstanceStatus::Healthy
        } else if !self.is_dead(age) {
            InstanceStatus::Degraded
        } else {
            InstanceStatus::Unhealthy
        }
    }

    /// Young enough to be offered to routing
    pub fn is_alive(&self, age: Duration) -> bool {
        age < self.aliveness_window
    }

    /// Old enough to be evicted by the sweep
    pub fn is_dead(&self, age: Duration) -> bool {
        age > self.dead_threshold
    }
}

/// HealthMonitor derives liveness and performs the hard sweep
pub struct HealthMonitor {
    registrar: Arc<ServiceRegistrar>,
}

impl HealthMonitor {
    pub fn new(registrar: Arc<ServiceRegistrar>) -> Self {
        Self { registrar }
    }

    /// Status of an instance as of now
    pub fn instance_status(&self, instance: &ServiceInstance) -> InstanceStatus {
        let age = instance.heartbeat_age(self.registrar.clock().now());
        self.registrar.liveness().status(age)
    }

    pub fn is_alive(&self, instance: &ServiceInstance) -> bool {
        let age = instance.heartbeat_age(self.registrar.clock().now());
        self.registrar.liveness().is_alive(age)
    }

    /// Remove every instance whose heartbeat is past the dead threshold
    ///
    /// Returns the evicted instance ids. Services left without instances
    /// are dropped from the service index.
    pub async fn sweep_dead(&self) -> Result<Vec<String>> {
        let liveness = *self.registrar.liveness();
        let now = self.registrar.clock().now();
        let mut evicted = Vec::new();

        for service in self.registrar.service_names().await? {
            for instance in self.registrar.all_instances(&service).await? {
                let age = instance.heartbeat_age(now);
                if !liveness.is_dead(age) {
                    continue;
                }
                if self.registrar.unregister(&instance.instance_id).await? {
                    info!(
                        "Evicted dead instance {} of {} (heartbeat age {}s)",
                        instance.instance_id,
                        service,
                        age.num_seconds()
                    );
                    evicted.push(instance.instance_id);
                }
            }

            if self.registrar.prune_service(&service).await? {
                debug!("Service {} has no instances left", service);
            }
        }

        if !evicted.is_empty() {
            info!("Sweep evicted {} dead instances", evicted.len());
        }
        Ok(evicted)
    }

    /// Aggregate health over every instance hosted in a region
    pub async fn region_health(&self, region_id: &str) -> Result<RegionHealth> {
        let instances = self.registrar.region_instances(region_id).await?;
        Ok(Self::aggregate(
            region_id,
            &instances,
            self.registrar.clock().now(),
        ))
    }

    /// Build a health record from a set of instances with current statuses
    pub fn aggregate(
        region_id: &str,
        instances: &[ServiceInstance],
        now: DateTime<Utc>,
    ) -> RegionHealth {
        let total = instances.len();
        let count = |status: InstanceStatus| instances.iter().filter(|i| i.status == status).count();
        let healthy = count(InstanceStatus::Healthy);
        let degraded = count(InstanceStatus::Degraded);
        let unhealthy = count(InstanceStatus::Unhealthy);

        let (health_percentage, average_load) = if total == 0 {
            (0.0, 0.0)
        } else {
            (
                healthy as f64 / total as f64 * 100.0,
                instances.iter().map(|i| i.load_score).sum::<f64>() / total as f64,
            )
        };

        if total > 0 && health_percentage < 50.0 {
            warn!(
                "Region {} is unhealthy: {}/{} instances healthy",
                region_id, healthy, total
            );
        }

        RegionHealth {
            region_id: region_id.to_string(),
            total_instances: total,
            healthy_instances: healthy,
            degraded_instances: degraded,
            unhealthy_instances: unhealthy,
            health_percentage,
            average_load,
            status: RegionStatus::from_health(total, health_percentage),
            computed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys;
    use crate::memory::MemoryStore;
    use crate::store::{RegistryStore, StoreHandle};
    use std::collections::BTreeMap;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>, Arc<ServiceRegistrar>, HealthMonitor) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let handle = StoreHandle::new(store.clone(), std::time::Duration::from_millis(500));
        let registrar = Arc::new(ServiceRegistrar::new(
            handle,
            clock.clone(),
            &MeshConfig::default(),
        ));
        let monitor = HealthMonitor::new(registrar.clone());
        (clock, store, registrar, monitor)
    }

    #[test]
    fn test_liveness_tiers() {
        let policy = LivenessPolicy::from_config(&MeshConfig::default());
        assert_eq!(policy.status(Duration::seconds(59)), InstanceStatus::Healthy);
        assert_eq!(policy.status(Duration::seconds(60)), InstanceStatus::Degraded);
        assert_eq!(policy.status(Duration::seconds(120)), InstanceStatus::Degraded);
        assert_eq!(policy.status(Duration::seconds(121)), InstanceStatus::Unhealthy);
        assert!(!policy.is_dead(Duration::seconds(120)));
        assert!(policy.is_dead(Duration::seconds(121)));
    }

    #[tokio::test]
    async fn test_sweep_evicts_121s_old_instance() {
        let (clock, store, registrar, monitor) = setup();
        let dead = registrar
            .register_in_region("orders", "10.0.0.1", 8000, "us-east-1", BTreeMap::new())
            .await
            .unwrap();
        clock.advance(Duration::seconds(62));
        let alive = registrar
            .register_in_region("orders", "10.0.0.2", 8000, "us-east-1", BTreeMap::new())
            .await
            .unwrap();

        // dead is now 121s old, alive is 59s old
        clock.advance(Duration::seconds(59));
        let evicted = monitor.sweep_dead().await.unwrap();
        assert_eq!(evicted, vec![dead.clone()]);

        let service_set = store.smembers(&keys::service_instances("orders")).await.unwrap();
        let region_set = store.smembers(&keys::region_instances("us-east-1")).await.unwrap();
        assert_eq!(service_set, vec![alive.clone()]);
        assert_eq!(region_set, vec![alive.clone()]);

        let listed = registrar.list_instances("orders").await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].instance_id, alive);
    }

    #[tokio::test]
    async fn test_sweep_prunes_empty_services() {
        let (clock, _store, registrar, monitor) = setup();
        registrar
            .register("billing", "10.0.0.9", 9000, BTreeMap::new())
            .await
            .unwrap();
        clock.advance(Duration::seconds(121));
        monitor.sweep_dead().await.unwrap();
        assert!(registrar.service_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_region_health_aggregation() {
        let (clock, _store, registrar, monitor) = setup();
        for host in ["10.0.0.1", "10.0.0.2"] {
            registrar
                .register_in_region("orders", host, 8000, "eu-west-1", BTreeMap::new())
                .await
                .unwrap();
        }
        clock.advance(Duration::seconds(70));
        for host in ["10.0.0.3", "10.0.0.4", "10.0.0.5"] {
            registrar
                .register_in_region("search", host, 8000, "eu-west-1", BTreeMap::new())
                .await
                .unwrap();
        }

        let health = monitor.region_health("eu-west-1").await.unwrap();
        assert_eq!(health.total_instances, 5);
        assert_eq!(health.healthy_instances, 3);
        assert_eq!(health.degraded_instances, 2);
        assert!((health.health_percentage - 60.0).abs() < 1e-9);
        assert_eq!(health.status, RegionStatus::Degraded);
    }

    #[tokio::test]
    async fn test_empty_region_is_unknown() {
        let (_clock, _store, _registrar, monitor) = setup();
        let health = monitor.region_health("ap-south-1").await.unwrap();
        assert_eq!(health.total_instances, 0);
        assert_eq!(health.status, RegionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_instance_status_recomputed() {
        let (clock, _store, registrar, monitor) = setup();
        let id = registrar
            .register("orders", "10.0.0.1", 8000, BTreeMap::new())
            .await
            .unwrap();
        let instance = registrar.get_instance(&id).await.unwrap().unwrap();
        assert!(monitor.is_alive(&instance));

        clock.advance(Duration::seconds(90));
        assert_eq!(monitor.instance_status(&instance), InstanceStatus::Degraded);
    }
}
