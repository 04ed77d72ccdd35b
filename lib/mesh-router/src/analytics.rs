//! Mesh-wide statistics

use crate::region::RegionDirectory;
use chrono::{DateTime, Utc};
use mesh_api::{CircuitState, InstanceStatus, MeshStatistics};
use mesh_core::{Result, ServiceRegistrar};
use mesh_proxy::CircuitBreakerRegistry;

/// Build a statistics snapshot
///
/// Instances are found by key enumeration, which is fine for analytics
/// but never used on a routing path.
pub async fn collect_statistics(
    registrar: &ServiceRegistrar,
    directory: &RegionDirectory,
    breakers: &CircuitBreakerRegistry,
    now: DateTime<Utc>,
) -> Result<MeshStatistics> {
    let instances = registrar.scan_instances().await?;
    let mut stats = MeshStatistics {
        total_instances: instances.len(),
        region_count: directory.list_regions().await?.len(),
        generated_at: Some(now),
        ..MeshStatistics::default()
    };

    for instance in &instances {
        match instance.status {
            InstanceStatus::Healthy => stats.healthy_instances += 1,
            InstanceStatus::Degraded => stats.degraded_instances += 1,
            InstanceStatus::Unhealthy => stats.unhealthy_instances += 1,
        }
        *stats
            .instances_per_service
            .entry(instance.service_name.clone())
            .or_insert(0) += 1;
        if let Some(region_id) = &instance.region_id {
            *stats
                .instances_per_region
                .entry(region_id.clone())
                .or_insert(0) += 1;
        }
    }

    for breaker in breakers.all() {
        match breakers.state(&breaker.service_name) {
            CircuitState::Open => stats.open_circuits.push(breaker.service_name),
            CircuitState::HalfOpen => stats.half_open_circuits.push(breaker.service_name),
            CircuitState::Closed => {}
        }
    }

    Ok(stats)
}
