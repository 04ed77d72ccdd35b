//! Load balancing strategies for distributing traffic across instances

use mesh_api::{InstanceStatus, LoadBalanceStrategy, ServiceInstance};
use mesh_core::{keys, Result, StoreHandle};
use rand::seq::SliceRandom;
use tracing::debug;

/// Load balancer for selecting one instance from a healthy set
///
/// Round-robin counters live in the registry store so that every routing
/// process shares one sequence per scope.
#[derive(Clone)]
pub struct LoadBalancer {
    store: StoreHandle,
}

impl LoadBalancer {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }

    /// Select an instance using `strategy`
    ///
    /// `scope` names the round-robin counter, normally the service name.
    /// Only instances whose status is healthy are considered.
    pub async fn select(
        &self,
        scope: &str,
        instances: &[ServiceInstance],
        strategy: LoadBalanceStrategy,
    ) -> Result<Option<ServiceInstance>> {
        // Filter to only healthy instances
        let healthy: Vec<&ServiceInstance> = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Healthy)
            .collect();

        if healthy.is_empty() {
            return Ok(None);
        }

        let selected = match strategy {
            LoadBalanceStrategy::RoundRobin => self.select_round_robin(scope, &healthy).await?,
            LoadBalanceStrategy::LeastLoaded => Self::select_least_loaded(&healthy),
            LoadBalanceStrategy::Random => Self::select_random(&healthy),
        };

        if let Some(instance) = selected {
            debug!(
                "Selected {} for {} ({})",
                instance.instance_id, scope, strategy
            );
        }
        Ok(selected.cloned())
    }

    /// Select instance using the shared round-robin counter
    async fn select_round_robin<'a>(
        &self,
        scope: &str,
        instances: &[&'a ServiceInstance],
    ) -> Result<Option<&'a ServiceInstance>> {
        let counter = self.store.incr(&keys::round_robin(scope)).await?;
        // The counter starts at 1, so the first pick is index 0
        let index = (counter - 1).rem_euclid(instances.len() as i64) as usize;
        Ok(instances.get(index).copied())
    }

    /// Select the instance with the minimum load score
    fn select_least_loaded<'a>(instances: &[&'a ServiceInstance]) -> Option<&'a ServiceInstance> {
        // min_by keeps the first of equal elements
        instances
            .iter()
            .copied()
            .min_by(|a, b| a.load_score.total_cmp(&b.load_score))
    }

    fn select_random<'a>(instances: &[&'a ServiceInstance]) -> Option<&'a ServiceInstance> {
        instances.choose(&mut rand::thread_rng()).copied()
    }
}
