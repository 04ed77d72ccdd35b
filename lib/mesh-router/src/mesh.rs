//! ServiceMesh: the operations the mesh exposes to callers
//!
//! Write paths (register, heartbeat, unregister) surface store failures.
//! Read paths degrade: a route that cannot be served for any reason other
//! than an open circuit reports `NotFound`.

use crate::analytics::collect_statistics;
use crate::global::{FallbackPolicy, GlobalRouter};
use crate::monitor::MonitorLoop;
use crate::probe::LatencyProbe;
use crate::region::RegionDirectory;
use mesh_api::{
    CircuitState, Coordinates, GlobalRoute, LoadBalanceStrategy, MeshStatistics, Region,
    RegionHealth, ServiceInstance,
};
use mesh_core::{
    Clock, HealthMonitor, MeshConfig, MeshError, RegistryStore, Result, ServiceRegistrar,
    StoreHandle,
};
use mesh_proxy::{BreakerConfig, CircuitBreakerRegistry, LoadBalancer, MeshMetrics, Permit};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const LOCAL: &str = "local";
const GLOBAL: &str = "global";

pub struct ServiceMesh {
    config: MeshConfig,
    clock: Arc<dyn Clock>,
    registrar: Arc<ServiceRegistrar>,
    health: Arc<HealthMonitor>,
    breakers: Arc<CircuitBreakerRegistry>,
    balancer: LoadBalancer,
    directory: Arc<RegionDirectory>,
    router: GlobalRouter,
    metrics: MeshMetrics,
}

impl ServiceMesh {
    pub fn new(
        config: MeshConfig,
        store: Arc<dyn RegistryStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = StoreHandle::new(store, config.store_timeout());
        let registrar = Arc::new(ServiceRegistrar::new(store.clone(), clock.clone(), &config));
        let health = Arc::new(HealthMonitor::new(registrar.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            BreakerConfig::from(&config),
            clock.clone(),
        ));
        let balancer = LoadBalancer::new(store.clone());
        let directory = Arc::new(RegionDirectory::new(
            store,
            config.latency_ttl(),
            config.region_health_ttl(),
        ));
        let router = GlobalRouter::new(registrar.clone(), directory.clone(), balancer.clone());

        Ok(Self {
            config,
            clock,
            registrar,
            health,
            breakers,
            balancer,
            directory,
            router,
            metrics: MeshMetrics::new()?,
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn registrar(&self) -> &Arc<ServiceRegistrar> {
        &self.registrar
    }

    pub fn directory(&self) -> &Arc<RegionDirectory> {
        &self.directory
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn metrics(&self) -> &MeshMetrics {
        &self.metrics
    }

    /// Build the background monitor loop over this mesh's state
    pub fn monitor(&self, probe: Arc<dyn LatencyProbe>) -> MonitorLoop {
        MonitorLoop::new(
            self.health.clone(),
            self.directory.clone(),
            probe,
            self.metrics.clone(),
            &self.config,
        )
    }

    pub async fn register(
        &self,
        service_name: &str,
        host: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        self.registrar
            .register(service_name, host, port, metadata)
            .await
    }

    pub async fn register_in_region(
        &self,
        service_name: &str,
        host: &str,
        port: u16,
        region_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        self.registrar
            .register_in_region(service_name, host, port, region_id, metadata)
            .await
    }

    pub async fn unregister(&self, instance_id: &str) -> Result<bool> {
        self.registrar.unregister(instance_id).await
    }

    pub async fn heartbeat(&self, instance_id: &str, load_score: f64) -> Result<bool> {
        self.registrar.heartbeat(instance_id, load_score).await
    }

    pub async fn list_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.registrar.list_instances(service_name).await
    }

    /// Route with the configured default strategy
    pub async fn route_default(&self, service: &str) -> Result<ServiceInstance> {
        self.route(service, self.config.load_balance_strategy).await
    }

    /// Route with a strategy given by name
    pub async fn route_named(&self, service: &str, strategy: &str) -> Result<ServiceInstance> {
        let strategy = strategy.parse::<LoadBalanceStrategy>()?;
        self.route(service, strategy).await
    }

    /// Pick one healthy instance of a service
    pub async fn route(
        &self,
        service: &str,
        strategy: LoadBalanceStrategy,
    ) -> Result<ServiceInstance> {
        let permit = self.acquire(service, LOCAL)?;

        let instances = self.registrar.list_instances(service).await;
        let mut reason = "no_healthy_instance";
        let selected = match self.balancer.select(service, &instances, strategy).await {
            Ok(selected) => selected,
            Err(e) => {
                warn!("Routing {} degraded ({}): {}", service, e.reason(), e);
                reason = e.reason();
                None
            }
        };

        match selected {
            Some(instance) => {
                self.metrics.record_route(LOCAL, "routed");
                if permit == Permit::Probe {
                    debug!("Routing half-open probe for {} to {}", service, instance.instance_id);
                }
                Ok(instance)
            }
            None => {
                self.no_route(service, permit, LOCAL);
                Err(MeshError::NotFound(format!("{} ({})", service, reason)))
            }
        }
    }

    /// Pick a region and an instance inside it for a user
    pub async fn route_global(
        &self,
        service: &str,
        user_region: Option<&str>,
        user_coords: Option<Coordinates>,
    ) -> Result<GlobalRoute> {
        let permit = self.acquire(service, GLOBAL)?;

        let mut reason = "no_healthy_region";
        let route = match self
            .router
            .route_global_request(service, user_region, user_coords, FallbackPolicy::Nearest)
            .await
        {
            Ok(route) => route,
            Err(e) => {
                warn!("Global routing of {} degraded ({}): {}", service, e.reason(), e);
                reason = e.reason();
                None
            }
        };

        match route {
            Some(route) => {
                let outcome = if route.fell_back { "fallback" } else { "routed" };
                self.metrics.record_route(GLOBAL, outcome);
                Ok(route)
            }
            None => {
                self.no_route(service, permit, GLOBAL);
                Err(MeshError::NotFound(format!("{} ({})", service, reason)))
            }
        }
    }

    /// Report that a call to a routed instance succeeded
    pub fn report_success(&self, service: &str) {
        if let Some(state) = self.breakers.record_success(service) {
            self.metrics.record_transition(state.as_str());
        }
    }

    /// Report that a call to a routed instance failed
    pub fn report_failure(&self, service: &str) {
        if let Some(state) = self.breakers.record_failure(service) {
            self.metrics.record_transition(state.as_str());
        }
    }

    pub fn circuit_state(&self, service: &str) -> CircuitState {
        self.breakers.state(service)
    }

    /// Current health of a region
    ///
    /// Unknown regions with no instances are `NotFound`. If the store cannot
    /// be read live, the last persisted snapshot is returned when present.
    pub async fn get_region_health(&self, region_id: &str) -> Result<RegionHealth> {
        match self.live_region_health(region_id).await {
            Ok(health) => Ok(health),
            Err(MeshError::StoreUnavailable(reason)) => {
                warn!("Region health for {} degraded to snapshot: {}", region_id, reason);
                match self.directory.cached_health(region_id).await {
                    Ok(Some(snapshot)) => Ok(snapshot),
                    _ => Err(MeshError::StoreUnavailable(reason)),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn live_region_health(&self, region_id: &str) -> Result<RegionHealth> {
        let health = self.health.region_health(region_id).await?;
        if health.total_instances == 0 && self.directory.get_region(region_id).await?.is_none() {
            return Err(MeshError::NotFound(format!("region {}", region_id)));
        }
        Ok(health)
    }

    pub async fn list_regions(&self) -> Result<Vec<Region>> {
        self.directory.list_regions().await
    }

    pub async fn get_mesh_statistics(&self) -> Result<MeshStatistics> {
        let stats = collect_statistics(
            &self.registrar,
            &self.directory,
            &self.breakers,
            self.clock.now(),
        )
        .await?;
        self.metrics
            .registered_instances
            .set(stats.total_instances as i64);
        Ok(stats)
    }

    fn acquire(&self, service: &str, tier: &str) -> Result<Permit> {
        self.breakers.acquire(service).map_err(|e| {
            self.metrics.record_route(tier, "circuit_open");
            debug!("Routing {} blocked: {}", service, e);
            e
        })
    }

    fn no_route(&self, service: &str, permit: Permit, tier: &str) {
        if permit == Permit::Probe {
            self.breakers.release_probe(service);
        }
        self.metrics.record_route(tier, "no_instance");
    }
}
