//! Multi-region routing
//!
//! Every region hosting at least one instance of a service is scored as
//! `0.4·health + 0.3·geo + 0.3·latency − 0.1·load`. The best region wins,
//! with ties going to the lexically smallest region id. If the winner has
//! no instance inside the aliveness window, the nearest region that does
//! is used instead.

use crate::geo::{geo_score, haversine_km, latency_score};
use crate::region::RegionDirectory;
use mesh_api::{
    Coordinates, GlobalRoute, LoadBalanceStrategy, Region, RegionScore, ServiceInstance,
};
use mesh_core::{Result, ServiceRegistrar};
use mesh_proxy::LoadBalancer;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const HEALTH_WEIGHT: f64 = 0.4;
const GEO_WEIGHT: f64 = 0.3;
const LATENCY_WEIGHT: f64 = 0.3;
const LOAD_WEIGHT: f64 = 0.1;

/// What to do when the optimal region has no healthy instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Use the geographically nearest region that has one
    #[default]
    Nearest,
    /// Give up
    Disabled,
}

/// GlobalRouter selects a region, then an instance inside it
pub struct GlobalRouter {
    registrar: Arc<ServiceRegistrar>,
    directory: Arc<RegionDirectory>,
    balancer: LoadBalancer,
}

impl GlobalRouter {
    pub fn new(
        registrar: Arc<ServiceRegistrar>,
        directory: Arc<RegionDirectory>,
        balancer: LoadBalancer,
    ) -> Self {
        Self {
            registrar,
            directory,
            balancer,
        }
    }

    /// Score every routable region that hosts the service, best first
    pub async fn score_regions(
        &self,
        service: &str,
        user_region: Option<&str>,
        user_coords: Option<Coordinates>,
    ) -> Result<Vec<RegionScore>> {
        let instances = self.registrar.all_instances(service).await?;
        let by_region = group_by_region(instances);
        let user_coords = self.resolve_user_coords(user_region, user_coords).await?;

        let mut scores = Vec::with_capacity(by_region.len());
        for (region_id, members) in &by_region {
            let region = self.directory.get_region(region_id).await?;
            if region.as_ref().map(|r| !r.is_routable()).unwrap_or(false) {
                debug!("Skipping region {} (maintenance)", region_id);
                continue;
            }

            let count = members.len() as f64;
            let avg_health = members.iter().map(|i| i.status.health_value()).sum::<f64>() / count;
            let avg_load = members.iter().map(|i| i.load_score).sum::<f64>() / count;

            let same_region = user_region == Some(region_id.as_str());
            let geo = geo_score(
                user_coords,
                region.as_ref().and_then(|r| r.coordinates),
                same_region,
            );
            let latency = match user_region {
                Some(from) => self.directory.latency(from, region_id).await?,
                None => None,
            };
            let latency = latency_score(latency);

            let combined = HEALTH_WEIGHT * avg_health + GEO_WEIGHT * geo + LATENCY_WEIGHT * latency
                - LOAD_WEIGHT * avg_load;

            scores.push(RegionScore {
                region_id: region_id.clone(),
                avg_health,
                geo_score: geo,
                latency_score: latency,
                avg_load,
                combined_score: combined,
            });
        }

        scores.sort_by(compare_scores);
        Ok(scores)
    }

    /// Best region for the service, if any region hosts it
    pub async fn get_optimal_region(
        &self,
        service: &str,
        user_region: Option<&str>,
        user_coords: Option<Coordinates>,
    ) -> Result<Option<RegionScore>> {
        let scores = self.score_regions(service, user_region, user_coords).await?;
        if let Some(best) = scores.first() {
            debug!(
                "Optimal region for {}: {} (score {:.3})",
                service, best.region_id, best.combined_score
            );
        }
        Ok(scores.into_iter().next())
    }

    /// Resolve a region and round-robin an instance inside it
    ///
    /// Returns `None` when no region anywhere has a healthy instance.
    pub async fn route_global_request(
        &self,
        service: &str,
        user_region: Option<&str>,
        user_coords: Option<Coordinates>,
        fallback: FallbackPolicy,
    ) -> Result<Option<GlobalRoute>> {
        let scores = self.score_regions(service, user_region, user_coords).await?;
        let optimal = match scores.first() {
            Some(best) => best.region_id.clone(),
            None => return Ok(None),
        };

        // Instances inside the aliveness window, grouped by region
        let alive = group_by_region(self.registrar.list_instances(service).await);

        let chosen = if alive.contains_key(&optimal) {
            Some(optimal.clone())
        } else if fallback == FallbackPolicy::Nearest {
            self.nearest_alive_region(&optimal, &scores, &alive, user_region, user_coords)
                .await?
        } else {
            None
        };

        let region_id = match chosen {
            Some(region_id) => region_id,
            None => {
                debug!("No region has a healthy instance of {}", service);
                return Ok(None);
            }
        };

        let fell_back = region_id != optimal;
        if fell_back {
            info!(
                "Region {} has no healthy {} instance, falling back to {}",
                optimal, service, region_id
            );
        }

        let members = alive.get(&region_id).map(Vec::as_slice).unwrap_or(&[]);
        let scope = format!("{}@{}", service, region_id);
        let instance = self
            .balancer
            .select(&scope, members, LoadBalanceStrategy::RoundRobin)
            .await?;

        Ok(instance.map(|instance| GlobalRoute {
            instance,
            region_id,
            optimal_region_id: optimal,
            fell_back,
        }))
    }

    /// Nearest routable region with a healthy instance
    ///
    /// Distance is measured from the user's position, or from the optimal
    /// region when the user's position is unknown. Regions without
    /// coordinates are only used when no region with coordinates qualifies,
    /// in score order.
    async fn nearest_alive_region(
        &self,
        optimal: &str,
        scores: &[RegionScore],
        alive: &BTreeMap<String, Vec<ServiceInstance>>,
        user_region: Option<&str>,
        user_coords: Option<Coordinates>,
    ) -> Result<Option<String>> {
        let origin = match self.resolve_user_coords(user_region, user_coords).await? {
            Some(coords) => Some(coords),
            None => self
                .directory
                .get_region(optimal)
                .await?
                .and_then(|r| r.coordinates),
        };

        let mut candidates: Vec<Region> = Vec::new();
        for region_id in alive.keys() {
            if let Some(region) = self.directory.get_region(region_id).await? {
                if region.is_routable() {
                    candidates.push(region);
                }
            }
        }

        if let Some(origin) = origin {
            let nearest = candidates
                .iter()
                .filter_map(|r| r.coordinates.map(|c| (haversine_km(origin, c), &r.region_id)))
                .min_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
            if let Some((_, region_id)) = nearest {
                return Ok(Some(region_id.clone()));
            }
        }

        // No usable geometry: take the best-scored region that is alive
        Ok(scores
            .iter()
            .find(|s| alive.contains_key(&s.region_id))
            .map(|s| s.region_id.clone()))
    }

    async fn resolve_user_coords(
        &self,
        user_region: Option<&str>,
        user_coords: Option<Coordinates>,
    ) -> Result<Option<Coordinates>> {
        if user_coords.is_some() {
            return Ok(user_coords);
        }
        match user_region {
            Some(region_id) => Ok(self
                .directory
                .get_region(region_id)
                .await?
                .and_then(|r| r.coordinates)),
            None => Ok(None),
        }
    }
}

/// Highest score first, ties by ascending region id
fn compare_scores(a: &RegionScore, b: &RegionScore) -> Ordering {
    b.combined_score
        .total_cmp(&a.combined_score)
        .then_with(|| a.region_id.cmp(&b.region_id))
}

fn group_by_region(instances: Vec<ServiceInstance>) -> BTreeMap<String, Vec<ServiceInstance>> {
    let mut by_region: BTreeMap<String, Vec<ServiceInstance>> = BTreeMap::new();
    for instance in instances {
        if let Some(region_id) = instance.region_id.clone() {
            by_region.entry(region_id).or_default().push(instance);
        }
    }
    by_region
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::default_regions;
    use mesh_core::{ManualClock, MemoryStore, MeshConfig, StoreHandle};
    use std::collections::{BTreeMap as Map, HashMap};
    use std::time::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        registrar: Arc<ServiceRegistrar>,
        directory: Arc<RegionDirectory>,
        router: GlobalRouter,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = StoreHandle::new(
            Arc::new(MemoryStore::with_clock(clock.clone())),
            Duration::from_millis(500),
        );
        let registrar = Arc::new(ServiceRegistrar::new(
            store.clone(),
            clock.clone(),
            &MeshConfig::default(),
        ));
        let directory = Arc::new(RegionDirectory::new(
            store.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        ));
        for region in default_regions() {
            directory.upsert_region(&region).await.unwrap();
        }
        let router = GlobalRouter::new(registrar.clone(), directory.clone(), LoadBalancer::new(store));
        Fixture {
            clock,
            registrar,
            directory,
            router,
        }
    }

    async fn place(f: &Fixture, region: &str, host: &str) -> String {
        f.registrar
            .register_in_region("search", host, 9200, region, Map::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_no_regions_host_service() {
        let f = fixture().await;
        assert!(f.router.get_optimal_region("search", None, None).await.unwrap().is_none());
        let route = f
            .router
            .route_global_request("search", Some("us-east-1"), None, FallbackPolicy::Nearest)
            .await
            .unwrap();
        assert!(route.is_none());
    }

    #[tokio::test]
    async fn test_user_region_preferred() {
        let f = fixture().await;
        place(&f, "us-east-1", "10.1.0.1").await;
        place(&f, "eu-west-1", "10.2.0.1").await;

        let best = f
            .router
            .get_optimal_region("search", Some("eu-west-1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.region_id, "eu-west-1");
        assert_eq!(best.geo_score, 1.0);
        assert_eq!(best.latency_score, 1.0);
        assert!((best.combined_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_ties_resolved_by_region_id() {
        let f = fixture().await;
        place(&f, "us-west-2", "10.1.0.1").await;
        place(&f, "eu-central-1", "10.2.0.1").await;
        place(&f, "ap-southeast-1", "10.3.0.1").await;

        // No user position: geo and latency are unknown everywhere
        for _ in 0..10 {
            let best = f
                .router
                .get_optimal_region("search", None, None)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(best.region_id, "ap-southeast-1");
        }
    }

    #[tokio::test]
    async fn test_latency_and_load_shift_choice() {
        let f = fixture().await;
        let east = place(&f, "us-east-1", "10.1.0.1").await;
        place(&f, "us-west-2", "10.2.0.1").await;
        f.registrar.heartbeat(&east, 1.0).await.unwrap();

        f.directory.update_latency("eu-west-1", "us-east-1", 300.0).await.unwrap();
        f.directory.update_latency("eu-west-1", "us-west-2", 40.0).await.unwrap();

        let scores = f
            .router
            .score_regions("search", Some("eu-west-1"), None)
            .await
            .unwrap();
        assert_eq!(scores[0].region_id, "us-west-2");
        assert_eq!(scores[1].avg_load, 1.0);
    }

    #[tokio::test]
    async fn test_degraded_region_scores_lower() {
        let f = fixture().await;
        place(&f, "eu-west-1", "10.2.0.1").await;
        f.clock.advance(chrono::Duration::seconds(90));
        place(&f, "eu-central-1", "10.3.0.1").await;

        let scores = f.router.score_regions("search", None, None).await.unwrap();
        let by_id: HashMap<_, _> = scores.iter().map(|s| (s.region_id.as_str(), s)).collect();
        assert_eq!(by_id["eu-west-1"].avg_health, 0.5);
        assert_eq!(by_id["eu-central-1"].avg_health, 1.0);
        assert_eq!(scores[0].region_id, "eu-central-1");
    }

    #[tokio::test]
    async fn test_fallback_to_nearest_region() {
        let f = fixture().await;
        // Tokyo looks best to a Tokyo user but its only instance is stale
        place(&f, "ap-northeast-1", "10.9.0.1").await;
        f.clock.advance(chrono::Duration::seconds(61));
        place(&f, "ap-southeast-1", "10.8.0.1").await;
        place(&f, "eu-west-1", "10.2.0.1").await;

        let best = f
            .router
            .get_optimal_region("search", Some("ap-northeast-1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(best.region_id, "ap-northeast-1");

        let route = f
            .router
            .route_global_request("search", Some("ap-northeast-1"), None, FallbackPolicy::Nearest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(route.region_id, "ap-southeast-1");
        assert_eq!(route.optimal_region_id, "ap-northeast-1");
        assert!(route.fell_back);
    }

    #[tokio::test]
    async fn test_fallback_disabled() {
        let f = fixture().await;
        place(&f, "ap-northeast-1", "10.9.0.1").await;
        f.clock.advance(chrono::Duration::seconds(61));
        place(&f, "ap-southeast-1", "10.8.0.1").await;

        let route = f
            .router
            .route_global_request("search", Some("ap-northeast-1"), None, FallbackPolicy::Disabled)
            .await
            .unwrap();
        assert!(route.is_none());
    }

    #[tokio::test]
    async fn test_round_robin_within_region() {
        let f = fixture().await;
        let a = place(&f, "us-east-1", "10.1.0.1").await;
        let b = place(&f, "us-east-1", "10.1.0.2").await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            let route = f
                .router
                .route_global_request("search", Some("us-east-1"), None, FallbackPolicy::Nearest)
                .await
                .unwrap()
                .unwrap();
            assert!(!route.fell_back);
            seen.push(route.instance.instance_id);
        }
        assert_eq!(seen, vec![a.clone(), b.clone(), a, b]);
    }

    #[tokio::test]
    async fn test_maintenance_region_excluded() {
        let f = fixture().await;
        place(&f, "eu-west-1", "10.2.0.1").await;
        place(&f, "us-east-1", "10.1.0.1").await;
        f.directory.set_region_maintenance("eu-west-1", true).await.unwrap();

        let route = f
            .router
            .route_global_request("search", Some("eu-west-1"), None, FallbackPolicy::Nearest)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(route.region_id, "us-east-1");
    }

    #[tokio::test]
    async fn test_unregistered_instance_never_routed() {
        let f = fixture().await;
        let gone = place(&f, "us-east-1", "10.1.0.1").await;
        let kept = place(&f, "us-east-1", "10.1.0.2").await;
        f.registrar.unregister(&gone).await.unwrap();

        for _ in 0..5 {
            let route = f
                .router
                .route_global_request("search", Some("us-east-1"), None, FallbackPolicy::Nearest)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(route.instance.instance_id, kept);
        }
    }
}
