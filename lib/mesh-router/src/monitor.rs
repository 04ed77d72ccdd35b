//! Background monitor loop
//!
//! Each cycle refreshes inter-region latency samples, persists a health
//! snapshot per region and sweeps dead instances. A failed cycle is logged
//! and followed by a fixed backoff; the loop only ends when told to stop.

use crate::probe::LatencyProbe;
use crate::region::RegionDirectory;
use futures::future::join_all;
use mesh_core::{HealthMonitor, MeshConfig, Result};
use mesh_proxy::MeshMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// What one monitor cycle did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub latency_samples: usize,
    pub regions_refreshed: usize,
    pub evicted: Vec<String>,
}

pub struct MonitorLoop {
    health: Arc<HealthMonitor>,
    directory: Arc<RegionDirectory>,
    probe: Arc<dyn LatencyProbe>,
    metrics: MeshMetrics,
    interval: Duration,
    backoff: Duration,
}

impl MonitorLoop {
    pub fn new(
        health: Arc<HealthMonitor>,
        directory: Arc<RegionDirectory>,
        probe: Arc<dyn LatencyProbe>,
        metrics: MeshMetrics,
        config: &MeshConfig,
    ) -> Self {
        Self {
            health,
            directory,
            probe,
            metrics,
            interval: config.heartbeat_interval(),
            backoff: config.monitor_backoff(),
        }
    }

    /// Run a single cycle
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let regions = self.directory.list_regions().await?;

        // (a) latency samples for every ordered pair of distinct regions
        let pairs: Vec<_> = regions
            .iter()
            .flat_map(|from| {
                regions
                    .iter()
                    .filter(move |to| to.region_id != from.region_id)
                    .map(move |to| (from, to))
            })
            .collect();
        let samples = join_all(pairs.iter().map(|(from, to)| self.probe.measure(from, to))).await;

        let mut latency_samples = 0;
        for ((from, to), sample) in pairs.iter().zip(samples) {
            if let Some(ms) = sample {
                self.directory
                    .update_latency(&from.region_id, &to.region_id, ms)
                    .await?;
                latency_samples += 1;
            }
        }

        // (b) region health snapshots
        for region in &regions {
            let health = self.health.region_health(&region.region_id).await?;
            self.directory.store_health_snapshot(&health).await?;
            self.directory.apply_health(&health).await?;
        }

        // (c) hard sweep
        let evicted = self.health.sweep_dead().await?;
        self.metrics.instances_swept_total.inc_by(evicted.len() as f64);

        Ok(CycleReport {
            latency_samples,
            regions_refreshed: regions.len(),
            evicted,
        })
    }

    /// Run until `stop` flips to true or its sender is dropped
    ///
    /// The stop signal is honoured at the sleep between cycles; a cycle in
    /// progress runs to completion.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(
            "Monitor loop started (interval {:?}, backoff {:?})",
            self.interval, self.backoff
        );

        loop {
            if *stop.borrow() {
                break;
            }

            let delay = match self.run_cycle().await {
                Ok(report) => {
                    self.metrics.record_cycle(true);
                    debug!(
                        "Monitor cycle: {} latency samples, {} regions, {} evicted",
                        report.latency_samples,
                        report.regions_refreshed,
                        report.evicted.len()
                    );
                    self.interval
                }
                Err(e) => {
                    self.metrics.record_cycle(false);
                    error!("Monitor cycle failed ({}): {}", e.reason(), e);
                    self.backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Monitor loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::SimulatedLatencyProbe;
    use crate::region::default_regions;
    use mesh_api::RegionStatus;
    use mesh_core::{keys, ManualClock, MemoryStore, RegistryStore, ServiceRegistrar, StoreHandle};
    use std::collections::BTreeMap;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        registrar: Arc<ServiceRegistrar>,
        directory: Arc<RegionDirectory>,
        monitor: MonitorLoop,
    }

    async fn fixture(region_count: usize) -> Fixture {
        let config = MeshConfig::default();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let handle = StoreHandle::new(store.clone(), Duration::from_millis(500));
        let registrar = Arc::new(ServiceRegistrar::new(handle.clone(), clock.clone(), &config));
        let directory = Arc::new(RegionDirectory::new(
            handle,
            config.latency_ttl(),
            config.region_health_ttl(),
        ));
        for region in default_regions().into_iter().take(region_count) {
            directory.upsert_region(&region).await.unwrap();
        }
        let monitor = MonitorLoop::new(
            Arc::new(HealthMonitor::new(registrar.clone())),
            directory.clone(),
            Arc::new(SimulatedLatencyProbe::steady()),
            MeshMetrics::new().unwrap(),
            &config,
        );
        Fixture {
            clock,
            store,
            registrar,
            directory,
            monitor,
        }
    }

    #[tokio::test]
    async fn test_cycle_refreshes_latency_and_health() {
        let f = fixture(3).await;
        f.registrar
            .register_in_region("search", "10.0.0.1", 9200, "us-east-1", BTreeMap::new())
            .await
            .unwrap();

        let report = f.monitor.run_cycle().await.unwrap();
        assert_eq!(report.latency_samples, 6);
        assert_eq!(report.regions_refreshed, 3);
        assert!(report.evicted.is_empty());

        assert!(f.directory.latency("us-east-1", "us-west-2").await.unwrap().is_some());
        let snapshot = f.directory.cached_health("us-east-1").await.unwrap().unwrap();
        assert_eq!(snapshot.total_instances, 1);
        assert_eq!(snapshot.status, RegionStatus::Healthy);

        let region = f.directory.get_region("us-east-1").await.unwrap().unwrap();
        assert_eq!(region.status, RegionStatus::Healthy);
        let empty = f.directory.get_region("us-west-2").await.unwrap().unwrap();
        assert_eq!(empty.status, RegionStatus::Unknown);
    }

    #[tokio::test]
    async fn test_cycle_sweeps_dead_instances() {
        let f = fixture(1).await;
        let dead = f
            .registrar
            .register_in_region("search", "10.0.0.1", 9200, "us-east-1", BTreeMap::new())
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::seconds(62));
        let alive = f
            .registrar
            .register_in_region("search", "10.0.0.2", 9200, "us-east-1", BTreeMap::new())
            .await
            .unwrap();
        f.clock.advance(chrono::Duration::seconds(59));

        let report = f.monitor.run_cycle().await.unwrap();
        assert_eq!(report.evicted, vec![dead]);

        let region_set = f.store.smembers(&keys::region_instances("us-east-1")).await.unwrap();
        let service_set = f.store.smembers(&keys::service_instances("search")).await.unwrap();
        assert_eq!(region_set, vec![alive.clone()]);
        assert_eq!(service_set, vec![alive]);
    }

    #[tokio::test]
    async fn test_cycle_error_on_outage() {
        let f = fixture(1).await;
        f.store.set_available(false);
        assert!(f.monitor.run_cycle().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_errors_and_stops_on_signal() {
        let f = fixture(1).await;
        f.store.set_available(false);

        let metrics = f.monitor.metrics.clone();
        let monitor = Arc::new(f.monitor);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.run(stop_rx).await })
        };

        // Two failed cycles, 60s backoff apart
        tokio::time::sleep(Duration::from_secs(61)).await;
        f.store.set_available(true);
        // Next cycle fires after the second backoff and succeeds
        tokio::time::sleep(Duration::from_secs(60)).await;

        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let text = metrics.gather().unwrap();
        assert!(text.contains("mesh_monitor_cycles_total{result=\"error\"} 2"), "{}", text);
        assert!(text.contains("mesh_monitor_cycles_total{result=\"ok\"} 1"), "{}", text);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_sender_dropped() {
        let f = fixture(0).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = Arc::new(f.monitor);
        let task = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.run(stop_rx).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(stop_tx);
        task.await.unwrap();
    }
}
