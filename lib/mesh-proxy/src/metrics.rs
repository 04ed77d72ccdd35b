//! Prometheus metrics for routing, breakers and the monitor loop

use anyhow::Result;
use prometheus::{Counter, CounterVec, Encoder, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for the mesh
///
/// Clones share the same registry and metrics.
#[derive(Clone)]
pub struct MeshMetrics {
    /// Route attempts by tier (local/global) and outcome
    pub routes_total: CounterVec,
    /// Circuit breaker transitions by target state
    pub breaker_transitions_total: CounterVec,
    /// Instances evicted by the hard sweep
    pub instances_swept_total: Counter,
    /// Monitor cycles by result (ok/error)
    pub monitor_cycles_total: CounterVec,
    /// Instance records seen by the last statistics pass
    pub registered_instances: IntGauge,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl MeshMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let routes_total = CounterVec::new(
            Opts::new("mesh_routes_total", "Route attempts by tier and outcome"),
            &["tier", "outcome"],
        )?;

        let breaker_transitions_total = CounterVec::new(
            Opts::new(
                "mesh_breaker_transitions_total",
                "Circuit breaker transitions by target state",
            ),
            &["to"],
        )?;

        let instances_swept_total = Counter::new(
            "mesh_instances_swept_total",
            "Instances evicted past the dead threshold",
        )?;

        let monitor_cycles_total = CounterVec::new(
            Opts::new("mesh_monitor_cycles_total", "Monitor loop cycles by result"),
            &["result"],
        )?;

        let registered_instances = IntGauge::new(
            "mesh_registered_instances",
            "Instance records currently in the registry",
        )?;

        registry.register(Box::new(routes_total.clone()))?;
        registry.register(Box::new(breaker_transitions_total.clone()))?;
        registry.register(Box::new(instances_swept_total.clone()))?;
        registry.register(Box::new(monitor_cycles_total.clone()))?;
        registry.register(Box::new(registered_instances.clone()))?;

        Ok(Self {
            routes_total,
            breaker_transitions_total,
            instances_swept_total,
            monitor_cycles_total,
            registered_instances,
            registry,
        })
    }

    pub fn record_route(&self, tier: &str, outcome: &str) {
        self.routes_total.with_label_values(&[tier, outcome]).inc();
    }

    pub fn record_transition(&self, to: &str) {
        self.breaker_transitions_total.with_label_values(&[to]).inc();
    }

    pub fn record_cycle(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.monitor_cycles_total.with_label_values(&[result]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
