//! Mesh-wide statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated view of the registry and breakers at one instant
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshStatistics {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub degraded_instances: usize,
    pub unhealthy_instances: usize,
    pub instances_per_service: BTreeMap<String, usize>,
    pub instances_per_region: BTreeMap<String, usize>,
    pub region_count: usize,
    pub open_circuits: Vec<String>,
    pub half_open_circuits: Vec<String>,
    pub generated_at: Option<DateTime<Utc>>,
}
