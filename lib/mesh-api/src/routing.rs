//! Global routing decisions

use crate::ServiceInstance;
use serde::{Deserialize, Serialize};

/// Score breakdown for one candidate region
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionScore {
    pub region_id: String,
    pub avg_health: f64,
    pub geo_score: f64,
    pub latency_score: f64,
    pub avg_load: f64,
    pub combined_score: f64,
}

/// Result of a successful global route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalRoute {
    pub instance: ServiceInstance,
    pub region_id: String,
    /// Region the scoring picked, which differs from `region_id` after a fallback
    pub optimal_region_id: String,
    pub fell_back: bool,
}
