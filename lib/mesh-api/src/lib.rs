//! Mesh API types shared by the registry, routers and the daemon
//!
//! This library defines the plain records the mesh stores and returns:
//! - ServiceInstance: one running, addressable copy of a named service
//! - Region: region metadata used by the global router
//! - CircuitBreakerState: per-service breaker snapshot
//! - MeshStatistics / RegionHealth: aggregated read models
//! - LoadBalanceStrategy: the selectable local balancing strategies

pub mod breaker;
pub mod instance;
pub mod region;
pub mod routing;
pub mod stats;
pub mod strategy;

pub use breaker::{CircuitBreakerState, CircuitState};
pub use instance::{InstanceStatus, ServiceInstance};
pub use region::{Coordinates, Region, RegionHealth, RegionStatus};
pub use routing::{GlobalRoute, RegionScore};
pub use stats::MeshStatistics;
pub use strategy::{LoadBalanceStrategy, UnknownStrategy};
