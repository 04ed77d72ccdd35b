//! Local traffic selection: load balancing, circuit breaking and metrics
pub mod circuit_breaker;
pub mod load_balancer;
pub mod metrics;

pub use circuit_breaker::{BreakerConfig, CircuitBreakerRegistry, Permit};
pub use load_balancer::LoadBalancer;
pub use metrics::MeshMetrics;
