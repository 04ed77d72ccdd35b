//! Core registry functionality for the service mesh
//!
//! This library provides:
//! - The registry store contract and an in-process implementation
//! - Service registration, heartbeats and lazy expiry
//! - Heartbeat-based liveness and hard sweeping of dead instances
//! - Mesh configuration

pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod keys;
pub mod memory;
pub mod registry;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MeshConfig;
pub use error::{MeshError, Result, StoreError};
pub use health::HealthMonitor;
pub use memory::MemoryStore;
pub use registry::ServiceRegistrar;
pub use store::{RegistryStore, StoreHandle};
