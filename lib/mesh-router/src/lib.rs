//! Multi-region routing and the mesh facade
pub mod analytics;
pub mod geo;
pub mod global;
pub mod mesh;
pub mod monitor;
pub mod probe;
pub mod region;

pub use global::{FallbackPolicy, GlobalRouter};
pub use mesh::ServiceMesh;
pub use monitor::{CycleReport, MonitorLoop};
pub use probe::{LatencyProbe, SimulatedLatencyProbe, TcpLatencyProbe};
pub use region::{default_regions, RegionDirectory};
