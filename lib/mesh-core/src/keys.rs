//! Registry store key layout

pub const INSTANCE_PREFIX: &str = "mesh:instance:";
pub const SERVICES: &str = "mesh:services";
pub const REGIONS: &str = "mesh:regions";

pub fn instance(instance_id: &str) -> String {
    format!("{}{}", INSTANCE_PREFIX, instance_id)
}

pub fn service_instances(service_name: &str) -> String {
    format!("mesh:service:{}:instances", service_name)
}

pub fn region(region_id: &str) -> String {
    format!("mesh:region:{}", region_id)
}

pub fn region_instances(region_id: &str) -> String {
    format!("mesh:region:{}:instances", region_id)
}

pub fn round_robin(scope: &str) -> String {
    format!("mesh:rr:{}", scope)
}

pub fn latency(from: &str, to: &str) -> String {
    format!("mesh:latency:{}:{}", from, to)
}

pub fn region_health(region_id: &str) -> String {
    format!("mesh:region_health:{}", region_id)
}
