//! Service registrar: creates, refreshes, lists and removes instance records
//!
//! The registry store is the single source of truth. Each record lives at
//! `mesh:instance:{id}`; the per-service and per-region sets are indexes
//! over those records and are repaired whenever a dangling member is seen.

use crate::clock::Clock;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::health::LivenessPolicy;
use crate::keys;
use crate::store::StoreHandle;
use mesh_api::ServiceInstance;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// ServiceRegistrar maintains instance records in the registry store
pub struct ServiceRegistrar {
    store: StoreHandle,
    clock: Arc<dyn Clock>,
    liveness: LivenessPolicy,
}

impl ServiceRegistrar {
    pub fn new(store: StoreHandle, clock: Arc<dyn Clock>, config: &MeshConfig) -> Self {
        Self {
            store,
            clock,
            liveness: LivenessPolicy::from_config(config),
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn liveness(&self) -> &LivenessPolicy {
        &self.liveness
    }

    /// Register (or re-register) an instance and return its id
    pub async fn register(
        &self,
        service_name: &str,
        host: &str,
        port: u16,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        let instance = ServiceInstance::new(service_name, host, port, self.clock.now())
            .with_metadata(metadata);
        self.register_instance(instance).await
    }

    /// Register a global-tier instance hosted in `region_id`
    pub async fn register_in_region(
        &self,
        service_name: &str,
        host: &str,
        port: u16,
        region_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<String> {
        let instance = ServiceInstance::new(service_name, host, port, self.clock.now())
            .with_metadata(metadata)
            .with_region(region_id);
        self.register_instance(instance).await
    }

    /// Write a fresh record, overwriting any previous record with the same id
    pub async fn register_instance(&self, mut instance: ServiceInstance) -> Result<String> {
        if instance.service_name.is_empty() || instance.host.is_empty() {
            return Err(MeshError::InvalidConfiguration(
                "service name and host are required".to_string(),
            ));
        }
        instance.status = mesh_api::InstanceStatus::Healthy;
        instance.last_heartbeat = self.clock.now();
        instance.load_score = 0.0;

        let id = instance.instance_id.clone();

        // A re-registration may move the instance to another region
        if let Some(previous) = self.get_instance(&id).await? {
            if previous.service_name != instance.service_name {
                return Err(MeshError::Conflict(format!(
                    "instance {} already belongs to service {}",
                    id, previous.service_name
                )));
            }
            if let Some(old_region) = previous.region_id.as_deref() {
                if instance.region_id.as_deref() != Some(old_region) {
                    self.store
                        .srem(&keys::region_instances(old_region), &id)
                        .await?;
                }
            }
        }

        self.store
            .set(&keys::instance(&id), serde_json::to_string(&instance)?, None)
            .await?;
        self.add_memberships(&instance).await?;

        info!(
            "Registered instance {} for service {} at {}",
            id,
            instance.service_name,
            instance.address()
        );
        Ok(id)
    }

    /// Remove an instance and all of its set memberships
    ///
    /// Returns false when the instance did not exist.
    pub async fn unregister(&self, instance_id: &str) -> Result<bool> {
        let instance = match self.load(instance_id).await? {
            Some(instance) => instance,
            None => return Ok(false),
        };

        self.store.delete(&keys::instance(instance_id)).await?;
        self.store
            .srem(&keys::service_instances(&instance.service_name), instance_id)
            .await?;
        if let Some(region_id) = instance.region_id.as_deref() {
            self.store
                .srem(&keys::region_instances(region_id), instance_id)
                .await?;
        }

        info!(
            "Unregistered instance {} from service {}",
            instance_id, instance.service_name
        );
        Ok(true)
    }

    /// Refresh an instance's heartbeat and load score
    ///
    /// Returns false when the instance has already been reaped.
    pub async fn heartbeat(&self, instance_id: &str, load_score: f64) -> Result<bool> {
        let mut instance = match self.load(instance_id).await? {
            Some(instance) => instance,
            None => {
                debug!("Heartbeat for unknown instance {}", instance_id);
                return Ok(false);
            }
        };

        instance.last_heartbeat = self.clock.now();
        instance.load_score = if load_score.is_finite() {
            load_score.max(0.0)
        } else {
            0.0
        };
        instance.status = mesh_api::InstanceStatus::Healthy;

        self.store
            .set(&keys::instance(instance_id), serde_json::to_string(&instance)?, None)
            .await?;
        // Re-assert membership so a heartbeat racing an unregister never
        // leaves a record that no index points at
        self.add_memberships(&instance).await?;

        debug!(
            "Heartbeat from {} (load {:.3})",
            instance_id, instance.load_score
        );
        Ok(true)
    }

    /// Fetch one instance with its status recomputed
    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<ServiceInstance>> {
        Ok(self
            .load(instance_id)
            .await?
            .map(|instance| self.with_current_status(instance)))
    }

    /// Instances of a service that are inside the aliveness window
    ///
    /// Stale instances found here are unregistered on the spot. Store
    /// failures degrade to an empty list.
    pub async fn list_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        let instances = match self.all_instances(service_name).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(
                    "Listing instances of {} degraded to empty ({}): {}",
                    service_name,
                    e.reason(),
                    e
                );
                return Vec::new();
            }
        };

        let now = self.clock.now();
        let mut alive = Vec::with_capacity(instances.len());
        for instance in instances {
            if self.liveness.is_alive(instance.heartbeat_age(now)) {
                alive.push(instance);
                continue;
            }

            debug!(
                "Lazily expiring stale instance {} (heartbeat age {}s)",
                instance.instance_id,
                instance.heartbeat_age(now).num_seconds()
            );
            if let Err(e) = self.unregister(&instance.instance_id).await {
                warn!(
                    "Failed to expire stale instance {}: {}",
                    instance.instance_id, e
                );
            }
        }
        alive
    }

    /// Every recorded instance of a service, regardless of heartbeat age
    pub async fn all_instances(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.resolve_set(&keys::service_instances(service_name))
            .await
    }

    /// Every recorded instance hosted in a region
    pub async fn region_instances(&self, region_id: &str) -> Result<Vec<ServiceInstance>> {
        self.resolve_set(&keys::region_instances(region_id)).await
    }

    /// Names of every service that has been registered
    pub async fn service_names(&self) -> Result<Vec<String>> {
        Ok(self.store.smembers(keys::SERVICES).await?)
    }

    /// Every instance record, found by key enumeration
    ///
    /// Only used for analytics.
    pub async fn scan_instances(&self) -> Result<Vec<ServiceInstance>> {
        let keys = self.store.keys(keys::INSTANCE_PREFIX).await?;
        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(raw) = self.store.get(&key).await? {
                let instance: ServiceInstance = serde_json::from_str(&raw)?;
                instances.push(self.with_current_status(instance));
            }
        }
        Ok(instances)
    }

    /// Drop a service from the service index once it has no instances
    ///
    /// A registration can land between the emptiness check and the removal,
    /// so the service set is checked again afterwards and the service is
    /// restored to the index if it gained a member.
    pub async fn prune_service(&self, service_name: &str) -> Result<bool> {
        let set_key = keys::service_instances(service_name);
        if !self.store.smembers(&set_key).await?.is_empty() {
            return Ok(false);
        }
        if !self.store.srem(keys::SERVICES, service_name).await? {
            return Ok(false);
        }
        if !self.store.smembers(&set_key).await?.is_empty() {
            debug!("Service {} gained an instance while pruning, restoring", service_name);
            self.store.sadd(keys::SERVICES, service_name).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn load(&self, instance_id: &str) -> Result<Option<ServiceInstance>> {
        match self.store.get(&keys::instance(instance_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn resolve_set(&self, set_key: &str) -> Result<Vec<ServiceInstance>> {
        let ids = self.store.smembers(set_key).await?;
        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(&id).await? {
                Some(instance) => instances.push(self.with_current_status(instance)),
                None => {
                    // Removed by a concurrent sweep or unregister
                    debug!("Dropping dangling member {} from {}", id, set_key);
                    self.store.srem(set_key, &id).await?;
                }
            }
        }
        Ok(instances)
    }

    async fn add_memberships(&self, instance: &ServiceInstance) -> Result<()> {
        let id = &instance.instance_id;
        self.store.sadd(keys::SERVICES, &instance.service_name).await?;
        self.store
            .sadd(&keys::service_instances(&instance.service_name), id)
            .await?;
        if let Some(region_id) = instance.region_id.as_deref() {
            self.store.sadd(&keys::region_instances(region_id), id).await?;
        }
        Ok(())
    }

    fn with_current_status(&self, mut instance: ServiceInstance) -> ServiceInstance {
        instance.status = self
            .liveness
            .status(instance.heartbeat_age(self.clock.now()));
        instance
    }
}
