//! In-memory instance tracker
//!
//! Suitable for development and testing. Production deployments back the
//! tracker with the cluster state store.

use crate::bus::InstanceEventBus;
use crate::error::{Result, TrackerError};
use crate::tracker::InstanceTracker;
use async_trait::async_trait;
use canopy_types::{Condition, Goal, Instance, InstanceEvent, InstanceId, RunSpecId};
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;

/// In-memory instance tracker publishing every mutation on the event bus.
pub struct InMemoryInstanceTracker {
    instances: DashMap<InstanceId, Instance>,
    by_run_spec: DashMap<RunSpecId, Vec<InstanceId>>,
    bus: InstanceEventBus,
}

impl InMemoryInstanceTracker {
    pub fn new(bus: InstanceEventBus) -> Self {
        Self {
            instances: DashMap::new(),
            by_run_spec: DashMap::new(),
            bus,
        }
    }

    /// Insert or replace an instance record and publish the change.
    pub fn upsert(&self, instance: Instance) {
        let id = instance.id.clone();
        let run_spec_id = instance.run_spec_id.clone();
        let event = InstanceEvent::changed(&instance);

        self.instances.insert(id.clone(), instance);
        {
            let mut ids = self.by_run_spec.entry(run_spec_id).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        self.bus.publish(event);
    }

    /// Remove an instance record. Idempotent.
    pub fn remove(&self, id: &InstanceId) {
        if let Some((_, instance)) = self.instances.remove(id) {
            if let Some(mut ids) = self.by_run_spec.get_mut(&instance.run_spec_id) {
                ids.retain(|i| i != id);
            }
        }
    }

    /// Mutate the observed condition of an instance and publish the change.
    pub fn set_condition(&self, id: &InstanceId, condition: Condition) -> Result<()> {
        let instance = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| TrackerError::InstanceNotFound(id.clone()))?;
            let now = Utc::now();
            entry.state.condition = condition;
            entry.state.since = now;
            if condition == Condition::Running && entry.state.active_since.is_none() {
                entry.state.active_since = Some(now);
            }
            entry.clone()
        };

        debug!(instance_id = %id, condition = ?condition, "Instance condition changed");
        self.bus.publish(InstanceEvent::changed(&instance));
        Ok(())
    }

    /// Record a health report for an instance and publish it.
    pub fn set_health(&self, id: &InstanceId, healthy: bool) -> Result<()> {
        let instance = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| TrackerError::InstanceNotFound(id.clone()))?;
            entry.state.healthy = Some(healthy);
            entry.clone()
        };

        self.bus
            .publish(InstanceEvent::health_changed(&instance, Some(healthy)));
        Ok(())
    }
}

#[async_trait]
impl InstanceTracker for InMemoryInstanceTracker {
    fn spec_instances_sync(&self, run_spec_id: &RunSpecId) -> Vec<Instance> {
        let mut result = Vec::new();
        if let Some(ids) = self.by_run_spec.get(run_spec_id) {
            for id in ids.iter() {
                if let Some(instance) = self.instances.get(id) {
                    result.push(instance.clone());
                }
            }
        }
        result
    }

    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>> {
        Ok(self.instances.get(id).map(|i| i.clone()))
    }

    async fn set_goal(&self, id: &InstanceId, goal: Goal) -> Result<()> {
        let instance = {
            let mut entry = self
                .instances
                .get_mut(id)
                .ok_or_else(|| TrackerError::InstanceNotFound(id.clone()))?;
            entry.state.goal = goal;
            entry.clone()
        };

        debug!(instance_id = %id, goal = ?goal, "Instance goal changed");
        self.bus.publish(InstanceEvent::changed(&instance));
        Ok(())
    }
}
