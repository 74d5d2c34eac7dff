//! Instance lifecycle events published on the platform event bus.

use crate::{Condition, Instance, InstanceId, RunSpecId};
use serde::{Deserialize, Serialize};

/// Events the tracker publishes about instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InstanceEvent {
    /// An instance record changed: condition, goal or tasks.
    Changed {
        id: InstanceId,
        run_spec_id: RunSpecId,
        condition: Condition,
        instance: Box<Instance>,
    },

    /// The aggregated health of an instance changed.
    HealthChanged {
        id: InstanceId,
        run_spec_id: RunSpecId,
        run_spec_version: semver::Version,
        /// Absent when health is not (yet) reported
        healthy: Option<bool>,
    },
}

impl InstanceEvent {
    /// Change event carrying a snapshot of `instance`.
    pub fn changed(instance: &Instance) -> Self {
        InstanceEvent::Changed {
            id: instance.id.clone(),
            run_spec_id: instance.run_spec_id.clone(),
            condition: instance.state.condition,
            instance: Box::new(instance.clone()),
        }
    }

    /// Health event for `instance` with the given report.
    pub fn health_changed(instance: &Instance, healthy: Option<bool>) -> Self {
        InstanceEvent::HealthChanged {
            id: instance.id.clone(),
            run_spec_id: instance.run_spec_id.clone(),
            run_spec_version: instance.run_spec_version.clone(),
            healthy,
        }
    }

    /// Run spec the event is scoped to.
    pub fn run_spec_id(&self) -> &RunSpecId {
        match self {
            InstanceEvent::Changed { run_spec_id, .. } => run_spec_id,
            InstanceEvent::HealthChanged { run_spec_id, .. } => run_spec_id,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        match self {
            InstanceEvent::Changed { id, .. } => id,
            InstanceEvent::HealthChanged { id, .. } => id,
        }
    }
}
