//! Instance tracker trait

use crate::error::Result;
use async_trait::async_trait;
use canopy_types::{Goal, Instance, InstanceId, RunSpecId};

/// Authoritative store of instances known to the platform.
#[async_trait]
pub trait InstanceTracker: Send + Sync {
    /// Synchronous snapshot of every instance of a run spec.
    fn spec_instances_sync(&self, run_spec_id: &RunSpecId) -> Vec<Instance>;

    /// Fetch the current record of one instance.
    async fn get(&self, id: &InstanceId) -> Result<Option<Instance>>;

    /// Persist a new goal for an instance.
    async fn set_goal(&self, id: &InstanceId, goal: Goal) -> Result<()>;
}
