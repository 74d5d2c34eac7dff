//! Kill service seam: actual task termination is owned by the cluster
//! runtime, this crate only asks for it.

use crate::error::Result;
use async_trait::async_trait;
use canopy_tracker::InMemoryInstanceTracker;
use canopy_types::{Condition, Instance, InstanceId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Why an instance is being terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillReason {
    /// Replaced by a newer run spec version
    Upgrading,

    /// Scaled down past the target instance count
    OverCapacity,

    /// Decommissioned while scaling down a resident run spec
    DecommissionScaling,

    /// Failing health checks
    Unhealthy,
}

/// Terminates instances on the cluster.
#[async_trait]
pub trait KillService: Send + Sync {
    async fn kill_instance(&self, instance: &Instance, reason: KillReason) -> Result<()>;
}

/// In-memory kill service for development and testing: drives the instance
/// through Killing to Killed in the backing tracker.
pub struct InMemoryKillService {
    tracker: Arc<InMemoryInstanceTracker>,
    kills: Mutex<Vec<(InstanceId, KillReason)>>,
}

impl InMemoryKillService {
    pub fn new(tracker: Arc<InMemoryInstanceTracker>) -> Self {
        Self {
            tracker,
            kills: Mutex::new(Vec::new()),
        }
    }

    /// Kills performed so far, in order.
    pub fn kills(&self) -> Vec<(InstanceId, KillReason)> {
        self.log().clone()
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Vec<(InstanceId, KillReason)>> {
        self.kills.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl KillService for InMemoryKillService {
    async fn kill_instance(&self, instance: &Instance, reason: KillReason) -> Result<()> {
        info!(instance_id = %instance.id, reason = ?reason, "Killing instance");
        self.log().push((instance.id.clone(), reason));

        self.tracker.set_condition(&instance.id, Condition::Killing)?;
        self.tracker.set_condition(&instance.id, Condition::Killed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_tracker::{InstanceEventBus, InstanceTracker};
    use canopy_types::{RunSpec, RunSpecId};

    #[tokio::test]
    async fn test_kill_drives_instance_terminal() {
        let bus = InstanceEventBus::default();
        let tracker = Arc::new(InMemoryInstanceTracker::new(bus));
        let service = InMemoryKillService::new(tracker.clone());

        let spec = RunSpec::new(
            RunSpecId::new("/ledger/api"),
            semver::Version::new(1, 0, 0),
            1,
        );
        let instance = Instance::provisioned(&spec);
        tracker.upsert(instance.clone());

        service
            .kill_instance(&instance, KillReason::Upgrading)
            .await
            .unwrap();

        let stored = tracker.get(&instance.id).await.unwrap().unwrap();
        assert_eq!(stored.state.condition, Condition::Killed);
        assert_eq!(service.kills().len(), 1);
        assert_eq!(service.kills()[0], (instance.id, KillReason::Upgrading));
    }
}
