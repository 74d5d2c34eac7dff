//! Launch queue seam: placement and scheduling of new instances is owned
//! by the launch queue, this crate only decides how many to request.

use crate::error::Result;
use async_trait::async_trait;
use canopy_tracker::InMemoryInstanceTracker;
use canopy_types::{Instance, RunSpec};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Accepts launch requests and schedules instances onto the cluster.
#[async_trait]
pub trait LaunchQueue: Send + Sync {
    /// Clear any backoff delay for the run spec.
    async fn reset_delay(&self, run_spec: &RunSpec);

    /// Schedule `count` new instances of `run_spec`; replies with the
    /// freshly scheduled records.
    async fn add_with_reply(&self, run_spec: &RunSpec, count: usize) -> Result<Vec<Instance>>;
}

/// In-memory launch queue for development and testing: provisions
/// instances straight into the backing tracker.
pub struct InMemoryLaunchQueue {
    tracker: Arc<InMemoryInstanceTracker>,
    launched: AtomicUsize,
    delay_resets: AtomicUsize,
}

impl InMemoryLaunchQueue {
    pub fn new(tracker: Arc<InMemoryInstanceTracker>) -> Self {
        Self {
            tracker,
            launched: AtomicUsize::new(0),
            delay_resets: AtomicUsize::new(0),
        }
    }

    /// Number of instances scheduled so far.
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Number of delay resets requested so far.
    pub fn delay_resets(&self) -> usize {
        self.delay_resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LaunchQueue for InMemoryLaunchQueue {
    async fn reset_delay(&self, run_spec: &RunSpec) {
        info!(run_spec_id = %run_spec.id, "Launch delay reset");
        self.delay_resets.fetch_add(1, Ordering::SeqCst);
    }

    async fn add_with_reply(&self, run_spec: &RunSpec, count: usize) -> Result<Vec<Instance>> {
        let mut scheduled = Vec::with_capacity(count);
        for _ in 0..count {
            let instance = Instance::provisioned(run_spec);
            self.tracker.upsert(instance.clone());
            scheduled.push(instance);
        }
        self.launched.fetch_add(count, Ordering::SeqCst);

        info!(
            run_spec_id = %run_spec.id,
            version = %run_spec.version,
            count,
            "Scheduled instances"
        );
        Ok(scheduled)
    }
}
