//! Ignition strategy for a rolling replacement.
//!
//! Decides how many old instances can be stopped the moment an upgrade
//! starts, and the capacity ceiling the controller must stay under while
//! it replaces the rest.

use canopy_types::RunSpec;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Initial kill batch plus working capacity ceiling for one upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartStrategy {
    /// Old instances stopped immediately at ignition
    pub nr_to_kill_immediately: usize,

    /// Hard ceiling on concurrently existing instances during the upgrade
    pub max_capacity: usize,
}

impl RestartStrategy {
    /// Compute the ignition strategy for `run_spec`, given the number of
    /// its instances currently in condition Running.
    ///
    /// Panics when `run_spec.target_instances` is zero; validation happens
    /// before a spec reaches the deployment engine, so that is a caller bug.
    pub fn compute(run_spec: &RunSpec, running_count: usize) -> Self {
        assert!(
            run_spec.target_instances > 0,
            "target_instances must be positive"
        );

        let target = f64::from(run_spec.target_instances);
        let strategy = run_spec.upgrade_strategy;
        let min_healthy = (target * strategy.minimum_health_capacity).ceil() as usize;
        let mut max_capacity = (target * (1.0 + strategy.maximum_over_capacity)).floor() as usize;
        let mut nr_to_kill_immediately = running_count.saturating_sub(min_healthy);

        // A pure upgrade is impossible when there is neither room above the
        // ceiling nor slack below the healthy minimum.
        if min_healthy == max_capacity && max_capacity <= running_count {
            if run_spec.is_resident {
                // Over-capacity is unacceptable for stateful instances;
                // go one below the healthy minimum instead.
                nr_to_kill_immediately = running_count - min_healthy + 1;
            } else {
                // Allow one transient extra instance.
                max_capacity += 1;
            }
        }

        info!(
            run_spec_id = %run_spec.id,
            version = %run_spec.version,
            min_healthy,
            max_capacity,
            nr_to_kill_immediately,
            "Computed restart strategy"
        );

        assert!(max_capacity > 0, "max capacity must be positive");
        assert!(
            min_healthy < max_capacity
                || running_count.saturating_sub(nr_to_kill_immediately) < max_capacity,
            "restart strategy must leave headroom to start an instance"
        );

        RestartStrategy {
            nr_to_kill_immediately,
            max_capacity,
        }
    }
}
