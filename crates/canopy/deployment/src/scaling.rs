//! Scaling proposition: which instances to stop and how many to start when
//! a run spec is scaled or partially decommissioned.

use canopy_types::{Condition, Instance, InstanceId, KillSelection};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// Outcome of a scale pass: instances to stop, in kill order, and the
/// number of new instances to schedule.
#[derive(Debug, Clone, Default)]
pub struct ScalingProposition {
    pub to_kill: Option<Vec<Instance>>,
    pub to_start: Option<usize>,
}

impl ScalingProposition {
    /// Decide which instances to stop and how many to start so that
    /// `scale_to` goal-running instances remain.
    ///
    /// `forced_decommission` instances are always stopped first, then
    /// whatever `meet_constraints` selects to repair host-constraint
    /// violations, then the remaining candidates in kill order.
    pub fn propose<F>(
        instances: Vec<Instance>,
        forced_decommission: Option<&HashSet<InstanceId>>,
        meet_constraints: F,
        scale_to: usize,
        kill_selection: KillSelection,
    ) -> ScalingProposition
    where
        F: FnOnce(&[Instance], usize) -> Vec<Instance>,
    {
        let killing_count = instances
            .iter()
            .filter(|i| i.state.condition == Condition::Killing)
            .count();

        let goal_running: Vec<Instance> =
            instances.into_iter().filter(|i| i.is_goal_running()).collect();
        let goal_running_count = goal_running.len();

        let (sentenced, free): (Vec<Instance>, Vec<Instance>) =
            goal_running.into_iter().partition(|i| {
                forced_decommission.map(|set| set.contains(&i.id)).unwrap_or(false)
            });

        let decommission_count = (goal_running_count as i64
            - killing_count as i64
            - scale_to as i64)
            .max(sentenced.len() as i64) as usize;

        let constraint_need = decommission_count.saturating_sub(sentenced.len());
        let constraint_kills = meet_constraints(&free, constraint_need);

        let constraint_ids: HashSet<InstanceId> =
            constraint_kills.iter().map(|i| i.id.clone()).collect();
        let mut rest: Vec<Instance> = free
            .into_iter()
            .filter(|i| !constraint_ids.contains(&i.id))
            .collect();
        sort_by_condition_and_date(&mut rest, kill_selection);

        let mut candidates = sentenced;
        candidates.extend(constraint_kills);
        candidates.extend(rest);
        candidates.truncate(decommission_count);

        let to_start =
            (scale_to as i64 - goal_running_count as i64 + decommission_count as i64).max(0)
                as usize;

        debug!(
            goal_running = goal_running_count,
            killing = killing_count,
            scale_to,
            to_kill = candidates.len(),
            to_start,
            "Computed scaling proposition"
        );

        ScalingProposition {
            to_kill: if candidates.is_empty() {
                None
            } else {
                Some(candidates)
            },
            to_start: if to_start == 0 { None } else { Some(to_start) },
        }
    }
}

/// Order kill candidates so the least valuable instances go first:
/// unreachable before staging before starting before running, ties broken
/// by condition-specific timestamp and then instance id.
fn sort_by_condition_and_date(instances: &mut [Instance], selection: KillSelection) {
    instances.sort_by(|a, b| {
        condition_weight(a)
            .cmp(&condition_weight(b))
            .then_with(|| compare_timestamps(a, b, selection))
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn condition_weight(instance: &Instance) -> u8 {
    match instance.state.condition {
        Condition::Unreachable => 1,
        Condition::Staging => 2,
        Condition::Starting => 3,
        Condition::Running => 4,
        _ => 5,
    }
}

/// Timestamp an instance is judged by: staging time while staging, the
/// condition change for starting instances, first-running otherwise.
/// Instances that never ran sort to the epoch, which keeps the comparator
/// total.
fn kill_timestamp(instance: &Instance) -> DateTime<Utc> {
    let timestamp = match instance.state.condition {
        Condition::Staging => instance.latest_staged_at(),
        Condition::Starting => Some(instance.state.since),
        _ => instance.state.active_since,
    };
    timestamp.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn compare_timestamps(a: &Instance, b: &Instance, selection: KillSelection) -> Ordering {
    let (ts_a, ts_b) = (kill_timestamp(a), kill_timestamp(b));
    match selection {
        KillSelection::YoungestFirst => ts_b.cmp(&ts_a),
        KillSelection::OldestFirst => ts_a.cmp(&ts_b),
    }
}
