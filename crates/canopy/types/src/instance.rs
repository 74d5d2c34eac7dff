//! Instance model: observed condition versus operator goal.
//!
//! The platform reconciles what an instance *is* (its `Condition`, reported
//! by the cluster) with what the operator *wants* it to be (its `Goal`).

use crate::runspec::RunSpec;
use crate::{InstanceId, RunSpecId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operator intent for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Goal {
    /// Keep the instance running
    Running,

    /// Stop the instance but keep its reservation and volumes
    Stopped,

    /// Stop the instance and release everything it holds
    Decommissioned,
}

/// Observed lifecycle condition of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    /// Resources reserved, nothing launched yet
    Provisioned,

    /// Task sent to the cluster, waiting for it to start
    Staging,

    /// Task started, not yet running
    Starting,

    /// Task is running
    Running,

    /// Termination requested, not yet confirmed
    Killing,

    /// Agent unreachable; the task may still be running
    Unreachable,

    /// Task was killed
    Killed,

    /// Task failed
    Failed,

    /// Task finished by itself
    Finished,

    /// Agent is gone; the task will never report back
    Gone,
}

impl Condition {
    /// Non-terminal: the instance still occupies capacity.
    pub fn is_active(self) -> bool {
        !self.consider_terminal()
    }

    /// The instance will never leave this condition by itself.
    pub fn consider_terminal(self) -> bool {
        matches!(
            self,
            Condition::Killed | Condition::Failed | Condition::Finished | Condition::Gone
        )
    }
}

/// Mutable state record of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub condition: Condition,
    pub goal: Goal,

    /// Aggregated health; absent until the first report
    pub healthy: Option<bool>,

    /// When the instance first became running, if it ever did
    pub active_since: Option<DateTime<Utc>>,

    /// When the current condition was entered
    pub since: DateTime<Utc>,
}

/// One task of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// When the task was staged onto the cluster
    pub staged_at: DateTime<Utc>,
}

/// A single running copy of a run spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,

    /// Run spec this instance belongs to
    pub run_spec_id: RunSpecId,

    /// Revision of the run spec this instance was launched from
    pub run_spec_version: semver::Version,

    pub state: InstanceState,

    /// Tasks of this instance, keyed by task id
    pub tasks: BTreeMap<TaskId, Task>,
}

impl Instance {
    /// Freshly provisioned instance of `spec` with a single task.
    pub fn provisioned(spec: &RunSpec) -> Self {
        let id = InstanceId::generate();
        let now = Utc::now();
        let task_id = TaskId::for_instance(&id, 0);
        let mut tasks = BTreeMap::new();
        tasks.insert(
            task_id.clone(),
            Task {
                id: task_id,
                staged_at: now,
            },
        );

        Self {
            id,
            run_spec_id: spec.id.clone(),
            run_spec_version: spec.version.clone(),
            state: InstanceState {
                condition: Condition::Provisioned,
                goal: Goal::Running,
                healthy: None,
                active_since: None,
                since: now,
            },
            tasks,
        }
    }

    pub fn is_goal_running(&self) -> bool {
        self.state.goal == Goal::Running
    }

    pub fn version_older_than(&self, version: &semver::Version) -> bool {
        self.run_spec_version < *version
    }

    /// Latest staging timestamp across the instance's tasks.
    pub fn latest_staged_at(&self) -> Option<DateTime<Utc>> {
        self.tasks.values().map(|t| t.staged_at).max()
    }
}
