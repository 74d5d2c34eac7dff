//! Run specifications: the versioned, declarative description of an
//! application the platform keeps running.

use crate::RunSpecId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// One immutable revision of an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSpec {
    /// Path-style identifier, stable across versions
    pub id: RunSpecId,

    /// Revision of this spec
    pub version: semver::Version,

    /// Desired instance count, at least 1
    pub target_instances: u32,

    /// Policy bounding capacity during upgrades
    pub upgrade_strategy: UpgradeStrategy,

    /// Instances bind to persistent local volumes; they can only be
    /// stopped, never decommissioned
    pub is_resident: bool,

    /// Health checks evaluated by the platform
    pub health_checks: Vec<HealthCheck>,

    /// Application-level "ready for traffic" probes
    pub readiness_checks: Vec<ReadinessCheck>,

    /// Tie-break policy between equivalent kill candidates
    pub kill_selection: KillSelection,
}

impl RunSpec {
    /// Create a run spec with default upgrade policy and no checks.
    pub fn new(id: RunSpecId, version: semver::Version, target_instances: u32) -> Self {
        Self {
            id,
            version,
            target_instances,
            upgrade_strategy: UpgradeStrategy::default(),
            is_resident: false,
            health_checks: Vec::new(),
            readiness_checks: Vec::new(),
            kill_selection: KillSelection::default(),
        }
    }

    pub fn has_health_checks(&self) -> bool {
        !self.health_checks.is_empty()
    }

    pub fn has_readiness_checks(&self) -> bool {
        !self.readiness_checks.is_empty()
    }

    /// Validate operator-supplied fields.
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.target_instances == 0 {
            return Err(SpecValidationError::NoInstances);
        }
        self.upgrade_strategy.validate()
    }
}

/// Capacity bounds honoured while replacing instances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    /// Fraction of `target_instances` that must stay healthy, in [0, 1]
    pub minimum_health_capacity: f64,

    /// Fraction of `target_instances` allowed on top during the upgrade,
    /// non-negative
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

impl UpgradeStrategy {
    pub fn new(minimum_health_capacity: f64, maximum_over_capacity: f64) -> Self {
        Self {
            minimum_health_capacity,
            maximum_over_capacity,
        }
    }

    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if !(0.0..=1.0).contains(&self.minimum_health_capacity) {
            return Err(SpecValidationError::MinimumHealthCapacityOutOfRange(
                self.minimum_health_capacity,
            ));
        }
        if !self.maximum_over_capacity.is_finite() || self.maximum_over_capacity < 0.0 {
            return Err(SpecValidationError::NegativeOverCapacity(
                self.maximum_over_capacity,
            ));
        }
        Ok(())
    }
}

/// Platform health probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Endpoint probed on the instance
    pub path: String,

    /// Time between probes
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Time after launch before failures count
    #[serde(with = "duration_serde")]
    pub grace_period: Duration,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/health".into(),
            interval: Duration::from_secs(10),
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Application-level readiness probe configuration, evaluated after an
/// instance is healthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessCheck {
    /// Name, unique within the run spec
    pub name: String,

    /// Endpoint probed on the task
    pub path: String,

    /// Time between probes
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// Per-probe timeout
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for ReadinessCheck {
    fn default() -> Self {
        Self {
            name: "readiness".into(),
            path: "/ready".into(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Tie-break policy choosing between otherwise-equivalent kill candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KillSelection {
    #[default]
    YoungestFirst,
    OldestFirst,
}

/// Validation failures for operator-supplied run specs.
#[derive(Debug, Error, PartialEq)]
pub enum SpecValidationError {
    #[error("target_instances must be at least 1")]
    NoInstances,

    #[error("minimum_health_capacity must be within [0, 1], got {0}")]
    MinimumHealthCapacityOutOfRange(f64),

    #[error("maximum_over_capacity must be non-negative, got {0}")]
    NegativeOverCapacity(f64),
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
