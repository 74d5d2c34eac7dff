//! Replacement error types

use canopy_tracker::TrackerError;
use canopy_types::InstanceId;
use thiserror::Error;

/// Replacement errors
#[derive(Debug, Error)]
pub enum ReplacementError {
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Kill failed for instance {instance_id}: {reason}")]
    Kill {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("Launch queue error: {0}")]
    Launch(String),

    #[error("Readiness check error: {0}")]
    Readiness(String),

    #[error("Replacement interrupted: {0}")]
    Interrupted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for replacement operations
pub type Result<T> = std::result::Result<T, ReplacementError>;
