//! Tracker error types

use canopy_types::InstanceId;
use thiserror::Error;

/// Tracker errors
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;
