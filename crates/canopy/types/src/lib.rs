//! Canopy Types - Core types for fleet replacement orchestration
//!
//! Canopy is the replacement layer of the container platform: it drives
//! every instance of a run spec from the current version to a target
//! version while the upgrade policy keeps the application available.
//!
//! ## Architectural Boundaries
//!
//! - **canopy-tracker** owns: the authoritative instance store and the
//!   instance event stream
//! - **canopy-deployment** owns: the replacement state machine, capacity
//!   arithmetic and readiness gating
//! - The cluster runtime owns: actual task launch and termination
//!
//! ## Key Concepts
//!
//! - **RunSpec**: versioned, declarative description of what to run
//! - **Instance**: one running copy of a run spec; observed `Condition`
//!   versus operator `Goal`
//! - **Events**: unified instance lifecycle stream published by the tracker

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod ids;
pub mod instance;
pub mod runspec;

// Re-export main types
pub use events::InstanceEvent;
pub use ids::{DeploymentId, InstanceId, RunSpecId, TaskId};
pub use instance::{Condition, Goal, Instance, InstanceState, Task};
pub use runspec::{
    HealthCheck, KillSelection, ReadinessCheck, RunSpec, SpecValidationError, UpgradeStrategy,
};
