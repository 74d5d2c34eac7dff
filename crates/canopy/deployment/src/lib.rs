//! Canopy Deployment Engine - rolling replacement of run-spec instances
//!
//! Replaces every instance of a run spec with instances of a newer version
//! while honouring the spec's upgrade policy: never fewer healthy instances
//! than `minimum_health_capacity` allows, never more concurrent instances
//! than `maximum_over_capacity` permits.
//!
//! ## Architectural Boundaries
//!
//! - `canopy-tracker` owns: the authoritative instance store and events
//! - `canopy-deployment` owns: the replacement state machine, capacity
//!   arithmetic, readiness gating, kill selection
//! - The kill service and launch queue own: actual task termination and
//!   scheduling; this crate coordinates but never places tasks itself
//!
//! ## Key Principle
//!
//! The controller keeps an optimistic shadow of the tracker: goal writes
//! and freshly scheduled instances are folded into its local view before
//! the authoritative events echo back, so a single pass never double-kills
//! or over-launches.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod controller;
pub mod error;
pub mod kill;
pub mod launch;
pub mod readiness;
pub mod scaling;
pub mod strategy;

// Re-exports
pub use controller::{ReplacementController, ReplacementHandle};
pub use error::{ReplacementError, Result};
pub use kill::{InMemoryKillService, KillReason, KillService};
pub use launch::{InMemoryLaunchQueue, LaunchQueue};
pub use readiness::{
    ReadinessCheckExecutor, ReadinessCheckResult, ReadinessCheckSpec, ReadinessCheckUpdate,
    ReadinessSubscriptions, SubscriptionKey,
};
pub use scaling::ScalingProposition;
pub use strategy::RestartStrategy;
