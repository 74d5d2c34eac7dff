//! Canopy Tracker - authoritative instance store and event stream
//!
//! The tracker is the single source of truth for instances known to the
//! platform. Everything above it (deployment engine, scaling, APIs) works
//! on snapshots and events; the tracker remains authoritative for
//! persistence.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod bus;
pub mod error;
pub mod memory;
pub mod tracker;

// Re-exports
pub use bus::InstanceEventBus;
pub use error::{Result, TrackerError};
pub use memory::InMemoryInstanceTracker;
pub use tracker::InstanceTracker;
