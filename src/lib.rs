//! Sentinel keeps a fleet of Docker hosts up to date under per-entity
//! policies: an approval queue for `manual` entities, label-derived
//! policies with persisted overrides, and a cluster controller that
//! enrolls remote agents and dispatches actions to them.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod planner;
pub mod policy;
pub mod queue;
pub mod runtime;
pub mod scanner;
pub mod store;
pub mod types;

pub use error::{Error, Result};
