//! Domain types - core pipeline entities
//!
//! Tasks, change events, queue entries, outcomes and statistics shared by the
//! batch and watch subsystems. These types are independent of how work is
//! scheduled.

pub mod config;
pub mod outcome;
pub mod stats;
pub mod task;
