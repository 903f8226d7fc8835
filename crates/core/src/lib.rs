//! Domain types for the model-security console's task monitor.
//!
//! Pure data and merge rules with no I/O; the `advsec-monitor` crate
//! drives them from the network.

pub mod error;
pub mod job;
pub mod job_events;
pub mod types;
