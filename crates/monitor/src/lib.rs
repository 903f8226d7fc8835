//! Realtime monitoring of long-running backend jobs.
//!
//! Every submitted job is advanced to a terminal state by two independent
//! paths: a per-job [`watcher::JobWatcher`] that polls the status endpoint,
//! and the process-wide push channel managed by
//! [`connection::ConnectionManager`]. Both converge on
//! [`registry::TaskRegistry::apply`], where the first terminal signal wins.
//!
//! [`monitor::TaskMonitor`] is the entry point used by the console.

pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod messages;
pub mod monitor;
pub mod reconnect;
pub mod registry;
pub mod watcher;
