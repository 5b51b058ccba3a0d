///! Upstream cluster node connection
///!
///! State machine, reconnect backoff, health counters and the task that ties
///! them to a TCP stream.

pub mod backoff;
pub mod connection;
pub mod state;
pub mod stats;

pub use backoff::Backoff;
pub use connection::{ClusterConnection, ClusterHandle};
pub use state::{ConnectionEvent, Transition, transition};
pub use stats::StatsTracker;
