//! Simulate packet exchange between nodes over a deterministic virtual network.
//!
//! A simulation is a set of nodes (each driven by a [node::Handler]) connected by directed
//! links with configurable latency, loss, bandwidth and partitions. Every effect is an event
//! on a single priority queue ordered by simulated time (ties broken by insertion order), so
//! two runs with the same seed, topology and initial work dispatch exactly the same events.
//!
//! # Status
//!
//! `micronetwork` is **ALPHA** software. Developers should expect breaking changes and
//! occasional instability.
//!
//! # Example
//!
//! ```rust
//! use micronetwork::{
//!     app::{App, Config},
//!     handlers::Echo,
//!     link::Latency,
//!     topology::LinkConfig,
//! };
//! use std::time::Duration;
//!
//! let mut app = App::new(Config::default());
//! app.add_node("a", Echo::default()).unwrap();
//! app.add_node("b", Echo::default()).unwrap();
//! app.add_link("a", "b", LinkConfig::new(Latency::Fixed(Duration::from_millis(10)))).unwrap();
//! app.send(Duration::ZERO, "a", "b", "hello").unwrap();
//!
//! let report = app.run().unwrap();
//! assert_eq!(report.delivered, 1);
//! assert_eq!(report.now, Duration::from_millis(10));
//! ```

use thiserror::Error;

pub mod app;
pub mod auditor;
pub mod handlers;
pub mod link;
mod metrics;
pub mod node;
pub mod scenario;
pub mod scheduler;
pub mod topology;

pub use app::{App, Canceller, Config, Outcome, Report};
pub use node::{Handler, HandlerError, Input, Outbox, Packet};
pub use topology::{LinkConfig, NodeId, Topology};

/// Errors that make a topology unusable.
///
/// These are returned while the simulation is being assembled and never
/// once it is running.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("duplicate node: {0}")]
    DuplicateNode(NodeId),
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("duplicate link: {0} -> {1}")]
    DuplicateLink(NodeId, NodeId),
    #[error("unknown link: {0} -> {1}")]
    UnknownLink(NodeId, NodeId),
    #[error("not valid to link self: {0}")]
    LinkingSelf(NodeId),
    #[error("invalid loss probability (must be in [0, 1]): {0}")]
    InvalidLoss(f64),
    #[error("invalid latency: {0}")]
    InvalidLatency(&'static str),
    #[error("invalid bandwidth (must be non-zero)")]
    InvalidBandwidth,
    #[error("invalid watchdog (must be non-zero)")]
    InvalidWatchdog,
}

/// Errors returned by [App::run].
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid topology: {0}")]
    Config(#[from] ConfigError),
    #[error("simulation finished with {} node fault(s)", .0.faults.len())]
    Faults(Box<Report>),
}
