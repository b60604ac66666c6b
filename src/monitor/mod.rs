//! Connection sampling and per-port session tracking.
//!
//! The collector turns kernel socket state into point-in-time [`Connection`]
//! samples; one [`PortTracker`] per monitored port folds those samples into
//! stable [`Session`] records; the [`Coordinator`] drives one polling task
//! per port and fans overlimit events out to the enforcement layer.

pub mod collector;
pub mod coordinator;
pub mod tracker;
pub mod types;

pub use collector::Collector;
pub use coordinator::Coordinator;
pub use tracker::PortTracker;
pub use types::{Connection, PortStats, Session};
