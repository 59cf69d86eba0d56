//! Core of the microgrid battery fleet: pack physics, safety supervision,
//! the unit and coordinator actors, the fleet optimizer with its supervisory
//! goals and alerts, and the message boundary they talk over.
//!
//! Binaries (`battery_agent`, `ugrid_headend`, the in-process simulator)
//! only wire configuration, logging and a transport around these pieces.

pub mod agent;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod forecast;
#[cfg(feature = "http")]
pub mod http_link;
pub mod lifecycle;
pub mod link;
pub mod ml;
pub mod optimizer;
pub mod physics;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod safety;
pub mod supervisor;

pub use agent::{ResetButton, UnitHandle, UnitSnapshot, spawn_unit};
pub use config::{CoordinatorSettings, FleetFile, UnitSettings};
pub use coordinator::{Coordinator, FleetStatus};
pub use lifecycle::Lifecycle;
pub use link::{Link, LinkConditions, LocalNetwork, NodeAddr};
