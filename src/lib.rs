//! Torfleet - Anonymizing Daemon Fleet Supervisor
//!
//! Plants, supervises and retires a fleet of Tor-style anonymizing
//! daemons from one process.
//!
//! ## Features
//!
//! - Control-channel client (cookie-less AUTHENTICATE, bootstrap
//!   tracking, NEWNYM circuit rotation) over Unix or TCP sockets
//! - Per-instance lifecycle supervision with graceful teardown
//! - Fleet-wide bulk operations: start, stop, egress-address retrieval,
//!   circuit rotation, status tables
//! - Egress-IP probing through each daemon's SOCKS5 port
//! - HTTP-to-SOCKS5 bridges, per instance or rotating across the fleet
//! - Directory layout and torrc rendering for any number of instances

pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod farm;
pub mod fleet;
pub mod instance;
pub mod probe;

mod recv;

#[cfg(test)]
pub(crate) mod testutil;

pub use bridge::{BridgeProxy, RotatingBridgeProxy};
pub use config::{BridgeAddr, ControlAddr, FarmSettings, InstanceConfig, InstanceTiming, SocksEndpoint};
pub use error::{FleetError, Result};
pub use farm::{Farm, FleetSpec, PlantSpec};
pub use fleet::Fleet;
pub use instance::{InstanceStatus, InstanceSupervisor};
