//! A discrete-event simulation of small L2/L3 networks: hosts, switches and routers joined by
//! links, running address resolution, address leasing, Ethernet switching and first-hop router
//! redundancy against a virtual clock.

// modules with macros must be included before other modules
#[macro_use]
pub mod utility;

pub mod core;
pub mod host;
pub mod network;
