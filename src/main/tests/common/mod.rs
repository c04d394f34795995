#![allow(dead_code)]

use std::str::FromStr;

use clap::Parser;
use netsim::core::configuration::{CliOptions, ConfigFileOptions, ConfigOptions};
use netsim::core::simulation::Simulation;
use netsim::host::host::HostId;
use netsim::host::network::interface::InterfaceId;
use netsim::network::address::Ipv4Address;

/// Build a simulation from a configuration file's contents.
pub fn build(yaml: &str) -> Simulation {
    let file = ConfigFileOptions::from_str(yaml).unwrap();
    let cli = CliOptions::try_parse_from(["netsim", "-"]).unwrap();
    Simulation::from_config(&ConfigOptions::new(file, cli)).unwrap()
}

pub fn host(sim: &Simulation, name: &str) -> HostId {
    sim.host_by_name(name).unwrap()
}

pub fn iface(sim: &Simulation, name: &str) -> InterfaceId {
    sim.find_interface(name).unwrap()
}

pub fn ip(s: &str) -> Ipv4Address {
    s.parse().unwrap()
}
