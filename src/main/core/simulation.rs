//! The simulation root: owns every host, interface and link, the scheduler that drives them, and
//! the random number generator. All construction and configuration goes through [`Simulation`].

use std::collections::BTreeMap;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use slotmap::SlotMap;

use crate::core::scheduler::{Scheduler, SchedulerContext};
use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::host::host::{Host, HostId, HostRole};
use crate::host::network::interface::{
    Interface, InterfaceId, InterfaceOptions, InterfaceSnapshot,
};
use crate::host::services::dhcp::PoolError;
use crate::network::address::{AddressParseError, Ipv4Address, MacAddress};
use crate::network::builder::BuildError;
use crate::network::link::{Link, LinkId, LinkSnapshot};
use crate::utility::counter::Counter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    UnknownHost,
    UnknownInterface,
    UnknownLink,
    UnknownHostName(String),
    UnknownInterfaceName(String),
    DuplicateHostName(String),
    DuplicateInterfaceName(String),
    InterfaceAlreadyLinked(String),
    SelfLink,
    InvalidMask(Ipv4Address),
    ServiceNotEnabled(&'static str),
    InvalidConfiguration(String),
    Address(AddressParseError),
    Build(BuildError),
    Pool(PoolError),
}

impl std::fmt::Display for SimError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownHost => write!(f, "No such host"),
            Self::UnknownInterface => write!(f, "No such interface"),
            Self::UnknownLink => write!(f, "No such link"),
            Self::UnknownHostName(name) => write!(f, "No host named '{name}'"),
            Self::UnknownInterfaceName(name) => write!(f, "No interface named '{name}'"),
            Self::DuplicateHostName(name) => write!(f, "A host named '{name}' already exists"),
            Self::DuplicateInterfaceName(name) => {
                write!(f, "An interface named '{name}' already exists on this host")
            }
            Self::InterfaceAlreadyLinked(name) => {
                write!(f, "Interface '{name}' is already connected to a link")
            }
            Self::SelfLink => write!(f, "An interface can't be linked to itself"),
            Self::InvalidMask(mask) => write!(f, "{mask} is not a valid netmask"),
            Self::ServiceNotEnabled(name) => write!(f, "Service '{name}' is not enabled"),
            Self::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::Address(e) => write!(f, "{e}"),
            Self::Build(e) => write!(f, "{e}"),
            Self::Pool(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Address(e) => Some(e),
            Self::Build(e) => Some(e),
            Self::Pool(e) => Some(e),
            _ => None,
        }
    }
}

impl From<AddressParseError> for SimError {
    fn from(e: AddressParseError) -> Self {
        Self::Address(e)
    }
}

impl From<BuildError> for SimError {
    fn from(e: BuildError) -> Self {
        Self::Build(e)
    }
}

impl From<PoolError> for SimError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimulationOptions {
    /// Seeds every random choice (generated MAC addresses, DHCP transaction ids).
    pub seed: u64,
    /// How long interface speed/duplex negotiation takes.
    pub negotiation_delay: SimulationTime,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            seed: 1,
            negotiation_delay: SimulationTime::from_millis(10),
        }
    }
}

/// A point-in-time report of the whole simulation.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub time: SimulationTime,
    pub events_executed: u64,
    pub hosts: Vec<HostReport>,
    pub links: Vec<LinkSnapshot>,
    /// Why packets were discarded in transit.
    pub drops: Counter,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub name: String,
    pub role: HostRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_gateway: Option<Ipv4Address>,
    pub interfaces: Vec<InterfaceSnapshot>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<&'static str, serde_yaml::Value>,
}

pub struct Simulation {
    pub(crate) scheduler: Scheduler<Simulation>,
    pub(crate) hosts: SlotMap<HostId, Host>,
    pub(crate) interfaces: SlotMap<InterfaceId, Interface>,
    pub(crate) links: SlotMap<LinkId, Link>,
    pub(crate) drops: Counter,
    rng: ChaCha8Rng,
    options: SimulationOptions,
}

impl SchedulerContext for Simulation {
    fn scheduler(&mut self) -> &mut Scheduler<Self> {
        &mut self.scheduler
    }
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new(SimulationOptions::default())
    }
}

impl Simulation {
    pub fn new(options: SimulationOptions) -> Self {
        Self {
            scheduler: Scheduler::new(),
            hosts: SlotMap::with_key(),
            interfaces: SlotMap::with_key(),
            links: SlotMap::with_key(),
            drops: Counter::new(),
            rng: ChaCha8Rng::seed_from_u64(options.seed),
            options,
        }
    }

    pub fn options(&self) -> &SimulationOptions {
        &self.options
    }

    pub fn set_negotiation_delay(&mut self, delay: SimulationTime) {
        self.options.negotiation_delay = delay;
    }

    /// The current virtual time.
    pub fn now(&self) -> EmulatedTime {
        self.scheduler.current_time()
    }

    /// The virtual time since the simulation started.
    pub fn elapsed(&self) -> SimulationTime {
        self.scheduler.elapsed()
    }

    /// Run the simulation forward by `duration` of virtual time. Returns the number of
    /// callbacks run.
    pub fn advance(&mut self, duration: SimulationTime) -> u64 {
        Scheduler::run_for(self, duration)
    }

    /// Run the simulation forward to `time`. Does nothing if `time` is in the past.
    pub fn advance_to(&mut self, time: EmulatedTime) -> u64 {
        Scheduler::run_until(self, time)
    }

    /// Report elapsed wall-clock time, which is scaled by the time multiplier.
    pub fn pump(&mut self, wall_elapsed: Duration) -> u64 {
        Scheduler::pump(self, wall_elapsed)
    }

    pub fn set_time_multiplier(&mut self, multiplier: f64) {
        self.scheduler.set_multiplier(multiplier);
    }

    pub fn time_multiplier(&self) -> f64 {
        self.scheduler.multiplier()
    }

    /// The wall-clock time that `delay` of virtual time takes at the current multiplier.
    pub fn wall_delay(&self, delay: SimulationTime) -> Duration {
        self.scheduler.wall_delay(delay)
    }

    /// A scheduler for arbitrary callbacks against the simulation.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler<Simulation> {
        &mut self.scheduler
    }

    pub fn random_mac(&mut self) -> MacAddress {
        MacAddress::random_local(&mut self.rng)
    }

    pub(crate) fn next_random_u32(&mut self) -> u32 {
        self.rng.gen()
    }

    pub fn add_host(&mut self, name: impl Into<String>, role: HostRole) -> Result<HostId, SimError> {
        let name = name.into();
        if self.hosts.values().any(|h| h.name() == name) {
            return Err(SimError::DuplicateHostName(name));
        }
        log::debug!("Adding {role} '{name}'");
        Ok(self.hosts.insert(Host::new(name, role)))
    }

    pub fn host(&self, host: HostId) -> Option<&Host> {
        self.hosts.get(host)
    }

    pub fn host_by_name(&self, name: &str) -> Option<HostId> {
        self.hosts
            .iter()
            .find(|(_, h)| h.name() == name)
            .map(|(id, _)| id)
    }

    /// Every host, ordered by name.
    pub fn hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<_> = self.hosts.iter().collect();
        hosts.sort_by(|(_, a), (_, b)| a.name().cmp(b.name()));
        hosts.into_iter().map(|(id, _)| id).collect()
    }

    /// Remove a host with all of its services, interfaces and their links.
    pub fn remove_host(&mut self, host: HostId) -> Result<(), SimError> {
        let h = self.hosts.get(host).ok_or(SimError::UnknownHost)?;
        log::debug!("Removing host '{}'", h.name());

        self.disable_all_services(host);
        for iface in self.hosts[host].interfaces().to_vec() {
            self.remove_interface(iface)?;
        }
        self.hosts.remove(host);
        Ok(())
    }

    pub fn set_default_gateway(
        &mut self,
        host: HostId,
        gateway: Option<Ipv4Address>,
    ) -> Result<(), SimError> {
        let h = self.hosts.get_mut(host).ok_or(SimError::UnknownHost)?;
        if h.default_gateway != gateway {
            log::debug!("Default gateway of '{}' set to {gateway:?}", h.name());
        }
        h.default_gateway = gateway;
        Ok(())
    }

    pub fn default_gateway(&self, host: HostId) -> Option<Ipv4Address> {
        self.hosts.get(host)?.default_gateway
    }

    /// Add an interface with default options: every speed, full duplex, administratively up.
    pub fn add_interface(
        &mut self,
        host: HostId,
        name: impl Into<String>,
    ) -> Result<InterfaceId, SimError> {
        self.add_interface_with(host, InterfaceOptions::new(name))
    }

    pub fn add_interface_with(
        &mut self,
        host: HostId,
        options: InterfaceOptions,
    ) -> Result<InterfaceId, SimError> {
        let h = self.hosts.get(host).ok_or(SimError::UnknownHost)?;
        if h.interface_by_name(&options.name).is_some() {
            return Err(SimError::DuplicateInterfaceName(options.name));
        }
        if let Some(addr) = options.address {
            if !addr.mask.is_valid_mask() {
                return Err(SimError::InvalidMask(addr.mask));
            }
        }
        let promiscuous = h.role() == HostRole::Switch;
        let admin_up = options.admin_up;
        let mac = match options.mac {
            Some(mac) => mac,
            None => self.random_mac(),
        };

        let iface = self
            .interfaces
            .insert_with_key(|id| Interface::new(id, host, mac, options));
        self.interfaces[iface].promiscuous = promiscuous;
        self.hosts[host].add_interface(iface, self.interfaces[iface].name.clone());
        log::debug!("Added interface {} ({mac})", self.interface_label(iface));

        self.register_interface_with_services(iface);
        if admin_up {
            self.set_interface_up(iface)?;
        }
        Ok(iface)
    }

    /// Remove an interface, taking it down and disconnecting its link first.
    pub fn remove_interface(&mut self, iface: InterfaceId) -> Result<(), SimError> {
        self.set_interface_down(iface)?;
        if let Some(link) = self.interfaces[iface].link {
            self.disconnect(link)?;
        }
        self.unregister_interface_from_services(iface);

        if let Some(i) = self.interfaces.remove(iface) {
            if let Some(h) = self.hosts.get_mut(i.host) {
                h.remove_interface(iface, &i.name);
            }
            log::debug!("Removed interface {}", i.name);
        }
        Ok(())
    }

    pub fn interface_by_name(&self, host: HostId, name: &str) -> Option<InterfaceId> {
        self.hosts.get(host)?.interface_by_name(name)
    }

    /// Look up an interface by `host:interface` name.
    pub fn find_interface(&self, qualified: &str) -> Result<InterfaceId, SimError> {
        let unknown = || SimError::UnknownInterfaceName(qualified.to_string());
        let (host, iface) = qualified.split_once(':').ok_or_else(unknown)?;
        let host = self
            .host_by_name(host)
            .ok_or_else(|| SimError::UnknownHostName(host.to_string()))?;
        self.interface_by_name(host, iface).ok_or_else(unknown)
    }

    pub fn iface(&self, iface: InterfaceId) -> Result<&Interface, SimError> {
        self.interfaces.get(iface).ok_or(SimError::UnknownInterface)
    }

    pub(crate) fn iface_mut(&mut self, iface: InterfaceId) -> Result<&mut Interface, SimError> {
        self.interfaces
            .get_mut(iface)
            .ok_or(SimError::UnknownInterface)
    }

    /// Every link, in creation order.
    pub fn links(&self) -> Vec<LinkId> {
        self.links.keys().collect()
    }

    pub fn report(&self) -> SimulationReport {
        let hosts = self
            .hosts()
            .into_iter()
            .map(|id| {
                let h = &self.hosts[id];
                HostReport {
                    name: h.name().to_string(),
                    role: h.role(),
                    default_gateway: h.default_gateway,
                    interfaces: h
                        .interfaces()
                        .iter()
                        .filter_map(|i| self.interface(*i))
                        .collect(),
                    services: self.service_reports(id),
                }
            })
            .collect();

        SimulationReport {
            time: self.elapsed(),
            events_executed: self.scheduler.events_executed(),
            hosts,
            links: self.links.keys().filter_map(|l| self.link(l)).collect(),
            drops: self.drops.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::network::interface::OperState;

    #[test]
    fn test_duplicate_names() {
        let mut sim = Simulation::default();
        let pc = sim.add_host("pc", HostRole::Computer).unwrap();
        assert_eq!(
            sim.add_host("pc", HostRole::Server),
            Err(SimError::DuplicateHostName("pc".into()))
        );
        sim.add_interface(pc, "eth0").unwrap();
        assert_eq!(
            sim.add_interface(pc, "eth0"),
            Err(SimError::DuplicateInterfaceName("eth0".into()))
        );
    }

    #[test]
    fn test_find_interface() {
        let mut sim = Simulation::default();
        let pc = sim.add_host("pc", HostRole::Computer).unwrap();
        let eth0 = sim.add_interface(pc, "eth0").unwrap();
        assert_eq!(sim.find_interface("pc:eth0"), Ok(eth0));
        assert_eq!(
            sim.find_interface("pc:eth1"),
            Err(SimError::UnknownInterfaceName("pc:eth1".into()))
        );
        assert_eq!(
            sim.find_interface("nope:eth0"),
            Err(SimError::UnknownHostName("nope".into()))
        );
    }

    #[test]
    fn test_same_seed_same_macs() {
        let macs = |seed| {
            let mut sim = Simulation::new(SimulationOptions {
                seed,
                ..Default::default()
            });
            (sim.random_mac(), sim.random_mac())
        };
        assert_eq!(macs(7), macs(7));
        assert_ne!(macs(7), macs(8));
        let (a, _) = macs(7);
        assert!(a.is_unicast());
    }

    #[test]
    fn test_remove_host() {
        let mut sim = Simulation::default();
        let a = sim.add_host("a", HostRole::Computer).unwrap();
        let b = sim.add_host("b", HostRole::Computer).unwrap();
        let a0 = sim.add_interface(a, "eth0").unwrap();
        let b0 = sim.add_interface(b, "eth0").unwrap();
        sim.connect(a0, b0, SimulationTime::from_millis(1)).unwrap();
        sim.advance(SimulationTime::from_secs(1));

        sim.remove_host(a).unwrap();
        assert!(sim.host(a).is_none());
        assert!(sim.interface(a0).is_none());
        assert!(sim.links().is_empty());

        sim.advance(SimulationTime::from_secs(1));
        assert_eq!(sim.iface(b0).unwrap().state(), OperState::Up);
        assert_eq!(sim.report().hosts.len(), 1);
    }
}
