use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::host::network::interface::InterfaceId;
use crate::host::service::ServiceEntry;
use crate::network::address::Ipv4Address;

slotmap::new_key_type! {
    /// Identifies a host for as long as it exists.
    pub struct HostId;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum HostRole {
    Computer,
    Server,
    Switch,
    Router,
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Computer => write!(f, "computer"),
            Self::Server => write!(f, "server"),
            Self::Switch => write!(f, "switch"),
            Self::Router => write!(f, "router"),
        }
    }
}

/// A simulated device. Interfaces and services are attached through the
/// [`Simulation`](crate::core::simulation::Simulation) that owns it.
pub struct Host {
    name: String,
    role: HostRole,
    // in creation order
    interfaces: Vec<InterfaceId>,
    interfaces_by_name: BTreeMap<String, InterfaceId>,
    pub(crate) default_gateway: Option<Ipv4Address>,
    // in the order they were enabled, which is also the order packets are offered to them
    pub(crate) services: Vec<ServiceEntry>,
}

impl Host {
    pub(crate) fn new(name: String, role: HostRole) -> Self {
        Self {
            name,
            role,
            interfaces: Vec::new(),
            interfaces_by_name: BTreeMap::new(),
            default_gateway: None,
            services: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> HostRole {
        self.role
    }

    pub fn interfaces(&self) -> &[InterfaceId] {
        &self.interfaces
    }

    pub fn interface_by_name(&self, name: &str) -> Option<InterfaceId> {
        self.interfaces_by_name.get(name).copied()
    }

    pub fn default_gateway(&self) -> Option<Ipv4Address> {
        self.default_gateway
    }

    /// Names of the enabled services, in the order packets are offered to them.
    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name).collect()
    }

    pub(crate) fn add_interface(&mut self, iface: InterfaceId, name: String) {
        self.interfaces.push(iface);
        self.interfaces_by_name.insert(name, iface);
    }

    pub(crate) fn remove_interface(&mut self, iface: InterfaceId, name: &str) {
        self.interfaces.retain(|i| *i != iface);
        self.interfaces_by_name.remove(name);
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("interfaces", &self.interfaces)
            .field("services", &self.service_names())
            .finish()
    }
}
