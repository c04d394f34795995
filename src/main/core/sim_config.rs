//! Building a [`Simulation`] from its processed configuration options.

use anyhow::Context;

use crate::core::configuration::{
    parse_interface_address, ConfigOptions, HostOptions, HsrpOptions, InterfaceConfig,
    LinkOptions as LinkConfig, ProtocolOptions, ServiceKind,
};
use crate::core::simulation::{Simulation, SimulationOptions};
use crate::core::support::simulation_time::SimulationTime;
use crate::host::host::HostId;
use crate::host::network::interface::{InterfaceAddress, InterfaceId, InterfaceOptions, SpeedSet};
use crate::host::services::arp::Arp;
use crate::host::services::dhcp::{self, DhcpClient, DhcpPool, DhcpServer};
use crate::host::services::hsrp::{self, Hsrp, HsrpGroupConfig};
use crate::host::services::switching::{self, Switching};
use crate::network::link::LinkOptions;

impl Simulation {
    /// Create the hosts, interfaces, services and links described by `config`. Interfaces that
    /// obtain their address with DHCP start negotiating once their links are up.
    pub fn from_config(config: &ConfigOptions) -> anyhow::Result<Self> {
        let protocols = &config.protocols;
        let mut sim = Simulation::new(SimulationOptions {
            seed: config.general.seed.unwrap_or(1),
            negotiation_delay: protocols.link.negotiation_delay.into(),
        });
        if let Some(multiplier) = config.general.time_multiplier {
            anyhow::ensure!(
                multiplier.is_finite() && multiplier > 0.0,
                "The time multiplier must be positive, not {multiplier}"
            );
            sim.set_time_multiplier(multiplier);
        }

        let mut dhcp_interfaces = Vec::new();
        for (name, options) in &config.hosts {
            let dhcp = build_host(&mut sim, protocols, name, options)
                .with_context(|| format!("Failed to configure host '{name}'"))?;
            dhcp_interfaces.extend(dhcp);
        }

        for (index, link) in config.links.iter().enumerate() {
            build_link(&mut sim, protocols, link).with_context(|| {
                format!(
                    "Failed to configure link {index} ({} <-> {})",
                    link.ends[0], link.ends[1]
                )
            })?;
        }

        // links were just made, so every linked interface finishes negotiating at this delay
        let start = sim.options().negotiation_delay;
        for iface in dhcp_interfaces {
            sim.scheduler_mut().once(start, move |sim: &mut Simulation| {
                if let Err(e) = dhcp::negotiate(sim, iface) {
                    log::warn!("Could not start DHCP: {e}");
                }
            });
        }

        Ok(sim)
    }
}

/// Returns the interfaces that should be configured with DHCP.
fn build_host(
    sim: &mut Simulation,
    protocols: &ProtocolOptions,
    name: &str,
    options: &HostOptions,
) -> anyhow::Result<Vec<InterfaceId>> {
    let host = sim.add_host(name, options.role)?;

    // services first, so that they see every interface being added
    for kind in &options.services {
        enable(sim, host, *kind, protocols, options)
            .with_context(|| format!("Failed to enable service {kind:?}"))?;
    }

    let mut dhcp_interfaces = Vec::new();
    for iface_config in &options.interfaces {
        let iface = build_interface(sim, host, protocols, options, iface_config)
            .with_context(|| format!("Failed to configure interface '{}'", iface_config.name))?;
        if iface_config.dhcp {
            anyhow::ensure!(
                options.services.contains(&ServiceKind::DhcpClient),
                "Interface '{}' uses DHCP but the host has no dhcp-client service",
                iface_config.name
            );
            dhcp_interfaces.push(iface);
        }
    }

    if options.default_gateway.is_some() {
        sim.set_default_gateway(host, options.default_gateway)?;
    }

    Ok(dhcp_interfaces)
}

fn enable(
    sim: &mut Simulation,
    host: HostId,
    kind: ServiceKind,
    protocols: &ProtocolOptions,
    options: &HostOptions,
) -> anyhow::Result<()> {
    match kind {
        ServiceKind::Arp => {
            sim.enable_service(host, Arp::new((&protocols.arp).into()))?;
        }
        ServiceKind::DhcpClient => {
            sim.enable_service(host, DhcpClient::new((&protocols.dhcp).into()))?;
        }
        ServiceKind::DhcpServer => {
            let mut server = DhcpServer::new((&protocols.dhcp).into());
            for pool in &options.dhcp_pools {
                let mut built = DhcpPool::new(pool.gateway, pool.mask, pool.start, pool.end)
                    .with_context(|| format!("Invalid pool {}-{}", pool.start, pool.end))?;
                for ip in &pool.exclude {
                    built.exclude(*ip);
                }
                server.add_pool(built);
            }
            server.set_forwarder(options.dhcp_forwarder);
            sim.enable_service(host, server)?;
        }
        ServiceKind::Switching => {
            sim.enable_service(host, Switching::new((&protocols.switching).into()))?;
        }
        ServiceKind::Hsrp => {
            sim.enable_service(host, Hsrp::new())?;
        }
    }
    Ok(())
}

fn build_interface(
    sim: &mut Simulation,
    host: HostId,
    protocols: &ProtocolOptions,
    host_options: &HostOptions,
    config: &InterfaceConfig,
) -> anyhow::Result<InterfaceId> {
    let address = match &config.address {
        Some(address) => {
            let (ip, mask) = parse_interface_address(address).map_err(anyhow::Error::msg)?;
            Some(InterfaceAddress { ip, mask })
        }
        None => None,
    };
    anyhow::ensure!(
        !(config.dhcp && address.is_some()),
        "An interface can't have both a static address and use DHCP"
    );

    let options = InterfaceOptions {
        name: config.name.clone(),
        mac: config.mac,
        speeds: config.max_speed.map_or(SpeedSet::all(), SpeedSet::up_to),
        full_duplex: config.full_duplex,
        admin_up: config.admin_up,
        address,
    };
    let iface = sim.add_interface_with(host, options)?;

    if let Some(mode) = &config.mode {
        anyhow::ensure!(
            host_options.services.contains(&ServiceKind::Switching),
            "A port mode was given but the host has no switching service"
        );
        switching::set_port_mode(sim, iface, mode.clone())?;
    }

    for group in &config.hsrp {
        let mut hsrp_config = group_config(&protocols.hsrp, group.group);
        hsrp_config.virtual_ip = group.virtual_ip;
        if let Some(priority) = group.priority {
            hsrp_config.priority = priority;
        }
        if let Some(preempt) = group.preempt {
            hsrp_config.preempt = preempt;
        }
        hsrp::configure_group(sim, iface, hsrp_config)
            .with_context(|| format!("Failed to configure HSRP group {}", group.group))?;
    }

    Ok(iface)
}

fn group_config(defaults: &HsrpOptions, group: u8) -> HsrpGroupConfig {
    HsrpGroupConfig {
        group,
        virtual_ip: None,
        priority: defaults.priority,
        preempt: defaults.preempt,
        hello_time: defaults.hello_time.into(),
        hold_time: defaults.hold_time.into(),
        auth: defaults.auth.clone(),
    }
}

fn build_link(
    sim: &mut Simulation,
    protocols: &ProtocolOptions,
    config: &LinkConfig,
) -> anyhow::Result<()> {
    let a = sim.find_interface(&config.ends[0])?;
    let b = sim.find_interface(&config.ends[1])?;
    let delay: SimulationTime = config.delay.unwrap_or(protocols.link.delay).into();
    let link = sim.connect_with(
        a,
        b,
        LinkOptions {
            delay,
            bandwidth: config.bandwidth,
        },
    )?;
    if let Some(mode) = config.trunk {
        switching::set_trunk_mode(sim, link, mode)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use clap::Parser;

    use super::*;
    use crate::core::configuration::{CliOptions, ConfigFileOptions};
    use crate::host::network::interface::{OperState, Speed};
    use crate::network::address::Ipv4Address;

    fn build(yaml: &str) -> anyhow::Result<Simulation> {
        let file = ConfigFileOptions::from_str(yaml)?;
        let cli = CliOptions::try_parse_from(["netsim", "-"])?;
        Simulation::from_config(&ConfigOptions::new(file, cli))
    }

    const LAN: &str = r#"
general:
  stop_time: 1 min
hosts:
  server:
    role: server
    services: [arp, dhcp-server]
    interfaces:
      - name: eth0
        address: 10.0.0.1/24
        max_speed: 100Mbps
    dhcp_pools:
      - gateway: 10.0.0.1
        mask: 255.255.255.0
        start: 10.0.0.10
        end: 10.0.0.20
  pc:
    role: computer
    services: [arp, dhcp-client]
    interfaces:
      - name: eth0
        dhcp: true
  sw:
    role: switch
    services: [switching]
    interfaces:
      - name: fa0/1
      - name: fa0/2
links:
  - ends: ["server:eth0", "sw:fa0/1"]
  - ends: ["pc:eth0", "sw:fa0/2"]
"#;

    #[test_log::test]
    fn builds_and_leases() {
        let mut sim = build(LAN).unwrap();
        assert_eq!(sim.hosts().len(), 3);

        sim.advance(SimulationTime::from_secs(5));
        let server = sim.find_interface("server:eth0").unwrap();
        let snapshot = sim.interface(server).unwrap();
        assert_eq!(snapshot.state, OperState::Up);
        assert_eq!(snapshot.speed, Some(Speed::Hundred));

        let pc = sim.find_interface("pc:eth0").unwrap();
        assert_eq!(sim.iface(pc).unwrap().ip(), Some(Ipv4Address::new(10, 0, 0, 10)));
    }

    #[test]
    fn unknown_link_end_is_an_error() {
        let yaml = LAN.replace("pc:eth0\"", "pc:eth9\"");
        let err = build(&yaml).err().unwrap();
        assert!(format!("{err:#}").contains("pc:eth9"));
    }

    #[test]
    fn dhcp_needs_a_client() {
        let yaml = LAN.replace("services: [arp, dhcp-client]", "services: [arp]");
        let err = build(&yaml).err().unwrap();
        assert!(format!("{err:#}").contains("dhcp-client"));
    }

    #[test]
    fn invalid_pool_is_an_error() {
        let yaml = LAN.replace("end: 10.0.0.20", "end: 10.0.1.20");
        assert!(build(&yaml).is_err());
    }
}
