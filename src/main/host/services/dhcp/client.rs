use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Weak;

use serde::Serialize;

use super::{broadcast, Lease};
use crate::core::scheduler::Subscription;
use crate::core::simulation::{SimError, Simulation};
use crate::core::support::simulation_time::SimulationTime;
use crate::host::host::HostId;
use crate::host::network::interface::{InterfaceId, InterfaceSnapshot, OperState};
use crate::host::service::{Service, ServiceTimers, ServiceVerdict};
use crate::host::services::arp::{self, Arp};
use crate::network::address::Ipv4Address;
use crate::network::builder::{DhcpBuilder, Ipv4Builder, UdpBuilder};
use crate::network::headers::{DhcpMessage, DhcpOp, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use crate::network::packet::PacketRc;
use crate::utility::deferred::{Deferred, Resolver};

#[derive(Debug, Clone, Copy)]
pub struct DhcpClientConfig {
    /// How long a negotiation may take before it's abandoned.
    pub timeout: SimulationTime,
}

impl Default for DhcpClientConfig {
    fn default() -> Self {
        Self {
            timeout: SimulationTime::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DhcpClientStats {
    pub discovers_sent: u64,
    pub requests_sent: u64,
    pub leases_obtained: u64,
    pub naks_received: u64,
    pub timeouts: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Selecting,
    Requesting,
}

struct Session {
    xid: u32,
    phase: Phase,
    deferred: Deferred<Option<Lease>>,
    resolver: Resolver<Option<Lease>>,
    timeout: Subscription,
}

struct Held {
    lease: Lease,
    expiry: Subscription,
}

#[derive(Serialize)]
struct DhcpClientReport {
    stats: DhcpClientStats,
    leases: BTreeMap<String, Lease>,
}

/// Obtains addresses for the host's interfaces.
pub struct DhcpClient {
    config: DhcpClientConfig,
    host: Option<HostId>,
    this: Weak<RefCell<Self>>,
    timers: ServiceTimers,
    sessions: BTreeMap<InterfaceId, Session>,
    leases: BTreeMap<InterfaceId, Held>,
    stats: DhcpClientStats,
}

impl DhcpClient {
    pub fn new(config: DhcpClientConfig) -> Self {
        Self {
            config,
            host: None,
            this: Weak::new(),
            timers: ServiceTimers::new(),
            sessions: BTreeMap::new(),
            leases: BTreeMap::new(),
            stats: DhcpClientStats::default(),
        }
    }

    pub fn lease(&self, iface: InterfaceId) -> Option<Lease> {
        self.leases.get(&iface).map(|h| h.lease)
    }

    pub fn stats(&self) -> DhcpClientStats {
        self.stats
    }

    /// Obtain a lease for `iface` by broadcasting a Discover. Resolves to `None` if no server
    /// acknowledges within the timeout. Calling this while a negotiation on the interface is
    /// already under way returns that negotiation's result.
    pub fn negotiate(&mut self, sim: &mut Simulation, iface: InterfaceId) -> Deferred<Option<Lease>> {
        if let Some(session) = self.sessions.get(&iface) {
            return session.deferred.clone();
        }

        let xid = sim.next_random_u32();
        let (deferred, resolver) = Deferred::pending();
        let timeout = self.timers.once(sim, &self.this, self.config.timeout, move |c: &mut Self, _| {
            c.abandon(iface, xid)
        });
        self.sessions.insert(
            iface,
            Session {
                xid,
                phase: Phase::Selecting,
                deferred: deferred.clone(),
                resolver,
                timeout,
            },
        );

        let Ok(mac) = sim.iface(iface).map(|i| i.mac()) else {
            self.fail(iface);
            return deferred;
        };
        let discover = DhcpBuilder::new(DhcpOp::Discover).xid(xid).client_mac(mac);
        log::debug!("Discovering a DHCP server (xid {xid:#010x})");
        self.stats.discovers_sent += 1;
        broadcast(sim, iface, Ipv4Address::UNSPECIFIED, discover, false);
        deferred
    }

    /// Give up the lease on `iface`, telling the server and removing the interface address.
    /// Returns `false` if there was no lease.
    pub fn release(&mut self, sim: &mut Simulation, iface: InterfaceId) -> bool {
        let Some(held) = self.leases.remove(&iface) else {
            return false;
        };
        held.expiry.unsubscribe();
        let lease = held.lease;

        if let Ok(mac) = sim.iface(iface).map(|i| i.mac()) {
            let release = DhcpBuilder::new(DhcpOp::Release)
                .xid(sim.next_random_u32())
                .client_mac(mac)
                .client_ip(lease.address)
                .server_id(lease.server);
            self.send_to_server(sim, iface, lease, release);
        }
        log::info!("Released {}", lease.address);
        self.unconfigure(sim, iface, lease);
        true
    }

    /// Release goes to the server directly when ARP is available to reach it, and is broadcast
    /// otherwise.
    fn send_to_server(&self, sim: &mut Simulation, iface: InterfaceId, lease: Lease, msg: DhcpBuilder) {
        let host = self.host;
        let arp_enabled = host.is_some_and(|h| sim.service::<Arp>(h).is_some());
        if let (Some(host), true) = (host, arp_enabled) {
            let packet = msg.build().and_then(|msg| {
                let udp = UdpBuilder::new()
                    .src_port(DHCP_CLIENT_PORT)
                    .dst_port(DHCP_SERVER_PORT)
                    .payload(msg)
                    .build()?;
                Ipv4Builder::new()
                    .src(lease.address)
                    .dst(lease.server)
                    .payload(udp)
                    .build()
            });
            match packet {
                Ok(packet) => {
                    if let Err(e) = arp::send_ipv4(sim, host, packet) {
                        log::warn!("Couldn't send a DHCP release: {e}");
                    }
                }
                Err(e) => log::warn!("Couldn't build a DHCP release: {e}"),
            }
        } else {
            broadcast(sim, iface, lease.address, msg, false);
        }
    }

    fn unconfigure(&mut self, sim: &mut Simulation, iface: InterfaceId, lease: Lease) {
        let still_ours = sim
            .iface(iface)
            .is_ok_and(|i| i.ip() == Some(lease.address));
        if still_ours {
            if let Err(e) = sim.clear_interface_address(iface) {
                log::warn!("Couldn't remove the leased address: {e}");
            }
        }
        if let Some(host) = self.host {
            if lease.router.is_some() && sim.default_gateway(host) == lease.router {
                if let Err(e) = sim.set_default_gateway(host, None) {
                    log::debug!("Couldn't clear the default gateway: {e}");
                }
            }
        }
    }

    fn handle_reply(&mut self, sim: &mut Simulation, iface: InterfaceId, msg: &DhcpMessage) -> bool {
        let Some(session) = self.sessions.get_mut(&iface) else {
            return false;
        };
        if session.xid != msg.xid {
            return false;
        }

        match (session.phase, msg.op) {
            (Phase::Selecting, DhcpOp::Offer) => {
                let (Some(offered), Some(server)) = (msg.your_ip, msg.server_id) else {
                    return true;
                };
                session.phase = Phase::Requesting;
                let request = DhcpBuilder::new(DhcpOp::Request)
                    .xid(msg.xid)
                    .client_mac(msg.client_mac)
                    .requested_ip(offered)
                    .server_id(server);
                log::debug!("Requesting {offered} from {server}");
                self.stats.requests_sent += 1;
                broadcast(sim, iface, Ipv4Address::UNSPECIFIED, request, false);
            }
            (Phase::Requesting, DhcpOp::Ack) => {
                let (Some(address), Some(mask), Some(server), Some(lease_time)) =
                    (msg.your_ip, msg.subnet_mask, msg.server_id, msg.lease_time)
                else {
                    return true;
                };
                let lease = Lease {
                    address,
                    mask,
                    router: msg.router,
                    server,
                    lease_time,
                    obtained_at: sim.now(),
                };
                self.accept(sim, iface, lease);
            }
            (Phase::Requesting, DhcpOp::Nak) => {
                log::info!("Server refused the lease");
                self.stats.naks_received += 1;
                self.fail(iface);
            }
            // stray offers from slower servers, and duplicates
            _ => {}
        }
        true
    }

    fn accept(&mut self, sim: &mut Simulation, iface: InterfaceId, lease: Lease) {
        let Some(session) = self.sessions.remove(&iface) else {
            return;
        };
        session.timeout.unsubscribe();
        if let Some(old) = self.leases.remove(&iface) {
            old.expiry.unsubscribe();
        }

        log::info!(
            "Obtained {} mask {} from {} for {}",
            lease.address,
            lease.mask,
            lease.server,
            lease.lease_time
        );
        if let Err(e) = sim.set_interface_address(iface, lease.address, lease.mask) {
            log::warn!("Couldn't apply the lease: {e}");
        }
        if let (Some(host), Some(router)) = (self.host, lease.router) {
            if let Err(e) = sim.set_default_gateway(host, Some(router)) {
                log::debug!("Couldn't set the default gateway to {router}: {e}");
            }
        }

        let expiry = self
            .timers
            .once(sim, &self.this, lease.lease_time, move |c: &mut Self, sim| {
                c.expire(sim, iface)
            });
        self.leases.insert(iface, Held { lease, expiry });
        self.stats.leases_obtained += 1;
        session.resolver.resolve(Some(lease));
    }

    fn expire(&mut self, sim: &mut Simulation, iface: InterfaceId) {
        let Some(held) = self.leases.remove(&iface) else {
            return;
        };
        log::info!("Lease of {} expired", held.lease.address);
        self.stats.expirations += 1;
        self.unconfigure(sim, iface, held.lease);
    }

    fn abandon(&mut self, iface: InterfaceId, xid: u32) {
        if self.sessions.get(&iface).is_some_and(|s| s.xid == xid) {
            log::info!("No DHCP server answered in time");
            self.stats.timeouts += 1;
            self.fail(iface);
        }
    }

    fn fail(&mut self, iface: InterfaceId) {
        if let Some(session) = self.sessions.remove(&iface) {
            session.timeout.unsubscribe();
            session.resolver.resolve(None);
        }
    }
}

impl Default for DhcpClient {
    fn default() -> Self {
        Self::new(DhcpClientConfig::default())
    }
}

impl Service for DhcpClient {
    fn name(&self) -> &'static str {
        "dhcp-client"
    }

    fn attach(&mut self, _sim: &mut Simulation, host: HostId, this: Weak<RefCell<Self>>) {
        self.host = Some(host);
        self.this = this;
        self.timers.set_host(host);
    }

    fn detach(&mut self, _sim: &mut Simulation) {
        self.timers.cancel_all();
        let ifaces: Vec<_> = self.sessions.keys().copied().collect();
        for iface in ifaces {
            self.fail(iface);
        }
    }

    fn receive_packet(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        packet: &PacketRc,
    ) -> ServiceVerdict {
        let (Some(udp), Some(msg)) = (packet.udp(), packet.dhcp()) else {
            return ServiceVerdict::Continue;
        };
        let ours = sim.iface(iface).is_ok_and(|i| i.mac() == msg.client_mac);
        if udp.dst_port != DHCP_CLIENT_PORT || !ours {
            return ServiceVerdict::Continue;
        }
        if self.handle_reply(sim, iface, msg) {
            ServiceVerdict::Handled
        } else {
            ServiceVerdict::Continue
        }
    }

    fn interface_changed(
        &mut self,
        _sim: &mut Simulation,
        iface: InterfaceId,
        snapshot: &InterfaceSnapshot,
    ) {
        if snapshot.state == OperState::Down {
            self.fail(iface);
        }
    }

    fn report(&self, sim: &Simulation) -> Option<serde_yaml::Value> {
        let report = DhcpClientReport {
            stats: self.stats,
            leases: self
                .leases
                .iter()
                .map(|(iface, held)| (sim.interface_label(*iface), held.lease))
                .collect(),
        };
        serde_yaml::to_value(report).ok()
    }
}

/// Obtain a lease for `iface` using the DHCP client of its host.
pub fn negotiate(sim: &mut Simulation, iface: InterfaceId) -> Result<Deferred<Option<Lease>>, SimError> {
    let host = sim.iface(iface)?.host();
    let client = sim.require_service::<DhcpClient>(host)?;
    let deferred = client.borrow_mut().negotiate(sim, iface);
    Ok(deferred)
}

/// Give up the lease on `iface`. Returns `false` if there was none.
pub fn release(sim: &mut Simulation, iface: InterfaceId) -> Result<bool, SimError> {
    let host = sim.iface(iface)?.host();
    let client = sim.require_service::<DhcpClient>(host)?;
    let released = client.borrow_mut().release(sim, iface);
    Ok(released)
}
