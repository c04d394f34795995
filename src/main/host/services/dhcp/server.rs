use std::cell::RefCell;
use std::rc::Weak;

use serde::Serialize;

use super::pool::{DhcpPool, DhcpPoolSnapshot, Reservation, ReservationState};
use super::broadcast;
use crate::core::simulation::Simulation;
use crate::core::support::simulation_time::SimulationTime;
use crate::host::host::HostId;
use crate::host::network::interface::{InterfaceAddress, InterfaceId};
use crate::host::service::{Service, ServiceTimers, ServiceVerdict};
use crate::host::services::arp;
use crate::network::address::Ipv4Address;
use crate::network::builder::{DhcpBuilder, Ipv4Builder, UdpBuilder};
use crate::network::headers::{DhcpMessage, DhcpOp, DHCP_SERVER_PORT};
use crate::network::packet::{PacketRc, PacketStatus};

#[derive(Debug, Clone, Copy)]
pub struct DhcpServerConfig {
    /// How long an offered address is held for the client.
    pub offer_hold: SimulationTime,
    pub lease_time: SimulationTime,
}

impl Default for DhcpServerConfig {
    fn default() -> Self {
        Self {
            offer_hold: SimulationTime::from_secs(30),
            lease_time: SimulationTime::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DhcpServerStats {
    pub discovers: u64,
    pub offers: u64,
    pub requests: u64,
    pub acks: u64,
    pub naks: u64,
    pub releases: u64,
    /// Client messages forwarded to another server, and replies re-broadcast to clients.
    pub relayed: u64,
    /// Discovers that no address could be offered for.
    pub no_offer: u64,
}

#[derive(Serialize)]
struct DhcpServerReport {
    stats: DhcpServerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    forwarder: Option<Ipv4Address>,
    pools: Vec<DhcpPoolSnapshot>,
}

/// Hands out addresses from its pools. Client messages from a subnet that no pool serves are
/// relayed to the forwarder, if one is set.
pub struct DhcpServer {
    config: DhcpServerConfig,
    host: Option<HostId>,
    this: Weak<RefCell<Self>>,
    timers: ServiceTimers,
    pools: Vec<DhcpPool>,
    forwarder: Option<Ipv4Address>,
    stats: DhcpServerStats,
}

impl DhcpServer {
    pub fn new(config: DhcpServerConfig) -> Self {
        Self {
            config,
            host: None,
            this: Weak::new(),
            timers: ServiceTimers::new(),
            pools: Vec::new(),
            forwarder: None,
            stats: DhcpServerStats::default(),
        }
    }

    pub fn with_pool(mut self, pool: DhcpPool) -> Self {
        self.add_pool(pool);
        self
    }

    pub fn with_forwarder(mut self, forwarder: Ipv4Address) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn add_pool(&mut self, pool: DhcpPool) {
        log::debug!("Serving {} mask {}", pool.gateway(), pool.mask());
        self.pools.push(pool);
    }

    /// Relay client messages that no pool serves to `forwarder`, or stop relaying.
    pub fn set_forwarder(&mut self, forwarder: Option<Ipv4Address>) {
        self.forwarder = forwarder;
    }

    pub fn forwarder(&self) -> Option<Ipv4Address> {
        self.forwarder
    }

    pub fn pools(&self) -> Vec<DhcpPoolSnapshot> {
        self.pools.iter().map(|p| p.snapshot()).collect()
    }

    pub fn stats(&self) -> DhcpServerStats {
        self.stats
    }

    fn own_addresses(&self, sim: &Simulation) -> Vec<(InterfaceId, InterfaceAddress)> {
        let Some(host) = self.host.and_then(|h| sim.host(h)) else {
            return Vec::new();
        };
        host.interfaces()
            .iter()
            .filter_map(|id| Some((*id, sim.iface(*id).ok()?.address()?)))
            .collect()
    }

    fn handle_client_message(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        local: InterfaceAddress,
        msg: &DhcpMessage,
    ) -> ServiceVerdict {
        // the subnet the client is on: the relay's, or the one the message arrived on
        let origin = msg.relay_agent.unwrap_or(local.ip);
        let Some(pool) = self.pools.iter().position(|p| p.serves(origin)) else {
            return self.relay_to_forwarder(sim, local, msg);
        };

        match msg.op {
            DhcpOp::Discover => self.handle_discover(sim, iface, local, pool, msg),
            DhcpOp::Request => self.handle_request(sim, iface, local, pool, msg),
            DhcpOp::Release => {
                self.stats.releases += 1;
                if let Some(ip) = msg.client_ip {
                    if self.pools[pool].release(ip, msg.client_mac) {
                        log::info!("{} released {ip}", msg.client_mac);
                    }
                }
            }
            DhcpOp::Offer | DhcpOp::Ack | DhcpOp::Nak => {}
        }
        ServiceVerdict::Handled
    }

    fn handle_discover(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        local: InterfaceAddress,
        pool: usize,
        msg: &DhcpMessage,
    ) {
        self.stats.discovers += 1;
        let own: Vec<_> = self.own_addresses(sim).into_iter().map(|(_, a)| a.ip).collect();
        for ip in own {
            self.pools[pool].exclude(ip);
        }

        let Some(ip) = self.pools[pool].choose(msg.client_mac, msg.requested_ip) else {
            log::info!("No address left to offer {}", msg.client_mac);
            self.stats.no_offer += 1;
            return;
        };
        let hold = self.config.offer_hold;
        self.reserve(sim, pool, ip, msg, ReservationState::Offered, hold);

        let p = &self.pools[pool];
        let offer = DhcpBuilder::new(DhcpOp::Offer)
            .xid(msg.xid)
            .client_mac(msg.client_mac)
            .your_ip(ip)
            .server_id(local.ip)
            .subnet_mask(p.mask())
            .router(p.gateway())
            .lease_time(self.config.lease_time);
        log::debug!("Offering {ip} to {}", msg.client_mac);
        self.stats.offers += 1;
        self.reply(sim, iface, local, msg, offer);
    }

    fn handle_request(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        local: InterfaceAddress,
        pool: usize,
        msg: &DhcpMessage,
    ) {
        self.stats.requests += 1;
        if let Some(server) = msg.server_id {
            let ours = self.own_addresses(sim).iter().any(|(_, a)| a.ip == server);
            if !ours {
                // the client picked another server's offer
                if let Some(ip) = self.pools[pool].reserved_for(msg.client_mac) {
                    if self.pools[pool].state_of(ip) == Some(ReservationState::Offered) {
                        self.pools[pool].release(ip, msg.client_mac);
                    }
                }
                return;
            }
        }

        let requested = msg.requested_ip.or(msg.client_ip);
        let p = &self.pools[pool];
        let grant = requested.filter(|ip| p.available_for(*ip, msg.client_mac));

        let Some(ip) = grant else {
            log::info!("Refusing {requested:?} to {}", msg.client_mac);
            let nak = DhcpBuilder::new(DhcpOp::Nak)
                .xid(msg.xid)
                .client_mac(msg.client_mac)
                .server_id(local.ip);
            self.stats.naks += 1;
            self.reply(sim, iface, local, msg, nak);
            return;
        };

        let lease_time = self.config.lease_time;
        self.reserve(sim, pool, ip, msg, ReservationState::Leased, lease_time);
        let p = &self.pools[pool];
        let ack = DhcpBuilder::new(DhcpOp::Ack)
            .xid(msg.xid)
            .client_mac(msg.client_mac)
            .your_ip(ip)
            .server_id(local.ip)
            .subnet_mask(p.mask())
            .router(p.gateway())
            .lease_time(lease_time);
        log::info!("Leased {ip} to {} for {lease_time}", msg.client_mac);
        self.stats.acks += 1;
        self.reply(sim, iface, local, msg, ack);
    }

    fn reserve(
        &mut self,
        sim: &mut Simulation,
        pool: usize,
        ip: Ipv4Address,
        msg: &DhcpMessage,
        state: ReservationState,
        duration: SimulationTime,
    ) {
        let token = self.pools[pool].next_token();
        let hold = self.timers.once(sim, &self.this, duration, move |server: &mut Self, _| {
            if let Some(p) = server.pools.get_mut(pool) {
                p.expire(ip, token);
            }
        });
        let reservation = Reservation {
            client: msg.client_mac,
            state,
            expires_at: sim.now().saturating_add(duration),
            token,
            hold,
        };
        self.pools[pool].reserve(ip, reservation);
    }

    /// Answer a client: through its relay if it came through one, otherwise by broadcast.
    fn reply(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        local: InterfaceAddress,
        request: &DhcpMessage,
        reply: DhcpBuilder,
    ) {
        match request.relay_agent {
            Some(relay) => {
                let reply = reply.relay_agent(relay);
                self.unicast(sim, local.ip, relay, reply);
            }
            None => {
                broadcast(sim, iface, local.ip, reply, true);
            }
        }
    }

    /// Send a DHCP message to another server or relay, routed at layer 3.
    fn unicast(&mut self, sim: &mut Simulation, src: Ipv4Address, dst: Ipv4Address, msg: DhcpBuilder) {
        let Some(host) = self.host else {
            return;
        };
        let packet = msg.build().and_then(|msg| {
            let udp = UdpBuilder::new()
                .src_port(DHCP_SERVER_PORT)
                .dst_port(DHCP_SERVER_PORT)
                .payload(msg)
                .build()?;
            Ipv4Builder::new().src(src).dst(dst).payload(udp).build()
        });
        let packet = match packet {
            Ok(x) => x,
            Err(e) => {
                log::warn!("Couldn't build a DHCP message for {dst}: {e}");
                return;
            }
        };
        match arp::send_ipv4(sim, host, packet) {
            Ok(true) => {}
            Ok(false) => log::debug!("No route to {dst} for a DHCP message"),
            Err(e) => log::warn!("Can't send a DHCP message to {dst}: {e}"),
        }
    }

    fn relay_to_forwarder(
        &mut self,
        sim: &mut Simulation,
        local: InterfaceAddress,
        msg: &DhcpMessage,
    ) -> ServiceVerdict {
        let Some(forwarder) = self.forwarder else {
            log::debug!("No pool serves {} and there's nowhere to relay to", local.ip);
            return ServiceVerdict::Continue;
        };
        // the first relay a message passes through records where the client is
        let relay = msg.relay_agent.unwrap_or(local.ip);
        let forwarded = DhcpBuilder::from_message(msg).relay_agent(relay);
        log::debug!("Relaying {:?} from {} to {forwarder}", msg.op, msg.client_mac);
        self.stats.relayed += 1;
        self.unicast(sim, local.ip, forwarder, forwarded);
        ServiceVerdict::Handled
    }

    /// A server's answer addressed to one of our relay addresses: re-broadcast it to the client.
    fn relay_to_client(&mut self, sim: &mut Simulation, msg: &DhcpMessage) -> ServiceVerdict {
        let Some(relay) = msg.relay_agent else {
            return ServiceVerdict::Continue;
        };
        let Some((iface, local)) = self
            .own_addresses(sim)
            .into_iter()
            .find(|(_, a)| a.ip == relay)
        else {
            return ServiceVerdict::Continue;
        };
        log::debug!("Relaying {:?} back to {}", msg.op, msg.client_mac);
        self.stats.relayed += 1;
        broadcast(sim, iface, local.ip, DhcpBuilder::from_message(msg), true);
        ServiceVerdict::Handled
    }
}

impl Default for DhcpServer {
    fn default() -> Self {
        Self::new(DhcpServerConfig::default())
    }
}

impl Service for DhcpServer {
    fn name(&self) -> &'static str {
        "dhcp-server"
    }

    fn attach(&mut self, _sim: &mut Simulation, host: HostId, this: Weak<RefCell<Self>>) {
        self.host = Some(host);
        self.this = this;
        self.timers.set_host(host);
    }

    fn detach(&mut self, _sim: &mut Simulation) {
        self.timers.cancel_all();
        for pool in &mut self.pools {
            pool.clear();
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
        if udp.dst_port != DHCP_SERVER_PORT {
            return ServiceVerdict::Continue;
        }
        let Some(local) = sim.iface(iface).ok().and_then(|i| i.address()) else {
            return ServiceVerdict::Continue;
        };

        let relayed = self.stats.relayed;
        let verdict = if msg.op.from_client() {
            self.handle_client_message(sim, iface, local, msg)
        } else {
            self.relay_to_client(sim, msg)
        };
        if self.stats.relayed > relayed {
            packet.add_status(PacketStatus::RelayForwarded);
        }
        verdict
    }

    fn report(&self, _sim: &Simulation) -> Option<serde_yaml::Value> {
        let report = DhcpServerReport {
            stats: self.stats,
            forwarder: self.forwarder,
            pools: self.pools(),
        };
        serde_yaml::to_value(report).ok()
    }
}
