//! Address resolution: a per-host cache of IPv4 to MAC bindings, learned from ARP traffic.
//!
//! There is deliberately no defense against poisoning. A spoofed reply replaces the cached
//! binding just like a genuine one; the entry is only flagged using the ground truth that the
//! simulation carries on the message.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Weak;

use serde::Serialize;

use crate::core::scheduler::Subscription;
use crate::core::simulation::{SimError, Simulation};
use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::host::host::HostId;
use crate::host::network::interface::{InterfaceId, InterfaceSnapshot, OperState};
use crate::host::service::{Service, ServiceTimers, ServiceVerdict};
use crate::network::address::{Ipv4Address, MacAddress};
use crate::network::builder::{ArpBuilder, EthernetBuilder};
use crate::network::headers::{ArpHeader, ArpOp};
use crate::network::packet::PacketRc;
use crate::utility::deferred::{Deferred, Resolver};

#[derive(Debug, Clone, Copy)]
pub struct ArpConfig {
    /// How long a cache entry lives after it was last learned.
    pub entry_timeout: SimulationTime,
    /// How long to wait for a reply before asking again.
    pub request_timeout: SimulationTime,
    /// How many requests to send before a resolution fails.
    pub retries: u32,
    /// How often expired entries are removed.
    pub sweep_interval: SimulationTime,
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            entry_timeout: SimulationTime::from_secs(300),
            request_timeout: SimulationTime::from_secs(1),
            retries: 3,
            sweep_interval: SimulationTime::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpEntry {
    pub mac: MacAddress,
    pub interface: InterfaceId,
    pub learned_at: EmulatedTime,
    /// The binding came from a message whose sender didn't own the address.
    pub poisoned: bool,
}

/// A cache entry, for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpCacheRow {
    pub ip: Ipv4Address,
    pub mac: MacAddress,
    pub interface: String,
    pub learned_at: EmulatedTime,
    pub poisoned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArpStats {
    pub hits: u64,
    pub misses: u64,
    pub requests_sent: u64,
    pub replies_sent: u64,
    pub failures: u64,
}

#[derive(Serialize)]
struct ArpReport {
    stats: ArpStats,
    cache: Vec<ArpCacheRow>,
}

struct PendingResolution {
    iface: InterfaceId,
    resolvers: Vec<Resolver<Option<MacAddress>>>,
    // IPv4 packets (without an Ethernet layer) waiting for the binding
    queued: Vec<PacketRc>,
    attempts: u32,
    timer: Option<Subscription>,
}

pub struct Arp {
    config: ArpConfig,
    host: Option<HostId>,
    this: Weak<RefCell<Self>>,
    timers: ServiceTimers,
    cache: BTreeMap<Ipv4Address, ArpEntry>,
    // addresses answered for on behalf of someone else: ip -> (interface, mac)
    proxies: BTreeMap<Ipv4Address, (InterfaceId, MacAddress)>,
    pending: BTreeMap<Ipv4Address, PendingResolution>,
    stats: ArpStats,
}

impl Arp {
    pub fn new(config: ArpConfig) -> Self {
        Self {
            config,
            host: None,
            this: Weak::new(),
            timers: ServiceTimers::new(),
            cache: BTreeMap::new(),
            proxies: BTreeMap::new(),
            pending: BTreeMap::new(),
            stats: ArpStats::default(),
        }
    }

    pub fn config(&self) -> &ArpConfig {
        &self.config
    }

    pub fn stats(&self) -> ArpStats {
        self.stats
    }

    pub fn lookup(&self, ip: Ipv4Address) -> Option<ArpEntry> {
        self.cache.get(&ip).copied()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn cache_rows(&self, sim: &Simulation) -> Vec<ArpCacheRow> {
        self.cache
            .iter()
            .map(|(ip, entry)| ArpCacheRow {
                ip: *ip,
                mac: entry.mac,
                interface: sim.interface_label(entry.interface),
                learned_at: entry.learned_at,
                poisoned: entry.poisoned,
            })
            .collect()
    }

    /// Answer requests for `ip` arriving on `iface` with `mac`.
    pub fn add_proxy(&mut self, ip: Ipv4Address, iface: InterfaceId, mac: MacAddress) {
        log::debug!("Answering ARP for {ip} with {mac}");
        self.proxies.insert(ip, (iface, mac));
    }

    pub fn remove_proxy(&mut self, ip: Ipv4Address) -> bool {
        self.proxies.remove(&ip).is_some()
    }

    /// Forget every learned binding.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Resolve `ip` to a MAC address. A cached binding resolves immediately; otherwise requests
    /// are broadcast until a reply arrives or the retries run out (resolving to `None`).
    pub fn resolve(&mut self, sim: &mut Simulation, ip: Ipv4Address) -> Deferred<Option<MacAddress>> {
        if let Some(entry) = self.cache.get(&ip) {
            self.stats.hits += 1;
            return Deferred::resolved(Some(entry.mac));
        }
        self.stats.misses += 1;

        let (deferred, resolver) = Deferred::pending();
        if !self.await_binding(sim, ip, Some(resolver.clone()), None) {
            self.stats.failures += 1;
            resolver.resolve(None);
        }
        deferred
    }

    /// Send an IPv4 packet (one without an Ethernet layer) towards its destination: directly if
    /// it's on an attached subnet, otherwise via the default gateway. Returns `false` if there's
    /// no route. The packet waits for address resolution if necessary.
    pub fn send_ipv4(&mut self, sim: &mut Simulation, packet: PacketRc) -> bool {
        let Some(dst) = packet.ipv4().map(|ip| ip.dst) else {
            log::warn!("Not sending {packet}: it isn't an IPv4 packet");
            return false;
        };
        let Some((iface, next_hop)) = self.next_hop(sim, dst) else {
            log::debug!("No route to {dst}; discarding {packet}");
            return false;
        };

        if let Some(entry) = self.cache.get(&next_hop) {
            self.stats.hits += 1;
            let mac = entry.mac;
            return send_frame(sim, iface, mac, packet);
        }
        self.stats.misses += 1;
        self.await_binding(sim, next_hop, None, Some(packet))
    }

    /// Remove entries older than the entry timeout. Returns how many were removed.
    pub fn sweep(&mut self, sim: &Simulation) -> usize {
        let now = sim.now();
        let timeout = self.config.entry_timeout;
        let before = self.cache.len();
        self.cache.retain(|ip, entry| {
            let keep = now.saturating_duration_since(&entry.learned_at) < timeout;
            if !keep {
                log::debug!("ARP entry for {ip} ({}) expired", entry.mac);
            }
            keep
        });
        before - self.cache.len()
    }

    fn next_hop(&self, sim: &Simulation, dst: Ipv4Address) -> Option<(InterfaceId, Ipv4Address)> {
        if let Some(iface) = self.egress_for(sim, dst) {
            return Some((iface, dst));
        }
        let gateway = sim.default_gateway(self.host?)?;
        self.egress_for(sim, gateway).map(|iface| (iface, gateway))
    }

    /// The interface whose subnet contains `ip`, preferring interfaces that are up.
    fn egress_for(&self, sim: &Simulation, ip: Ipv4Address) -> Option<InterfaceId> {
        let host = sim.host(self.host?)?;
        let candidates: Vec<_> = host
            .interfaces()
            .iter()
            .filter_map(|id| sim.iface(*id).ok())
            .filter(|i| i.address().is_some_and(|a| a.contains(ip)))
            .collect();
        candidates
            .iter()
            .find(|i| i.is_up())
            .or(candidates.first())
            .map(|i| i.id())
    }

    /// Register interest in the binding for `ip`, sending a request if none is outstanding.
    /// Returns `false` if `ip` isn't on an attached subnet.
    fn await_binding(
        &mut self,
        sim: &mut Simulation,
        ip: Ipv4Address,
        resolver: Option<Resolver<Option<MacAddress>>>,
        packet: Option<PacketRc>,
    ) -> bool {
        if let Some(pending) = self.pending.get_mut(&ip) {
            pending.resolvers.extend(resolver);
            pending.queued.extend(packet);
            return true;
        }
        let Some(iface) = self.egress_for(sim, ip) else {
            return false;
        };
        self.pending.insert(
            ip,
            PendingResolution {
                iface,
                resolvers: resolver.into_iter().collect(),
                queued: packet.into_iter().collect(),
                attempts: 0,
                timer: None,
            },
        );
        self.send_request(sim, ip);
        true
    }

    fn send_request(&mut self, sim: &mut Simulation, ip: Ipv4Address) {
        let Some(pending) = self.pending.get_mut(&ip) else {
            return;
        };
        pending.attempts += 1;
        let iface = pending.iface;

        if let Ok(i) = sim.iface(iface) {
            if let Some(addr) = i.address() {
                let request = ArpBuilder::request(i.mac(), addr.ip, ip).build();
                match request {
                    Ok(request) => {
                        log::trace!("Who has {ip}? Tell {}", addr.ip);
                        send_frame(sim, iface, MacAddress::BROADCAST, request);
                        self.stats.requests_sent += 1;
                    }
                    Err(e) => log::warn!("Couldn't build an ARP request for {ip}: {e}"),
                }
            }
        }

        let timeout = self.config.request_timeout;
        let timer = self.timers.once(sim, &self.this, timeout, move |arp: &mut Self, sim| {
            arp.request_timed_out(sim, ip)
        });
        if let Some(pending) = self.pending.get_mut(&ip) {
            pending.timer = Some(timer);
        }
    }

    fn request_timed_out(&mut self, sim: &mut Simulation, ip: Ipv4Address) {
        let Some(pending) = self.pending.get(&ip) else {
            return;
        };
        if pending.attempts < self.config.retries {
            self.send_request(sim, ip);
            return;
        }
        log::debug!("Couldn't resolve {ip} after {} requests", pending.attempts);
        self.stats.failures += 1;
        self.fail_pending(ip);
    }

    fn fail_pending(&mut self, ip: Ipv4Address) {
        let Some(pending) = self.pending.remove(&ip) else {
            return;
        };
        if let Some(timer) = pending.timer {
            timer.unsubscribe();
        }
        if !pending.queued.is_empty() {
            log::debug!("Discarding {} packets queued for {ip}", pending.queued.len());
        }
        for resolver in pending.resolvers {
            resolver.resolve(None);
        }
    }

    fn complete_pending(&mut self, sim: &mut Simulation, ip: Ipv4Address, mac: MacAddress) {
        let Some(pending) = self.pending.remove(&ip) else {
            return;
        };
        if let Some(timer) = pending.timer {
            timer.unsubscribe();
        }
        for packet in pending.queued {
            send_frame(sim, pending.iface, mac, packet);
        }
        for resolver in pending.resolvers {
            resolver.resolve(Some(mac));
        }
    }

    /// Whether this host answers for `ip` on `iface`, and with which MAC.
    fn answers_for(&self, sim: &Simulation, iface: InterfaceId, ip: Ipv4Address) -> Option<MacAddress> {
        let i = sim.iface(iface).ok()?;
        if i.ip() == Some(ip) {
            return Some(i.mac());
        }
        match self.proxies.get(&ip) {
            Some((proxy_iface, mac)) if *proxy_iface == iface => Some(*mac),
            _ => None,
        }
    }

    fn handle_arp(&mut self, sim: &mut Simulation, iface: InterfaceId, arp: &ArpHeader) {
        let own_ip = sim.iface(iface).ok().and_then(|i| i.ip());
        let answer_with = self.answers_for(sim, iface, arp.target_ip);

        // RFC 826: update an existing binding for the sender, and only create one if the message
        // was meant for us. Gratuitous announcements and answers to our own outstanding requests
        // are always accepted.
        let now = sim.now();
        let learned = if Some(arp.sender_ip) == own_ip {
            false
        } else if let Some(entry) = self.cache.get_mut(&arp.sender_ip) {
            if entry.mac != arp.sender_mac {
                log::debug!(
                    "ARP entry for {} changed from {} to {}",
                    arp.sender_ip,
                    entry.mac,
                    arp.sender_mac
                );
            }
            *entry = ArpEntry {
                mac: arp.sender_mac,
                interface: iface,
                learned_at: now,
                poisoned: arp.spoofed,
            };
            true
        } else if answer_with.is_some()
            || arp.is_gratuitous()
            || (arp.op == ArpOp::Reply && self.pending.contains_key(&arp.sender_ip))
        {
            self.cache.insert(
                arp.sender_ip,
                ArpEntry {
                    mac: arp.sender_mac,
                    interface: iface,
                    learned_at: now,
                    poisoned: arp.spoofed,
                },
            );
            true
        } else {
            false
        };

        if learned && arp.spoofed {
            log::debug!("Cached a poisoned binding {} -> {}", arp.sender_ip, arp.sender_mac);
        }
        if learned {
            self.complete_pending(sim, arp.sender_ip, arp.sender_mac);
        }

        if arp.op == ArpOp::Request && !arp.is_gratuitous() {
            if let Some(mac) = answer_with {
                let reply = ArpBuilder::reply(mac, arp.target_ip, arp.sender_mac, arp.sender_ip)
                    .build()
                    .and_then(|reply| {
                        EthernetBuilder::new()
                            .src(mac)
                            .dst(arp.sender_mac)
                            .payload(reply)
                            .build()
                    });
                match reply {
                    Ok(reply) => {
                        log::trace!("{} is at {mac}", arp.target_ip);
                        sim.send_packet(iface, reply);
                        self.stats.replies_sent += 1;
                    }
                    Err(e) => log::warn!("Couldn't build an ARP reply: {e}"),
                }
            }
        }
    }
}

impl Default for Arp {
    fn default() -> Self {
        Self::new(ArpConfig::default())
    }
}

impl Service for Arp {
    fn name(&self) -> &'static str {
        "arp"
    }

    fn attach(&mut self, sim: &mut Simulation, host: HostId, this: Weak<RefCell<Self>>) {
        self.host = Some(host);
        self.this = this;
        self.timers.set_host(host);
        let interval = self.config.sweep_interval;
        self.timers.repeat(sim, &self.this, interval, |arp: &mut Self, sim| {
            arp.sweep(sim);
        });
    }

    fn detach(&mut self, _sim: &mut Simulation) {
        self.timers.cancel_all();
        let pending: Vec<_> = self.pending.keys().copied().collect();
        for ip in pending {
            self.fail_pending(ip);
        }
    }

    fn receive_packet(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        packet: &PacketRc,
    ) -> ServiceVerdict {
        match packet.arp() {
            Some(arp) => {
                self.handle_arp(sim, iface, arp);
                ServiceVerdict::Handled
            }
            None => ServiceVerdict::Continue,
        }
    }

    fn interface_changed(
        &mut self,
        _sim: &mut Simulation,
        iface: InterfaceId,
        snapshot: &InterfaceSnapshot,
    ) {
        if snapshot.state == OperState::Up {
            return;
        }
        let before = self.cache.len();
        self.cache.retain(|_, entry| entry.interface != iface);
        if before != self.cache.len() {
            log::debug!(
                "Flushed {} ARP entries learned on {}",
                before - self.cache.len(),
                snapshot.name
            );
        }
        let stranded: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, p)| p.iface == iface)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in stranded {
            self.stats.failures += 1;
            self.fail_pending(ip);
        }
    }

    fn report(&self, sim: &Simulation) -> Option<serde_yaml::Value> {
        let report = ArpReport {
            stats: self.stats,
            cache: self.cache_rows(sim),
        };
        serde_yaml::to_value(report).ok()
    }
}

/// Wrap `payload` in an Ethernet frame from `iface` to `dst` and send it.
pub(crate) fn send_frame(
    sim: &mut Simulation,
    iface: InterfaceId,
    dst: MacAddress,
    payload: PacketRc,
) -> bool {
    let Ok(src) = sim.iface(iface).map(|i| i.mac()) else {
        return false;
    };
    match EthernetBuilder::new().src(src).dst(dst).payload(payload).build() {
        Ok(frame) => sim.send_packet(iface, frame),
        Err(e) => {
            log::warn!("Couldn't build a frame: {e}");
            false
        }
    }
}

/// Resolve `ip` using the ARP service of `host`.
pub fn resolve(
    sim: &mut Simulation,
    host: HostId,
    ip: Ipv4Address,
) -> Result<Deferred<Option<MacAddress>>, SimError> {
    let arp = sim.require_service::<Arp>(host)?;
    let deferred = arp.borrow_mut().resolve(sim, ip);
    Ok(deferred)
}

/// Send an IPv4 packet using the ARP service of `host` for next-hop resolution. See
/// [`Arp::send_ipv4`].
pub fn send_ipv4(sim: &mut Simulation, host: HostId, packet: PacketRc) -> Result<bool, SimError> {
    let arp = sim.require_service::<Arp>(host)?;
    let sent = arp.borrow_mut().send_ipv4(sim, packet);
    Ok(sent)
}

/// Broadcast the address of `iface` so that every receiver caches it. Returns `false` if the
/// interface has no address or isn't active.
pub fn gratuitous_announce(sim: &mut Simulation, iface: InterfaceId) -> Result<bool, SimError> {
    let i = sim.iface(iface)?;
    let Some(ip) = i.ip() else {
        return Ok(false);
    };
    let mac = i.mac();
    announce(sim, iface, ip, mac)
}

/// Broadcast that `ip` is at `mac` out of `iface`.
pub fn announce(
    sim: &mut Simulation,
    iface: InterfaceId,
    ip: Ipv4Address,
    mac: MacAddress,
) -> Result<bool, SimError> {
    let announcement = ArpBuilder::gratuitous(mac, ip).build()?;
    let frame = EthernetBuilder::new()
        .src(mac)
        .dst(MacAddress::BROADCAST)
        .payload(announcement)
        .build()?;
    log::debug!("Announcing {ip} at {mac}");
    Ok(sim.send_packet(iface, frame))
}

/// Send `victim` a reply claiming that `spoofed_ip` is at the attacker's MAC.
pub fn poison(
    sim: &mut Simulation,
    attacker: InterfaceId,
    victim_ip: Ipv4Address,
    victim_mac: MacAddress,
    spoofed_ip: Ipv4Address,
) -> Result<bool, SimError> {
    let mac = sim.iface(attacker)?.mac();
    let reply = ArpBuilder::reply(mac, spoofed_ip, victim_mac, victim_ip)
        .spoofed(true)
        .build()?;
    let frame = EthernetBuilder::new()
        .src(mac)
        .dst(victim_mac)
        .payload(reply)
        .build()?;
    log::info!("Telling {victim_ip} that {spoofed_ip} is at {mac}");
    Ok(sim.send_packet(attacker, frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::host::HostRole;
    use crate::host::network::interface::InterfaceOptions;

    fn ip(s: &str) -> Ipv4Address {
        s.parse().unwrap()
    }

    /// Two hosts with ARP on a /24, connected directly.
    fn pair() -> (Simulation, HostId, HostId, InterfaceId, InterfaceId) {
        let mut sim = Simulation::default();
        let a = sim.add_host("a", HostRole::Computer).unwrap();
        let b = sim.add_host("b", HostRole::Computer).unwrap();
        let a0 = sim.add_interface(a, "eth0").unwrap();
        let b0 = sim.add_interface(b, "eth0").unwrap();
        let mask = ip("255.255.255.0");
        sim.set_interface_address(a0, ip("10.0.0.1"), mask).unwrap();
        sim.set_interface_address(b0, ip("10.0.0.2"), mask).unwrap();
        sim.connect(a0, b0, SimulationTime::from_millis(1)).unwrap();
        sim.enable_service(a, Arp::default()).unwrap();
        sim.enable_service(b, Arp::default()).unwrap();
        sim.advance(SimulationTime::from_secs(1));
        (sim, a, b, a0, b0)
    }

    #[test]
    fn test_miss_then_hit() {
        let (mut sim, a, b, _, b0) = pair();
        let arp = sim.service::<Arp>(a).unwrap();

        let first = resolve(&mut sim, a, ip("10.0.0.2")).unwrap();
        assert_eq!(first.value(), None);
        sim.advance(SimulationTime::from_millis(100));
        let b_mac = sim.iface(b0).unwrap().mac();
        assert_eq!(first.value(), Some(Some(b_mac)));

        let second = resolve(&mut sim, a, ip("10.0.0.2")).unwrap();
        assert_eq!(second.value(), Some(Some(b_mac)));

        let stats = arp.borrow().stats();
        assert_eq!((stats.hits, stats.misses, stats.requests_sent), (1, 1, 1));
        assert!(!arp.borrow().lookup(ip("10.0.0.2")).unwrap().poisoned);

        // b learned a from the request that targeted it
        let b_arp = sim.service::<Arp>(b).unwrap();
        assert!(b_arp.borrow().lookup(ip("10.0.0.1")).is_some());
        assert_eq!(b_arp.borrow().stats().replies_sent, 1);
    }

    #[test]
    fn test_unanswered_request_fails_after_retries() {
        let (mut sim, a, _, _, _) = pair();
        let result = resolve(&mut sim, a, ip("10.0.0.99")).unwrap();
        sim.advance(SimulationTime::from_millis(2_500));
        assert!(!result.is_resolved());
        sim.advance(SimulationTime::from_secs(1));
        assert_eq!(result.value(), Some(None));

        let stats = sim.service::<Arp>(a).unwrap().borrow().stats();
        assert_eq!(stats.requests_sent, 3);
        assert_eq!(stats.failures, 1);

        // not on an attached subnet, and no gateway
        let unroutable = resolve(&mut sim, a, ip("192.168.1.1")).unwrap();
        assert_eq!(unroutable.value(), Some(None));
    }

    #[test]
    fn test_poison_marks_entry() {
        let (mut sim, a, _, a0, b0) = pair();
        let mallory = sim.add_host("mallory", HostRole::Computer).unwrap();
        let m0 = sim
            .add_interface_with(mallory, InterfaceOptions::new("eth0"))
            .unwrap();
        let m_mac = sim.iface(m0).unwrap().mac();

        // put mallory on a's link instead of b
        let link = sim.iface(a0).unwrap().link().unwrap();
        sim.disconnect(link).unwrap();
        sim.connect(m0, a0, SimulationTime::from_millis(1)).unwrap();
        sim.advance(SimulationTime::from_secs(1));

        let a_mac = sim.iface(a0).unwrap().mac();
        assert!(poison(&mut sim, m0, ip("10.0.0.1"), a_mac, ip("10.0.0.2")).unwrap());
        sim.advance(SimulationTime::from_millis(10));

        let entry = sim.service::<Arp>(a).unwrap().borrow().lookup(ip("10.0.0.2")).unwrap();
        assert_eq!(entry.mac, m_mac);
        assert!(entry.poisoned);
        assert_ne!(entry.mac, sim.iface(b0).unwrap().mac());
    }

    #[test]
    fn test_gratuitous_and_aging() {
        let (mut sim, a, _, _, b0) = pair();
        assert!(gratuitous_announce(&mut sim, b0).unwrap());
        sim.advance(SimulationTime::from_millis(10));

        let arp = sim.service::<Arp>(a).unwrap();
        let entry = arp.borrow().lookup(ip("10.0.0.2")).unwrap();
        assert_eq!(entry.mac, sim.iface(b0).unwrap().mac());

        // the periodic sweep removes it once it's older than the timeout
        sim.advance(SimulationTime::from_secs(311));
        assert!(arp.borrow().lookup(ip("10.0.0.2")).is_none());
    }

    #[test]
    fn test_interface_down_flushes() {
        let (mut sim, a, _, a0, _) = pair();
        gratuitous_announce(&mut sim, a0).unwrap();
        resolve(&mut sim, a, ip("10.0.0.2")).unwrap();
        sim.advance(SimulationTime::from_millis(100));
        let arp = sim.service::<Arp>(a).unwrap();
        assert_eq!(arp.borrow().len(), 1);

        sim.set_interface_down(a0).unwrap();
        assert!(arp.borrow().is_empty());
    }
}
