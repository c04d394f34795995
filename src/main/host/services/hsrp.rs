//! First-hop redundancy: routers sharing a virtual IP address elect one of themselves to answer
//! for it, in the manner of HSRP version 1.
//!
//! Each configured group runs its own election on one interface:
//!
//! ```text
//! Initial -> Learn (no virtual IP yet) -> Listen -> Speak -> Standby | Active
//! ```
//!
//! Routers in `Speak`, `Standby` and `Active` send a hello every hello interval. Silence from the
//! active (or standby) router for a hold interval vacates its role. Routers are ranked by
//! priority and then by interface address.

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
use crate::host::services::arp::{self, Arp};
use crate::network::address::{Ipv4Address, MacAddress};
use crate::network::builder::{EthernetBuilder, HsrpBuilder, Ipv4Builder, UdpBuilder};
use crate::network::headers::{HsrpMessage, HsrpOp, HsrpState, HSRP_MULTICAST, HSRP_PORT};
use crate::network::packet::PacketRc;

/// The configuration of one group on one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsrpGroupConfig {
    pub group: u8,
    /// Learned from the active router's hellos if unset.
    pub virtual_ip: Option<Ipv4Address>,
    pub priority: u8,
    pub preempt: bool,
    pub hello_time: SimulationTime,
    pub hold_time: SimulationTime,
    pub auth: String,
}

impl HsrpGroupConfig {
    pub fn new(group: u8) -> Self {
        Self {
            group,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), SimError> {
        if !self.hello_time.is_positive() || self.hold_time <= self.hello_time {
            return Err(SimError::InvalidConfiguration(format!(
                "group {}: the hold time ({}) must be longer than the hello time ({})",
                self.group, self.hold_time, self.hello_time
            )));
        }
        if self.auth.len() > HsrpBuilder::MAX_AUTH_LEN {
            return Err(SimError::InvalidConfiguration(format!(
                "group {}: authentication string is longer than {} bytes",
                self.group,
                HsrpBuilder::MAX_AUTH_LEN
            )));
        }
        Ok(())
    }
}

impl Default for HsrpGroupConfig {
    fn default() -> Self {
        Self {
            group: 0,
            virtual_ip: None,
            priority: 100,
            preempt: false,
            hello_time: SimulationTime::from_secs(3),
            hold_time: SimulationTime::from_secs(10),
            auth: "cisco".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HsrpStats {
    pub hellos_sent: u64,
    pub hellos_received: u64,
    pub coups_sent: u64,
    pub coups_received: u64,
    pub resigns_sent: u64,
    pub resigns_received: u64,
    pub auth_failures: u64,
    pub state_changes: u64,
}

/// The state of a group, for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HsrpGroupStatus {
    pub interface: String,
    pub group: u8,
    pub state: HsrpState,
    pub virtual_ip: Option<Ipv4Address>,
    pub priority: u8,
    pub preempt: bool,
    pub active_router: Option<Ipv4Address>,
    pub standby_router: Option<Ipv4Address>,
    /// When the last hello from the active router arrived.
    pub active_heard_at: Option<EmulatedTime>,
}

#[derive(Serialize)]
struct HsrpReport {
    stats: HsrpStats,
    groups: Vec<HsrpGroupStatus>,
}

type GroupKey = (InterfaceId, u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Peer {
    ip: Ipv4Address,
    priority: u8,
    heard_at: EmulatedTime,
}

impl Peer {
    fn rank(&self) -> (u8, Ipv4Address) {
        (self.priority, self.ip)
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupTimer {
    Hello,
    ActiveHold,
    StandbyHold,
    Speak,
}

struct Group {
    config: HsrpGroupConfig,
    state: HsrpState,
    virtual_ip: Option<Ipv4Address>,
    active: Option<Peer>,
    standby: Option<Peer>,
    hello: Option<Subscription>,
    active_hold: Option<Subscription>,
    standby_hold: Option<Subscription>,
    speak: Option<Subscription>,
}

impl Group {
    fn new(config: HsrpGroupConfig) -> Self {
        Self {
            virtual_ip: config.virtual_ip,
            config,
            state: HsrpState::Initial,
            active: None,
            standby: None,
            hello: None,
            active_hold: None,
            standby_hold: None,
            speak: None,
        }
    }

    fn timer(&mut self, timer: GroupTimer) -> &mut Option<Subscription> {
        match timer {
            GroupTimer::Hello => &mut self.hello,
            GroupTimer::ActiveHold => &mut self.active_hold,
            GroupTimer::StandbyHold => &mut self.standby_hold,
            GroupTimer::Speak => &mut self.speak,
        }
    }

    fn cancel(&mut self, timer: GroupTimer) {
        if let Some(sub) = self.timer(timer).take() {
            sub.unsubscribe();
        }
    }

    fn cancel_all(&mut self) {
        for timer in [
            GroupTimer::Hello,
            GroupTimer::ActiveHold,
            GroupTimer::StandbyHold,
            GroupTimer::Speak,
        ] {
            self.cancel(timer);
        }
    }

    fn sends_hellos(state: HsrpState) -> bool {
        matches!(state, HsrpState::Speak | HsrpState::Standby | HsrpState::Active)
    }
}

pub struct Hsrp {
    host: Option<HostId>,
    this: Weak<RefCell<Self>>,
    timers: ServiceTimers,
    groups: BTreeMap<GroupKey, Group>,
    stats: HsrpStats,
}

impl Hsrp {
    pub fn new() -> Self {
        Self {
            host: None,
            this: Weak::new(),
            timers: ServiceTimers::new(),
            groups: BTreeMap::new(),
            stats: HsrpStats::default(),
        }
    }

    pub fn stats(&self) -> HsrpStats {
        self.stats
    }

    pub fn state(&self, iface: InterfaceId, group: u8) -> Option<HsrpState> {
        self.groups.get(&(iface, group)).map(|g| g.state)
    }

    pub fn status(&self, sim: &Simulation) -> Vec<HsrpGroupStatus> {
        self.groups
            .iter()
            .map(|(&(iface, group), g)| {
                let local = sim.iface(iface).ok().and_then(|i| i.ip());
                let active_router = match g.state {
                    HsrpState::Active => local,
                    _ => g.active.map(|p| p.ip),
                };
                let standby_router = match g.state {
                    HsrpState::Standby => local,
                    _ => g.standby.map(|p| p.ip),
                };
                HsrpGroupStatus {
                    interface: sim.interface_label(iface),
                    group,
                    state: g.state,
                    virtual_ip: g.virtual_ip,
                    priority: g.config.priority,
                    preempt: g.config.preempt,
                    active_router,
                    standby_router,
                    active_heard_at: g.active.map(|p| p.heard_at),
                }
            })
            .collect()
    }

    /// Add a group to `iface`, or replace its configuration. A replaced group restarts its
    /// election.
    pub fn configure_group(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        config: HsrpGroupConfig,
    ) -> Result<(), SimError> {
        config.validate()?;
        sim.iface(iface)?;
        let key = (iface, config.group);
        if self.groups.contains_key(&key) {
            self.stop(sim, key);
        }
        self.groups.insert(key, Group::new(config));
        self.start(sim, key);
        Ok(())
    }

    pub fn remove_group(&mut self, sim: &mut Simulation, iface: InterfaceId, group: u8) -> bool {
        let key = (iface, group);
        if !self.groups.contains_key(&key) {
            return false;
        }
        self.resign(sim, key);
        self.stop(sim, key);
        self.groups.remove(&key);
        true
    }

    /// Change the priority of a group. Takes effect from the next hello.
    pub fn set_priority(&mut self, iface: InterfaceId, group: u8, priority: u8) -> bool {
        match self.groups.get_mut(&(iface, group)) {
            Some(g) => {
                g.config.priority = priority;
                true
            }
            None => false,
        }
    }

    pub fn set_preempt(&mut self, iface: InterfaceId, group: u8, preempt: bool) -> bool {
        match self.groups.get_mut(&(iface, group)) {
            Some(g) => {
                g.config.preempt = preempt;
                true
            }
            None => false,
        }
    }

    /// Begin the election of a group that's in `Initial`, if the service is attached and the
    /// interface is up and addressed.
    fn start(&mut self, sim: &mut Simulation, key: GroupKey) {
        if self.host.is_none() {
            return;
        }
        let ready = sim
            .iface(key.0)
            .is_ok_and(|i| i.state() == OperState::Up && i.ip().is_some());
        let Some(g) = self.groups.get(&key) else {
            return;
        };
        if !ready || g.state != HsrpState::Initial {
            return;
        }
        let next = if g.virtual_ip.is_some() {
            HsrpState::Listen
        } else {
            HsrpState::Learn
        };
        self.set_state(sim, key, next);
    }

    /// Return a group to `Initial`, forgetting its peers.
    fn stop(&mut self, sim: &mut Simulation, key: GroupKey) {
        let Some(g) = self.groups.get_mut(&key) else {
            return;
        };
        let was_active = g.state == HsrpState::Active;
        g.cancel_all();
        g.active = None;
        g.standby = None;
        g.virtual_ip = g.config.virtual_ip;
        if g.state != HsrpState::Initial {
            log::info!("HSRP group {} {} -> {}", key.1, g.state, HsrpState::Initial);
            g.state = HsrpState::Initial;
            self.stats.state_changes += 1;
        }
        if was_active {
            self.leave_active(sim, key);
        }
    }

    fn set_state(&mut self, sim: &mut Simulation, key: GroupKey, new: HsrpState) {
        let Some(g) = self.groups.get_mut(&key) else {
            return;
        };
        let old = g.state;
        if old == new {
            return;
        }
        log::info!("HSRP group {} {old} -> {new}", key.1);
        g.state = new;
        self.stats.state_changes += 1;

        if !Group::sends_hellos(new) {
            g.cancel(GroupTimer::Hello);
        }
        if new != HsrpState::Speak {
            g.cancel(GroupTimer::Speak);
        }
        match new {
            HsrpState::Active => {
                g.active = None;
                g.cancel(GroupTimer::ActiveHold);
            }
            HsrpState::Standby => {
                g.standby = None;
                g.cancel(GroupTimer::StandbyHold);
            }
            _ => {}
        }
        let (active_hold_running, standby_hold_running) =
            (g.active_hold.is_some(), g.standby_hold.is_some());

        if old == HsrpState::Active {
            self.leave_active(sim, key);
        }

        match new {
            HsrpState::Listen => {
                if !active_hold_running {
                    self.schedule(sim, key, GroupTimer::ActiveHold);
                }
                if !standby_hold_running {
                    self.schedule(sim, key, GroupTimer::StandbyHold);
                }
            }
            HsrpState::Speak => self.schedule(sim, key, GroupTimer::Speak),
            HsrpState::Standby if !active_hold_running => {
                self.schedule(sim, key, GroupTimer::ActiveHold);
            }
            HsrpState::Active => self.become_active(sim, key),
            _ => {}
        }

        if Group::sends_hellos(new) && !Group::sends_hellos(old) {
            self.schedule(sim, key, GroupTimer::Hello);
        }
        if Group::sends_hellos(new) {
            self.send(sim, key, HsrpOp::Hello);
        }
    }

    fn schedule(&mut self, sim: &mut Simulation, key: GroupKey, timer: GroupTimer) {
        let Some(g) = self.groups.get(&key) else {
            return;
        };
        let (hello, hold) = (g.config.hello_time, g.config.hold_time);
        let sub = match timer {
            GroupTimer::Hello => self.timers.repeat(sim, &self.this, hello, move |h: &mut Self, sim| {
                h.send(sim, key, HsrpOp::Hello)
            }),
            GroupTimer::ActiveHold => self.timers.once(sim, &self.this, hold, move |h: &mut Self, sim| {
                h.active_expired(sim, key)
            }),
            GroupTimer::StandbyHold => self.timers.once(sim, &self.this, hold, move |h: &mut Self, sim| {
                h.standby_expired(sim, key)
            }),
            GroupTimer::Speak => self.timers.once(sim, &self.this, hold, move |h: &mut Self, sim| {
                h.speak_expired(sim, key)
            }),
        };
        match self.groups.get_mut(&key) {
            Some(g) => {
                if let Some(old) = g.timer(timer).replace(sub) {
                    old.unsubscribe();
                }
            }
            None => sub.unsubscribe(),
        }
    }

    fn active_expired(&mut self, sim: &mut Simulation, key: GroupKey) {
        let Some(g) = self.groups.get_mut(&key) else {
            return;
        };
        g.active_hold = None;
        if let Some(active) = g.active.take() {
            log::info!("Active router {} of group {} timed out", active.ip, key.1);
        }
        self.active_vacant(sim, key);
    }

    fn standby_expired(&mut self, sim: &mut Simulation, key: GroupKey) {
        let Some(g) = self.groups.get_mut(&key) else {
            return;
        };
        g.standby_hold = None;
        if let Some(standby) = g.standby.take() {
            log::info!("Standby router {} of group {} timed out", standby.ip, key.1);
        }
        if g.state == HsrpState::Listen {
            self.set_state(sim, key, HsrpState::Speak);
        }
    }

    fn speak_expired(&mut self, sim: &mut Simulation, key: GroupKey) {
        let Some(g) = self.groups.get_mut(&key) else {
            return;
        };
        g.speak = None;
        let next = match (g.active, g.standby) {
            (None, _) => HsrpState::Active,
            (Some(_), None) => HsrpState::Standby,
            (Some(_), Some(_)) => HsrpState::Listen,
        };
        self.set_state(sim, key, next);
    }

    fn active_vacant(&mut self, sim: &mut Simulation, key: GroupKey) {
        let Some(g) = self.groups.get(&key) else {
            return;
        };
        match g.state {
            HsrpState::Standby => self.set_state(sim, key, HsrpState::Active),
            HsrpState::Listen => self.set_state(sim, key, HsrpState::Speak),
            // the speak timer decides
            _ => {}
        }
    }

    fn become_active(&mut self, sim: &mut Simulation, key: GroupKey) {
        let (iface, group) = key;
        let Some(vip) = self.groups.get(&key).and_then(|g| g.virtual_ip) else {
            return;
        };
        let vmac = MacAddress::hsrp_virtual(group);
        if let Err(e) = sim.add_secondary_mac(iface, vmac) {
            log::warn!("Couldn't install the virtual MAC: {e}");
            return;
        }
        if let Some(arp) = self.host.and_then(|h| sim.service::<Arp>(h)) {
            match arp.try_borrow_mut() {
                Ok(mut arp) => arp.add_proxy(vip, iface, vmac),
                Err(_) => log::warn!("ARP is busy; not answering for {vip}"),
            }
        }
        if let Err(e) = arp::announce(sim, iface, vip, vmac) {
            log::warn!("Couldn't announce {vip}: {e}");
        }
    }

    fn leave_active(&mut self, sim: &mut Simulation, key: GroupKey) {
        let (iface, group) = key;
        if let Err(e) = sim.remove_secondary_mac(iface, MacAddress::hsrp_virtual(group)) {
            log::debug!("Couldn't remove the virtual MAC of group {group}: {e}");
        }
        let vip = self.groups.get(&key).and_then(|g| g.virtual_ip);
        if let (Some(vip), Some(arp)) = (vip, self.host.and_then(|h| sim.service::<Arp>(h))) {
            if let Ok(mut arp) = arp.try_borrow_mut() {
                arp.remove_proxy(vip);
            }
        }
    }

    /// Send a resign if the group is active.
    fn resign(&mut self, sim: &mut Simulation, key: GroupKey) {
        if self.state(key.0, key.1) == Some(HsrpState::Active) {
            self.send(sim, key, HsrpOp::Resign);
        }
    }

    fn send(&mut self, sim: &mut Simulation, key: GroupKey, op: HsrpOp) {
        let (iface, group) = key;
        let Some(g) = self.groups.get(&key) else {
            return;
        };
        let Ok(i) = sim.iface(iface) else {
            return;
        };
        let Some(src_ip) = i.ip() else {
            return;
        };
        // the active router speaks from the virtual MAC
        let src_mac = if g.state == HsrpState::Active {
            MacAddress::hsrp_virtual(group)
        } else {
            i.mac()
        };

        let frame = HsrpBuilder::new(op, g.state)
            .group(group)
            .priority(g.config.priority)
            .preempt(g.config.preempt)
            .timers(g.config.hello_time, g.config.hold_time)
            .auth(g.config.auth.clone())
            .virtual_ip(g.virtual_ip)
            .build()
            .and_then(|hsrp| {
                UdpBuilder::new()
                    .src_port(HSRP_PORT)
                    .dst_port(HSRP_PORT)
                    .payload(hsrp)
                    .build()
            })
            .and_then(|udp| {
                Ipv4Builder::new()
                    .src(src_ip)
                    .dst(HSRP_MULTICAST)
                    .ttl(1)
                    .payload(udp)
                    .build()
            })
            .and_then(|ip| {
                EthernetBuilder::new()
                    .src(src_mac)
                    .dst(MacAddress::ipv4_multicast(HSRP_MULTICAST))
                    .payload(ip)
                    .build()
            });
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Couldn't build an HSRP message: {e}");
                return;
            }
        };
        sim.send_packet(iface, frame);
        match op {
            HsrpOp::Hello => self.stats.hellos_sent += 1,
            HsrpOp::Coup => self.stats.coups_sent += 1,
            HsrpOp::Resign => self.stats.resigns_sent += 1,
        }
    }

    fn handle_message(
        &mut self,
        sim: &mut Simulation,
        key: GroupKey,
        src_ip: Ipv4Address,
        msg: &HsrpMessage,
    ) {
        let Ok(Some(local_ip)) = sim.iface(key.0).map(|i| i.ip()) else {
            return;
        };
        let Some(g) = self.groups.get_mut(&key) else {
            return;
        };
        if msg.auth != g.config.auth {
            log::debug!("Dropping an HSRP message from {src_ip} with the wrong authentication");
            self.stats.auth_failures += 1;
            return;
        }
        if g.state == HsrpState::Initial {
            return;
        }

        let peer = Peer {
            ip: src_ip,
            priority: msg.priority,
            heard_at: sim.now(),
        };
        let local = (g.config.priority, local_ip);

        match msg.op {
            HsrpOp::Hello => {
                self.stats.hellos_received += 1;
                if g.state == HsrpState::Learn {
                    if let Some(vip) = msg.virtual_ip {
                        log::info!("Learned virtual IP {vip} for group {}", key.1);
                        g.virtual_ip = Some(vip);
                        self.set_state(sim, key, HsrpState::Listen);
                    }
                }
                self.handle_hello(sim, key, peer, local, msg);
            }
            HsrpOp::Coup => {
                self.stats.coups_received += 1;
                let state = g.state;
                let wins = msg.priority > local.0
                    || (msg.priority == local.0 && state != HsrpState::Active);
                if !wins {
                    return;
                }
                log::info!("{src_ip} took over group {}", key.1);
                g.active = Some(peer);
                if g.standby.is_some_and(|s| s.ip == src_ip) {
                    g.standby = None;
                }
                self.schedule(sim, key, GroupTimer::ActiveHold);
                if state == HsrpState::Active {
                    self.set_state(sim, key, HsrpState::Speak);
                }
            }
            HsrpOp::Resign => {
                self.stats.resigns_received += 1;
                if g.standby.is_some_and(|s| s.ip == src_ip) {
                    g.standby = None;
                    g.cancel(GroupTimer::StandbyHold);
                }
                if g.active.is_some_and(|a| a.ip == src_ip) {
                    log::info!("Active router {src_ip} of group {} resigned", key.1);
                    g.active = None;
                    g.cancel(GroupTimer::ActiveHold);
                    self.active_vacant(sim, key);
                }
            }
        }
    }

    fn handle_hello(
        &mut self,
        sim: &mut Simulation,
        key: GroupKey,
        peer: Peer,
        local: (u8, Ipv4Address),
        msg: &HsrpMessage,
    ) {
        let Some(g) = self.groups.get_mut(&key) else {
            return;
        };
        let state = g.state;
        if state == HsrpState::Learn {
            return;
        }
        if g.virtual_ip.is_none() {
            g.virtual_ip = msg.virtual_ip;
        }

        match msg.state {
            HsrpState::Active => {
                if state == HsrpState::Active && peer.rank() < local {
                    // let the other active router hear that it's outranked
                    self.send(sim, key, HsrpOp::Hello);
                    return;
                }
                g.active = Some(peer);
                if g.standby.is_some_and(|s| s.ip == peer.ip) {
                    g.standby = None;
                }
                let preempt = g.config.preempt;
                self.schedule(sim, key, GroupTimer::ActiveHold);
                match state {
                    HsrpState::Active => self.set_state(sim, key, HsrpState::Speak),
                    HsrpState::Listen | HsrpState::Speak | HsrpState::Standby
                        if preempt && local.0 > peer.priority =>
                    {
                        self.send(sim, key, HsrpOp::Coup);
                        self.set_state(sim, key, HsrpState::Active);
                    }
                    _ => {}
                }
            }
            HsrpState::Standby | HsrpState::Speak => {
                if msg.state == HsrpState::Standby {
                    g.standby = Some(peer);
                    self.schedule(sim, key, GroupTimer::StandbyHold);
                } else if g.standby.is_some_and(|s| s.ip == peer.ip) {
                    g.standby = None;
                }
                if let Some(g) = self.groups.get_mut(&key) {
                    if g.active.is_some_and(|a| a.ip == peer.ip) {
                        g.active = None;
                        g.cancel(GroupTimer::ActiveHold);
                    }
                }
                match state {
                    HsrpState::Speak | HsrpState::Standby if peer.rank() > local => {
                        self.set_state(sim, key, HsrpState::Listen);
                    }
                    HsrpState::Active if msg.preempt && peer.priority > local.0 => {
                        log::info!("Yielding group {} to {}", key.1, peer.ip);
                        self.send(sim, key, HsrpOp::Resign);
                        self.set_state(sim, key, HsrpState::Standby);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
}

impl Default for Hsrp {
    fn default() -> Self {
        Self::new()
    }
}

impl Service for Hsrp {
    fn name(&self) -> &'static str {
        "hsrp"
    }

    fn attach(&mut self, sim: &mut Simulation, host: HostId, this: Weak<RefCell<Self>>) {
        self.host = Some(host);
        self.this = this;
        self.timers.set_host(host);
        let keys: Vec<_> = self.groups.keys().copied().collect();
        for key in keys {
            self.start(sim, key);
        }
    }

    fn detach(&mut self, sim: &mut Simulation) {
        let keys: Vec<_> = self.groups.keys().copied().collect();
        for key in keys {
            self.resign(sim, key);
            self.stop(sim, key);
        }
        self.timers.cancel_all();
        self.host = None;
    }

    fn receive_packet(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        packet: &PacketRc,
    ) -> ServiceVerdict {
        let (Some(ip), Some(udp), Some(msg)) = (packet.ipv4(), packet.udp(), packet.hsrp()) else {
            return ServiceVerdict::Continue;
        };
        if udp.dst_port != HSRP_PORT {
            return ServiceVerdict::Continue;
        }
        let key = (iface, msg.group);
        if !self.groups.contains_key(&key) {
            return ServiceVerdict::Continue;
        }
        if sim.iface(iface).is_ok_and(|i| i.ip() == Some(ip.src)) {
            return ServiceVerdict::Handled;
        }
        self.handle_message(sim, key, ip.src, msg);
        ServiceVerdict::Handled
    }

    fn interface_changed(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        snapshot: &InterfaceSnapshot,
    ) {
        let keys: Vec<_> = self
            .groups
            .keys()
            .filter(|(i, _)| *i == iface)
            .copied()
            .collect();
        for key in keys {
            if snapshot.state == OperState::Up && snapshot.address.is_some() {
                self.start(sim, key);
            } else {
                self.stop(sim, key);
            }
        }
    }

    fn report(&self, sim: &Simulation) -> Option<serde_yaml::Value> {
        let report = HsrpReport {
            stats: self.stats,
            groups: self.status(sim),
        };
        serde_yaml::to_value(report).ok()
    }
}

/// Add or replace a group on `iface` using the HSRP service of its host.
pub fn configure_group(
    sim: &mut Simulation,
    iface: InterfaceId,
    config: HsrpGroupConfig,
) -> Result<(), SimError> {
    let host = sim.iface(iface)?.host();
    let hsrp = sim.require_service::<Hsrp>(host)?;
    hsrp.borrow_mut().configure_group(sim, iface, config)?;
    Ok(())
}

/// The state of every group on `host`.
pub fn status(sim: &Simulation, host: HostId) -> Result<Vec<HsrpGroupStatus>, SimError> {
    let hsrp = sim.require_service::<Hsrp>(host)?;
    let status = hsrp.borrow().status(sim);
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::host::HostRole;
    use crate::host::services::switching::Switching;

    fn ip(s: &str) -> Ipv4Address {
        s.parse().unwrap()
    }

    /// Two routers on a shared /24, connected through a switch.
    fn routers(
        priorities: [u8; 2],
        preempt: bool,
    ) -> (Simulation, [InterfaceId; 2], [std::rc::Rc<RefCell<Hsrp>>; 2]) {
        let mut sim = Simulation::default();
        let sw = sim.add_host("sw", HostRole::Switch).unwrap();
        sim.enable_service(sw, Switching::default()).unwrap();
        let mask = ip("255.255.255.0");
        let mut ifaces = Vec::new();
        let mut services = Vec::new();
        for (n, priority) in priorities.into_iter().enumerate() {
            let host = sim.add_host(format!("r{}", n + 1), HostRole::Router).unwrap();
            let iface = sim.add_interface(host, "gi0/0").unwrap();
            sim.set_interface_address(iface, ip(&format!("10.0.0.{}", n + 2)), mask)
                .unwrap();
            sim.enable_service(host, Arp::default()).unwrap();
            let hsrp = sim.enable_service(host, Hsrp::new()).unwrap();
            let config = HsrpGroupConfig {
                group: 1,
                virtual_ip: Some(ip("10.0.0.1")),
                priority,
                preempt,
                ..Default::default()
            };
            configure_group(&mut sim, iface, config).unwrap();

            let port = sim.add_interface(sw, format!("fa0/{n}")).unwrap();
            sim.connect(iface, port, SimulationTime::from_millis(1)).unwrap();
            ifaces.push(iface);
            services.push(hsrp);
        }
        (
            sim,
            ifaces.try_into().unwrap(),
            services.try_into().ok().unwrap(),
        )
    }

    #[test]
    fn higher_priority_becomes_active() {
        let (mut sim, ifaces, hsrp) = routers([100, 150], false);
        sim.advance(SimulationTime::from_secs(40));

        assert_eq!(hsrp[0].borrow().state(ifaces[0], 1), Some(HsrpState::Standby));
        assert_eq!(hsrp[1].borrow().state(ifaces[1], 1), Some(HsrpState::Active));

        let active = sim.interface(ifaces[1]).unwrap();
        assert!(active.secondary_macs.contains(&MacAddress::hsrp_virtual(1)));
        let status = hsrp[0].borrow().status(&sim);
        assert_eq!(status[0].active_router, Some(ip("10.0.0.3")));
        assert_eq!(status[0].standby_router, Some(ip("10.0.0.2")));
    }

    #[test]
    fn standby_takes_over_on_resign() {
        let (mut sim, ifaces, hsrp) = routers([100, 150], false);
        sim.advance(SimulationTime::from_secs(40));

        let r2 = sim.iface(ifaces[1]).unwrap().host();
        assert!(sim.disable_service::<Hsrp>(r2));
        sim.advance(SimulationTime::from_secs(1));
        assert_eq!(hsrp[0].borrow().state(ifaces[0], 1), Some(HsrpState::Active));
        assert_eq!(hsrp[1].borrow().stats().resigns_sent, 1);
    }

    #[test]
    fn standby_takes_over_after_holdtime() {
        let (mut sim, ifaces, hsrp) = routers([100, 150], false);
        sim.advance(SimulationTime::from_secs(40));

        sim.set_interface_down(ifaces[1]).unwrap();
        assert_eq!(hsrp[1].borrow().state(ifaces[1], 1), Some(HsrpState::Initial));
        sim.advance(SimulationTime::from_secs(10));
        assert_eq!(hsrp[0].borrow().state(ifaces[0], 1), Some(HsrpState::Active));
    }

    #[test]
    fn preempt_takes_over() {
        let (mut sim, ifaces, hsrp) = routers([100, 150], true);
        sim.set_interface_down(ifaces[1]).unwrap();
        sim.advance(SimulationTime::from_secs(40));
        assert_eq!(hsrp[0].borrow().state(ifaces[0], 1), Some(HsrpState::Active));

        sim.set_interface_up(ifaces[1]).unwrap();
        sim.advance(SimulationTime::from_secs(40));
        assert_eq!(hsrp[1].borrow().state(ifaces[1], 1), Some(HsrpState::Active));
        assert_eq!(hsrp[0].borrow().state(ifaces[0], 1), Some(HsrpState::Standby));
        assert_eq!(hsrp[1].borrow().stats().coups_sent, 1);
    }

    #[test]
    fn auth_mismatch_is_ignored() {
        let (mut sim, ifaces, hsrp) = routers([100, 150], false);
        hsrp[0]
            .borrow_mut()
            .configure_group(
                &mut sim,
                ifaces[0],
                HsrpGroupConfig {
                    group: 1,
                    virtual_ip: Some(ip("10.0.0.1")),
                    auth: "other".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        sim.advance(SimulationTime::from_secs(40));

        // neither hears the other, so both claim the address
        assert_eq!(hsrp[0].borrow().state(ifaces[0], 1), Some(HsrpState::Active));
        assert_eq!(hsrp[1].borrow().state(ifaces[1], 1), Some(HsrpState::Active));
        assert!(hsrp[0].borrow().stats().auth_failures > 0);
    }

    #[test]
    fn learns_virtual_ip() {
        let (mut sim, ifaces, hsrp) = routers([100, 150], false);
        hsrp[0]
            .borrow_mut()
            .configure_group(&mut sim, ifaces[0], HsrpGroupConfig::new(1))
            .unwrap();
        sim.advance(SimulationTime::from_secs(40));

        let status = hsrp[0].borrow().status(&sim);
        assert_eq!(status[0].virtual_ip, Some(ip("10.0.0.1")));
        assert_eq!(status[0].state, HsrpState::Standby);
    }

    #[test]
    fn invalid_timers_are_rejected() {
        let (mut sim, ifaces, hsrp) = routers([100, 150], false);
        let config = HsrpGroupConfig {
            group: 2,
            hello_time: SimulationTime::from_secs(10),
            hold_time: SimulationTime::from_secs(3),
            ..Default::default()
        };
        let err = hsrp[0]
            .borrow_mut()
            .configure_group(&mut sim, ifaces[0], config)
            .unwrap_err();
        assert!(matches!(err, SimError::InvalidConfiguration(_)));
    }
}
