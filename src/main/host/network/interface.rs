//! Interfaces (ports): administrative and operational state, speed/duplex negotiation, and
//! observers.

use std::collections::BTreeSet;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::core::simulation::{SimError, Simulation};
use crate::core::support::emulated_time::EmulatedTime;
use crate::host::host::HostId;
use crate::network::address::{Ipv4Address, MacAddress};
use crate::network::link::LinkId;
use crate::network::packet::PacketRc;
use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};

slotmap::new_key_type! {
    /// Identifies an interface for as long as it exists.
    pub struct InterfaceId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Speed {
    #[serde(rename = "10Mbps")]
    Ten,
    #[serde(rename = "100Mbps")]
    Hundred,
    #[serde(rename = "1Gbps")]
    Gigabit,
    #[serde(rename = "10Gbps")]
    TenGigabit,
}

impl Speed {
    pub fn mbps(&self) -> u64 {
        match self {
            Self::Ten => 10,
            Self::Hundred => 100,
            Self::Gigabit => 1_000,
            Self::TenGigabit => 10_000,
        }
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ten => write!(f, "10 Mbps"),
            Self::Hundred => write!(f, "100 Mbps"),
            Self::Gigabit => write!(f, "1 Gbps"),
            Self::TenGigabit => write!(f, "10 Gbps"),
        }
    }
}

bitflags! {
    /// The speeds an interface can run at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpeedSet: u8 {
        const TEN = 1 << 0;
        const HUNDRED = 1 << 1;
        const GIGABIT = 1 << 2;
        const TEN_GIGABIT = 1 << 3;
    }
}

impl SpeedSet {
    /// The fastest speed in the set.
    pub fn fastest(&self) -> Option<Speed> {
        [
            (Self::TEN_GIGABIT, Speed::TenGigabit),
            (Self::GIGABIT, Speed::Gigabit),
            (Self::HUNDRED, Speed::Hundred),
            (Self::TEN, Speed::Ten),
        ]
        .into_iter()
        .find(|(flag, _)| self.contains(*flag))
        .map(|(_, speed)| speed)
    }

    /// A set containing `speed` and every slower speed.
    pub fn up_to(speed: Speed) -> Self {
        match speed {
            Speed::Ten => Self::TEN,
            Speed::Hundred => Self::TEN | Self::HUNDRED,
            Speed::Gigabit => Self::TEN | Self::HUNDRED | Self::GIGABIT,
            Speed::TenGigabit => Self::all(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Duplex {
    Half,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperState {
    Down,
    Negotiating,
    Up,
}

impl fmt::Display for OperState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Down => write!(f, "down"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Up => write!(f, "up"),
        }
    }
}

/// A network address and netmask assigned to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InterfaceAddress {
    pub ip: Ipv4Address,
    pub mask: Ipv4Address,
}

impl InterfaceAddress {
    pub fn contains(&self, ip: Ipv4Address) -> bool {
        self.ip.in_same_network(self.mask, ip)
    }

    pub fn network(&self) -> Ipv4Address {
        self.ip.network(self.mask)
    }
}

impl fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mask.prefix_len() {
            Some(len) => write!(f, "{}/{len}", self.ip),
            None => write!(f, "{} mask {}", self.ip, self.mask),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    /// Packets discarded on arrival (interface not up, or not addressed to this interface).
    pub rx_dropped: u64,
    /// Packets that couldn't be sent because the interface or its link wasn't active.
    pub tx_dropped: u64,
}

/// How to create an interface.
#[derive(Debug, Clone)]
pub struct InterfaceOptions {
    pub name: String,
    /// A random locally-administered address is generated if unset.
    pub mac: Option<MacAddress>,
    pub speeds: SpeedSet,
    pub full_duplex: bool,
    pub admin_up: bool,
    pub address: Option<InterfaceAddress>,
}

impl InterfaceOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mac: None,
            speeds: SpeedSet::all(),
            full_duplex: true,
            admin_up: true,
            address: None,
        }
    }
}

/// A copy of an interface's observable state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceSnapshot {
    #[serde(skip)]
    pub id: InterfaceId,
    pub host: String,
    pub name: String,
    pub mac: MacAddress,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secondary_macs: Vec<MacAddress>,
    pub address: Option<InterfaceAddress>,
    pub admin_up: bool,
    pub state: OperState,
    pub speed: Option<Speed>,
    pub duplex: Option<Duplex>,
    pub linked: bool,
    pub stats: InterfaceStats,
}

#[derive(Debug, Clone)]
pub enum InterfaceEventKind {
    StateChanged { old: OperState, new: OperState },
    SpeedChanged,
    DuplexChanged,
    AddressChanged,
    PacketReceived(PacketRc),
}

/// Delivered to interface observers. `interface` reflects the state after the change.
#[derive(Debug, Clone)]
pub struct InterfaceEvent {
    pub time: EmulatedTime,
    pub interface: InterfaceSnapshot,
    pub kind: InterfaceEventKind,
}

pub struct Interface {
    pub(crate) id: InterfaceId,
    pub(crate) host: HostId,
    pub(crate) name: String,
    pub(crate) mac: MacAddress,
    pub(crate) secondary_macs: BTreeSet<MacAddress>,
    pub(crate) address: Option<InterfaceAddress>,
    pub(crate) admin_up: bool,
    pub(crate) state: OperState,
    pub(crate) speeds: SpeedSet,
    pub(crate) full_duplex: bool,
    pub(crate) speed: Option<Speed>,
    pub(crate) duplex: Option<Duplex>,
    pub(crate) link: Option<LinkId>,
    pub(crate) promiscuous: bool,
    pub(crate) stats: InterfaceStats,
    pub(crate) listeners: EventSource<InterfaceEvent>,
    pub(crate) negotiation: Option<crate::core::scheduler::Subscription>,
}

impl Interface {
    pub(crate) fn new(id: InterfaceId, host: HostId, mac: MacAddress, options: InterfaceOptions) -> Self {
        Self {
            id,
            host,
            name: options.name,
            mac,
            secondary_macs: BTreeSet::new(),
            address: options.address,
            admin_up: false,
            state: OperState::Down,
            speeds: options.speeds,
            full_duplex: options.full_duplex,
            speed: None,
            duplex: None,
            link: None,
            promiscuous: false,
            stats: InterfaceStats::default(),
            listeners: EventSource::new(),
            negotiation: None,
        }
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn host(&self) -> HostId {
        self.host
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> MacAddress {
        self.mac
    }

    pub fn address(&self) -> Option<InterfaceAddress> {
        self.address
    }

    pub fn ip(&self) -> Option<Ipv4Address> {
        self.address.map(|a| a.ip)
    }

    pub fn state(&self) -> OperState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == OperState::Up
    }

    pub fn admin_up(&self) -> bool {
        self.admin_up
    }

    pub fn link(&self) -> Option<LinkId> {
        self.link
    }

    pub fn speed(&self) -> Option<Speed> {
        self.speed
    }

    pub fn stats(&self) -> InterfaceStats {
        self.stats
    }

    /// Whether a frame addressed to `dst` should be accepted.
    pub fn accepts(&self, dst: MacAddress) -> bool {
        self.promiscuous
            || dst.is_multicast()
            || dst == self.mac
            || self.secondary_macs.contains(&dst)
    }

    pub fn has_mac(&self, mac: MacAddress) -> bool {
        mac == self.mac || self.secondary_macs.contains(&mac)
    }
}

/// The outcome of negotiating one interface against its link partner.
enum Negotiated {
    /// Both ends (or the lone end) agree on a speed and duplex.
    Up(Speed, Duplex),
    /// No agreement is possible yet.
    Pending,
}

impl Simulation {
    /// The current state of an interface.
    pub fn interface(&self, iface: InterfaceId) -> Option<InterfaceSnapshot> {
        let i = self.interfaces.get(iface)?;
        let host = self.hosts.get(i.host).map(|h| h.name().to_string()).unwrap_or_default();
        Some(InterfaceSnapshot {
            id: iface,
            host,
            name: i.name.clone(),
            mac: i.mac,
            secondary_macs: i.secondary_macs.iter().copied().collect(),
            address: i.address,
            admin_up: i.admin_up,
            state: i.state,
            speed: i.speed,
            duplex: i.duplex,
            linked: i.link.is_some(),
            stats: i.stats,
        })
    }

    /// Administratively enable an interface. It comes up once negotiation completes.
    pub fn set_interface_up(&mut self, iface: InterfaceId) -> Result<(), SimError> {
        let i = self.iface_mut(iface)?;
        if i.admin_up {
            return Ok(());
        }
        i.admin_up = true;
        log::debug!("Interface {} administratively up", i.name);
        self.start_negotiation(iface);
        Ok(())
    }

    /// Administratively disable an interface. Its link partner falls back to negotiating.
    pub fn set_interface_down(&mut self, iface: InterfaceId) -> Result<(), SimError> {
        let i = self.iface_mut(iface)?;
        if !i.admin_up {
            return Ok(());
        }
        i.admin_up = false;
        if let Some(sub) = i.negotiation.take() {
            sub.unsubscribe();
        }
        log::debug!("Interface {} administratively down", i.name);
        self.set_oper_state(iface, OperState::Down, None, None);

        if let Some(peer) = self.peer_of(iface) {
            if self.interfaces[peer].admin_up {
                self.set_oper_state(peer, OperState::Negotiating, None, None);
            }
        }
        Ok(())
    }

    /// Assign (or replace) an interface's network address.
    pub fn set_interface_address(
        &mut self,
        iface: InterfaceId,
        ip: Ipv4Address,
        mask: Ipv4Address,
    ) -> Result<(), SimError> {
        if !mask.is_valid_mask() {
            return Err(SimError::InvalidMask(mask));
        }
        let i = self.iface_mut(iface)?;
        let address = Some(InterfaceAddress { ip, mask });
        if i.address == address {
            return Ok(());
        }
        i.address = address;
        log::debug!("Interface {} address set to {ip}/{mask}", i.name);
        self.notify_interface(iface, InterfaceEventKind::AddressChanged);
        self.notify_services_of_change(iface);
        Ok(())
    }

    pub fn clear_interface_address(&mut self, iface: InterfaceId) -> Result<(), SimError> {
        let i = self.iface_mut(iface)?;
        if i.address.take().is_some() {
            log::debug!("Interface {} address cleared", i.name);
            self.notify_interface(iface, InterfaceEventKind::AddressChanged);
            self.notify_services_of_change(iface);
        }
        Ok(())
    }

    /// Make the interface also accept frames addressed to `mac`. Returns `false` if it already
    /// did.
    pub fn add_secondary_mac(&mut self, iface: InterfaceId, mac: MacAddress) -> Result<bool, SimError> {
        Ok(self.iface_mut(iface)?.secondary_macs.insert(mac))
    }

    pub fn remove_secondary_mac(
        &mut self,
        iface: InterfaceId,
        mac: MacAddress,
    ) -> Result<bool, SimError> {
        Ok(self.iface_mut(iface)?.secondary_macs.remove(&mac))
    }

    /// A promiscuous interface accepts every frame regardless of its destination.
    pub fn set_promiscuous(&mut self, iface: InterfaceId, promiscuous: bool) -> Result<(), SimError> {
        self.iface_mut(iface)?.promiscuous = promiscuous;
        Ok(())
    }

    /// Observe an interface's state changes and packet arrivals. Observers are called
    /// synchronously, in registration order, until the returned handle is dropped.
    pub fn add_interface_listener(
        &mut self,
        iface: InterfaceId,
        f: impl Fn(&InterfaceEvent) + 'static,
    ) -> Result<Handle<InterfaceEvent>, SimError> {
        let i = self.iface_mut(iface)?;
        Ok(i.listeners.add_listener(move |event, _| f(event)))
    }

    pub(crate) fn peer_of(&self, iface: InterfaceId) -> Option<InterfaceId> {
        let link = self.interfaces.get(iface)?.link?;
        self.links.get(link)?.peer_of(iface)
    }

    pub(crate) fn notify_interface(&mut self, iface: InterfaceId, kind: InterfaceEventKind) {
        let Some(snapshot) = self.interface(iface) else {
            return;
        };
        let event = InterfaceEvent {
            time: self.now(),
            interface: snapshot,
            kind,
        };
        let i = &self.interfaces[iface];
        CallbackQueue::queue_and_run(|queue| i.listeners.notify_listeners(event, queue));
    }

    /// Move to `Negotiating` (if not already there) and schedule negotiation.
    pub(crate) fn start_negotiation(&mut self, iface: InterfaceId) {
        let Some(i) = self.interfaces.get_mut(iface) else {
            return;
        };
        if !i.admin_up {
            return;
        }
        if let Some(sub) = i.negotiation.take() {
            sub.unsubscribe();
        }
        self.set_oper_state(iface, OperState::Negotiating, None, None);

        let delay = self.options().negotiation_delay;
        let sub = self.scheduler.once(delay, move |sim: &mut Simulation| sim.negotiate(iface));
        self.interfaces[iface].negotiation = Some(sub);
    }

    fn negotiate(&mut self, iface: InterfaceId) {
        let Some(i) = self.interfaces.get_mut(iface) else {
            return;
        };
        i.negotiation = None;
        if !i.admin_up {
            return;
        }
        let (speeds, full_duplex) = (i.speeds, i.full_duplex);

        let peer = self.peer_of(iface);
        let outcome = match peer.map(|p| &self.interfaces[p]) {
            None => match speeds.fastest() {
                Some(speed) => Negotiated::Up(speed, duplex_for(full_duplex)),
                None => Negotiated::Pending,
            },
            Some(p) if !p.admin_up => Negotiated::Pending,
            Some(p) => match (speeds & p.speeds).fastest() {
                Some(speed) => Negotiated::Up(speed, duplex_for(full_duplex && p.full_duplex)),
                None => {
                    log::info!(
                        "Interfaces {} and {} have no speed in common",
                        self.interfaces[iface].name,
                        p.name
                    );
                    Negotiated::Pending
                }
            },
        };

        match outcome {
            Negotiated::Up(speed, duplex) => {
                self.set_oper_state(iface, OperState::Up, Some(speed), Some(duplex));
                if let Some(peer) = peer {
                    if let Some(sub) = self.interfaces[peer].negotiation.take() {
                        sub.unsubscribe();
                    }
                    self.set_oper_state(peer, OperState::Up, Some(speed), Some(duplex));
                }
            }
            Negotiated::Pending => {
                self.set_oper_state(iface, OperState::Negotiating, None, None);
            }
        }
    }

    /// Apply a new operational state, speed and duplex, notifying observers and services of
    /// whatever changed.
    pub(crate) fn set_oper_state(
        &mut self,
        iface: InterfaceId,
        state: OperState,
        speed: Option<Speed>,
        duplex: Option<Duplex>,
    ) {
        let Some(i) = self.interfaces.get_mut(iface) else {
            return;
        };
        let old_state = std::mem::replace(&mut i.state, state);
        let speed_changed = std::mem::replace(&mut i.speed, speed) != speed;
        let duplex_changed = std::mem::replace(&mut i.duplex, duplex) != duplex;

        if old_state != state {
            log::info!("Interface {} {old_state} -> {state}", i.name);
            self.notify_interface(
                iface,
                InterfaceEventKind::StateChanged {
                    old: old_state,
                    new: state,
                },
            );
        }
        if speed_changed {
            self.notify_interface(iface, InterfaceEventKind::SpeedChanged);
        }
        if duplex_changed {
            self.notify_interface(iface, InterfaceEventKind::DuplexChanged);
        }
        if old_state != state {
            self.notify_services_of_change(iface);
        }
    }
}

fn duplex_for(full: bool) -> Duplex {
    if full {
        Duplex::Full
    } else {
        Duplex::Half
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fastest_speed() {
        assert_eq!(SpeedSet::all().fastest(), Some(Speed::TenGigabit));
        assert_eq!((SpeedSet::TEN | SpeedSet::HUNDRED).fastest(), Some(Speed::Hundred));
        assert_eq!(SpeedSet::empty().fastest(), None);
        assert_eq!(
            (SpeedSet::up_to(Speed::Gigabit) & SpeedSet::up_to(Speed::Hundred)).fastest(),
            Some(Speed::Hundred)
        );
        assert_eq!((SpeedSet::TEN & SpeedSet::GIGABIT).fastest(), None);
    }

    #[test]
    fn test_interface_address() {
        let addr = InterfaceAddress {
            ip: Ipv4Address::new(10, 1, 2, 3),
            mask: Ipv4Address::new(255, 255, 255, 0),
        };
        assert!(addr.contains(Ipv4Address::new(10, 1, 2, 200)));
        assert!(!addr.contains(Ipv4Address::new(10, 1, 3, 1)));
        assert_eq!(addr.network(), Ipv4Address::new(10, 1, 2, 0));
        assert_eq!(addr.to_string(), "10.1.2.3/24");
    }
}
