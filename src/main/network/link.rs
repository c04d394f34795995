//! Point-to-point links and packet transport between interfaces.

use serde::Serialize;

use crate::core::simulation::{SimError, Simulation};
use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::host::network::interface::{InterfaceEventKind, InterfaceId};
use crate::network::packet::{PacketRc, PacketStatus};
use crate::utility::callback_queue::{CallbackQueue, EventSource, Handle};
use crate::utility::units::Bandwidth;

slotmap::new_key_type! {
    /// Identifies a link for as long as it exists.
    pub struct LinkId;
}

/// A copy of a packet as it's put on a link, for observers.
#[derive(Debug, Clone)]
pub struct LinkTrace {
    pub link: LinkId,
    pub from: InterfaceId,
    pub to: InterfaceId,
    pub packet: PacketRc,
    /// How long the packet takes to reach `to`.
    pub delay: SimulationTime,
    /// When the packet was sent.
    pub time: EmulatedTime,
}

#[derive(Debug, Clone, Copy)]
pub struct LinkOptions {
    pub delay: SimulationTime,
    /// Overrides the negotiated interface speed when computing transmission delay.
    pub bandwidth: Option<Bandwidth>,
}

impl LinkOptions {
    pub fn with_delay(delay: SimulationTime) -> Self {
        Self {
            delay,
            bandwidth: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkSnapshot {
    /// `host:interface` names of the two ends.
    pub ends: [String; 2],
    pub delay: SimulationTime,
    pub active: bool,
    pub packets: u64,
}

pub struct Link {
    pub(crate) ends: [InterfaceId; 2],
    pub(crate) options: LinkOptions,
    pub(crate) spies: EventSource<LinkTrace>,
    pub(crate) packets: u64,
}

impl Link {
    pub(crate) fn new(a: InterfaceId, b: InterfaceId, options: LinkOptions) -> Self {
        Self {
            ends: [a, b],
            options,
            spies: EventSource::new(),
            packets: 0,
        }
    }

    pub fn ends(&self) -> [InterfaceId; 2] {
        self.ends
    }

    /// The other end of the link, if `iface` is one of its ends.
    pub fn peer_of(&self, iface: InterfaceId) -> Option<InterfaceId> {
        match self.ends {
            [a, b] if a == iface => Some(b),
            [a, b] if b == iface => Some(a),
            _ => None,
        }
    }

    /// How long `len` bytes take to reach the far end at `speed_mbps`.
    pub fn delay_for(&self, len: usize, speed_mbps: u64) -> SimulationTime {
        let mbps = self
            .options
            .bandwidth
            .map(|bw| bw.as_mbps())
            .unwrap_or(speed_mbps);
        self.options
            .delay
            .saturating_add(transmission_delay(len, mbps))
    }
}

/// The time to serialize `len` bytes onto a `mbps` wire. A zero rate is treated as 1 Mbps.
pub fn transmission_delay(len: usize, mbps: u64) -> SimulationTime {
    // bits / (Mbit/s) = microseconds, so scale to nanoseconds first
    let bits = (len as u64).saturating_mul(8);
    SimulationTime::from_nanos(bits.saturating_mul(1_000) / mbps.max(1))
}

impl Simulation {
    /// Join two interfaces with a link. Both ends renegotiate.
    pub fn connect(
        &mut self,
        a: InterfaceId,
        b: InterfaceId,
        delay: SimulationTime,
    ) -> Result<LinkId, SimError> {
        self.connect_with(a, b, LinkOptions::with_delay(delay))
    }

    pub fn connect_with(
        &mut self,
        a: InterfaceId,
        b: InterfaceId,
        options: LinkOptions,
    ) -> Result<LinkId, SimError> {
        if a == b {
            return Err(SimError::SelfLink);
        }
        for end in [a, b] {
            let i = self.iface(end)?;
            if i.link.is_some() {
                return Err(SimError::InterfaceAlreadyLinked(self.interface_label(end)));
            }
        }

        let link = self.links.insert(Link::new(a, b, options));
        self.interfaces[a].link = Some(link);
        self.interfaces[b].link = Some(link);
        log::debug!(
            "Connected {} and {} with delay {}",
            self.interface_label(a),
            self.interface_label(b),
            options.delay
        );

        self.start_negotiation(a);
        self.start_negotiation(b);
        Ok(link)
    }

    /// Remove a link. Both ends renegotiate without a partner. Packets in flight are lost.
    pub fn disconnect(&mut self, link: LinkId) -> Result<(), SimError> {
        let removed = self.links.remove(link).ok_or(SimError::UnknownLink)?;
        for end in removed.ends {
            if let Some(i) = self.interfaces.get_mut(end) {
                i.link = None;
            }
        }
        log::debug!(
            "Disconnected {} and {}",
            self.interface_label(removed.ends[0]),
            self.interface_label(removed.ends[1])
        );
        for end in removed.ends {
            self.start_negotiation(end);
        }
        Ok(())
    }

    pub fn link(&self, link: LinkId) -> Option<LinkSnapshot> {
        let l = self.links.get(link)?;
        Some(LinkSnapshot {
            ends: l.ends.map(|i| self.interface_label(i)),
            delay: l.options.delay,
            active: self.link_is_active(link),
            packets: l.packets,
        })
    }

    /// A link is active when both of its ends are up.
    pub fn link_is_active(&self, link: LinkId) -> bool {
        self.links.get(link).is_some_and(|l| {
            l.ends
                .iter()
                .all(|i| self.interfaces.get(*i).is_some_and(|i| i.is_up()))
        })
    }

    /// Observe every packet put on a link, until the returned handle is dropped.
    pub fn add_link_spy(
        &mut self,
        link: LinkId,
        f: impl Fn(&LinkTrace) + 'static,
    ) -> Result<Handle<LinkTrace>, SimError> {
        let l = self.links.get_mut(link).ok_or(SimError::UnknownLink)?;
        Ok(l.spies.add_listener(move |trace, _| f(trace)))
    }

    /// Send a frame out of `iface`. Returns `false`, without sending anything, if the interface
    /// or its link isn't active.
    pub fn send_packet(&mut self, iface: InterfaceId, packet: PacketRc) -> bool {
        let Some(i) = self.interfaces.get(iface) else {
            log::trace!("Not sending {packet}: no such interface");
            return false;
        };
        let (Some(link_id), Some(speed)) = (i.link, i.speed) else {
            log::trace!("Not sending {packet} from {}: interface isn't linked and up", i.name);
            self.interfaces[iface].stats.tx_dropped += 1;
            self.drops.add_one("tx-interface-inactive");
            packet.add_status(PacketStatus::InterfaceDropped);
            return false;
        };
        if !self.link_is_active(link_id) {
            log::trace!("Not sending {packet} from {}: link isn't active", i.name);
            self.interfaces[iface].stats.tx_dropped += 1;
            self.drops.add_one("tx-link-inactive");
            packet.add_status(PacketStatus::InterfaceDropped);
            return false;
        }

        let link = &mut self.links[link_id];
        let Some(to) = link.peer_of(iface) else {
            return false;
        };
        let delay = link.delay_for(packet.len(), speed.mbps());
        link.packets += 1;

        let trace = LinkTrace {
            link: link_id,
            from: iface,
            to,
            packet: packet.clone(),
            delay,
            time: self.scheduler.current_time(),
        };
        let link = &self.links[link_id];
        CallbackQueue::queue_and_run(|queue| link.spies.notify_listeners(trace, queue));

        let stats = &mut self.interfaces[iface].stats;
        stats.tx_packets += 1;
        stats.tx_bytes += packet.len() as u64;
        packet.add_status(PacketStatus::InterfaceSent);
        packet.add_status(PacketStatus::LinkTransmitted);

        self.scheduler
            .once(delay, move |sim: &mut Simulation| sim.deliver(link_id, to, packet));
        true
    }

    fn deliver(&mut self, link: LinkId, to: InterfaceId, packet: PacketRc) {
        if !self.links.contains_key(link) {
            log::trace!("Dropping {packet}: its link was removed in flight");
            self.drops.add_one("link-removed");
            return;
        }
        let Some(i) = self.interfaces.get_mut(to) else {
            return;
        };
        if !i.is_up() {
            log::trace!("Dropping {packet}: {} isn't up", i.name);
            i.stats.rx_dropped += 1;
            self.drops.add_one("rx-interface-down");
            packet.add_status(PacketStatus::RcvInterfaceDropped);
            return;
        }
        let accepted = packet.ethernet().is_some_and(|eth| i.accepts(eth.dst));
        if !accepted {
            log::trace!("Dropping {packet}: not addressed to {}", i.name);
            i.stats.rx_dropped += 1;
            self.drops.add_one("rx-not-addressed");
            packet.add_status(PacketStatus::RcvInterfaceDropped);
            return;
        }

        i.stats.rx_packets += 1;
        i.stats.rx_bytes += packet.len() as u64;
        packet.add_status(PacketStatus::RcvInterfaceReceived);

        self.notify_interface(to, InterfaceEventKind::PacketReceived(packet.clone()));
        self.dispatch_packet(to, &packet);
    }

    /// `host:interface`, for log messages and snapshots.
    pub(crate) fn interface_label(&self, iface: InterfaceId) -> String {
        let Some(i) = self.interfaces.get(iface) else {
            return "<removed>".to_string();
        };
        match self.hosts.get(i.host) {
            Some(h) => format!("{}:{}", h.name(), i.name),
            None => i.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::host::host::HostRole;
    use crate::host::network::interface::{InterfaceEvent, OperState};
    use crate::network::address::MacAddress;
    use crate::network::builder::{DataBuilder, EthernetBuilder};

    fn pair() -> (Simulation, InterfaceId, InterfaceId) {
        let mut sim = Simulation::default();
        let a = sim.add_host("a", HostRole::Computer).unwrap();
        let b = sim.add_host("b", HostRole::Computer).unwrap();
        let ea = sim.add_interface(a, "eth0").unwrap();
        let eb = sim.add_interface(b, "eth0").unwrap();
        (sim, ea, eb)
    }

    fn broadcast_from(sim: &Simulation, iface: InterfaceId) -> PacketRc {
        EthernetBuilder::new()
            .src(sim.iface(iface).unwrap().mac())
            .dst(MacAddress::BROADCAST)
            .payload(DataBuilder::new().label("hello").len(64).build().unwrap())
            .build()
            .unwrap()
    }

    fn describe(event: &InterfaceEvent) -> String {
        match &event.kind {
            InterfaceEventKind::StateChanged { old, new } => format!("{old} -> {new}"),
            InterfaceEventKind::SpeedChanged => "speed".to_string(),
            InterfaceEventKind::DuplexChanged => "duplex".to_string(),
            InterfaceEventKind::AddressChanged => "address".to_string(),
            InterfaceEventKind::PacketReceived(p) => format!("rx {}", p.len()),
        }
    }

    #[test]
    fn test_interface_listeners() {
        let (mut sim, ea, eb) = pair();
        let events = Rc::new(RefCell::new(Vec::new()));
        let handle = {
            let events = Rc::clone(&events);
            sim.add_interface_listener(ea, move |e| events.borrow_mut().push(describe(e)))
                .unwrap()
        };
        sim.connect(ea, eb, SimulationTime::MILLISECOND).unwrap();
        sim.advance(SimulationTime::SECOND);
        assert_eq!(*events.borrow(), ["negotiating -> up", "speed", "duplex"]);

        let frame = broadcast_from(&sim, eb);
        assert!(sim.send_packet(eb, frame));
        sim.advance(SimulationTime::SECOND);
        assert_eq!(events.borrow().last().unwrap(), "rx 78");

        // the partner going down sends this end back to negotiating
        events.borrow_mut().clear();
        sim.set_interface_down(eb).unwrap();
        assert_eq!(*events.borrow(), ["up -> negotiating", "speed", "duplex"]);
        assert_eq!(sim.interface(ea).unwrap().state, OperState::Negotiating);

        drop(handle);
        sim.set_interface_up(eb).unwrap();
        sim.advance(SimulationTime::SECOND);
        assert_eq!(sim.interface(ea).unwrap().state, OperState::Up);
        assert_eq!(events.borrow().len(), 3);
    }

    #[test]
    fn test_link_spy() {
        let (mut sim, ea, eb) = pair();
        let link = sim.connect(ea, eb, SimulationTime::MILLISECOND).unwrap();
        sim.advance(SimulationTime::SECOND);

        let traces = Rc::new(RefCell::new(Vec::new()));
        let spy = {
            let traces = Rc::clone(&traces);
            sim.add_link_spy(link, move |t| traces.borrow_mut().push(t.clone()))
                .unwrap()
        };
        let frame = broadcast_from(&sim, ea);
        assert!(sim.send_packet(ea, frame.clone()));

        {
            let traces = traces.borrow();
            assert_eq!(traces.len(), 1);
            assert_eq!((traces[0].from, traces[0].to), (ea, eb));
            assert_eq!(traces[0].packet, frame);
            // propagation plus 78 bytes at 10 Gbps
            assert_eq!(
                traces[0].delay,
                SimulationTime::MILLISECOND + transmission_delay(78, 10_000)
            );
        }

        spy.stop_listening();
        assert!(sim.send_packet(ea, broadcast_from(&sim, ea)));
        assert_eq!(traces.borrow().len(), 1);
        assert_eq!(sim.link(link).unwrap().packets, 2);
    }

    #[test]
    fn test_send_on_inactive_interface_is_dropped() {
        let (mut sim, ea, eb) = pair();
        sim.advance(SimulationTime::SECOND);

        // up, but not linked
        assert!(!sim.send_packet(ea, broadcast_from(&sim, ea)));
        assert_eq!(sim.interface(ea).unwrap().stats.tx_dropped, 1);

        let link = sim.connect(ea, eb, SimulationTime::MILLISECOND).unwrap();
        sim.advance(SimulationTime::SECOND);
        assert!(sim.link_is_active(link));

        sim.set_interface_down(ea).unwrap();
        assert!(!sim.link_is_active(link));
        assert!(!sim.send_packet(ea, broadcast_from(&sim, ea)));
        assert!(!sim.send_packet(eb, broadcast_from(&sim, eb)));
        assert_eq!(sim.interface(ea).unwrap().stats.tx_dropped, 2);
        assert_eq!(sim.interface(eb).unwrap().stats.tx_dropped, 1);
        assert_eq!(sim.link(link).unwrap().packets, 0);
    }

    #[test]
    fn test_transmission_delay() {
        // 1500 bytes at 100 Mbps is 120 μs
        assert_eq!(transmission_delay(1500, 100), SimulationTime::from_micros(120));
        assert_eq!(transmission_delay(125, 1), SimulationTime::from_millis(1));
        assert_eq!(transmission_delay(0, 10), SimulationTime::ZERO);
        assert_eq!(transmission_delay(125, 0), SimulationTime::from_millis(1));
    }
}
