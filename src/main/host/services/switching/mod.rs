//! Ethernet switching: MAC learning, VLANs and aging.
//!
//! Every frame arriving on a switch port is classified into a VLAN by the port's mode, its
//! source address is learned against the port, and it's then either forwarded out of the one
//! port its destination was learned on or flooded out of every other port carrying the VLAN.
//! Frames leave trunk ports tagged (except in the native VLAN) and access ports untagged.
//!
//! A switch that isn't VLAN-aware ignores port modes and tags entirely and learns plain MAC
//! addresses.

mod cam;
mod vlan;

pub use cam::{CamEntry, CamKey, CamRow, CamTable, Learned};
pub use vlan::{PortMode, TrunkVlans, VlanDatabase};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Weak;

use serde::{Deserialize, Serialize};

use crate::core::simulation::{SimError, Simulation};
use crate::core::support::simulation_time::SimulationTime;
use crate::host::host::HostId;
use crate::host::network::interface::{InterfaceId, InterfaceSnapshot, OperState};
use crate::host::service::{Service, ServiceTimers, ServiceVerdict};
use crate::network::headers::VlanId;
use crate::network::link::LinkId;
use crate::network::packet::{PacketRc, PacketStatus};

#[derive(Debug, Clone, Copy)]
pub struct SwitchingConfig {
    /// How long a CAM entry lives after its address was last seen.
    pub aging_time: SimulationTime,
    /// How often aged entries are removed.
    pub sweep_interval: SimulationTime,
    pub vlan_aware: bool,
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            aging_time: SimulationTime::from_secs(300),
            sweep_interval: SimulationTime::from_secs(10),
            vlan_aware: true,
        }
    }
}

/// Per-frame outcomes. Every received frame is counted in exactly one of `forwarded`,
/// `flooded`, `dropped` and `filtered`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwitchingStats {
    pub received: u64,
    /// Sent out of the single port the destination was learned on.
    pub forwarded: u64,
    /// Sent out of every other port carrying the VLAN (possibly none).
    pub flooded: u64,
    /// Not accepted by the ingress port, or not permitted on the egress port.
    pub dropped: u64,
    /// The destination was learned on the ingress port.
    pub filtered: u64,
    pub aged_out: u64,
}

/// How the two switch ports of an inter-switch link carry VLANs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrunkMode {
    /// Only the given VLAN, untagged.
    Fixed(VlanId),
    /// Every VLAN, tagged.
    AllVlans,
}

impl TrunkMode {
    fn port_mode(self) -> PortMode {
        match self {
            Self::Fixed(vlan) => PortMode::Access(vlan),
            Self::AllVlans => PortMode::trunk_all(),
        }
    }
}

#[derive(Serialize)]
struct SwitchingReport {
    stats: SwitchingStats,
    vlans: VlanDatabase,
    ports: BTreeMap<String, String>,
    cam: Vec<CamRow>,
}

pub struct Switching {
    config: SwitchingConfig,
    host: Option<HostId>,
    this: Weak<RefCell<Self>>,
    timers: ServiceTimers,
    cam: CamTable,
    vlans: VlanDatabase,
    // ports without an entry are access ports in the default VLAN
    ports: BTreeMap<InterfaceId, PortMode>,
    stats: SwitchingStats,
}

impl Switching {
    pub fn new(config: SwitchingConfig) -> Self {
        Self {
            config,
            host: None,
            this: Weak::new(),
            timers: ServiceTimers::new(),
            cam: CamTable::new(),
            vlans: VlanDatabase::new(),
            ports: BTreeMap::new(),
            stats: SwitchingStats::default(),
        }
    }

    pub fn config(&self) -> &SwitchingConfig {
        &self.config
    }

    pub fn stats(&self) -> SwitchingStats {
        self.stats
    }

    pub fn cam(&self) -> &CamTable {
        &self.cam
    }

    pub fn cam_rows(&self, sim: &Simulation) -> Vec<CamRow> {
        self.cam
            .iter()
            .map(|((mac, vlan), entry)| CamRow {
                mac: *mac,
                vlan: *vlan,
                port: sim.interface_label(entry.port),
                learned_at: entry.learned_at,
            })
            .collect()
    }

    pub fn vlans(&self) -> &VlanDatabase {
        &self.vlans
    }

    pub fn add_vlan(&mut self, vlan: VlanId, name: Option<&str>) -> bool {
        self.vlans.add(vlan, name)
    }

    pub fn port_mode(&self, port: InterfaceId) -> PortMode {
        self.ports.get(&port).cloned().unwrap_or_default()
    }

    /// Change how a port carries VLANs. The VLANs the port carries are added to the database.
    /// Entries learned on the port are kept until they age out, but frames are only forwarded
    /// to it in the VLANs it now carries.
    pub fn set_port_mode(&mut self, port: InterfaceId, mode: PortMode) {
        match &mode {
            PortMode::Access(vlan) => {
                self.vlans.add(*vlan, None);
            }
            PortMode::Trunk { allowed, native } => {
                self.vlans.add(*native, None);
                if let TrunkVlans::Only(set) = allowed {
                    for vlan in set {
                        self.vlans.add(*vlan, None);
                    }
                }
            }
        }
        self.ports.insert(port, mode);
    }

    pub fn clear_cam(&mut self) {
        self.cam.clear();
    }

    /// Remove the entries that have aged out. Returns how many were removed.
    pub fn sweep(&mut self, sim: &Simulation) -> usize {
        let removed = self.cam.age(sim.now(), self.config.aging_time);
        if removed > 0 {
            log::debug!("Aged out {removed} CAM entries");
            self.stats.aged_out += removed as u64;
        }
        removed
    }

    fn ports_of(&self, sim: &Simulation) -> Vec<InterfaceId> {
        self.host
            .and_then(|h| sim.host(h))
            .map(|h| h.interfaces().to_vec())
            .unwrap_or_default()
    }

    /// The VLAN the frame belongs to and whether `port` may carry it. `vlan` is `None` on a
    /// switch that isn't VLAN-aware, where every port carries everything.
    fn permits(&self, port: InterfaceId, vlan: Option<VlanId>) -> bool {
        match vlan {
            Some(vlan) => self.port_mode(port).permits(vlan),
            None => true,
        }
    }

    fn egress(&self, sim: &mut Simulation, port: InterfaceId, vlan: Option<VlanId>, packet: &PacketRc) {
        let frame = match vlan {
            Some(vlan) => packet.with_vlan(self.port_mode(port).egress_tag(vlan)),
            None => packet.clone(),
        };
        sim.send_packet(port, frame);
    }

    fn switch_frame(&mut self, sim: &mut Simulation, ingress: InterfaceId, packet: &PacketRc) {
        let Some(eth) = packet.ethernet() else {
            return;
        };
        self.stats.received += 1;

        let vlan = if self.config.vlan_aware {
            match self.port_mode(ingress).ingress_vlan(eth.vlan) {
                Some(vlan) => Some(vlan),
                None => {
                    log::trace!("Port doesn't accept frames tagged {:?}", eth.vlan);
                    self.stats.dropped += 1;
                    packet.add_status(PacketStatus::SwitchDropped);
                    return;
                }
            }
        } else {
            None
        };

        if !eth.src.is_multicast() {
            if let Learned::Moved { from } = self.cam.learn((eth.src, vlan), ingress, sim.now()) {
                log::debug!(
                    "{} moved from {} to {}",
                    eth.src,
                    sim.interface_label(from),
                    sim.interface_label(ingress)
                );
            }
        }

        let known = if eth.dst.is_multicast() {
            None
        } else {
            self.cam.lookup(&(eth.dst, vlan))
        };

        match known {
            Some(entry) if entry.port == ingress => {
                self.stats.filtered += 1;
            }
            Some(entry) if self.permits(entry.port, vlan) => {
                self.stats.forwarded += 1;
                packet.add_status(PacketStatus::SwitchForwarded);
                self.egress(sim, entry.port, vlan, packet);
            }
            Some(_) => {
                log::trace!("VLAN {vlan:?} not permitted on the egress port");
                self.stats.dropped += 1;
                packet.add_status(PacketStatus::SwitchDropped);
            }
            None => {
                self.stats.flooded += 1;
                packet.add_status(PacketStatus::SwitchFlooded);
                for port in self.ports_of(sim) {
                    if port != ingress && self.permits(port, vlan) {
                        self.egress(sim, port, vlan, packet);
                    }
                }
            }
        }
    }
}

impl Default for Switching {
    fn default() -> Self {
        Self::new(SwitchingConfig::default())
    }
}

impl Service for Switching {
    fn name(&self) -> &'static str {
        "switching"
    }

    fn attach(&mut self, sim: &mut Simulation, host: HostId, this: Weak<RefCell<Self>>) {
        self.host = Some(host);
        self.this = this;
        self.timers.set_host(host);
        for port in self.ports_of(sim) {
            make_promiscuous(sim, port);
        }
        let interval = self.config.sweep_interval;
        self.timers.repeat(sim, &self.this, interval, |s: &mut Self, sim| {
            s.sweep(sim);
        });
    }

    fn detach(&mut self, _sim: &mut Simulation) {
        self.timers.cancel_all();
        self.cam.clear();
    }

    fn interface_added(&mut self, sim: &mut Simulation, iface: InterfaceId) {
        make_promiscuous(sim, iface);
    }

    fn receive_packet(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        packet: &PacketRc,
    ) -> ServiceVerdict {
        if packet.ethernet().is_none() {
            return ServiceVerdict::Continue;
        }
        self.switch_frame(sim, iface, packet);
        ServiceVerdict::Handled
    }

    fn interface_changed(
        &mut self,
        _sim: &mut Simulation,
        iface: InterfaceId,
        snapshot: &InterfaceSnapshot,
    ) {
        if snapshot.state != OperState::Up {
            let flushed = self.cam.flush_port(iface);
            if flushed > 0 {
                log::debug!("Flushed {flushed} CAM entries learned on {}", snapshot.name);
            }
        }
    }

    fn report(&self, sim: &Simulation) -> Option<serde_yaml::Value> {
        let ports = self
            .ports_of(sim)
            .into_iter()
            .map(|p| (sim.interface_label(p), self.port_mode(p).to_string()))
            .collect();
        let report = SwitchingReport {
            stats: self.stats,
            vlans: self.vlans.clone(),
            ports,
            cam: self.cam_rows(sim),
        };
        serde_yaml::to_value(report).ok()
    }
}

/// Set the mode of a switch port.
pub fn set_port_mode(sim: &mut Simulation, port: InterfaceId, mode: PortMode) -> Result<(), SimError> {
    let host = sim.iface(port)?.host();
    let switching = sim.require_service::<Switching>(host)?;
    log::debug!("{} is now {mode}", sim.interface_label(port));
    switching.borrow_mut().set_port_mode(port, mode);
    Ok(())
}

/// Change how an inter-switch link carries VLANs. Both switches forget everything they learned,
/// since what their ports carry has changed.
pub fn set_trunk_mode(sim: &mut Simulation, link: LinkId, mode: TrunkMode) -> Result<(), SimError> {
    let ends = sim.links.get(link).ok_or(SimError::UnknownLink)?.ends();
    let mut switches = Vec::with_capacity(2);
    for end in ends {
        let host = sim.iface(end)?.host();
        switches.push((end, sim.require_service::<Switching>(host)?));
    }
    for (end, switching) in switches {
        let mut switching = switching.borrow_mut();
        switching.set_port_mode(end, mode.port_mode());
        switching.clear_cam();
    }
    log::info!("Trunk mode of link set to {mode:?}");
    Ok(())
}

/// Switch ports accept every frame, whatever the role of the host.
fn make_promiscuous(sim: &mut Simulation, port: InterfaceId) {
    if let Err(e) = sim.set_promiscuous(port, true) {
        log::debug!("Could not make port {port:?} promiscuous: {e}");
    }
}
