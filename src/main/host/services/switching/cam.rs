use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::host::network::interface::InterfaceId;
use crate::network::address::MacAddress;
use crate::network::headers::VlanId;

/// A MAC address and, on a VLAN-aware switch, the VLAN it was seen in.
pub type CamKey = (MacAddress, Option<VlanId>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CamEntry {
    pub port: InterfaceId,
    /// When the address was last seen. Never moves backwards.
    pub learned_at: EmulatedTime,
}

/// What [`CamTable::learn`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Learned {
    New,
    Refreshed,
    /// The address was previously learned on another port.
    Moved { from: InterfaceId },
}

/// A CAM entry, for reports. `port` is the qualified interface name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CamRow {
    pub mac: MacAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanId>,
    pub port: String,
    pub learned_at: EmulatedTime,
}

#[derive(Debug, Clone, Default)]
pub struct CamTable {
    entries: BTreeMap<CamKey, CamEntry>,
}

impl CamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn learn(&mut self, key: CamKey, port: InterfaceId, now: EmulatedTime) -> Learned {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.port == port => {
                entry.learned_at = entry.learned_at.max(now);
                Learned::Refreshed
            }
            Some(entry) => {
                let from = entry.port;
                entry.port = port;
                entry.learned_at = entry.learned_at.max(now);
                Learned::Moved { from }
            }
            None => {
                self.entries.insert(
                    key,
                    CamEntry {
                        port,
                        learned_at: now,
                    },
                );
                Learned::New
            }
        }
    }

    pub fn lookup(&self, key: &CamKey) -> Option<CamEntry> {
        self.entries.get(key).copied()
    }

    /// Remove the entries not refreshed for longer than `aging_time`. Returns how many were
    /// removed.
    pub fn age(&mut self, now: EmulatedTime, aging_time: SimulationTime) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(&entry.learned_at) <= aging_time);
        before - self.entries.len()
    }

    /// Remove the entries learned on `port`. Returns how many were removed.
    pub fn flush_port(&mut self, port: InterfaceId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.port != port);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CamKey, &CamEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use slotmap::SlotMap;

    use super::*;

    fn ports() -> (InterfaceId, InterfaceId) {
        let mut map = SlotMap::<InterfaceId, ()>::with_key();
        (map.insert(()), map.insert(()))
    }

    fn at(secs: u64) -> EmulatedTime {
        EmulatedTime::SIMULATION_START + SimulationTime::from_secs(secs)
    }

    #[test]
    fn learn_refresh_and_move() {
        let (p1, p2) = ports();
        let mac = MacAddress::new([0x02, 0, 0, 0, 0, 1]);
        let mut cam = CamTable::new();

        assert_eq!(cam.learn((mac, None), p1, at(1)), Learned::New);
        assert_eq!(cam.learn((mac, None), p1, at(5)), Learned::Refreshed);
        assert_eq!(cam.lookup(&(mac, None)).unwrap().learned_at, at(5));

        // a stale refresh doesn't move the timestamp back
        cam.learn((mac, None), p1, at(3));
        assert_eq!(cam.lookup(&(mac, None)).unwrap().learned_at, at(5));

        assert_eq!(cam.learn((mac, None), p2, at(6)), Learned::Moved { from: p1 });
        assert_eq!(cam.lookup(&(mac, None)).unwrap().port, p2);
        assert_eq!(cam.len(), 1);
    }

    #[test]
    fn vlans_are_separate_keys() {
        let (p1, p2) = ports();
        let mac = MacAddress::new([0x02, 0, 0, 0, 0, 1]);
        let mut cam = CamTable::new();
        cam.learn((mac, Some(10)), p1, at(0));
        cam.learn((mac, Some(20)), p2, at(0));
        assert_eq!(cam.lookup(&(mac, Some(10))).unwrap().port, p1);
        assert_eq!(cam.lookup(&(mac, Some(20))).unwrap().port, p2);
        assert!(cam.lookup(&(mac, None)).is_none());
    }

    #[test]
    fn aging() {
        let (p1, p2) = ports();
        let old = MacAddress::new([0x02, 0, 0, 0, 0, 1]);
        let new = MacAddress::new([0x02, 0, 0, 0, 0, 2]);
        let mut cam = CamTable::new();
        cam.learn((old, None), p1, at(0));
        cam.learn((new, None), p2, at(200));

        assert_eq!(cam.age(at(300), SimulationTime::from_secs(300)), 0);
        assert_eq!(cam.age(at(301), SimulationTime::from_secs(300)), 1);
        assert!(cam.lookup(&(old, None)).is_none());
        assert!(cam.lookup(&(new, None)).is_some());
    }

    #[test]
    fn flush() {
        let (p1, p2) = ports();
        let mut cam = CamTable::new();
        cam.learn((MacAddress::new([0x02, 0, 0, 0, 0, 1]), None), p1, at(0));
        cam.learn((MacAddress::new([0x02, 0, 0, 0, 0, 2]), None), p1, at(0));
        cam.learn((MacAddress::new([0x02, 0, 0, 0, 0, 3]), None), p2, at(0));
        assert_eq!(cam.flush_port(p1), 2);
        assert_eq!(cam.len(), 1);
        cam.clear();
        assert!(cam.is_empty());
    }
}
