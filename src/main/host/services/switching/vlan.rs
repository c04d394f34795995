//! Port VLAN membership.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::network::headers::{VlanId, DEFAULT_VLAN};

/// The VLANs a trunk port carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrunkVlans {
    All,
    Only(BTreeSet<VlanId>),
}

impl TrunkVlans {
    pub fn contains(&self, vlan: VlanId) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(&vlan),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortMode {
    /// Carries exactly one VLAN, untagged.
    Access(VlanId),
    /// Carries the allowed VLANs tagged, except `native` which is carried untagged.
    Trunk { allowed: TrunkVlans, native: VlanId },
}

impl PortMode {
    pub fn trunk_all() -> Self {
        Self::Trunk {
            allowed: TrunkVlans::All,
            native: DEFAULT_VLAN,
        }
    }

    /// The VLAN a frame arriving with `tag` belongs to, or `None` if the port doesn't accept it.
    pub fn ingress_vlan(&self, tag: Option<VlanId>) -> Option<VlanId> {
        match (self, tag) {
            (Self::Access(vlan), None) => Some(*vlan),
            // only trunks carry tagged frames
            (Self::Access(_), Some(_)) => None,
            (Self::Trunk { native, .. }, None) => Some(*native),
            (Self::Trunk { allowed, native }, Some(tag)) => {
                (tag == *native || allowed.contains(tag)).then_some(tag)
            }
        }
    }

    pub fn permits(&self, vlan: VlanId) -> bool {
        match self {
            Self::Access(v) => *v == vlan,
            Self::Trunk { allowed, native } => vlan == *native || allowed.contains(vlan),
        }
    }

    /// The tag a frame of `vlan` leaves the port with. `None` means untagged; the caller must
    /// check [`permits`](Self::permits) first.
    pub fn egress_tag(&self, vlan: VlanId) -> Option<VlanId> {
        match self {
            Self::Access(_) => None,
            Self::Trunk { native, .. } if *native == vlan => None,
            Self::Trunk { .. } => Some(vlan),
        }
    }
}

impl Default for PortMode {
    fn default() -> Self {
        Self::Access(DEFAULT_VLAN)
    }
}

impl fmt::Display for PortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access(vlan) => write!(f, "access vlan {vlan}"),
            Self::Trunk {
                allowed: TrunkVlans::All,
                native,
            } => write!(f, "trunk (all, native {native})"),
            Self::Trunk {
                allowed: TrunkVlans::Only(set),
                native,
            } => {
                let list: Vec<String> = set.iter().map(|v| v.to_string()).collect();
                write!(f, "trunk ({}, native {native})", list.join(","))
            }
        }
    }
}

/// The VLANs a switch knows about, by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VlanDatabase {
    names: BTreeMap<VlanId, String>,
}

impl VlanDatabase {
    pub fn new() -> Self {
        let mut names = BTreeMap::new();
        names.insert(DEFAULT_VLAN, "default".to_string());
        Self { names }
    }

    /// Returns `false` if the VLAN already existed, in which case its name is kept.
    pub fn add(&mut self, vlan: VlanId, name: Option<&str>) -> bool {
        if self.names.contains_key(&vlan) {
            return false;
        }
        let name = name.map_or_else(|| format!("VLAN{vlan:04}"), str::to_string);
        self.names.insert(vlan, name);
        true
    }

    /// The default VLAN can't be removed.
    pub fn remove(&mut self, vlan: VlanId) -> bool {
        vlan != DEFAULT_VLAN && self.names.remove(&vlan).is_some()
    }

    pub fn contains(&self, vlan: VlanId) -> bool {
        self.names.contains_key(&vlan)
    }

    pub fn name(&self, vlan: VlanId) -> Option<&str> {
        self.names.get(&vlan).map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = VlanId> + '_ {
        self.names.keys().copied()
    }
}

impl Default for VlanDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_port() {
        let port = PortMode::Access(10);
        assert_eq!(port.ingress_vlan(None), Some(10));
        assert_eq!(port.ingress_vlan(Some(10)), None);
        assert!(port.permits(10));
        assert!(!port.permits(20));
        assert_eq!(port.egress_tag(10), None);
    }

    #[test]
    fn trunk_port() {
        let port = PortMode::Trunk {
            allowed: TrunkVlans::Only([10, 20].into_iter().collect()),
            native: 1,
        };
        assert_eq!(port.ingress_vlan(None), Some(1));
        assert_eq!(port.ingress_vlan(Some(20)), Some(20));
        assert_eq!(port.ingress_vlan(Some(30)), None);
        assert!(port.permits(1));
        assert!(!port.permits(30));
        assert_eq!(port.egress_tag(1), None);
        assert_eq!(port.egress_tag(10), Some(10));
        assert_eq!(port.to_string(), "trunk (10,20, native 1)");
    }

    #[test]
    fn database() {
        let mut db = VlanDatabase::new();
        assert!(db.contains(DEFAULT_VLAN));
        assert!(db.add(10, None));
        assert!(!db.add(10, Some("other")));
        assert_eq!(db.name(10), Some("VLAN0010"));
        assert!(!db.remove(DEFAULT_VLAN));
        assert!(db.remove(10));
        assert_eq!(db.ids().collect::<Vec<_>>(), vec![DEFAULT_VLAN]);
    }
}
