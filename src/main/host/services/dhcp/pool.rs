use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::core::scheduler::Subscription;
use crate::core::support::emulated_time::EmulatedTime;
use crate::network::address::{Ipv4Address, MacAddress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    InvalidMask(Ipv4Address),
    /// The range doesn't lie within the gateway's subnet.
    RangeOutsideSubnet {
        start: Ipv4Address,
        end: Ipv4Address,
        gateway: Ipv4Address,
        mask: Ipv4Address,
    },
    StartAfterEnd {
        start: Ipv4Address,
        end: Ipv4Address,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMask(mask) => write!(f, "{mask} is not a valid pool netmask"),
            Self::RangeOutsideSubnet {
                start,
                end,
                gateway,
                mask,
            } => write!(
                f,
                "Pool range {start}-{end} is outside the subnet of gateway {gateway} mask {mask}"
            ),
            Self::StartAfterEnd { start, end } => {
                write!(f, "Pool range start {start} is after its end {end}")
            }
        }
    }
}

impl std::error::Error for PoolError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReservationState {
    /// Offered to a client and held briefly while it decides.
    Offered,
    /// Committed to a client.
    Leased,
}

#[derive(Debug)]
pub(crate) struct Reservation {
    pub client: MacAddress,
    pub state: ReservationState,
    pub expires_at: EmulatedTime,
    // identifies this reservation, so that the expiry of a replaced one is ignored
    pub token: u64,
    pub hold: Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseRow {
    pub address: Ipv4Address,
    pub client: MacAddress,
    pub state: ReservationState,
    pub expires_at: EmulatedTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DhcpPoolSnapshot {
    pub gateway: Ipv4Address,
    pub mask: Ipv4Address,
    pub start: Ipv4Address,
    pub end: Ipv4Address,
    pub leases: Vec<LeaseRow>,
}

/// A range of addresses in the subnet of a gateway, with at most one reservation per address.
#[derive(Debug)]
pub struct DhcpPool {
    gateway: Ipv4Address,
    mask: Ipv4Address,
    start: Ipv4Address,
    end: Ipv4Address,
    excluded: BTreeSet<Ipv4Address>,
    reservations: BTreeMap<Ipv4Address, Reservation>,
    next_token: u64,
}

impl DhcpPool {
    pub fn new(
        gateway: Ipv4Address,
        mask: Ipv4Address,
        start: Ipv4Address,
        end: Ipv4Address,
    ) -> Result<Self, PoolError> {
        if !mask.is_valid_mask() {
            return Err(PoolError::InvalidMask(mask));
        }
        if start > end {
            return Err(PoolError::StartAfterEnd { start, end });
        }
        if !gateway.in_same_network(mask, start) || !gateway.in_same_network(mask, end) {
            return Err(PoolError::RangeOutsideSubnet {
                start,
                end,
                gateway,
                mask,
            });
        }
        Ok(Self {
            gateway,
            mask,
            start,
            end,
            excluded: BTreeSet::new(),
            reservations: BTreeMap::new(),
            next_token: 0,
        })
    }

    pub fn gateway(&self) -> Ipv4Address {
        self.gateway
    }

    pub fn mask(&self) -> Ipv4Address {
        self.mask
    }

    /// Whether this pool serves clients on the subnet that `ip` belongs to.
    pub fn serves(&self, ip: Ipv4Address) -> bool {
        self.gateway.in_same_network(self.mask, ip)
    }

    pub fn in_range(&self, ip: Ipv4Address) -> bool {
        (self.start..=self.end).contains(&ip)
    }

    /// Never hand out `ip`.
    pub fn exclude(&mut self, ip: Ipv4Address) {
        self.excluded.insert(ip);
    }

    fn assignable(&self, ip: Ipv4Address) -> bool {
        self.in_range(ip)
            && ip != self.gateway
            && ip != self.gateway.network(self.mask)
            && ip != self.gateway.broadcast(self.mask)
            && !self.excluded.contains(&ip)
    }

    /// Whether `ip` could be reserved for `client`: it's assignable and either free or already
    /// reserved for that client.
    pub fn available_for(&self, ip: Ipv4Address, client: MacAddress) -> bool {
        self.assignable(ip)
            && self
                .reservations
                .get(&ip)
                .map_or(true, |r| r.client == client)
    }

    /// The address reserved for `client`, if any.
    pub fn reserved_for(&self, client: MacAddress) -> Option<Ipv4Address> {
        self.reservations
            .iter()
            .find(|(_, r)| r.client == client)
            .map(|(ip, _)| *ip)
    }

    /// Pick an address to offer `client`: its existing reservation, the address it asked for,
    /// or the lowest free address, in that order.
    pub fn choose(&self, client: MacAddress, requested: Option<Ipv4Address>) -> Option<Ipv4Address> {
        if let Some(ip) = self.reserved_for(client) {
            return Some(ip);
        }
        if let Some(ip) = requested.filter(|ip| self.available_for(*ip, client)) {
            return Some(ip);
        }
        let (start, end) = (self.start.to_u32(), self.end.to_u32());
        (start..=end)
            .map(Ipv4Address::from_u32)
            .find(|ip| self.assignable(*ip) && !self.reservations.contains_key(ip))
    }

    pub(crate) fn next_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Reserve `ip`, replacing (and cancelling the hold of) any earlier reservation of it and
    /// any other reservation held by the same client.
    pub(crate) fn reserve(&mut self, ip: Ipv4Address, reservation: Reservation) {
        let client = reservation.client;
        let stale: Vec<_> = self
            .reservations
            .iter()
            .filter(|(other, r)| **other != ip && r.client == client)
            .map(|(other, _)| *other)
            .collect();
        for other in stale {
            self.remove(other);
        }
        if let Some(old) = self.reservations.insert(ip, reservation) {
            old.hold.unsubscribe();
        }
    }

    /// Free `ip` if it's reserved for `client`.
    pub fn release(&mut self, ip: Ipv4Address, client: MacAddress) -> bool {
        match self.reservations.get(&ip) {
            Some(r) if r.client == client => self.remove(ip),
            _ => false,
        }
    }

    /// Free `ip` if it's still held by the reservation identified by `token`.
    pub(crate) fn expire(&mut self, ip: Ipv4Address, token: u64) -> bool {
        match self.reservations.get(&ip) {
            Some(r) if r.token == token => {
                log::debug!("Reservation of {ip} for {} expired", r.client);
                self.reservations.remove(&ip);
                true
            }
            _ => false,
        }
    }

    /// Drop every reservation, cancelling their holds.
    pub(crate) fn clear(&mut self) {
        for (_, r) in std::mem::take(&mut self.reservations) {
            r.hold.unsubscribe();
        }
    }

    fn remove(&mut self, ip: Ipv4Address) -> bool {
        match self.reservations.remove(&ip) {
            Some(r) => {
                r.hold.unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn state_of(&self, ip: Ipv4Address) -> Option<ReservationState> {
        self.reservations.get(&ip).map(|r| r.state)
    }

    pub fn snapshot(&self) -> DhcpPoolSnapshot {
        DhcpPoolSnapshot {
            gateway: self.gateway,
            mask: self.mask,
            start: self.start,
            end: self.end,
            leases: self
                .reservations
                .iter()
                .map(|(ip, r)| LeaseRow {
                    address: *ip,
                    client: r.client,
                    state: r.state,
                    expires_at: r.expires_at,
                })
                .collect(),
        }
    }
}
