//! The protocol headers a [`Packet`](super::packet::Packet) layer can carry.
//!
//! Lengths are synthetic: they only feed the link's transmission-delay model, and are close to
//! (but not exactly) the real on-wire sizes.

#![allow(clippy::len_without_is_empty)]

use std::fmt;

use crate::core::support::simulation_time::SimulationTime;
use crate::network::address::{Ipv4Address, MacAddress};

pub type VlanId = u16;

/// The default VLAN of every switch port.
pub const DEFAULT_VLAN: VlanId = 1;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
pub const HSRP_PORT: u16 = 1985;
/// The all-routers group that HSRP (version 1) hellos are sent to.
pub const HSRP_MULTICAST: Ipv4Address = Ipv4Address::new(224, 0, 0, 2);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EtherType {
    Arp,
    Ipv4,
    Other(u16),
}

impl EtherType {
    pub fn number(&self) -> u16 {
        match self {
            Self::Arp => 0x0806,
            Self::Ipv4 => 0x0800,
            Self::Other(x) => *x,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthernetHeader {
    pub src: MacAddress,
    pub dst: MacAddress,
    /// The 802.1Q tag, if the frame is tagged.
    pub vlan: Option<VlanId>,
    pub ethertype: EtherType,
}

impl EthernetHeader {
    pub fn len(&self) -> usize {
        if self.vlan.is_some() {
            18
        } else {
            14
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArpHeader {
    pub op: ArpOp,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Address,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Address,
    /// Simulation ground truth: set when the sender does not own `sender_ip`. Receivers never use
    /// this to reject the message; it only marks the resulting cache entry as poisoned.
    pub spoofed: bool,
}

impl ArpHeader {
    /// An announcement of the sender's own binding (sender and target address are the same).
    pub fn is_gratuitous(&self) -> bool {
        self.sender_ip == self.target_ip
    }

    pub fn len(&self) -> usize {
        28
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IpProtocol {
    Udp,
    Other(u8),
}

impl IpProtocol {
    /// The IANA-assigned protocol number.
    pub fn number(&self) -> u8 {
        match self {
            Self::Udp => 17,
            Self::Other(x) => *x,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub protocol: IpProtocol,
    pub ttl: u8,
}

impl Ipv4Header {
    pub fn len(&self) -> usize {
        // 20 bytes without options
        20
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

impl UdpHeader {
    pub fn len(&self) -> usize {
        8
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DhcpOp {
    Discover,
    Offer,
    Request,
    Ack,
    Nak,
    Release,
}

impl DhcpOp {
    /// Whether a client sends this message (as opposed to a server).
    pub fn from_client(&self) -> bool {
        matches!(self, Self::Discover | Self::Request | Self::Release)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpMessage {
    pub op: DhcpOp,
    /// Transaction id chosen by the client, echoed by servers and relays.
    pub xid: u32,
    pub client_mac: MacAddress,
    /// The client's current address (ciaddr), used by Release.
    pub client_ip: Option<Ipv4Address>,
    /// The address being offered or assigned (yiaddr).
    pub your_ip: Option<Ipv4Address>,
    pub server_id: Option<Ipv4Address>,
    pub requested_ip: Option<Ipv4Address>,
    /// The relay agent address (giaddr), set by the first relay a client message passes through.
    pub relay_agent: Option<Ipv4Address>,
    pub subnet_mask: Option<Ipv4Address>,
    pub router: Option<Ipv4Address>,
    pub lease_time: Option<SimulationTime>,
}

impl DhcpMessage {
    pub fn len(&self) -> usize {
        // fixed BOOTP fields plus a handful of options
        240 + 60
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HsrpOp {
    Hello,
    Coup,
    Resign,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HsrpState {
    Initial,
    Learn,
    Listen,
    Speak,
    Standby,
    Active,
}

impl fmt::Display for HsrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::Learn => "Learn",
            Self::Listen => "Listen",
            Self::Speak => "Speak",
            Self::Standby => "Standby",
            Self::Active => "Active",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HsrpMessage {
    pub op: HsrpOp,
    pub state: HsrpState,
    pub hello_time: SimulationTime,
    pub hold_time: SimulationTime,
    pub priority: u8,
    /// Whether the sender takes over from a lower-priority active router.
    pub preempt: bool,
    pub group: u8,
    /// Plain-text authentication data, compared verbatim by receivers.
    pub auth: String,
    /// Unset while the sender has not learned or been configured with the virtual address.
    pub virtual_ip: Option<Ipv4Address>,
}

impl HsrpMessage {
    pub fn len(&self) -> usize {
        20
    }
}

/// Opaque application data, for traffic that no modelled protocol interprets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPayload {
    pub len: usize,
    pub label: String,
}
