use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atomic_refcell::AtomicRefCell;

use crate::network::headers::{
    ArpHeader, ArpOp, DataPayload, DhcpMessage, EthernetHeader, HsrpMessage, Ipv4Header,
    UdpHeader, VlanId,
};

/// Represents different checkpoints that a packet reaches as it is being moved around the
/// simulated network.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PacketStatus {
    Created,
    InterfaceSent,
    InterfaceDropped,
    LinkTransmitted,
    RcvInterfaceReceived,
    RcvInterfaceDropped,
    ServiceHandled,
    SwitchForwarded,
    SwitchFlooded,
    SwitchDropped,
    RelayForwarded,
}

/// A shared reference to an immutable [`Packet`].
///
/// Cloning a `PacketRc` is cheap; the `PartialEq` implementation compares the pointer values of
/// the wrapped `Packet`, so two separately built but identical packets are not equal.
///
/// `PacketRc` implements the `Deref` trait so that all methods on `Packet` can be called on it
/// directly.
#[derive(Clone)]
pub struct PacketRc {
    inner: Arc<Packet>,
}

impl PacketRc {
    pub(crate) fn new(header: Header, inner: Option<PacketRc>) -> Self {
        Self::from(Packet::new(header, inner))
    }
}

impl PartialEq for PacketRc {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for PacketRc {}

impl From<Packet> for PacketRc {
    fn from(packet: Packet) -> Self {
        Self {
            inner: Arc::new(packet),
        }
    }
}

impl std::ops::Deref for PacketRc {
    type Target = Packet;
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl fmt::Debug for PacketRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.inner.as_ref(), f)
    }
}

impl fmt::Display for PacketRc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.inner.as_ref(), f)
    }
}

/// The header of one protocol layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Header {
    Ethernet(EthernetHeader),
    Arp(ArpHeader),
    Ipv4(Ipv4Header),
    Udp(UdpHeader),
    Dhcp(DhcpMessage),
    Hsrp(HsrpMessage),
    Data(DataPayload),
}

impl Header {
    pub fn len(&self) -> usize {
        match self {
            Self::Ethernet(x) => x.len(),
            Self::Arp(x) => x.len(),
            Self::Ipv4(x) => x.len(),
            Self::Udp(x) => x.len(),
            Self::Dhcp(x) => x.len(),
            Self::Hsrp(x) => x.len(),
            Self::Data(x) => x.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One layer of a message: a protocol header and the (optional) encapsulated layer.
///
/// Packets are only created through the builders in [`builder`](super::builder), which validate
/// that each protocol's required fields are present, and are read-only after creation. Changing
/// a layer (for example re-tagging a frame at a switch) creates a new top layer that shares the
/// encapsulated layers with the original.
pub struct Packet {
    header: Header,
    inner: Option<PacketRc>,
    id: u64,
    statuses: Option<AtomicRefCell<Vec<PacketStatus>>>,
}

static NEXT_PACKET_ID: AtomicU64 = AtomicU64::new(0);

impl Packet {
    fn new(header: Header, inner: Option<PacketRc>) -> Self {
        let statuses = log::log_enabled!(log::Level::Trace).then(|| AtomicRefCell::new(Vec::new()));
        let packet = Self {
            header,
            inner,
            id: NEXT_PACKET_ID.fetch_add(1, Ordering::Relaxed),
            statuses,
        };
        packet.add_status(PacketStatus::Created);
        packet
    }

    /// A process-wide unique identifier, for tracing.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn inner(&self) -> Option<&PacketRc> {
        self.inner.as_ref()
    }

    /// Iterate over this layer and every encapsulated layer, outermost first.
    pub fn layers(&self) -> impl Iterator<Item = &Packet> {
        std::iter::successors(Some(self), |p| p.inner.as_deref())
    }

    /// Returns the total simulated length of all layers.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.layers().map(|p| p.header.len()).sum()
    }

    /// The Ethernet header, if this is a frame.
    pub fn ethernet(&self) -> Option<&EthernetHeader> {
        match &self.header {
            Header::Ethernet(x) => Some(x),
            _ => None,
        }
    }

    pub fn arp(&self) -> Option<&ArpHeader> {
        self.layers().find_map(|p| match &p.header {
            Header::Arp(x) => Some(x),
            _ => None,
        })
    }

    pub fn ipv4(&self) -> Option<&Ipv4Header> {
        self.layers().find_map(|p| match &p.header {
            Header::Ipv4(x) => Some(x),
            _ => None,
        })
    }

    /// The first IPv4 layer, as a packet (its header and everything it encapsulates).
    pub fn ipv4_packet(&self) -> Option<&Packet> {
        self.layers().find(|p| matches!(p.header, Header::Ipv4(_)))
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        self.layers().find_map(|p| match &p.header {
            Header::Udp(x) => Some(x),
            _ => None,
        })
    }

    pub fn dhcp(&self) -> Option<&DhcpMessage> {
        self.layers().find_map(|p| match &p.header {
            Header::Dhcp(x) => Some(x),
            _ => None,
        })
    }

    pub fn hsrp(&self) -> Option<&HsrpMessage> {
        self.layers().find_map(|p| match &p.header {
            Header::Hsrp(x) => Some(x),
            _ => None,
        })
    }

    pub fn data(&self) -> Option<&DataPayload> {
        self.layers().find_map(|p| match &p.header {
            Header::Data(x) => Some(x),
            _ => None,
        })
    }

    /// The VLAN tag of the frame, if it's a tagged frame.
    pub fn vlan(&self) -> Option<VlanId> {
        self.ethernet().and_then(|eth| eth.vlan)
    }

    /// Appends the provided packet status to the list of the packet's status checkpoints.
    ///
    /// This function has no effect unless `log::Level::Trace` is enabled.
    pub fn add_status(&self, status: PacketStatus) {
        if log::log_enabled!(log::Level::Trace) {
            if let Some(vec) = self.statuses.as_ref() {
                vec.borrow_mut().push(status);
            }
            log::trace!("[{status:?}] {self}");
        }
    }

    /// The checkpoints recorded so far. Always empty unless trace logging was enabled when the
    /// packet was created.
    pub fn statuses(&self) -> Vec<PacketStatus> {
        self.statuses
            .as_ref()
            .map(|x| x.borrow().clone())
            .unwrap_or_default()
    }
}

impl PacketRc {
    /// A frame identical to this one but with the VLAN tag set to `vlan` (or removed). The
    /// encapsulated layers are shared rather than copied. Packets that aren't Ethernet frames, and
    /// frames already carrying the requested tag, are returned unchanged.
    pub fn with_vlan(&self, vlan: Option<VlanId>) -> PacketRc {
        let packet: &Packet = self;
        match &packet.header {
            Header::Ethernet(eth) if eth.vlan != vlan => {
                let eth = EthernetHeader {
                    vlan,
                    ..eth.clone()
                };
                PacketRc::new(Header::Ethernet(eth), packet.inner.clone())
            }
            _ => self.clone(),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("header", &self.header)
            .field("inner", &self.inner)
            .finish()
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.id)?;
        for layer in self.layers() {
            write!(f, " | ")?;
            match &layer.header {
                Header::Ethernet(x) => {
                    write!(f, "eth {} > {}", x.src, x.dst)?;
                    if let Some(vlan) = x.vlan {
                        write!(f, " vlan {vlan}")?;
                    }
                }
                Header::Arp(x) => match x.op {
                    ArpOp::Request => {
                        write!(f, "arp who-has {} tell {}", x.target_ip, x.sender_ip)?
                    }
                    ArpOp::Reply => write!(f, "arp {} is-at {}", x.sender_ip, x.sender_mac)?,
                },
                Header::Ipv4(x) => write!(f, "ip {} > {}", x.src, x.dst)?,
                Header::Udp(x) => write!(f, "udp {} > {}", x.src_port, x.dst_port)?,
                Header::Dhcp(x) => write!(f, "dhcp {:?} xid {:#010x}", x.op, x.xid)?,
                Header::Hsrp(x) => write!(
                    f,
                    "hsrp {:?} group {} {} prio {}",
                    x.op, x.group, x.state, x.priority
                )?,
                Header::Data(x) => write!(f, "data '{}' ({} bytes)", x.label, x.len)?,
            }
        }
        Ok(())
    }
}

// packets are handed to interface observers and link spies, which may live on other threads
static_assertions::assert_impl_all!(PacketRc: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::address::{Ipv4Address, MacAddress};
    use crate::network::builder::{ArpBuilder, DataBuilder, EthernetBuilder};
    use crate::network::headers::EtherType;

    fn arp_frame() -> PacketRc {
        let arp = ArpBuilder::request(
            MacAddress::new([2, 0, 0, 0, 0, 1]),
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 0, 0, 2),
        )
        .build()
        .unwrap();
        EthernetBuilder::new()
            .src(MacAddress::new([2, 0, 0, 0, 0, 1]))
            .dst(MacAddress::BROADCAST)
            .payload(arp)
            .build()
            .unwrap()
    }

    #[test]
    fn test_layers_and_len() {
        let frame = arp_frame();
        assert_eq!(frame.layers().count(), 2);
        assert_eq!(frame.len(), 14 + 28);
        assert_eq!(frame.ethernet().unwrap().ethertype, EtherType::Arp);
        assert_eq!(frame.arp().unwrap().target_ip, Ipv4Address::new(10, 0, 0, 2));
        assert!(frame.ipv4().is_none());
    }

    #[test]
    fn test_with_vlan_shares_inner() {
        let frame = arp_frame();
        let tagged = frame.with_vlan(Some(20));
        assert_eq!(tagged.vlan(), Some(20));
        assert_eq!(tagged.len(), frame.len() + 4);
        assert_eq!(tagged.inner(), frame.inner());
        assert_ne!(tagged, frame);

        // no change needed, so the same packet comes back
        let untagged = frame.with_vlan(None);
        assert_eq!(untagged, frame);
    }

    #[test]
    fn test_display() {
        let data = DataBuilder::new().label("hello").len(100).build().unwrap();
        let frame = EthernetBuilder::new()
            .src(MacAddress::new([2, 0, 0, 0, 0, 1]))
            .dst(MacAddress::new([2, 0, 0, 0, 0, 2]))
            .vlan(10)
            .payload(data)
            .build()
            .unwrap();
        let s = frame.to_string();
        assert!(s.contains("eth 02:00:00:00:00:01 > 02:00:00:00:00:02 vlan 10"), "{s}");
        assert!(s.contains("data 'hello' (100 bytes)"), "{s}");
    }
}
