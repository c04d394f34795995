//! Validating builders for every message layer.
//!
//! Each builder collects a layer's fields and checks in `build()` that the ones its protocol
//! requires are present and consistent, producing a read-only [`PacketRc`].

use std::fmt;

use crate::core::support::simulation_time::SimulationTime;
use crate::network::address::{Ipv4Address, MacAddress};
use crate::network::headers::{
    ArpHeader, ArpOp, DataPayload, DhcpMessage, DhcpOp, EtherType, EthernetHeader, HsrpMessage,
    HsrpOp, HsrpState, IpProtocol, Ipv4Header, UdpHeader, VlanId,
};
use crate::network::packet::{Header, PacketRc};

/// A message layer could not be built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    MissingField {
        layer: &'static str,
        field: &'static str,
    },
    InvalidField {
        layer: &'static str,
        field: &'static str,
        reason: String,
    },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField { layer, field } => {
                write!(f, "{layer} message is missing required field '{field}'")
            }
            Self::InvalidField {
                layer,
                field,
                reason,
            } => write!(f, "{layer} message has invalid field '{field}': {reason}"),
        }
    }
}

impl std::error::Error for BuildError {}

fn require<T>(value: Option<T>, layer: &'static str, field: &'static str) -> Result<T, BuildError> {
    value.ok_or(BuildError::MissingField { layer, field })
}

fn invalid(layer: &'static str, field: &'static str, reason: impl Into<String>) -> BuildError {
    BuildError::InvalidField {
        layer,
        field,
        reason: reason.into(),
    }
}

/// The largest valid 802.1Q VLAN id.
pub const MAX_VLAN: VlanId = 4094;

#[derive(Debug, Default, Clone)]
pub struct EthernetBuilder {
    src: Option<MacAddress>,
    dst: Option<MacAddress>,
    vlan: Option<VlanId>,
    ethertype: Option<EtherType>,
    payload: Option<PacketRc>,
}

impl EthernetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src(mut self, src: MacAddress) -> Self {
        self.src = Some(src);
        self
    }

    pub fn dst(mut self, dst: MacAddress) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn vlan(mut self, vlan: VlanId) -> Self {
        self.vlan = Some(vlan);
        self
    }

    /// Only needed for payloads whose ethertype can't be inferred.
    pub fn ethertype(mut self, ethertype: EtherType) -> Self {
        self.ethertype = Some(ethertype);
        self
    }

    pub fn payload(mut self, payload: PacketRc) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn build(self) -> Result<PacketRc, BuildError> {
        const LAYER: &str = "ethernet";
        let src = require(self.src, LAYER, "src")?;
        let dst = require(self.dst, LAYER, "dst")?;
        let payload = require(self.payload, LAYER, "payload")?;

        if !src.is_unicast() {
            return Err(invalid(LAYER, "src", format!("{src} is not a unicast address")));
        }
        if let Some(vlan) = self.vlan {
            if !(1..=MAX_VLAN).contains(&vlan) {
                return Err(invalid(LAYER, "vlan", format!("{vlan} is not in 1..={MAX_VLAN}")));
            }
        }
        if matches!(payload.header(), Header::Ethernet(_)) {
            return Err(invalid(LAYER, "payload", "frames can't be nested"));
        }

        let ethertype = match (self.ethertype, payload.header()) {
            (Some(x), _) => x,
            (None, Header::Arp(_)) => EtherType::Arp,
            (None, Header::Ipv4(_)) => EtherType::Ipv4,
            (None, _) => EtherType::Other(0x88b5),
        };

        let header = EthernetHeader {
            src,
            dst,
            vlan: self.vlan,
            ethertype,
        };
        Ok(PacketRc::new(Header::Ethernet(header), Some(payload)))
    }
}

#[derive(Debug, Clone)]
pub struct ArpBuilder {
    op: ArpOp,
    sender_mac: Option<MacAddress>,
    sender_ip: Option<Ipv4Address>,
    target_mac: MacAddress,
    target_ip: Option<Ipv4Address>,
    spoofed: bool,
}

impl ArpBuilder {
    pub fn new(op: ArpOp) -> Self {
        Self {
            op,
            sender_mac: None,
            sender_ip: None,
            target_mac: MacAddress::ZERO,
            target_ip: None,
            spoofed: false,
        }
    }

    /// "Who has `target_ip`? Tell `sender_ip`."
    pub fn request(sender_mac: MacAddress, sender_ip: Ipv4Address, target_ip: Ipv4Address) -> Self {
        Self::new(ArpOp::Request)
            .sender(sender_mac, sender_ip)
            .target_ip(target_ip)
    }

    /// "`sender_ip` is at `sender_mac`", addressed to the requester.
    pub fn reply(
        sender_mac: MacAddress,
        sender_ip: Ipv4Address,
        target_mac: MacAddress,
        target_ip: Ipv4Address,
    ) -> Self {
        Self::new(ArpOp::Reply)
            .sender(sender_mac, sender_ip)
            .target(target_mac, target_ip)
    }

    /// An unsolicited announcement of `ip` at `mac`.
    pub fn gratuitous(mac: MacAddress, ip: Ipv4Address) -> Self {
        Self::new(ArpOp::Request)
            .sender(mac, ip)
            .target(MacAddress::BROADCAST, ip)
    }

    pub fn sender(mut self, mac: MacAddress, ip: Ipv4Address) -> Self {
        self.sender_mac = Some(mac);
        self.sender_ip = Some(ip);
        self
    }

    pub fn target(mut self, mac: MacAddress, ip: Ipv4Address) -> Self {
        self.target_mac = mac;
        self.target_ip = Some(ip);
        self
    }

    pub fn target_ip(mut self, ip: Ipv4Address) -> Self {
        self.target_ip = Some(ip);
        self
    }

    /// Mark the message as claiming an address the sender does not own.
    pub fn spoofed(mut self, spoofed: bool) -> Self {
        self.spoofed = spoofed;
        self
    }

    pub fn build(self) -> Result<PacketRc, BuildError> {
        const LAYER: &str = "arp";
        let sender_mac = require(self.sender_mac, LAYER, "sender_mac")?;
        let sender_ip = require(self.sender_ip, LAYER, "sender_ip")?;
        let target_ip = require(self.target_ip, LAYER, "target_ip")?;

        if !sender_mac.is_unicast() {
            return Err(invalid(LAYER, "sender_mac", "must be a unicast address"));
        }
        if sender_ip.is_unspecified() || sender_ip.is_broadcast() {
            return Err(invalid(LAYER, "sender_ip", format!("{sender_ip} can't be claimed")));
        }
        if self.op == ArpOp::Reply && self.target_mac == MacAddress::ZERO {
            return Err(BuildError::MissingField {
                layer: LAYER,
                field: "target_mac",
            });
        }

        let header = ArpHeader {
            op: self.op,
            sender_mac,
            sender_ip,
            target_mac: self.target_mac,
            target_ip,
            spoofed: self.spoofed,
        };
        Ok(PacketRc::new(Header::Arp(header), None))
    }
}

#[derive(Debug, Default, Clone)]
pub struct Ipv4Builder {
    src: Option<Ipv4Address>,
    dst: Option<Ipv4Address>,
    ttl: Option<u8>,
    protocol: Option<IpProtocol>,
    payload: Option<PacketRc>,
}

impl Ipv4Builder {
    pub const DEFAULT_TTL: u8 = 64;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn src(mut self, src: Ipv4Address) -> Self {
        self.src = Some(src);
        self
    }

    pub fn dst(mut self, dst: Ipv4Address) -> Self {
        self.dst = Some(dst);
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn protocol(mut self, protocol: IpProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn payload(mut self, payload: PacketRc) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn build(self) -> Result<PacketRc, BuildError> {
        const LAYER: &str = "ipv4";
        let src = require(self.src, LAYER, "src")?;
        let dst = require(self.dst, LAYER, "dst")?;
        let payload = require(self.payload, LAYER, "payload")?;

        let ttl = self.ttl.unwrap_or(Self::DEFAULT_TTL);
        if ttl == 0 {
            return Err(invalid(LAYER, "ttl", "must be non-zero"));
        }
        if src.is_multicast() || src.is_broadcast() {
            return Err(invalid(LAYER, "src", format!("{src} is not a host address")));
        }

        let protocol = match (self.protocol, payload.header()) {
            (Some(x), _) => x,
            (None, Header::Udp(_)) => IpProtocol::Udp,
            (None, Header::Data(_)) => IpProtocol::Other(253),
            (None, _) => return Err(invalid(LAYER, "payload", "expected a transport layer")),
        };

        let header = Ipv4Header {
            src,
            dst,
            protocol,
            ttl,
        };
        Ok(PacketRc::new(Header::Ipv4(header), Some(payload)))
    }
}

#[derive(Debug, Default, Clone)]
pub struct UdpBuilder {
    src_port: Option<u16>,
    dst_port: Option<u16>,
    payload: Option<PacketRc>,
}

impl UdpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn src_port(mut self, port: u16) -> Self {
        self.src_port = Some(port);
        self
    }

    pub fn dst_port(mut self, port: u16) -> Self {
        self.dst_port = Some(port);
        self
    }

    pub fn payload(mut self, payload: PacketRc) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn build(self) -> Result<PacketRc, BuildError> {
        const LAYER: &str = "udp";
        let src_port = require(self.src_port, LAYER, "src_port")?;
        let dst_port = require(self.dst_port, LAYER, "dst_port")?;
        let payload = require(self.payload, LAYER, "payload")?;

        if dst_port == 0 {
            return Err(invalid(LAYER, "dst_port", "port 0 is reserved"));
        }

        let header = UdpHeader { src_port, dst_port };
        Ok(PacketRc::new(Header::Udp(header), Some(payload)))
    }
}

#[derive(Debug, Clone)]
pub struct DhcpBuilder {
    msg: DhcpMessage,
    has_xid: bool,
    has_client_mac: bool,
}

impl DhcpBuilder {
    pub fn new(op: DhcpOp) -> Self {
        Self {
            msg: DhcpMessage {
                op,
                xid: 0,
                client_mac: MacAddress::ZERO,
                client_ip: None,
                your_ip: None,
                server_id: None,
                requested_ip: None,
                relay_agent: None,
                subnet_mask: None,
                router: None,
                lease_time: None,
            },
            has_xid: false,
            has_client_mac: false,
        }
    }

    /// Start from an existing message, for example to forward it through a relay.
    pub fn from_message(msg: &DhcpMessage) -> Self {
        Self {
            msg: msg.clone(),
            has_xid: true,
            has_client_mac: true,
        }
    }

    pub fn xid(mut self, xid: u32) -> Self {
        self.msg.xid = xid;
        self.has_xid = true;
        self
    }

    pub fn client_mac(mut self, mac: MacAddress) -> Self {
        self.msg.client_mac = mac;
        self.has_client_mac = true;
        self
    }

    pub fn client_ip(mut self, ip: Ipv4Address) -> Self {
        self.msg.client_ip = Some(ip);
        self
    }

    pub fn your_ip(mut self, ip: Ipv4Address) -> Self {
        self.msg.your_ip = Some(ip);
        self
    }

    pub fn server_id(mut self, ip: Ipv4Address) -> Self {
        self.msg.server_id = Some(ip);
        self
    }

    pub fn requested_ip(mut self, ip: Ipv4Address) -> Self {
        self.msg.requested_ip = Some(ip);
        self
    }

    pub fn relay_agent(mut self, ip: Ipv4Address) -> Self {
        self.msg.relay_agent = Some(ip);
        self
    }

    pub fn subnet_mask(mut self, mask: Ipv4Address) -> Self {
        self.msg.subnet_mask = Some(mask);
        self
    }

    pub fn router(mut self, ip: Ipv4Address) -> Self {
        self.msg.router = Some(ip);
        self
    }

    pub fn lease_time(mut self, time: SimulationTime) -> Self {
        self.msg.lease_time = Some(time);
        self
    }

    pub fn build(self) -> Result<PacketRc, BuildError> {
        const LAYER: &str = "dhcp";
        if !self.has_xid {
            return Err(BuildError::MissingField {
                layer: LAYER,
                field: "xid",
            });
        }
        if !self.has_client_mac {
            return Err(BuildError::MissingField {
                layer: LAYER,
                field: "client_mac",
            });
        }

        let msg = &self.msg;
        match msg.op {
            DhcpOp::Offer | DhcpOp::Ack => {
                require(msg.your_ip, LAYER, "your_ip")?;
                require(msg.server_id, LAYER, "server_id")?;
                let mask = require(msg.subnet_mask, LAYER, "subnet_mask")?;
                if !mask.is_valid_mask() {
                    return Err(invalid(LAYER, "subnet_mask", format!("{mask} is not contiguous")));
                }
            }
            DhcpOp::Nak if msg.server_id.is_none() => {
                return Err(BuildError::MissingField {
                    layer: LAYER,
                    field: "server_id",
                });
            }
            DhcpOp::Request => {
                require(msg.requested_ip, LAYER, "requested_ip")?;
            }
            DhcpOp::Release => {
                require(msg.client_ip, LAYER, "client_ip")?;
            }
            _ => {}
        }
        if msg.op == DhcpOp::Ack && msg.lease_time.map_or(true, |t| t.is_zero()) {
            return Err(invalid(LAYER, "lease_time", "an ack needs a non-zero lease"));
        }

        Ok(PacketRc::new(Header::Dhcp(self.msg), None))
    }
}

#[derive(Debug, Clone)]
pub struct HsrpBuilder {
    msg: HsrpMessage,
    has_group: bool,
}

impl HsrpBuilder {
    /// The longest authentication string that fits the message.
    pub const MAX_AUTH_LEN: usize = 8;

    pub fn new(op: HsrpOp, state: HsrpState) -> Self {
        Self {
            msg: HsrpMessage {
                op,
                state,
                hello_time: SimulationTime::from_secs(3),
                hold_time: SimulationTime::from_secs(10),
                priority: 100,
                preempt: false,
                group: 0,
                auth: "cisco".to_string(),
                virtual_ip: None,
            },
            has_group: false,
        }
    }

    pub fn group(mut self, group: u8) -> Self {
        self.msg.group = group;
        self.has_group = true;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.msg.priority = priority;
        self
    }

    pub fn preempt(mut self, preempt: bool) -> Self {
        self.msg.preempt = preempt;
        self
    }

    pub fn timers(mut self, hello_time: SimulationTime, hold_time: SimulationTime) -> Self {
        self.msg.hello_time = hello_time;
        self.msg.hold_time = hold_time;
        self
    }

    pub fn auth(mut self, auth: impl Into<String>) -> Self {
        self.msg.auth = auth.into();
        self
    }

    pub fn virtual_ip(mut self, ip: Option<Ipv4Address>) -> Self {
        self.msg.virtual_ip = ip;
        self
    }

    pub fn build(self) -> Result<PacketRc, BuildError> {
        const LAYER: &str = "hsrp";
        if !self.has_group {
            return Err(BuildError::MissingField {
                layer: LAYER,
                field: "group",
            });
        }
        if self.msg.auth.len() > Self::MAX_AUTH_LEN {
            return Err(invalid(
                LAYER,
                "auth",
                format!("longer than {} bytes", Self::MAX_AUTH_LEN),
            ));
        }
        if !self.msg.hello_time.is_positive() {
            return Err(invalid(LAYER, "hello_time", "must be non-zero"));
        }
        if self.msg.hold_time <= self.msg.hello_time {
            return Err(invalid(LAYER, "hold_time", "must be longer than the hello time"));
        }
        Ok(PacketRc::new(Header::Hsrp(self.msg), None))
    }
}

#[derive(Debug, Default, Clone)]
pub struct DataBuilder {
    label: Option<String>,
    len: usize,
}

impl DataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    pub fn build(self) -> Result<PacketRc, BuildError> {
        let label = require(self.label, "data", "label")?;
        let payload = DataPayload {
            len: self.len,
            label,
        };
        Ok(PacketRc::new(Header::Data(payload), None))
    }
}

/// The addressing of a UDP datagram carried in an Ethernet frame.
#[derive(Debug, Clone, Copy)]
pub struct UdpEndpoints {
    pub src_mac: MacAddress,
    pub dst_mac: MacAddress,
    pub src_ip: Ipv4Address,
    pub dst_ip: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Wrap `payload` in UDP, IPv4 and Ethernet layers.
pub fn udp_frame(ends: &UdpEndpoints, payload: PacketRc) -> Result<PacketRc, BuildError> {
    let udp = UdpBuilder::new()
        .src_port(ends.src_port)
        .dst_port(ends.dst_port)
        .payload(payload)
        .build()?;
    let ip = Ipv4Builder::new()
        .src(ends.src_ip)
        .dst(ends.dst_ip)
        .payload(udp)
        .build()?;
    EthernetBuilder::new()
        .src(ends.src_mac)
        .dst(ends.dst_mac)
        .payload(ip)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddress = MacAddress::new([2, 0, 0, 0, 0, 1]);

    #[test]
    fn test_missing_fields() {
        let err = EthernetBuilder::new().dst(MacAddress::BROADCAST).build().unwrap_err();
        assert_eq!(
            err,
            BuildError::MissingField {
                layer: "ethernet",
                field: "src"
            }
        );
        assert_eq!(err.to_string(), "ethernet message is missing required field 'src'");

        let err = DhcpBuilder::new(DhcpOp::Discover).xid(1).build().unwrap_err();
        assert!(matches!(err, BuildError::MissingField { field: "client_mac", .. }));

        let err = DhcpBuilder::new(DhcpOp::Offer)
            .xid(1)
            .client_mac(MAC)
            .server_id(Ipv4Address::new(10, 0, 0, 1))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingField { field: "your_ip", .. }));

        let err = HsrpBuilder::new(HsrpOp::Hello, HsrpState::Speak).build().unwrap_err();
        assert!(matches!(err, BuildError::MissingField { field: "group", .. }));
    }

    #[test]
    fn test_invalid_fields() {
        let arp = ArpBuilder::gratuitous(MAC, Ipv4Address::new(10, 0, 0, 1))
            .build()
            .unwrap();

        let err = EthernetBuilder::new()
            .src(MacAddress::BROADCAST)
            .dst(MAC)
            .payload(arp.clone())
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidField { field: "src", .. }));

        let err = EthernetBuilder::new()
            .src(MAC)
            .dst(MacAddress::BROADCAST)
            .vlan(4095)
            .payload(arp)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidField { field: "vlan", .. }));

        let err = HsrpBuilder::new(HsrpOp::Hello, HsrpState::Active)
            .group(1)
            .auth("much-too-long")
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidField { field: "auth", .. }));

        let err = HsrpBuilder::new(HsrpOp::Hello, HsrpState::Active)
            .group(1)
            .timers(SimulationTime::from_secs(3), SimulationTime::from_secs(3))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidField { field: "hold_time", .. }));

        let err = ArpBuilder::new(ArpOp::Reply)
            .sender(MAC, Ipv4Address::new(10, 0, 0, 1))
            .target_ip(Ipv4Address::new(10, 0, 0, 2))
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingField { field: "target_mac", .. }));
    }

    #[test]
    fn test_udp_frame_layers() {
        let ends = UdpEndpoints {
            src_mac: MAC,
            dst_mac: MacAddress::BROADCAST,
            src_ip: Ipv4Address::UNSPECIFIED,
            dst_ip: Ipv4Address::BROADCAST,
            src_port: 68,
            dst_port: 67,
        };
        let dhcp = DhcpBuilder::new(DhcpOp::Discover)
            .xid(7)
            .client_mac(MAC)
            .build()
            .unwrap();
        let frame = udp_frame(&ends, dhcp).unwrap();

        assert_eq!(frame.ethernet().unwrap().ethertype, EtherType::Ipv4);
        assert_eq!(frame.ipv4().unwrap().protocol, IpProtocol::Udp);
        assert_eq!(frame.udp().unwrap().dst_port, 67);
        assert_eq!(frame.dhcp().unwrap().xid, 7);
        assert_eq!(frame.len(), 14 + 20 + 8 + 300);
    }

    #[test]
    fn test_gratuitous_arp() {
        let ip = Ipv4Address::new(192, 168, 1, 1);
        let arp = ArpBuilder::gratuitous(MAC, ip).build().unwrap();
        let header = arp.arp().unwrap();
        assert!(header.is_gratuitous());
        assert_eq!(header.op, ArpOp::Request);
        assert!(!header.spoofed);
    }
}
