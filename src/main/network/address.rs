//! Network-layer (IPv4-style) and hardware (MAC-style) address values.
//!
//! Both kinds are small `Copy` values. Equality and ordering compare the raw address bytes, so
//! `10.0.0.2 < 10.0.0.10` and `aa:00:00:00:00:01 > 0a:ff:ff:ff:ff:ff`.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use rand::Rng;
use schemars::JsonSchema;
use serde::de::{Deserialize, Deserializer, Visitor};
use serde::ser::{Serialize, Serializer};

/// The reason an address string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    Empty,
    /// The string starts or ends with a separator character.
    LeadingOrTrailingSeparator,
    WrongFieldCount { expected: usize, found: usize },
    EmptyField { index: usize },
    Negative { field: String },
    InvalidCharacter { field: String },
    OutOfRange { field: String },
    /// A hardware address that mixes ':' and '-' separators.
    MixedSeparators,
    InvalidPrefixLength(u32),
}

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty address"),
            Self::LeadingOrTrailingSeparator => {
                write!(f, "address starts or ends with a separator")
            }
            Self::WrongFieldCount { expected, found } => {
                write!(f, "expected {expected} address fields but found {found}")
            }
            Self::EmptyField { index } => write!(f, "address field {index} is empty"),
            Self::Negative { field } => write!(f, "negative address field '{field}'"),
            Self::InvalidCharacter { field } => {
                write!(f, "invalid character in address field '{field}'")
            }
            Self::OutOfRange { field } => write!(f, "address field '{field}' is out of range"),
            Self::MixedSeparators => write!(f, "hardware address mixes ':' and '-' separators"),
            Self::InvalidPrefixLength(len) => write!(f, "invalid prefix length /{len}"),
        }
    }
}

impl std::error::Error for AddressParseError {}

/// An IPv4-style network address. Also used for netmasks.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0
    }

    pub const fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub const fn from_u32(val: u32) -> Self {
        Self(val.to_be_bytes())
    }

    /// The limited broadcast address `255.255.255.255`.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    /// Class D (224.0.0.0/4).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0xf0 == 0xe0
    }

    /// The classful default mask: /8 for class A, /16 for class B, /24 for class C. Class D and E
    /// addresses have no network part, so they get a host mask (/32).
    pub fn classful_mask(&self) -> Self {
        let prefix = match self.0[0] {
            0..=127 => 8,
            128..=191 => 16,
            192..=223 => 24,
            _ => 32,
        };
        // prefixes above are all valid
        Self::mask_from_prefix_unchecked(prefix)
    }

    /// A contiguous netmask with `len` leading one bits.
    pub fn mask_from_prefix(len: u32) -> Result<Self, AddressParseError> {
        if len > 32 {
            return Err(AddressParseError::InvalidPrefixLength(len));
        }
        Ok(Self::mask_from_prefix_unchecked(len))
    }

    fn mask_from_prefix_unchecked(len: u32) -> Self {
        let bits = u32::MAX.checked_shl(32 - len).unwrap_or(0);
        Self::from_u32(bits)
    }

    /// The number of leading one bits if this is a contiguous netmask.
    pub fn prefix_len(&self) -> Option<u32> {
        let bits = self.to_u32();
        let ones = bits.leading_ones();
        if bits.checked_shl(ones).unwrap_or(0) == 0 {
            Some(ones)
        } else {
            None
        }
    }

    pub fn is_valid_mask(&self) -> bool {
        self.prefix_len().is_some()
    }

    /// The network address of this address's subnet.
    pub fn network(&self, mask: Ipv4Address) -> Self {
        Self::from_u32(self.to_u32() & mask.to_u32())
    }

    /// The directed broadcast address of this address's subnet.
    pub fn broadcast(&self, mask: Ipv4Address) -> Self {
        Self::from_u32(self.to_u32() | !mask.to_u32())
    }

    /// Add `n`, carrying across octets and wrapping around at the end of the address space.
    pub fn add(&self, n: u32) -> Self {
        Self::from_u32(self.to_u32().wrapping_add(n))
    }

    /// Subtract `n`, borrowing across octets and wrapping around at the start of the address
    /// space.
    pub fn subtract(&self, n: u32) -> Self {
        Self::from_u32(self.to_u32().wrapping_sub(n))
    }

    pub fn in_same_network(&self, mask: Ipv4Address, other: Ipv4Address) -> bool {
        self.network(mask) == other.network(mask)
    }
}

impl FromStr for Ipv4Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }
        if s.starts_with('.') || s.ends_with('.') {
            return Err(AddressParseError::LeadingOrTrailingSeparator);
        }

        let fields: Vec<&str> = s.split('.').collect();
        if fields.len() != 4 {
            return Err(AddressParseError::WrongFieldCount {
                expected: 4,
                found: fields.len(),
            });
        }

        let mut octets = [0u8; 4];
        for (index, (field, octet)) in fields.iter().zip(octets.iter_mut()).enumerate() {
            *octet = parse_decimal_octet(index, field)?;
        }
        Ok(Self(octets))
    }
}

fn parse_decimal_octet(index: usize, field: &str) -> Result<u8, AddressParseError> {
    if field.is_empty() {
        return Err(AddressParseError::EmptyField { index });
    }
    if field.starts_with('-') {
        return Err(AddressParseError::Negative {
            field: field.to_string(),
        });
    }
    if !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressParseError::InvalidCharacter {
            field: field.to_string(),
        });
    }
    // at most three digits ("010" is fine, "0010" is not)
    if field.len() > 3 {
        return Err(AddressParseError::OutOfRange {
            field: field.to_string(),
        });
    }
    field.parse::<u8>().map_err(|_| AddressParseError::OutOfRange {
        field: field.to_string(),
    })
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl fmt::Debug for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<Ipv4Addr> for Ipv4Address {
    fn from(addr: Ipv4Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<Ipv4Address> for Ipv4Addr {
    fn from(addr: Ipv4Address) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(octets: [u8; 4]) -> Self {
        Self(octets)
    }
}

/// An Ethernet-style hardware address.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xff; 6]);
    pub const ZERO: Self = Self([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group addresses (including broadcast) have the least significant bit of the first octet
    /// set.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    /// The well-known virtual MAC for an HSRP (version 1) group.
    pub fn hsrp_virtual(group: u8) -> Self {
        Self([0x00, 0x00, 0x0c, 0x07, 0xac, group])
    }

    /// The Ethernet group address that an IPv4 multicast address maps to.
    pub fn ipv4_multicast(addr: Ipv4Address) -> Self {
        let [_, b, c, d] = addr.octets();
        Self([0x01, 0x00, 0x5e, b & 0x7f, c, d])
    }

    /// A random unicast address with the locally-administered bit set.
    pub fn random_local(rng: &mut impl Rng) -> Self {
        let mut octets: [u8; 6] = rng.gen();
        octets[0] = (octets[0] | 0x02) & !0x01;
        Self(octets)
    }
}

impl FromStr for MacAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }

        let sep = match (s.contains(':'), s.contains('-')) {
            (true, true) => return Err(AddressParseError::MixedSeparators),
            (false, true) => '-',
            _ => ':',
        };
        if s.starts_with(sep) || s.ends_with(sep) {
            return Err(AddressParseError::LeadingOrTrailingSeparator);
        }

        let fields: Vec<&str> = s.split(sep).collect();
        if fields.len() != 6 {
            return Err(AddressParseError::WrongFieldCount {
                expected: 6,
                found: fields.len(),
            });
        }

        let mut octets = [0u8; 6];
        for (index, (field, octet)) in fields.iter().zip(octets.iter_mut()).enumerate() {
            if field.is_empty() {
                return Err(AddressParseError::EmptyField { index });
            }
            if field.len() > 2 || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(AddressParseError::InvalidCharacter {
                    field: field.to_string(),
                });
            }
            *octet = u8::from_str_radix(field, 16).map_err(|_| {
                AddressParseError::InvalidCharacter {
                    field: field.to_string(),
                }
            })?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

macro_rules! address_serde_impl {
    ($name:ident, $expecting:literal) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                struct AddressVisitor;

                impl<'de> Visitor<'de> for AddressVisitor {
                    type Value = $name;

                    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                        formatter.write_str($expecting)
                    }

                    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        $name::from_str(v).map_err(E::custom)
                    }
                }

                deserializer.deserialize_str(AddressVisitor)
            }
        }

        impl JsonSchema for $name {
            fn is_referenceable() -> bool {
                false
            }

            fn schema_name() -> String {
                stringify!($name).to_owned()
            }

            fn json_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
                schemars::schema::SchemaObject {
                    instance_type: Some(schemars::schema::InstanceType::String.into()),
                    format: Some(stringify!($name).to_owned()),
                    ..Default::default()
                }
                .into()
            }
        }
    };
}

address_serde_impl!(Ipv4Address, "a dotted-decimal network address");
address_serde_impl!(MacAddress, "a colon-separated hardware address");

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn ip(s: &str) -> Ipv4Address {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_round_trip() {
        for s in ["0.0.0.0", "10.0.0.1", "192.168.1.254", "255.255.255.255"] {
            assert_eq!(ip(s).to_string(), s);
        }
        // leading zeros are accepted and normalized
        assert_eq!(ip("010.000.0.01").to_string(), "10.0.0.1");
    }

    #[test]
    fn test_parse_failures() {
        use AddressParseError as E;
        let cases = [
            ("", E::Empty),
            (".1.2.3", E::LeadingOrTrailingSeparator),
            ("1.2.3.4.", E::LeadingOrTrailingSeparator),
            ("1.2.3", E::WrongFieldCount { expected: 4, found: 3 }),
            ("1.2.3.4.5", E::WrongFieldCount { expected: 4, found: 5 }),
            ("1..3.4", E::EmptyField { index: 1 }),
            ("1.2.-3.4", E::Negative { field: "-3".into() }),
            ("1.2.3.x", E::InvalidCharacter { field: "x".into() }),
            ("1.2.3. 4", E::InvalidCharacter { field: " 4".into() }),
            ("1.2.3.+4", E::InvalidCharacter { field: "+4".into() }),
            ("1.2.3.256", E::OutOfRange { field: "256".into() }),
            ("1.2.3.0004", E::OutOfRange { field: "0004".into() }),
        ];
        for (input, err) in cases {
            assert_eq!(input.parse::<Ipv4Address>(), Err(err), "input {input:?}");
        }
    }

    #[test]
    fn test_ordering_is_bytewise() {
        assert!(ip("10.0.0.2") < ip("10.0.0.10"));
        assert!(ip("9.255.255.255") < ip("10.0.0.0"));
        assert_eq!(ip("10.0.0.1"), Ipv4Address::new(10, 0, 0, 1));
    }

    #[test]
    fn test_classful_mask() {
        assert_eq!(ip("10.1.2.3").classful_mask(), ip("255.0.0.0"));
        assert_eq!(ip("172.16.0.1").classful_mask(), ip("255.255.0.0"));
        assert_eq!(ip("192.168.0.1").classful_mask(), ip("255.255.255.0"));
        assert_eq!(ip("224.0.0.2").classful_mask(), ip("255.255.255.255"));
    }

    #[test]
    fn test_network_and_broadcast() {
        let mask = ip("255.255.255.0");
        assert_eq!(ip("192.168.7.42").network(mask), ip("192.168.7.0"));
        assert_eq!(ip("192.168.7.42").broadcast(mask), ip("192.168.7.255"));

        let mask = ip("255.255.240.0");
        assert_eq!(ip("10.1.37.9").network(mask), ip("10.1.32.0"));
        assert_eq!(ip("10.1.37.9").broadcast(mask), ip("10.1.47.255"));

        assert!(ip("10.0.0.1").in_same_network(ip("255.255.255.0"), ip("10.0.0.200")));
        assert!(!ip("10.0.0.1").in_same_network(ip("255.255.255.0"), ip("10.0.1.1")));
    }

    #[test]
    fn test_add_subtract_carry() {
        assert_eq!(ip("10.0.0.255").add(1), ip("10.0.1.0"));
        assert_eq!(ip("10.0.255.255").add(2), ip("10.1.0.1"));
        assert_eq!(ip("10.1.0.0").subtract(1), ip("10.0.255.255"));
        assert_eq!(ip("255.255.255.255").add(1), ip("0.0.0.0"));
        assert_eq!(ip("0.0.0.0").subtract(1), ip("255.255.255.255"));
        assert_eq!(ip("1.2.3.4").add(256 * 256), ip("1.3.3.4"));
    }

    #[test]
    fn test_masks() {
        assert_eq!(Ipv4Address::mask_from_prefix(24), Ok(ip("255.255.255.0")));
        assert_eq!(Ipv4Address::mask_from_prefix(0), Ok(ip("0.0.0.0")));
        assert_eq!(Ipv4Address::mask_from_prefix(32), Ok(ip("255.255.255.255")));
        assert_eq!(
            Ipv4Address::mask_from_prefix(33),
            Err(AddressParseError::InvalidPrefixLength(33))
        );
        assert_eq!(ip("255.255.252.0").prefix_len(), Some(22));
        assert_eq!(ip("255.0.255.0").prefix_len(), None);
        assert!(!ip("0.255.255.255").is_valid_mask());
    }

    #[test]
    fn test_predicates() {
        assert!(ip("255.255.255.255").is_broadcast());
        assert!(!ip("10.0.0.255").is_broadcast());
        assert!(ip("224.0.0.2").is_multicast());
        assert!(ip("0.0.0.0").is_unspecified());
    }

    #[test]
    fn test_mac_parse() {
        let mac: MacAddress = "00:00:0C:07:ac:01".parse().unwrap();
        assert_eq!(mac, MacAddress::hsrp_virtual(1));
        assert_eq!(mac.to_string(), "00:00:0c:07:ac:01");
        assert_eq!("00-00-0c-07-ac-01".parse::<MacAddress>(), Ok(mac));

        assert_eq!(
            "00:00-0c:07:ac:01".parse::<MacAddress>(),
            Err(AddressParseError::MixedSeparators)
        );
        assert_eq!(
            "00:00:0c:07:ac".parse::<MacAddress>(),
            Err(AddressParseError::WrongFieldCount { expected: 6, found: 5 })
        );
        assert_eq!(
            ":00:0c:07:ac:01".parse::<MacAddress>(),
            Err(AddressParseError::LeadingOrTrailingSeparator)
        );
        assert!("00:00:0c:07:ac:1g".parse::<MacAddress>().is_err());
        assert!("00:00:0c:07:ac:100".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_kinds() {
        assert!(MacAddress::BROADCAST.is_broadcast());
        assert!(MacAddress::BROADCAST.is_multicast());
        assert_eq!(
            MacAddress::ipv4_multicast(ip("224.0.0.2")).to_string(),
            "01:00:5e:00:00:02"
        );

        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        for _ in 0..32 {
            let mac = MacAddress::random_local(&mut rng);
            assert!(mac.is_unicast());
            assert_eq!(mac.octets()[0] & 0x02, 0x02);
        }
    }

    #[test]
    fn test_serde() {
        let addr: Ipv4Address = serde_yaml::from_str("10.0.0.1").unwrap();
        assert_eq!(addr, ip("10.0.0.1"));
        assert!(serde_yaml::from_str::<Ipv4Address>("10.0.0.").is_err());
        assert_eq!(serde_yaml::to_string(&addr).unwrap().trim(), "10.0.0.1");
    }
}
