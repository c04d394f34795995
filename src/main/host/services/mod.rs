//! The protocol services that can be enabled on hosts.

pub mod arp;
pub mod dhcp;
pub mod hsrp;
pub mod switching;
