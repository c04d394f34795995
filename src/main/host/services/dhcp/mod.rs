//! Address leasing: a DHCP server (which doubles as a relay agent), its address pools, and a
//! client.

mod client;
mod pool;
mod server;

pub use client::{negotiate, release, DhcpClient, DhcpClientConfig, DhcpClientStats};
pub use pool::{DhcpPool, DhcpPoolSnapshot, LeaseRow, PoolError, ReservationState};
pub use server::{DhcpServer, DhcpServerConfig, DhcpServerStats};

use serde::Serialize;

use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::host::network::interface::InterfaceId;
use crate::network::address::{Ipv4Address, MacAddress};
use crate::network::builder::{udp_frame, DhcpBuilder, UdpEndpoints};
use crate::network::headers::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use crate::core::simulation::Simulation;

/// An address lease held by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub address: Ipv4Address,
    pub mask: Ipv4Address,
    pub router: Option<Ipv4Address>,
    pub server: Ipv4Address,
    pub lease_time: SimulationTime,
    pub obtained_at: EmulatedTime,
}

impl Lease {
    pub fn expires_at(&self) -> EmulatedTime {
        self.obtained_at.saturating_add(self.lease_time)
    }
}

/// Broadcast a DHCP message out of `iface`, from `src_ip`. Messages from servers and relays go
/// to the client port and messages from clients go to the server port.
fn broadcast(
    sim: &mut Simulation,
    iface: InterfaceId,
    src_ip: Ipv4Address,
    msg: DhcpBuilder,
    to_client: bool,
) -> bool {
    let Ok(src_mac) = sim.iface(iface).map(|i| i.mac()) else {
        return false;
    };
    let (src_port, dst_port) = if to_client {
        (DHCP_SERVER_PORT, DHCP_CLIENT_PORT)
    } else {
        (DHCP_CLIENT_PORT, DHCP_SERVER_PORT)
    };
    let ends = UdpEndpoints {
        src_mac,
        dst_mac: MacAddress::BROADCAST,
        src_ip,
        dst_ip: Ipv4Address::BROADCAST,
        src_port,
        dst_port,
    };
    match msg.build().and_then(|msg| udp_frame(&ends, msg)) {
        Ok(frame) => sim.send_packet(iface, frame),
        Err(e) => {
            log::warn!("Couldn't build a DHCP message: {e}");
            false
        }
    }
}
