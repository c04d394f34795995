mod common;

use netsim::core::support::simulation_time::SimulationTime;
use netsim::host::services::dhcp::{self, DhcpClient, DhcpServer, ReservationState};

use common::{build, host, iface, ip};

const SMALL_POOL: &str = r#"
general:
  stop_time: 1 min
hosts:
  server:
    role: server
    services: [arp, dhcp-server]
    interfaces:
      - name: eth0
        address: 10.0.0.254/24
    dhcp_pools:
      - gateway: 10.0.0.254
        mask: 255.255.255.0
        start: 10.0.0.1
        end: 10.0.0.2
  pc1:
    role: computer
    services: [arp, dhcp-client]
    interfaces:
      - name: eth0
        dhcp: true
  pc2:
    role: computer
    services: [arp, dhcp-client]
    interfaces:
      - name: eth0
        dhcp: true
  pc3:
    role: computer
    services: [arp, dhcp-client]
    interfaces:
      - name: eth0
        dhcp: true
  sw:
    role: switch
    services: [switching]
    interfaces:
      - name: fa0/1
      - name: fa0/2
      - name: fa0/3
      - name: fa0/4
links:
  - ends: ["server:eth0", "sw:fa0/1"]
  - ends: ["pc1:eth0", "sw:fa0/2"]
  - ends: ["pc2:eth0", "sw:fa0/3"]
  - ends: ["pc3:eth0", "sw:fa0/4"]
"#;

#[test_log::test]
fn exhausted_pool_makes_no_offer() {
    let mut sim = build(SMALL_POOL);
    sim.advance(SimulationTime::from_secs(15));

    let mut leased: Vec<_> = ["pc1:eth0", "pc2:eth0", "pc3:eth0"]
        .iter()
        .filter_map(|name| sim.iface(iface(&sim, name)).unwrap().ip())
        .collect();
    leased.sort();
    assert_eq!(leased, vec![ip("10.0.0.1"), ip("10.0.0.2")]);

    let server = sim.service::<DhcpServer>(host(&sim, "server")).unwrap();
    let stats = server.borrow().stats();
    assert_eq!(stats.acks, 2);
    assert_eq!(stats.no_offer, 1);

    let pools = server.borrow().pools();
    assert_eq!(pools[0].leases.len(), 2);
    assert!(pools[0]
        .leases
        .iter()
        .all(|l| l.state == ReservationState::Leased));

    let timeouts: u64 = ["pc1", "pc2", "pc3"]
        .iter()
        .map(|name| {
            let client = sim.service::<DhcpClient>(host(&sim, name)).unwrap();
            let timeouts = client.borrow().stats().timeouts;
            timeouts
        })
        .sum();
    assert_eq!(timeouts, 1);
}

#[test_log::test]
fn lease_sets_gateway_and_release_frees_address() {
    let mut sim = build(SMALL_POOL);
    sim.advance(SimulationTime::from_secs(15));

    let holder = ["pc1:eth0", "pc2:eth0", "pc3:eth0"]
        .iter()
        .map(|name| iface(&sim, name))
        .find(|i| sim.iface(*i).unwrap().ip() == Some(ip("10.0.0.1")))
        .unwrap();
    let holder_host = sim.iface(holder).unwrap().host();
    assert_eq!(sim.default_gateway(holder_host), Some(ip("10.0.0.254")));

    assert!(dhcp::release(&mut sim, holder).unwrap());
    assert_eq!(sim.iface(holder).unwrap().ip(), None);
    assert_eq!(sim.default_gateway(holder_host), None);
    sim.advance(SimulationTime::from_secs(1));

    let server = sim.service::<DhcpServer>(host(&sim, "server")).unwrap();
    assert_eq!(server.borrow().stats().releases, 1);

    // the client left without an address can now get the released one
    let waiting = ["pc1:eth0", "pc2:eth0", "pc3:eth0"]
        .iter()
        .map(|name| iface(&sim, name))
        .find(|i| *i != holder && sim.iface(*i).unwrap().ip().is_none())
        .unwrap();
    let lease = dhcp::negotiate(&mut sim, waiting).unwrap();
    sim.advance(SimulationTime::from_secs(1));
    assert_eq!(lease.value().flatten().map(|l| l.address), Some(ip("10.0.0.1")));
}

#[test_log::test]
fn relay_forwards_to_remote_server() {
    let yaml = r#"
general:
  stop_time: 1 min
hosts:
  pc:
    role: computer
    services: [arp, dhcp-client]
    interfaces:
      - name: eth0
        dhcp: true
  relay:
    role: router
    services: [arp, dhcp-server]
    dhcp_forwarder: 10.0.2.2
    interfaces:
      - name: g0/0
        address: 10.0.1.1/24
      - name: g0/1
        address: 10.0.2.1/24
  server:
    role: server
    services: [arp, dhcp-server]
    default_gateway: 10.0.2.1
    interfaces:
      - name: eth0
        address: 10.0.2.2/24
    dhcp_pools:
      - gateway: 10.0.1.1
        mask: 255.255.255.0
        start: 10.0.1.100
        end: 10.0.1.110
links:
  - ends: ["pc:eth0", "relay:g0/0"]
  - ends: ["relay:g0/1", "server:eth0"]
"#;
    let mut sim = build(yaml);
    sim.advance(SimulationTime::from_secs(5));

    let pc = iface(&sim, "pc:eth0");
    assert_eq!(sim.iface(pc).unwrap().ip(), Some(ip("10.0.1.100")));
    assert_eq!(sim.default_gateway(host(&sim, "pc")), Some(ip("10.0.1.1")));

    let relay = sim.service::<DhcpServer>(host(&sim, "relay")).unwrap();
    // discover, offer, request and ack each pass through once
    assert_eq!(relay.borrow().stats().relayed, 4);

    let server = sim.service::<DhcpServer>(host(&sim, "server")).unwrap();
    assert_eq!(server.borrow().stats().acks, 1);
}

#[test_log::test]
fn no_server_times_out() {
    let yaml = r#"
general:
  stop_time: 1 min
protocols:
  dhcp:
    client_timeout: 3 s
hosts:
  pc:
    role: computer
    services: [dhcp-client]
    interfaces:
      - name: eth0
        dhcp: true
  other:
    role: computer
    interfaces:
      - name: eth0
        address: 192.168.0.1
links:
  - ends: ["pc:eth0", "other:eth0"]
"#;
    let mut sim = build(yaml);
    sim.advance(SimulationTime::from_secs(2));
    let client = sim.service::<DhcpClient>(host(&sim, "pc")).unwrap();
    assert_eq!(client.borrow().stats().timeouts, 0);

    sim.advance(SimulationTime::from_secs(2));
    assert_eq!(client.borrow().stats().discovers_sent, 1);
    assert_eq!(client.borrow().stats().timeouts, 1);
    assert_eq!(sim.iface(iface(&sim, "pc:eth0")).unwrap().ip(), None);
}
