mod common;

use netsim::core::support::simulation_time::SimulationTime;
use netsim::host::services::arp::{self, Arp};
use netsim::host::services::hsrp;
use netsim::network::address::MacAddress;
use netsim::network::headers::HsrpState;

use common::{build, host, iface, ip};

const TWO_ROUTERS: &str = r#"
general:
  stop_time: 5 min
hosts:
  r1:
    role: router
    services: [arp, hsrp]
    interfaces:
      - name: g0/0
        address: 10.0.0.2/24
        hsrp:
          - group: 1
            virtual_ip: 10.0.0.1
            priority: 110
            preempt: true
  r2:
    role: router
    services: [arp, hsrp]
    interfaces:
      - name: g0/0
        address: 10.0.0.3/24
        hsrp:
          - group: 1
            virtual_ip: 10.0.0.1
  pc:
    role: computer
    services: [arp]
    default_gateway: 10.0.0.1
    interfaces:
      - name: eth0
        address: 10.0.0.10/24
  sw:
    role: switch
    services: [switching]
    interfaces:
      - name: fa0/1
      - name: fa0/2
      - name: fa0/3
links:
  - ends: ["r1:g0/0", "sw:fa0/1"]
  - ends: ["r2:g0/0", "sw:fa0/2"]
  - ends: ["pc:eth0", "sw:fa0/3"]
"#;

fn state(sim: &netsim::core::simulation::Simulation, router: &str) -> HsrpState {
    hsrp::status(sim, host(sim, router)).unwrap()[0].state
}

#[test_log::test]
fn higher_priority_router_is_active() {
    let mut sim = build(TWO_ROUTERS);
    sim.advance(SimulationTime::from_secs(40));

    assert_eq!(state(&sim, "r1"), HsrpState::Active);
    assert_eq!(state(&sim, "r2"), HsrpState::Standby);

    let status = hsrp::status(&sim, host(&sim, "r2")).unwrap();
    assert_eq!(status[0].active_router, Some(ip("10.0.0.2")));

    // the default gateway answers at the group's virtual MAC
    let pc = host(&sim, "pc");
    let resolved = arp::resolve(&mut sim, pc, ip("10.0.0.1")).unwrap();
    sim.advance(SimulationTime::from_millis(100));
    assert_eq!(resolved.value(), Some(Some(MacAddress::hsrp_virtual(1))));
}

#[test_log::test]
fn standby_takes_over_when_active_fails() {
    let mut sim = build(TWO_ROUTERS);
    sim.advance(SimulationTime::from_secs(40));
    assert_eq!(state(&sim, "r1"), HsrpState::Active);

    sim.set_interface_down(iface(&sim, "r1:g0/0")).unwrap();
    // r2 keeps waiting until the hold time has passed without a hello
    sim.advance(SimulationTime::from_secs(5));
    assert_eq!(state(&sim, "r2"), HsrpState::Standby);
    sim.advance(SimulationTime::from_secs(7));
    assert_eq!(state(&sim, "r2"), HsrpState::Active);
    assert_eq!(state(&sim, "r1"), HsrpState::Initial);

    let pc = host(&sim, "pc");
    let resolved = arp::resolve(&mut sim, pc, ip("10.0.0.1")).unwrap();
    sim.advance(SimulationTime::from_millis(100));
    assert_eq!(resolved.value(), Some(Some(MacAddress::hsrp_virtual(1))));

    // r1 comes back and preempts
    sim.set_interface_up(iface(&sim, "r1:g0/0")).unwrap();
    sim.advance(SimulationTime::from_secs(40));
    assert_eq!(state(&sim, "r1"), HsrpState::Active);
    assert_eq!(state(&sim, "r2"), HsrpState::Standby);
}

#[test_log::test]
fn poisoned_binding_replaces_real_one() {
    let mut sim = build(TWO_ROUTERS);
    sim.advance(SimulationTime::from_secs(1));

    let pc = host(&sim, "pc");
    let r2 = iface(&sim, "r2:g0/0");
    let resolved = arp::resolve(&mut sim, pc, ip("10.0.0.2")).unwrap();
    sim.advance(SimulationTime::from_millis(100));
    let r1_mac = sim.iface(iface(&sim, "r1:g0/0")).unwrap().mac();
    assert_eq!(resolved.value(), Some(Some(r1_mac)));

    // r2 claims to be r1
    let pc_mac = sim.iface(iface(&sim, "pc:eth0")).unwrap().mac();
    assert!(arp::poison(&mut sim, r2, ip("10.0.0.10"), pc_mac, ip("10.0.0.2")).unwrap());
    sim.advance(SimulationTime::from_millis(100));

    let arp = sim.service::<Arp>(pc).unwrap();
    let entry = arp.borrow().lookup(ip("10.0.0.2")).unwrap();
    assert_eq!(entry.mac, sim.iface(r2).unwrap().mac());
    assert!(entry.poisoned);
}
