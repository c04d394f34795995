//! Protocol services and how they attach to hosts.
//!
//! A service is enabled on a host at most once per type. When enabled it's registered on every
//! interface of the host that it [qualifies](Service::qualifies) for, including interfaces added
//! later. Packets arriving on an interface are offered to its registered services in the order
//! they were enabled until one of them returns [`ServiceVerdict::Stop`] or
//! [`ServiceVerdict::Handled`].
//!
//! Services are shared as `Rc<RefCell<S>>`. Timer callbacks only hold a `Weak` reference (see
//! [`ServiceTimers`]) so that a callback that fires after the service was disabled does nothing.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use crate::core::logger;
use crate::core::scheduler::Subscription;
use crate::core::simulation::{SimError, Simulation};
use crate::core::support::simulation_time::SimulationTime;
use crate::host::host::HostId;
use crate::host::network::interface::{InterfaceId, InterfaceSnapshot};
use crate::network::packet::{PacketRc, PacketStatus};

/// What should happen to a packet after a service has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceVerdict {
    /// Offer the packet to the next service.
    Continue,
    /// Don't offer the packet to any other service.
    Stop,
    /// The packet was consumed. Don't offer it to any other service.
    Handled,
}

pub trait Service: 'static {
    fn name(&self) -> &'static str;

    /// Called once when the service is enabled on `host`. `this` refers to the service itself
    /// and is what timer callbacks should hold on to.
    fn attach(&mut self, sim: &mut Simulation, host: HostId, this: Weak<RefCell<Self>>)
    where
        Self: Sized;

    /// Called once when the service is disabled. Timers should be cancelled here.
    fn detach(&mut self, sim: &mut Simulation);

    /// Whether the service should receive packets from `iface`.
    fn qualifies(&self, _sim: &Simulation, _iface: InterfaceId) -> bool {
        true
    }

    fn receive_packet(
        &mut self,
        sim: &mut Simulation,
        iface: InterfaceId,
        packet: &PacketRc,
    ) -> ServiceVerdict;

    /// Called when an interface added after the service was enabled is registered with it.
    fn interface_added(&mut self, _sim: &mut Simulation, _iface: InterfaceId) {}

    /// Called when the operational state or address of a registered interface changes.
    fn interface_changed(
        &mut self,
        _sim: &mut Simulation,
        _iface: InterfaceId,
        _snapshot: &InterfaceSnapshot,
    ) {
    }

    /// A snapshot of the service's state for reports.
    fn report(&self, _sim: &Simulation) -> Option<serde_yaml::Value> {
        None
    }
}

/// A service enabled on a host.
pub(crate) struct ServiceEntry {
    type_id: TypeId,
    pub(crate) name: &'static str,
    service: Rc<RefCell<dyn Service>>,
    // the same allocation as `service`, for downcasting
    any: Rc<dyn Any>,
    interfaces: BTreeSet<InterfaceId>,
}

impl ServiceEntry {
    fn downcast<S: Service>(&self) -> Option<Rc<RefCell<S>>> {
        Rc::downcast::<RefCell<S>>(Rc::clone(&self.any)).ok()
    }
}

/// Owns the timers of a service so that they can all be cancelled on detach. Callbacks are run
/// with a mutable borrow of the service and are skipped if the service no longer exists.
#[derive(Debug, Default)]
pub struct ServiceTimers {
    host: Option<HostId>,
    subs: Vec<Subscription>,
}

impl ServiceTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute log records from the callbacks to `host`.
    pub fn set_host(&mut self, host: HostId) {
        self.host = Some(host);
    }

    pub fn once<S: Service>(
        &mut self,
        sim: &mut Simulation,
        this: &Weak<RefCell<S>>,
        delay: SimulationTime,
        f: impl FnOnce(&mut S, &mut Simulation) + 'static,
    ) -> Subscription {
        let this = Weak::clone(this);
        let host = self.host;
        let sub = sim.scheduler.once(delay, move |sim: &mut Simulation| {
            with_service(sim, host, &this, f);
        });
        self.track(sub)
    }

    pub fn repeat<S: Service>(
        &mut self,
        sim: &mut Simulation,
        this: &Weak<RefCell<S>>,
        interval: SimulationTime,
        mut f: impl FnMut(&mut S, &mut Simulation) + 'static,
    ) -> Subscription {
        let this = Weak::clone(this);
        let host = self.host;
        let sub = sim.scheduler.repeat(interval, move |sim: &mut Simulation| {
            with_service(sim, host, &this, |s, sim| f(s, sim));
        });
        self.track(sub)
    }

    pub fn cancel_all(&mut self) {
        for sub in self.subs.drain(..) {
            sub.unsubscribe();
        }
    }

    /// The number of timers that may still fire.
    pub fn active(&self) -> usize {
        self.subs.iter().filter(|s| s.is_active()).count()
    }

    fn track(&mut self, sub: Subscription) -> Subscription {
        self.subs.retain(|s| s.is_active());
        self.subs.push(sub.clone());
        sub
    }
}

fn with_service<S: Service>(
    sim: &mut Simulation,
    host: Option<HostId>,
    this: &Weak<RefCell<S>>,
    f: impl FnOnce(&mut S, &mut Simulation),
) {
    let Some(service) = this.upgrade() else {
        return;
    };
    let Ok(mut service) = service.try_borrow_mut() else {
        log::warn!("Skipping a timer for a service that's already running");
        return;
    };
    let name = host
        .and_then(|h| sim.hosts.get(h))
        .map(|h| h.name().to_string());
    match name {
        Some(name) => logger::with_log_host(&name, || f(&mut service, sim)),
        None => f(&mut service, sim),
    }
}

impl Simulation {
    /// Enable a service on a host. If a service of the same type is already enabled, `service`
    /// is discarded and the existing one is returned.
    pub fn enable_service<S: Service>(
        &mut self,
        host: HostId,
        service: S,
    ) -> Result<Rc<RefCell<S>>, SimError> {
        if let Some(existing) = self.service::<S>(host) {
            return Ok(existing);
        }
        let h = self.hosts.get(host).ok_or(SimError::UnknownHost)?;
        let host_name = h.name().to_string();

        let interfaces = h
            .interfaces()
            .iter()
            .copied()
            .filter(|i| service.qualifies(self, *i))
            .collect();
        let name = service.name();
        let rc = Rc::new(RefCell::new(service));
        self.hosts[host].services.push(ServiceEntry {
            type_id: TypeId::of::<S>(),
            name,
            service: Rc::clone(&rc) as Rc<RefCell<dyn Service>>,
            any: Rc::clone(&rc) as Rc<dyn Any>,
            interfaces,
        });

        log::debug!("Enabling {name} on '{host_name}'");
        let this = Rc::downgrade(&rc);
        logger::with_log_host(&host_name, || rc.borrow_mut().attach(self, host, this));
        Ok(rc)
    }

    /// Disable a service, removing its registrations and cancelling its timers. Returns `false`
    /// if it wasn't enabled.
    pub fn disable_service<S: Service>(&mut self, host: HostId) -> bool {
        let Some(h) = self.hosts.get_mut(host) else {
            return false;
        };
        let Some(pos) = h
            .services
            .iter()
            .position(|s| s.type_id == TypeId::of::<S>())
        else {
            return false;
        };
        let entry = h.services.remove(pos);
        let host_name = h.name().to_string();
        log::debug!("Disabling {} on '{host_name}'", entry.name);
        logger::with_log_host(&host_name, || entry.service.borrow_mut().detach(self));
        true
    }

    pub(crate) fn disable_all_services(&mut self, host: HostId) {
        let Some(h) = self.hosts.get_mut(host) else {
            return;
        };
        let entries = std::mem::take(&mut h.services);
        let host_name = h.name().to_string();
        // most recently enabled first
        for entry in entries.into_iter().rev() {
            logger::with_log_host(&host_name, || entry.service.borrow_mut().detach(self));
        }
    }

    /// The service of type `S` enabled on `host`, if any.
    pub fn service<S: Service>(&self, host: HostId) -> Option<Rc<RefCell<S>>> {
        self.hosts
            .get(host)?
            .services
            .iter()
            .find(|s| s.type_id == TypeId::of::<S>())?
            .downcast::<S>()
    }

    /// Like [`Self::service`], but an error if the service isn't enabled.
    pub fn require_service<S: Service>(&self, host: HostId) -> Result<Rc<RefCell<S>>, SimError> {
        if !self.hosts.contains_key(host) {
            return Err(SimError::UnknownHost);
        }
        self.service::<S>(host)
            .ok_or(SimError::ServiceNotEnabled(std::any::type_name::<S>()))
    }

    pub(crate) fn register_interface_with_services(&mut self, iface: InterfaceId) {
        let Some(host) = self.interfaces.get(iface).map(|i| i.host) else {
            return;
        };
        let services: Vec<_> = self.hosts[host]
            .services
            .iter()
            .map(|s| Rc::clone(&s.service))
            .collect();
        let qualifying: Vec<bool> = services
            .iter()
            .map(|s| s.try_borrow().is_ok_and(|s| s.qualifies(self, iface)))
            .collect();
        let mut added = Vec::new();
        for ((entry, service), qualifies) in self.hosts[host]
            .services
            .iter_mut()
            .zip(services)
            .zip(qualifying)
        {
            if qualifies {
                entry.interfaces.insert(iface);
                added.push(service);
            }
        }

        let host_name = self.hosts[host].name().to_string();
        logger::with_log_host(&host_name, || {
            for service in added {
                match service.try_borrow_mut() {
                    Ok(mut s) => s.interface_added(self, iface),
                    Err(_) => log::warn!("Service is busy; not telling it about a new interface"),
                }
            }
        });
    }

    pub(crate) fn unregister_interface_from_services(&mut self, iface: InterfaceId) {
        let Some(host) = self.interfaces.get(iface).map(|i| i.host) else {
            return;
        };
        if let Some(h) = self.hosts.get_mut(host) {
            for entry in &mut h.services {
                entry.interfaces.remove(&iface);
            }
        }
    }

    /// The services registered on `iface`, in dispatch order.
    fn services_on(&self, iface: InterfaceId) -> Option<(String, Vec<Rc<RefCell<dyn Service>>>)> {
        let host = self.hosts.get(self.interfaces.get(iface)?.host)?;
        let services = host
            .services
            .iter()
            .filter(|s| s.interfaces.contains(&iface))
            .map(|s| Rc::clone(&s.service))
            .collect();
        Some((host.name().to_string(), services))
    }

    /// Offer a received packet to the services registered on `iface`.
    pub(crate) fn dispatch_packet(&mut self, iface: InterfaceId, packet: &PacketRc) {
        let Some((host_name, services)) = self.services_on(iface) else {
            return;
        };
        logger::with_log_host(&host_name, || {
            for service in services {
                let Ok(mut service) = service.try_borrow_mut() else {
                    log::warn!("Service is busy; not offering it {packet}");
                    continue;
                };
                match service.receive_packet(self, iface, packet) {
                    ServiceVerdict::Continue => {}
                    ServiceVerdict::Stop => break,
                    ServiceVerdict::Handled => {
                        packet.add_status(PacketStatus::ServiceHandled);
                        break;
                    }
                }
            }
        });
    }

    /// Tell the services registered on `iface` that its state changed. A service that's busy
    /// (it caused the change) is told once it has finished.
    pub(crate) fn notify_services_of_change(&mut self, iface: InterfaceId) {
        let Some((host_name, services)) = self.services_on(iface) else {
            return;
        };
        let Some(snapshot) = self.interface(iface) else {
            return;
        };
        logger::with_log_host(&host_name, || {
            for service in services {
                if let Ok(mut s) = service.try_borrow_mut() {
                    s.interface_changed(self, iface, &snapshot);
                    continue;
                }
                let service = Rc::downgrade(&service);
                self.scheduler
                    .once(SimulationTime::ZERO, move |sim: &mut Simulation| {
                        let (Some(service), Some(snapshot)) = (service.upgrade(), sim.interface(iface))
                        else {
                            return;
                        };
                        let Ok(mut s) = service.try_borrow_mut() else {
                            return;
                        };
                        let host = snapshot.host.clone();
                        logger::with_log_host(&host, || s.interface_changed(sim, iface, &snapshot));
                    });
            }
        });
    }

    pub(crate) fn service_reports(&self, host: HostId) -> BTreeMap<&'static str, serde_yaml::Value> {
        let Some(h) = self.hosts.get(host) else {
            return BTreeMap::new();
        };
        h.services
            .iter()
            .filter_map(|entry| {
                let service = entry.service.try_borrow().ok()?;
                Some((entry.name, service.report(self)?))
            })
            .collect()
    }
}
