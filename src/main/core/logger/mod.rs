pub mod sim_logger;

use std::cell::{Cell, RefCell};

use crate::core::support::emulated_time::EmulatedTime;

// The simulation context that log records are stamped with. The scheduler publishes the virtual
// time as it advances and the simulation publishes the host whose code is running.
thread_local! {
    static LOG_TIME: Cell<Option<EmulatedTime>> = const { Cell::new(None) };
    static LOG_HOST: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn set_log_time(time: Option<EmulatedTime>) {
    LOG_TIME.with(|t| t.set(time));
}

pub fn log_time() -> Option<EmulatedTime> {
    LOG_TIME.try_with(|t| t.get()).ok().flatten()
}

/// Run `f` with `host` as the host that log records are attributed to.
pub fn with_log_host<U>(host: &str, f: impl FnOnce() -> U) -> U {
    let prev = LOG_HOST.with(|h| h.replace(Some(host.to_string())));
    let rv = f();
    LOG_HOST.with(|h| *h.borrow_mut() = prev);
    rv
}

pub fn log_host() -> Option<String> {
    LOG_HOST.try_with(|h| h.borrow().clone()).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::support::simulation_time::SimulationTime;

    #[test]
    fn test_log_context() {
        let t = EmulatedTime::from_abs_simtime(SimulationTime::from_secs(2));
        set_log_time(Some(t));
        assert_eq!(log_time(), Some(t));
        set_log_time(None);
        assert_eq!(log_time(), None);

        assert_eq!(log_host(), None);
        let inner = with_log_host("r1", || {
            with_log_host("r2", log_host);
            log_host()
        });
        assert_eq!(inner.as_deref(), Some("r1"));
        assert_eq!(log_host(), None);
    }
}
