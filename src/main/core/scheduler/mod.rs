//! The virtual-time scheduler that drives a simulation.
//!
//! Virtual time only moves when the scheduler is told to move it: either deterministically with
//! [`Scheduler::run_until`] / [`Scheduler::run_for`], or by reporting elapsed wall-clock time with
//! [`Scheduler::pump`], which is scaled by the scheduler's time multiplier. The scheduler never
//! sleeps or blocks.
//!
//! Callbacks receive the scheduler's *context* (for a full simulation this is the
//! [`Simulation`](crate::core::simulation::Simulation) itself), so a callback can mutate any
//! simulation state and schedule further callbacks.

mod wall_clock;

use std::cell::Cell;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::time::Duration;

use crate::core::logger;
use crate::core::support::emulated_time::EmulatedTime;
use crate::core::support::simulation_time::SimulationTime;
use crate::core::work::event::Event;
use crate::core::work::event_queue::EventQueue;
use crate::core::work::task::{Task, TaskRef};

pub use wall_clock::WallClock;

/// Gives the scheduler access to itself from the context that its callbacks run with.
pub trait SchedulerContext: Sized + 'static {
    fn scheduler(&mut self) -> &mut Scheduler<Self>;
}

/// Shared state between a [`Subscription`] and its queued event.
#[derive(Debug)]
pub struct SubscriptionState {
    id: u64,
    cancelled: Cell<bool>,
    finished: Cell<bool>,
    fire_count: Cell<u64>,
}

impl SubscriptionState {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            cancelled: Cell::new(false),
            finished: Cell::new(false),
            fire_count: Cell::new(0),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// A cancellation token for a scheduled callback, returned by [`Scheduler::once`] and
/// [`Scheduler::repeat`].
///
/// Dropping a `Subscription` does *not* cancel it. Clones refer to the same scheduled callback.
#[derive(Debug, Clone)]
pub struct Subscription {
    state: Rc<SubscriptionState>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Prevent any future firing. Safe to call any number of times, including after a one-shot
    /// callback has already fired.
    pub fn unsubscribe(&self) {
        if !self.state.cancelled.replace(true) {
            log::trace!("Unsubscribed timer {}", self.state.id);
        }
    }

    /// Whether the callback may still fire.
    pub fn is_active(&self) -> bool {
        !self.state.cancelled.get() && !self.state.finished.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    /// How many times the callback has been run.
    pub fn fire_count(&self) -> u64 {
        self.state.fire_count.get()
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for Subscription {}

/// A virtual-time event source with one-shot and repeating timers.
pub struct Scheduler<C> {
    queue: EventQueue<C>,
    now: EmulatedTime,
    next_seq: u64,
    multiplier: f64,
    // sub-nanosecond remainder of scaled wall-clock time that hasn't been applied yet
    carry_nanos: f64,
    running: bool,
    events_executed: u64,
    callbacks_panicked: u64,
}

impl<C: 'static> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            queue: EventQueue::new(),
            now: EmulatedTime::SIMULATION_START,
            next_seq: 0,
            multiplier: 1.0,
            carry_nanos: 0.0,
            running: false,
            events_executed: 0,
            callbacks_panicked: 0,
        }
    }

    /// The current virtual time.
    pub fn current_time(&self) -> EmulatedTime {
        self.now
    }

    /// The virtual time elapsed since the simulation started.
    pub fn elapsed(&self) -> SimulationTime {
        self.now.to_abs_simtime()
    }

    /// How many simulated seconds pass per wall-clock second.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Set how many simulated seconds pass per wall-clock second. A multiplier of 0 pauses the
    /// simulation. Panics if the multiplier is negative or not finite.
    pub fn set_multiplier(&mut self, multiplier: f64) {
        assert!(
            multiplier.is_finite() && multiplier >= 0.0,
            "Invalid time multiplier {multiplier}"
        );
        self.multiplier = multiplier;
        self.carry_nanos = 0.0;
    }

    /// The wall-clock time that corresponds to `delay` of simulated time at the current
    /// multiplier. Returns [`Duration::MAX`] while the simulation is paused.
    pub fn wall_delay(&self, delay: SimulationTime) -> Duration {
        if self.multiplier == 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(delay.as_secs_f64() / self.multiplier).unwrap_or(Duration::MAX)
    }

    /// Run `f` once, `delay` after the current virtual time.
    pub fn once(&mut self, delay: SimulationTime, f: impl FnOnce(&mut C) + 'static) -> Subscription {
        let state = self.new_subscription_state();
        let time = self.now.saturating_add(delay);
        self.push(Task::Once(Box::new(f)), time, Rc::clone(&state));
        log::trace!("Scheduled timer {} at {time}", state.id);
        Subscription { state }
    }

    /// Run `f` every `interval`, starting `interval` after the current virtual time, until the
    /// returned subscription is cancelled. Panics if `interval` is zero.
    pub fn repeat(
        &mut self,
        interval: SimulationTime,
        f: impl FnMut(&mut C) + 'static,
    ) -> Subscription {
        assert!(interval.is_positive(), "Repeating timers need a non-zero interval");
        let state = self.new_subscription_state();
        let time = self.now.saturating_add(interval);
        let task = Task::Repeat {
            task: TaskRef::new(f),
            interval,
        };
        self.push(task, time, Rc::clone(&state));
        log::trace!("Scheduled repeating timer {} every {interval}", state.id);
        Subscription { state }
    }

    /// The number of scheduled firings that have not been cancelled.
    pub fn pending(&self) -> usize {
        self.queue
            .iter()
            .filter(|e| !e.subscription().is_cancelled())
            .count()
    }

    /// The due time of the earliest firing that has not been cancelled.
    pub fn next_event_time(&self) -> Option<EmulatedTime> {
        self.queue
            .iter()
            .filter(|e| !e.subscription().is_cancelled())
            .map(|e| e.time())
            .min()
    }

    /// The total number of callbacks run so far.
    pub fn events_executed(&self) -> u64 {
        self.events_executed
    }

    /// The number of callbacks that panicked. Their panics were contained.
    pub fn callbacks_panicked(&self) -> u64 {
        self.callbacks_panicked
    }

    fn new_subscription_state(&mut self) -> Rc<SubscriptionState> {
        Rc::new(SubscriptionState::new(self.next_seq))
    }

    fn push(&mut self, task: Task<C>, time: EmulatedTime, state: Rc<SubscriptionState>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Event::new(task, time, seq, state));
    }

    /// Queue the next firing of a repeating timer. It keeps the sequence number it was
    /// registered with, so ties are still broken by registration order.
    fn rearm(
        &mut self,
        task: Task<C>,
        time: EmulatedTime,
        seq: u64,
        state: Rc<SubscriptionState>,
    ) {
        self.queue.push(Event::new(task, time, seq, state));
    }

    /// Pop the next event due no later than `until`, discarding cancelled events along the way.
    fn pop_live(&mut self, until: EmulatedTime) -> Option<Event<C>> {
        while let Some(event) = self.queue.pop_due(until) {
            if event.subscription().is_cancelled() {
                event.subscription().finished.set(true);
                continue;
            }
            return Some(event);
        }
        None
    }

    fn set_now(&mut self, time: EmulatedTime) {
        debug_assert!(time >= self.now);
        self.now = time;
        logger::set_log_time(Some(time));
    }
}

impl<C: SchedulerContext> Scheduler<C> {
    /// Run every callback due at or before `until`, in due-time order (registration order for
    /// ties), then leave the clock at `until`. Returns the number of callbacks run.
    ///
    /// Calls made from inside a running callback are ignored.
    pub fn run_until(ctx: &mut C, until: EmulatedTime) -> u64 {
        {
            let scheduler = ctx.scheduler();
            if scheduler.running {
                log::warn!("Ignoring a request to advance time from inside a scheduled callback");
                return 0;
            }
            scheduler.running = true;
        }

        let mut count = 0;
        while let Some(event) = ctx.scheduler().pop_live(until) {
            let (task, time, seq, state) = event.into_parts();
            ctx.scheduler().set_now(time);
            state.fire_count.set(state.fire_count.get() + 1);

            let result = match task {
                Task::Once(f) => {
                    state.finished.set(true);
                    std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx)))
                }
                Task::Repeat { task, interval } => {
                    // re-arm before running so that the callback can cancel itself
                    let next = Task::Repeat {
                        task: task.clone(),
                        interval,
                    };
                    ctx.scheduler()
                        .rearm(next, time.saturating_add(interval), seq, Rc::clone(&state));
                    std::panic::catch_unwind(AssertUnwindSafe(|| task.execute(ctx)))
                }
            };

            count += 1;
            if let Err(e) = result {
                let msg = e
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| e.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic>".to_string());
                log::error!("Timer {} panicked at {time}: {msg}", state.id);
                ctx.scheduler().callbacks_panicked += 1;
            }
        }

        let scheduler = ctx.scheduler();
        if until > scheduler.now {
            scheduler.set_now(until);
        }
        scheduler.events_executed += count;
        scheduler.running = false;
        count
    }

    /// Advance virtual time by `duration`. See [`Self::run_until`].
    pub fn run_for(ctx: &mut C, duration: SimulationTime) -> u64 {
        let until = ctx.scheduler().now.saturating_add(duration);
        Self::run_until(ctx, until)
    }

    /// Report that `wall_elapsed` of real time has passed. Virtual time advances by
    /// `wall_elapsed * multiplier`.
    pub fn pump(ctx: &mut C, wall_elapsed: Duration) -> u64 {
        let scheduler = ctx.scheduler();
        let nanos = wall_elapsed.as_nanos() as f64 * scheduler.multiplier + scheduler.carry_nanos;
        let whole = nanos.floor();
        scheduler.carry_nanos = nanos - whole;
        // float-to-int casts saturate
        let delta = SimulationTime::from_nanos(whole as u64);
        Self::run_for(ctx, delta)
    }
}

impl<C: 'static> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal context that records which callbacks ran, and when.
    struct Recorder {
        scheduler: Scheduler<Recorder>,
        fired: Vec<(&'static str, u64)>,
    }

    impl Recorder {
        fn new() -> Self {
            Self {
                scheduler: Scheduler::new(),
                fired: Vec::new(),
            }
        }

        fn record(&mut self, name: &'static str) {
            let now = self.scheduler.elapsed().as_secs();
            self.fired.push((name, now));
        }

        fn at(&self, name: &str) -> Vec<u64> {
            self.fired
                .iter()
                .filter(|(n, _)| *n == name)
                .map(|(_, t)| *t)
                .collect()
        }
    }

    impl SchedulerContext for Recorder {
        fn scheduler(&mut self) -> &mut Scheduler<Self> {
            &mut self.scheduler
        }
    }

    fn secs(s: u64) -> SimulationTime {
        SimulationTime::from_secs(s)
    }

    #[test]
    fn test_once_fires_exactly_once() {
        let mut ctx = Recorder::new();
        let sub = ctx.scheduler.once(secs(5), |c| c.record("once"));

        Scheduler::run_for(&mut ctx, secs(4));
        assert!(ctx.at("once").is_empty());
        assert!(sub.is_active());

        Scheduler::run_for(&mut ctx, secs(10));
        assert_eq!(ctx.at("once"), [5]);
        assert_eq!(sub.fire_count(), 1);
        assert!(!sub.is_active());

        // unsubscribing after firing is harmless
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(ctx.at("once"), [5]);
    }

    #[test]
    fn test_repeat_until_unsubscribed() {
        let mut ctx = Recorder::new();
        let sub = ctx.scheduler.repeat(secs(2), |c| c.record("repeat"));

        Scheduler::run_for(&mut ctx, secs(7));
        assert_eq!(ctx.at("repeat"), [2, 4, 6]);

        sub.unsubscribe();
        Scheduler::run_for(&mut ctx, secs(10));
        assert_eq!(ctx.at("repeat"), [2, 4, 6]);
        assert_eq!(ctx.scheduler.pending(), 0);
    }

    #[test]
    fn test_unsubscribe_before_due() {
        let mut ctx = Recorder::new();
        let sub = ctx.scheduler.once(secs(5), |c| c.record("once"));
        sub.unsubscribe();
        Scheduler::run_for(&mut ctx, secs(10));
        assert!(ctx.at("once").is_empty());
        assert_eq!(sub.fire_count(), 0);
    }

    #[test]
    fn test_fifo_for_equal_due_times() {
        let mut ctx = Recorder::new();
        ctx.scheduler.once(secs(3), |c| c.record("a"));
        ctx.scheduler.once(secs(3), |c| c.record("b"));
        ctx.scheduler.once(secs(1), |c| c.record("c"));
        ctx.scheduler.once(secs(3), |c| c.record("d"));

        Scheduler::run_for(&mut ctx, secs(3));
        let names: Vec<_> = ctx.fired.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, ["c", "a", "b", "d"]);
    }

    #[test]
    fn test_repeating_timers_keep_registration_order() {
        let mut ctx = Recorder::new();
        ctx.scheduler.repeat(secs(2), |c| c.record("every-2"));
        ctx.scheduler.repeat(secs(1), |c| c.record("every-1"));
        ctx.scheduler.once(secs(4), |c| c.record("once"));

        Scheduler::run_for(&mut ctx, secs(4));
        let names: Vec<_> = ctx.fired.iter().map(|(n, _)| *n).collect();
        // at 4 s both repeating timers were re-armed after "once" was registered, but they
        // were registered before it
        assert_eq!(
            names,
            ["every-1", "every-2", "every-1", "every-1", "every-2", "every-1", "once"]
        );
    }

    #[test]
    fn test_callback_can_schedule_and_cancel() {
        let mut ctx = Recorder::new();
        ctx.scheduler.once(secs(1), |c| {
            c.record("outer");
            c.scheduler.once(secs(1), |c| c.record("inner"));
        });

        // a repeating timer that cancels itself on its second run
        let sub: Rc<Cell<Option<Subscription>>> = Rc::new(Cell::new(None));
        let sub_clone = Rc::clone(&sub);
        let mut runs = 0;
        let repeating = ctx.scheduler.repeat(secs(1), move |c| {
            runs += 1;
            c.record("self-cancel");
            if runs == 2 {
                if let Some(s) = sub_clone.take() {
                    s.unsubscribe();
                }
            }
        });
        sub.set(Some(repeating));

        Scheduler::run_for(&mut ctx, secs(5));
        assert_eq!(ctx.at("outer"), [1]);
        assert_eq!(ctx.at("inner"), [2]);
        assert_eq!(ctx.at("self-cancel"), [1, 2]);
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let mut ctx = Recorder::new();
        ctx.scheduler.once(secs(1), |_| panic!("boom"));
        ctx.scheduler.once(secs(1), |c| c.record("after"));
        ctx.scheduler.repeat(secs(1), |c| c.record("repeat"));

        Scheduler::run_for(&mut ctx, secs(3));
        assert_eq!(ctx.at("after"), [1]);
        assert_eq!(ctx.at("repeat"), [1, 2, 3]);
        assert_eq!(ctx.scheduler.callbacks_panicked(), 1);
    }

    #[test]
    fn test_pump_scales_by_multiplier() {
        let mut ctx = Recorder::new();
        ctx.scheduler.set_multiplier(10.0);
        ctx.scheduler.once(secs(5), |c| c.record("once"));

        Scheduler::pump(&mut ctx, Duration::from_millis(400));
        assert_eq!(ctx.scheduler.elapsed(), secs(4));
        assert!(ctx.at("once").is_empty());

        Scheduler::pump(&mut ctx, Duration::from_millis(100));
        assert_eq!(ctx.at("once"), [5]);

        assert_eq!(ctx.scheduler.wall_delay(secs(10)), Duration::from_secs(1));

        ctx.scheduler.set_multiplier(0.0);
        Scheduler::pump(&mut ctx, Duration::from_secs(100));
        assert_eq!(ctx.scheduler.elapsed(), secs(5));
        assert_eq!(ctx.scheduler.wall_delay(secs(1)), Duration::MAX);
    }

    #[test]
    fn test_next_event_time_skips_cancelled() {
        let mut ctx = Recorder::new();
        let early = ctx.scheduler.once(secs(1), |_| {});
        ctx.scheduler.once(secs(4), |_| {});
        early.unsubscribe();
        assert_eq!(
            ctx.scheduler.next_event_time(),
            Some(EmulatedTime::SIMULATION_START + secs(4))
        );
        assert_eq!(ctx.scheduler.pending(), 1);
    }
}
