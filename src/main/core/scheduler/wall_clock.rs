use std::time::{Duration, Instant};

use super::{Scheduler, SchedulerContext};

/// Feeds real elapsed time into a [`Scheduler`], for running a simulation paced against the wall
/// clock rather than fast-forwarded.
#[derive(Debug)]
pub struct WallClock {
    last_tick: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
        }
    }

    /// Pump the wall-clock time elapsed since the previous tick (or since creation) into the
    /// context's scheduler. Returns the number of callbacks run.
    pub fn tick<C: SchedulerContext>(&mut self, ctx: &mut C) -> u64 {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        Scheduler::pump(ctx, elapsed)
    }

    /// How long to sleep before the scheduler's next callback is due, capped at `max`.
    pub fn time_until_next_event<C: 'static>(&self, scheduler: &Scheduler<C>, max: Duration) -> Duration {
        let Some(next) = scheduler.next_event_time() else {
            return max;
        };
        let sim_delay = next.saturating_duration_since(&scheduler.current_time());
        let wall = scheduler.wall_delay(sim_delay);
        let already_elapsed = self.last_tick.elapsed();
        wall.saturating_sub(already_elapsed).min(max)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}
