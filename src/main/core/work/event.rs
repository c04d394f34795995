use std::rc::Rc;

use crate::core::scheduler::SubscriptionState;
use crate::core::support::emulated_time::EmulatedTime;

use super::task::Task;

/// A task that is due at some point in simulated time.
#[derive(Debug)]
pub struct Event<C> {
    task: Task<C>,
    time: EmulatedTime,
    // registration order, used to break ties between events due at the same time
    seq: u64,
    subscription: Rc<SubscriptionState>,
}

impl<C> Event<C> {
    pub fn new(
        task: Task<C>,
        time: EmulatedTime,
        seq: u64,
        subscription: Rc<SubscriptionState>,
    ) -> Self {
        Self {
            task,
            time,
            seq,
            subscription,
        }
    }

    pub fn time(&self) -> EmulatedTime {
        self.time
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn subscription(&self) -> &Rc<SubscriptionState> {
        &self.subscription
    }

    pub fn into_parts(self) -> (Task<C>, EmulatedTime, u64, Rc<SubscriptionState>) {
        (self.task, self.time, self.seq, self.subscription)
    }
}

impl<C> PartialEq for Event<C> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl<C> Eq for Event<C> {}

impl<C> PartialOrd for Event<C> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Event<C> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // sort by event time first, then by the order in which the events were registered; a
        // subscription has at most one queued event, so the order is total
        self.time
            .cmp(&other.time)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}
