use std::cmp::Reverse;
use std::collections::binary_heap::BinaryHeap;

use crate::core::support::emulated_time::EmulatedTime;

use super::event::Event;

/// A queue of [`Event`]s ordered by their times, and by registration order for events due at the
/// same time.
#[derive(Debug)]
pub struct EventQueue<C> {
    queue: BinaryHeap<Reverse<Event<C>>>,
    last_popped_event_time: EmulatedTime,
}

impl<C> EventQueue<C> {
    pub fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            last_popped_event_time: EmulatedTime::SIMULATION_START,
        }
    }

    /// Push a new [`Event`] on to the queue.
    ///
    /// Will panic if the event time is earlier than the last popped event time (time moves
    /// backward).
    pub fn push(&mut self, event: Event<C>) {
        // make sure time never moves backward
        assert!(event.time() >= self.last_popped_event_time);

        self.queue.push(Reverse(event));
    }

    /// Pop the earliest [`Event`] from the queue.
    pub fn pop(&mut self) -> Option<Event<C>> {
        let event = self.queue.pop().map(|x| x.0);

        // make sure time never moves backward
        if let Some(ref event) = event {
            assert!(event.time() >= self.last_popped_event_time);
            self.last_popped_event_time = event.time();
        }

        event
    }

    /// Pop the earliest [`Event`] if it is due at or before `until`.
    pub fn pop_due(&mut self, until: EmulatedTime) -> Option<Event<C>> {
        if self.next_event_time()? > until {
            return None;
        }
        self.pop()
    }

    /// The time of the next [`Event`] (the time of the earliest event in the queue).
    pub fn next_event_time(&self) -> Option<EmulatedTime> {
        self.queue.peek().map(|x| x.0.time())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Iterate over the queued events in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Event<C>> {
        self.queue.iter().map(|x| &x.0)
    }

    /// Drop every queued event for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&Event<C>) -> bool) {
        self.queue.retain(|x| keep(&x.0));
    }
}

impl<C> Default for EventQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}
