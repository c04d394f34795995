//! Observer lists with drop-to-unsubscribe handles.
//!
//! Notifying an [`EventSource`] doesn't call its listeners directly. The calls are queued on a
//! [`CallbackQueue`] and run once the notifier has finished, so a listener that triggers another
//! notification (or drops its own handle) never runs while the source is borrowed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::num::Wrapping;
use std::rc::{Rc, Weak};

/// A queue of callbacks which, when run, can add further callbacks to the queue.
#[allow(clippy::type_complexity)]
pub struct CallbackQueue(VecDeque<Box<dyn FnOnce(&mut Self)>>);

impl CallbackQueue {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, f: impl FnOnce(&mut Self) + 'static) {
        self.0.push_back(Box::new(f));
    }

    /// Run all queued callbacks, including any queued while running.
    pub fn run(&mut self) {
        let mut count = 0;
        while let Some(f) = self.0.pop_front() {
            (f)(self);

            count += 1;
            if count == 10_000 {
                log::trace!("Possible infinite loop of observer callbacks.");
            } else if count == 10_000_000 {
                log::warn!("Very likely an infinite loop of observer callbacks.");
            }
        }
    }

    /// Create a queue, let `f` add callbacks to it, and run them all before returning.
    pub fn queue_and_run<F, U>(f: F) -> U
    where
        F: FnOnce(&mut Self) -> U,
    {
        let mut cb_queue = Self::new();
        let rv = (f)(&mut cb_queue);
        cb_queue.run();
        rv
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallbackQueue {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        if !self.is_empty() {
            debug_panic!("Dropping a CallbackQueue with {} callbacks pending.", self.len());
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct HandleId(u32);

/// Keeps a listener subscribed. The listener receives events until the handle is dropped or
/// [`stop_listening()`](Self::stop_listening) is called.
#[must_use = "Stops listening when the handle is dropped"]
pub struct Handle<T> {
    id: HandleId,
    source: Weak<RefCell<EventSourceInner<T>>>,
}

impl<T> Handle<T> {
    /// Equivalent to dropping the handle.
    pub fn stop_listening(self) {}

    /// Whether the event source still exists.
    pub fn is_connected(&self) -> bool {
        self.source.strong_count() > 0
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        if let Some(x) = self.source.upgrade() {
            // the listener list may be mid-iteration if a notification is being queued
            if let Ok(mut inner) = x.try_borrow_mut() {
                inner.remove_listener(self.id);
            } else {
                log::debug!("Listener {:?} dropped while its source was busy", self.id);
            }
        }
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

type Listener<T> = Rc<dyn Fn(&T, &mut CallbackQueue)>;

/// Emits events to subscribed listeners.
pub struct EventSource<T> {
    inner: Rc<RefCell<EventSourceInner<T>>>,
}

impl<T: Clone + 'static> EventSource<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(EventSourceInner::new())),
        }
    }

    pub fn add_listener(&mut self, notify_fn: impl Fn(&T, &mut CallbackQueue) + 'static) -> Handle<T> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.get_unused_id();
        inner.listeners.push((id, Rc::new(notify_fn)));
        Handle {
            id,
            source: Rc::downgrade(&self.inner),
        }
    }

    pub fn num_listeners(&self) -> usize {
        self.inner.borrow().listeners.len()
    }

    /// Queue a call of every current listener with its own copy of `message`.
    pub fn notify_listeners(&self, message: T, cb_queue: &mut CallbackQueue) {
        for (_, l) in &self.inner.borrow().listeners {
            let l = Rc::clone(l);
            let message = message.clone();
            cb_queue.add(move |cb_queue| (l)(&message, cb_queue));
        }
    }
}

impl<T: Clone + 'static> Default for EventSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct EventSourceInner<T> {
    listeners: Vec<(HandleId, Listener<T>)>,
    next_id: Wrapping<u32>,
}

impl<T> EventSourceInner<T> {
    fn new() -> Self {
        Self {
            listeners: Vec::new(),
            next_id: Wrapping(0),
        }
    }

    fn get_unused_id(&mut self) -> HandleId {
        loop {
            let id = HandleId(self.next_id.0);
            self.next_id += Wrapping(1);

            if !self.listeners.iter().any(|x| x.0 == id) {
                break id;
            }
        }
    }

    fn remove_listener(&mut self, id: HandleId) {
        self.listeners.retain(|x| x.0 != id);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_listener_until_handle_dropped() {
        let counter = Rc::new(Cell::new(0u32));
        let counter_clone = Rc::clone(&counter);

        let mut source = EventSource::new();
        let handle = source.add_listener(move |inc: &u32, _| {
            counter_clone.set(counter_clone.get() + inc);
        });
        assert_eq!(source.num_listeners(), 1);

        CallbackQueue::queue_and_run(|queue| source.notify_listeners(1, queue));
        CallbackQueue::queue_and_run(|queue| source.notify_listeners(3, queue));

        handle.stop_listening();
        assert_eq!(source.num_listeners(), 0);

        CallbackQueue::queue_and_run(|queue| source.notify_listeners(5, queue));
        assert_eq!(counter.get(), 4);
    }

    #[test]
    fn test_listener_can_queue_more_callbacks() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = Rc::clone(&log);

        let mut source = EventSource::new();
        let _handle = source.add_listener(move |msg: &String, queue| {
            log_clone.borrow_mut().push(msg.clone());
            let log_clone = Rc::clone(&log_clone);
            queue.add(move |_| log_clone.borrow_mut().push("follow-up".to_string()));
        });

        CallbackQueue::queue_and_run(|queue| source.notify_listeners("first".to_string(), queue));
        assert_eq!(*log.borrow(), ["first", "follow-up"]);
    }

    #[test]
    fn test_handle_outlives_source() {
        let mut source = EventSource::<u32>::new();
        let handle = source.add_listener(|_, _| {});
        assert!(handle.is_connected());
        drop(source);
        assert!(!handle.is_connected());
        drop(handle);
    }
}
