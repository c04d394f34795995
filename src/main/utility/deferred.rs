//! A single-threaded result that becomes available later in simulated time.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

enum State<T> {
    Pending(Vec<Box<dyn FnOnce(&T)>>),
    Resolved(T),
}

/// The eventual result of an asynchronous protocol operation (an address resolution, a lease
/// negotiation). Clones observe the same result.
pub struct Deferred<T> {
    state: Rc<RefCell<State<T>>>,
}

/// The producing side of a [`Deferred`]. Only the first resolution counts.
pub struct Resolver<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T: Clone + 'static> Deferred<T> {
    pub fn pending() -> (Self, Resolver<T>) {
        let state = Rc::new(RefCell::new(State::Pending(Vec::new())));
        let resolver = Resolver {
            state: Rc::clone(&state),
        };
        (Self { state }, resolver)
    }

    pub fn resolved(value: T) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Resolved(value))),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.borrow(), State::Resolved(_))
    }

    /// The result, if it's available yet.
    pub fn value(&self) -> Option<T> {
        match &*self.state.borrow() {
            State::Resolved(x) => Some(x.clone()),
            State::Pending(_) => None,
        }
    }

    /// Run `f` with the result once it's available, or immediately if it already is.
    pub fn on_resolve(&self, f: impl FnOnce(&T) + 'static) {
        let mut state = self.state.borrow_mut();
        match &mut *state {
            State::Pending(callbacks) => callbacks.push(Box::new(f)),
            State::Resolved(x) => {
                let x = x.clone();
                drop(state);
                f(&x);
            }
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    /// Publish the result. Returns `false` if it had already been resolved.
    pub fn resolve(&self, value: T) -> bool {
        let callbacks = {
            let mut state = self.state.borrow_mut();
            match std::mem::replace(&mut *state, State::Resolved(value.clone())) {
                State::Pending(callbacks) => callbacks,
                earlier @ State::Resolved(_) => {
                    *state = earlier;
                    return false;
                }
            }
        };
        // run outside the borrow so that callbacks can inspect the result
        for f in callbacks {
            f(&value);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.state.borrow(), State::Resolved(_))
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            State::Resolved(x) => f.debug_tuple("Deferred::Resolved").field(x).finish(),
            State::Pending(cbs) => write!(f, "Deferred::Pending({} waiting)", cbs.len()),
        }
    }
}
