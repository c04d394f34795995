use std::cell::RefCell;
use std::rc::Rc;

/// A shared, re-runnable callback. Repeating timers keep one of these alive across firings, so
/// the closure's captured state persists between runs.
pub struct TaskRef<C> {
    inner: Rc<RefCell<dyn FnMut(&mut C)>>,
}

impl<C> TaskRef<C> {
    pub fn new<T: 'static + FnMut(&mut C)>(f: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(f)),
        }
    }

    /// Run the task. Panics if the task is already running further up the stack.
    pub fn execute(&self, ctx: &mut C) {
        let mut inner = self.inner.borrow_mut();
        inner(ctx)
    }
}

impl<C> Clone for TaskRef<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C> PartialEq for TaskRef<C> {
    /// Two `TaskRef`s are equal if they point to the same task object.
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<C> Eq for TaskRef<C> {}

impl<C> std::fmt::Debug for TaskRef<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRef")
            .field("inner", &Rc::as_ptr(&self.inner).cast::<()>())
            .finish()
    }
}

/// What an [`Event`](super::event::Event) runs when it comes due.
pub enum Task<C> {
    /// Runs a single time and is consumed.
    Once(Box<dyn FnOnce(&mut C)>),
    /// Runs every `interval` until its subscription is cancelled.
    Repeat {
        task: TaskRef<C>,
        interval: crate::core::support::simulation_time::SimulationTime,
    },
}

impl<C> std::fmt::Debug for Task<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Once(_) => write!(f, "Once"),
            Self::Repeat { task, interval } => f
                .debug_struct("Repeat")
                .field("task", task)
                .field("interval", interval)
                .finish(),
        }
    }
}
