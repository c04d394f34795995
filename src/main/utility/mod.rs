// defines macros, so must be included first
#[macro_use]
pub mod macros;

pub mod callback_queue;
pub mod counter;
pub mod deferred;
pub mod time;
pub mod units;
