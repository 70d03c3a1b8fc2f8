//! Observer hook for scheduler events
//!
//! Purely diagnostic: the scheduler behaves the same with or without one.
//! Callbacks run with the table unlocked, so they may query the scheduler,
//! but they must not call [`Loom::yield_now`](crate::Loom::yield_now) or
//! [`Loom::spawn`](crate::Loom::spawn): `switched` in particular fires
//! between the bookkeeping and the actual register switch.

use crate::thread::{Priority, ThreadId};

pub trait LoomObserver {
    /// A thread was placed in `thread`'s slot. `admission` is set under FIFO.
    fn spawned(&self, _thread: ThreadId, _priority: Priority, _admission: Option<u64>) {}

    /// `thread` received a new FIFO admission stamp after being resumed
    fn admitted(&self, _thread: ThreadId, _admission: u64) {}

    /// Control is about to pass from `from` to `to`
    fn switched(&self, _from: ThreadId, _to: ThreadId) {}

    /// `thread` finished and its slot is Unused again
    fn exited(&self, _thread: ThreadId) {}
}
