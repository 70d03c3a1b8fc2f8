//! # Spindle - cooperative user-space threads
//!
//! A scheduler that runs many lightweight threads on one OS thread.
//! Threads are never preempted; each runs until it calls
//! [`Loom::yield_now`] or returns from its entry function.
//!
//! ## Architecture
//! - A fixed table of thread slots: `Unused`, `Ready`, `Running`
//! - Slot 0 is the bootstrap thread, the OS thread that built the [`Loom`]
//! - Three interchangeable [`Policy`] orderings: strict priority, FIFO
//!   admission order, round-robin
//! - A minimal context switch (stack pointer plus callee-saved registers)
//! - Spawned threads clean up after themselves: returning from the entry
//!   function frees the slot
//!
//! ```no_run
//! use spindle::{Loom, Policy, Priority};
//!
//! let loom = Loom::with_policy(Policy::Priority)?;
//! for p in [1, 10, 80] {
//!     loom.spawn(move |loom| {
//!         for i in 0..3 {
//!             println!("priority {p} step {i}");
//!             loom.yield_now();
//!         }
//!     }, Priority::new(p)?)?;
//! }
//! loom.exit(0);
//! # Ok::<(), spindle::LoomError>(())
//! ```

/// Abort on a broken scheduler invariant
///
/// These are never ordinary runtime conditions: continuing would resume
/// garbage registers.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::abort_with(format_args!($($arg)*))
    };
}
pub(crate) use fatal;

pub mod config;
pub mod context;
pub mod observer;
pub mod policy;
pub mod scheduler;
pub mod stack;
pub mod thread;

pub use config::LoomConfig;
pub use observer::LoomObserver;
pub use policy::Policy;
pub use scheduler::{Loom, LoomStats, ThreadDebugInfo};
pub use thread::{Priority, ThreadId, ThreadState};

use thiserror::Error;

/// Recoverable scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoomError {
    /// Every slot in the thread table is occupied
    #[error("thread table is full")]
    ResourceExhausted,

    /// The allocator could not provide a thread stack
    #[error("could not allocate a {size}-byte thread stack")]
    AllocationFailed { size: usize },

    #[error("priority {0} is outside 1..=99")]
    InvalidPriority(u8),

    #[error("thread table capacity {0} is outside 1..={max}", max = config::MAX_CAPACITY)]
    InvalidCapacity(usize),

    /// The operation belongs to the bootstrap thread
    #[error("only the bootstrap thread may do this")]
    NotBootstrap,
}

#[cold]
#[inline(never)]
pub(crate) fn abort_with(args: std::fmt::Arguments<'_>) -> ! {
    if log::log_enabled!(log::Level::Error) {
        log::error!("[FATAL] {args}");
    } else {
        eprintln!("spindle: [FATAL] {args}");
    }
    std::process::abort()
}
