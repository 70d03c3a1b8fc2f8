//! The Scheduler - the core of the Loom
//!
//! Every state transition of every slot happens here:
//!
//! ```text
//! Unused --spawn--> Ready --selected--> Running --yield--> Ready ...
//!                                          \--entry returns--> Unused
//! ```
//!
//! The table sits behind a lock that is never held across a switch. A
//! yield takes the lock, does all of the bookkeeping, copies out the two
//! context pointers, drops the lock and only then switches. The lock is
//! acquired with `try_lock`: with a single flow of control, finding it
//! taken means a guard leaked across a switch.

use std::any::Any;
use std::cell::UnsafeCell;
use std::marker::{PhantomData, PhantomPinned};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::time::{Duration, Instant};

use spin::{Mutex, MutexGuard};

use crate::config::LoomConfig;
use crate::context::{switch_context, Context};
use crate::observer::LoomObserver;
use crate::policy::{ready_queue_for, Policy, ReadyQueue};
use crate::stack::Stack;
use crate::thread::{Priority, Thread, ThreadId, ThreadState};
use crate::{fatal, LoomError};

const BOOTSTRAP_SLOT: usize = 0;

/// A cooperative scheduler for one OS thread
///
/// Created with [`Loom::new`], which turns the calling OS thread into the
/// bootstrap thread (slot 0). The scheduler is pinned because spawned
/// threads hold its address, and it is neither `Send` nor `Sync`: all of
/// its threads share the one OS thread that created it.
pub struct Loom {
    tapestry: Mutex<Tapestry>,
    /// Saved registers, one per slot. Only the context switch reads or
    /// writes them, and never while the table is locked.
    contexts: Box<[UnsafeCell<Context>]>,
    config: LoomConfig,
    observer: Option<Box<dyn LoomObserver>>,
    _pinned: PhantomPinned,
    _local: PhantomData<*const ()>,
}

/// The thread table and process-wide scheduling state
struct Tapestry {
    threads: Vec<Thread>,
    ready: Box<dyn ReadyQueue>,
    current: usize,
    /// Last FIFO admission stamp handed out
    admissions: u64,
    context_switches: u64,
    spawns: u64,
    stacks_allocated: u64,
}

impl Tapestry {
    fn new(config: &LoomConfig) -> Self {
        let mut threads: Vec<Thread> = (0..config.capacity).map(|_| Thread::unused()).collect();
        threads[BOOTSTRAP_SLOT] = Thread::bootstrap();

        let mut tapestry = Self {
            threads,
            ready: ready_queue_for(config.policy),
            current: BOOTSTRAP_SLOT,
            admissions: 0,
            context_switches: 0,
            spawns: 0,
            stacks_allocated: 0,
        };

        // The bootstrap thread is the first one admitted.
        if config.policy == Policy::Fifo {
            let admission = tapestry.next_admission();
            tapestry.threads[BOOTSTRAP_SLOT].admission = Some(admission);
        }

        tapestry
    }

    fn next_admission(&mut self) -> u64 {
        self.admissions += 1;
        self.admissions
    }

    fn count(&self, state: ThreadState) -> usize {
        self.threads.iter().filter(|t| t.state() == state).count()
    }

    fn slot(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id.slot())
    }
}

/// Statistics about the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoomStats {
    pub capacity: usize,
    pub unused: usize,
    pub ready: usize,
    pub running: usize,
    pub spawns: u64,
    pub context_switches: u64,
    /// FIFO admission stamps handed out (always 0 under other policies)
    pub admissions: u64,
    /// Stacks allocated; spawns beyond this reused a pooled stack
    pub stacks_allocated: u64,
}

/// Thread debug information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadDebugInfo {
    pub id: ThreadId,
    pub state: ThreadState,
    pub priority: Priority,
    pub admission: Option<u64>,
    pub stack_bottom: Option<usize>,
    pub stack_top: Option<usize>,
    pub generation: u64,
    pub runs: u64,
}

impl Loom {
    /// Initialize a scheduler; the calling OS thread becomes slot 0 and is
    /// Running.
    pub fn new(config: LoomConfig) -> Result<Pin<Box<Loom>>, LoomError> {
        Self::build(config, None)
    }

    /// Initialize a scheduler with default settings and the given policy
    pub fn with_policy(policy: Policy) -> Result<Pin<Box<Loom>>, LoomError> {
        Self::new(LoomConfig::new(policy))
    }

    /// Initialize a scheduler that reports its events to `observer`
    pub fn with_observer(
        config: LoomConfig,
        observer: impl LoomObserver + 'static,
    ) -> Result<Pin<Box<Loom>>, LoomError> {
        Self::build(config, Some(Box::new(observer)))
    }

    fn build(
        config: LoomConfig,
        observer: Option<Box<dyn LoomObserver>>,
    ) -> Result<Pin<Box<Loom>>, LoomError> {
        config.validate()?;

        let tapestry = Tapestry::new(&config);
        let contexts = (0..config.capacity)
            .map(|_| UnsafeCell::new(Context::default()))
            .collect();

        log::debug!(
            "loom initialized: policy={} capacity={} stack_size={}",
            config.policy,
            config.capacity,
            config.stack_size
        );

        Ok(Box::pin(Loom {
            tapestry: Mutex::new(tapestry),
            contexts,
            config,
            observer,
            _pinned: PhantomPinned,
            _local: PhantomData,
        }))
    }

    fn tapestry(&self) -> MutexGuard<'_, Tapestry> {
        match self.tapestry.try_lock() {
            Some(guard) => guard,
            None => fatal!("thread table lock held across a context switch"),
        }
    }

    /// Spawn a new thread
    ///
    /// The thread starts in the Ready state and first runs when the
    /// scheduler selects it. When `entry` returns the slot becomes Unused
    /// again; nothing else needs to be called.
    ///
    /// # Errors
    /// - [`LoomError::ResourceExhausted`] if every slot is occupied
    /// - [`LoomError::AllocationFailed`] if no stack memory is available
    pub fn spawn<F>(&self, entry: F, priority: Priority) -> Result<ThreadId, LoomError>
    where
        F: FnOnce(&Loom) + 'static,
    {
        let (id, admission) = {
            let mut t = self.tapestry();

            // Slot 0 is never Unused, so this only finds spawnable slots.
            let slot = t
                .threads
                .iter()
                .position(Thread::is_unused)
                .ok_or(LoomError::ResourceExhausted)?;

            let mut stack = match t.threads[slot].stack.take() {
                Some(stack) => stack,
                None => {
                    let size = self.config.stack_size;
                    let stack = Stack::with_size(size).ok_or(LoomError::AllocationFailed { size })?;
                    t.stacks_allocated += 1;
                    stack
                }
            };

            let fresh = Context::fresh(&mut stack, thread_start, self as *const Loom as usize, slot);
            // SAFETY: the slot is Unused, so nothing will resume from its
            // context until it is Ready, and the switch is not running.
            unsafe { *self.contexts[slot].get() = fresh };

            let admission = match self.config.policy {
                Policy::Fifo => Some(t.next_admission()),
                _ => None,
            };

            t.threads[slot].revive(Box::new(entry), priority, admission, stack);
            t.ready.insert(slot, priority, admission);
            t.spawns += 1;

            (ThreadId(slot), admission)
        };

        match admission {
            Some(admission) => log::debug!("spawned {id} priority={priority} admission={admission}"),
            None => log::debug!("spawned {id} priority={priority}"),
        }
        if let Some(observer) = &self.observer {
            observer.spawned(id, priority, admission);
        }

        Ok(id)
    }

    /// Yield the current thread and switch to the next one
    ///
    /// The next thread is chosen by the active policy and is never the
    /// caller. Returns `true` once the caller has been switched away from
    /// and later resumed, `false` at once if no other thread is Ready.
    pub fn yield_now(&self) -> bool {
        let (from, to, old, new) = {
            let mut t = self.tapestry();
            let caller = t.current;

            let Some(target) = t.ready.select(caller) else {
                return false;
            };
            if target == caller {
                fatal!("thread {caller} selected itself");
            }
            if t.threads[target].state() != ThreadState::Ready {
                fatal!(
                    "selected thread {target} is {:?}, not Ready",
                    t.threads[target].state()
                );
            }

            match t.threads[caller].state() {
                // Merely yielding: back into the Ready set.
                ThreadState::Running => {
                    let caller_thread = &mut t.threads[caller];
                    caller_thread.state = ThreadState::Ready;
                    let (priority, admission) = (caller_thread.priority, caller_thread.admission);
                    t.ready.insert(caller, priority, admission);
                }
                // Exiting: the slot is already released.
                ThreadState::Unused => {}
                ThreadState::Ready => fatal!("yield from thread {caller}, which is not running"),
            }

            t.threads[target].record_run();
            t.current = target;
            t.context_switches += 1;

            (
                caller,
                target,
                self.contexts[caller].get(),
                self.contexts[target].get().cast_const(),
            )
        };

        log::trace!("switch #{from} -> #{to}");
        if let Some(observer) = &self.observer {
            observer.switched(ThreadId(from), ThreadId(to));
        }

        // SAFETY: `from` and `to` are distinct slots of this table; the
        // target is Running and its context was saved by an earlier switch
        // or built by `spawn` on a stack its slot still owns. The table is
        // unlocked and this is the only flow of control.
        unsafe { switch_context(old, new) };

        self.resumed(from);
        true
    }

    /// Yield only if the advisory time slice of the current thread is used up
    pub fn yield_if_expired(&self) -> bool {
        self.slice_expired() && self.yield_now()
    }

    /// Whether the current thread has run for at least the configured time
    /// slice since it was last switched in. Nothing enforces the slice.
    pub fn slice_expired(&self) -> bool {
        self.running_for() >= self.config.time_slice
    }

    /// Time since the current thread was last switched in
    pub fn running_for(&self) -> Duration {
        let t = self.tapestry();
        t.threads[t.current]
            .resumed_at
            .map_or(Duration::MAX, |at| at.elapsed())
    }

    /// Bookkeeping on the resumed side of a switch
    fn resumed(&self, slot: usize) {
        let admission = {
            let mut t = self.tapestry();
            if t.current != slot {
                fatal!("thread {slot} resumed while thread {} is current", t.current);
            }

            // Stamped only now that the switch has completed, so a switch
            // that never lands cannot reorder the queue.
            let admission = match self.config.policy {
                Policy::Fifo => Some(t.next_admission()),
                _ => None,
            };
            let thread = &mut t.threads[slot];
            thread.resumed_at = Some(Instant::now());
            if admission.is_some() {
                thread.admission = admission;
            }
            admission
        };

        if let Some(admission) = admission {
            log::trace!("#{slot} admitted as {admission}");
            if let Some(observer) = &self.observer {
                observer.admitted(ThreadId(slot), admission);
            }
        }
    }

    /// First code run by every spawned thread, on its own stack
    fn run_thread(&self, slot: usize) -> ! {
        self.resumed(slot);

        let entry = self.tapestry().threads[slot].entry.take();
        let Some(entry) = entry else {
            fatal!("thread {slot} started without an entry function");
        };

        // Unwinding must stop here: above this frame is only the trampoline.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry(self))) {
            log::error!("thread #{slot} panicked: {}", panic_message(payload.as_ref()));
        }

        self.terminate_current()
    }

    /// Release the current (non-bootstrap) slot and never come back
    fn terminate_current(&self) -> ! {
        let slot = {
            let mut t = self.tapestry();
            let slot = t.current;
            if slot == BOOTSTRAP_SLOT {
                fatal!("bootstrap thread cannot terminate itself");
            }
            t.threads[slot].retire();
            slot
        };

        log::debug!("#{slot} finished");
        if let Some(observer) = &self.observer {
            observer.exited(ThreadId(slot));
        }

        // The bootstrap thread is never Unused, so there is always somewhere
        // to go.
        self.yield_now();
        fatal!("finished thread {slot} was resumed")
    }

    /// Finish the current thread, or on the bootstrap thread, the process
    ///
    /// On a spawned thread this behaves as if its entry function had
    /// returned and `status` is ignored. On the bootstrap thread it first
    /// runs every other thread to completion, then exits the process with
    /// `status`.
    ///
    /// Values living on the calling thread's stack are not dropped.
    pub fn exit(&self, status: i32) -> ! {
        if !self.current().is_bootstrap() {
            self.terminate_current();
        }

        while self.yield_now() {}

        log::info!("all threads finished, exiting with status {status}");
        std::process::exit(status)
    }

    /// Run every other thread to completion and return
    ///
    /// The bootstrap thread's reaper loop: it yields until nothing else is
    /// Ready, which can only happen once every other slot is Unused.
    pub fn drain(&self) -> Result<(), LoomError> {
        if !self.current().is_bootstrap() {
            return Err(LoomError::NotBootstrap);
        }

        while self.yield_now() {}

        log::debug!("loom drained");
        Ok(())
    }

    /// Get the current thread ID
    pub fn current(&self) -> ThreadId {
        ThreadId(self.tapestry().current)
    }

    pub fn policy(&self) -> Policy {
        self.config.policy
    }

    pub fn config(&self) -> &LoomConfig {
        &self.config
    }

    /// Number of table slots, bootstrap included
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// `None` for an id outside the table
    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.tapestry().slot(id).map(Thread::state)
    }

    /// `None` for an id outside the table or an Unused slot
    pub fn priority(&self, id: ThreadId) -> Option<Priority> {
        self.tapestry()
            .slot(id)
            .filter(|t| !t.is_unused())
            .map(Thread::priority)
    }

    /// FIFO admission stamp; `None` under the other policies
    pub fn admission(&self, id: ThreadId) -> Option<u64> {
        self.tapestry().slot(id).and_then(Thread::admission)
    }

    /// Get scheduler statistics
    pub fn stats(&self) -> LoomStats {
        let t = self.tapestry();
        LoomStats {
            capacity: t.threads.len(),
            unused: t.count(ThreadState::Unused),
            ready: t.count(ThreadState::Ready),
            running: t.count(ThreadState::Running),
            spawns: t.spawns,
            context_switches: t.context_switches,
            admissions: t.admissions,
            stacks_allocated: t.stacks_allocated,
        }
    }

    /// Get debug information for all occupied slots
    pub fn debug_info(&self) -> Vec<ThreadDebugInfo> {
        let t = self.tapestry();
        t.threads
            .iter()
            .enumerate()
            .filter(|(_, thread)| !thread.is_unused())
            .map(|(slot, thread)| ThreadDebugInfo {
                id: ThreadId(slot),
                state: thread.state(),
                priority: thread.priority(),
                admission: thread.admission(),
                stack_bottom: thread.stack.as_ref().map(Stack::bottom),
                stack_top: thread.stack.as_ref().map(Stack::top),
                generation: thread.generation(),
                runs: thread.runs(),
            })
            .collect()
    }

    /// Check the Ready set against the table
    #[cfg(test)]
    pub(crate) fn verify(&self) {
        let t = self.tapestry();
        assert_eq!(t.count(ThreadState::Running), 1);
        assert_eq!(t.threads[t.current].state(), ThreadState::Running);
        assert_ne!(t.threads[BOOTSTRAP_SLOT].state(), ThreadState::Unused);
        for (slot, thread) in t.threads.iter().enumerate() {
            assert_eq!(
                t.ready.contains(slot),
                thread.state() == ThreadState::Ready,
                "slot {slot} is {:?}",
                thread.state()
            );
        }
        assert_eq!(t.ready.len(), t.count(ThreadState::Ready));
        assert_eq!(t.ready.is_empty(), t.count(ThreadState::Ready) == 0);
    }
}

impl Drop for Loom {
    fn drop(&mut self) {
        let t = self.tapestry.get_mut();
        if t.current != BOOTSTRAP_SLOT {
            fatal!("loom dropped from thread {} instead of the bootstrap thread", t.current);
        }

        // Their stacks go away with the table; values on them are leaked.
        let unfinished = t.threads.len() - t.count(ThreadState::Unused) - 1;
        if unfinished > 0 {
            log::warn!("dropping loom with {unfinished} unfinished threads");
        }
    }
}

/// Where the trampoline lands. `loom` is the pinned scheduler's address.
extern "C" fn thread_start(loom: usize, slot: usize) -> ! {
    // SAFETY: `spawn` stored the address of a pinned `Loom`, and the table
    // (with this thread's stack) is only freed by dropping that `Loom`.
    let loom = unsafe { &*(loom as *const Loom) };
    loom.run_thread(slot)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
