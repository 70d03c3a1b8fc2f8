//! Thread definitions - one record per table slot

use std::fmt;
use std::time::Instant;

use crate::scheduler::Loom;
use crate::stack::Stack;
use crate::LoomError;

/// Entry point of a spawned thread. It receives the scheduler that runs it
/// so it can yield.
pub(crate) type Entry = Box<dyn FnOnce(&Loom) + 'static>;

/// Identifies a thread by its table slot
///
/// Slots are reused, so an id names "whatever thread currently occupies
/// this slot".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub usize);

impl ThreadId {
    /// The thread that created the scheduler. Always slot 0.
    pub const BOOTSTRAP: ThreadId = ThreadId(0);

    pub fn slot(self) -> usize {
        self.0
    }

    pub fn is_bootstrap(self) -> bool {
        self == Self::BOOTSTRAP
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The state of a slot in its lifecycle
///
/// `Unused -> Ready -> Running -> Ready -> ... -> Unused`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    /// Free for the next spawn
    Unused,

    /// Waiting to be selected
    Ready,

    /// Currently executing. Exactly one slot is in this state.
    Running,
}

/// Scheduling priority, meaningful under [`Policy::Priority`](crate::Policy::Priority)
///
/// Spawned threads take a value in `1..=99`; higher runs first. The bootstrap
/// thread sits below that range so it only runs once nothing else is Ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(99);

    /// Priority of the bootstrap thread
    pub(crate) const IDLE: Priority = Priority(0);

    pub fn new(value: u8) -> Result<Self, LoomError> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(LoomError::InvalidPriority(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MIN
    }
}

impl TryFrom<u8> for Priority {
    type Error = LoomError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A slot in the thread table
///
/// The saved register context is not kept here: it lives next to the table
/// in the scheduler so the switch primitive can reach it without taking the
/// table lock.
pub struct Thread {
    pub(crate) state: ThreadState,
    pub(crate) priority: Priority,

    /// FIFO admission stamp. `None` under the other policies and for
    /// Unused slots.
    pub(crate) admission: Option<u64>,

    /// Taken by the trampoline on first run
    pub(crate) entry: Option<Entry>,

    /// Pooled with the slot across generations. `None` for the bootstrap
    /// thread and for slots that were never spawned into.
    pub(crate) stack: Option<Stack>,

    /// When the slot last started running (advisory time slice)
    pub(crate) resumed_at: Option<Instant>,

    // Execution statistics
    pub(crate) generation: u64,
    pub(crate) runs: u64,
}

impl Thread {
    /// An empty slot
    pub(crate) fn unused() -> Self {
        Self {
            state: ThreadState::Unused,
            priority: Priority::IDLE,
            admission: None,
            entry: None,
            stack: None,
            resumed_at: None,
            generation: 0,
            runs: 0,
        }
    }

    /// Slot 0: already running on the process's own stack
    pub(crate) fn bootstrap() -> Self {
        Self {
            state: ThreadState::Running,
            resumed_at: Some(Instant::now()),
            runs: 1,
            ..Self::unused()
        }
    }

    /// Occupy an Unused slot with a new Ready thread
    pub(crate) fn revive(
        &mut self,
        entry: Entry,
        priority: Priority,
        admission: Option<u64>,
        stack: Stack,
    ) {
        self.state = ThreadState::Ready;
        self.priority = priority;
        self.admission = admission;
        self.entry = Some(entry);
        self.stack = Some(stack);
        self.resumed_at = None;
        self.generation += 1;
    }

    /// Release the slot. The stack stays for reuse.
    pub(crate) fn retire(&mut self) {
        self.state = ThreadState::Unused;
        self.admission = None;
        self.entry = None;
        self.resumed_at = None;
    }

    /// Record that this slot was just selected to run
    pub(crate) fn record_run(&mut self) {
        self.state = ThreadState::Running;
        self.runs += 1;
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn admission(&self) -> Option<u64> {
        self.admission
    }

    /// How many threads have occupied this slot
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// How many times this slot was switched into (bootstrap counts its
    /// initial run)
    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn is_unused(&self) -> bool {
        self.state == ThreadState::Unused
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("admission", &self.admission)
            .field("stack", &self.stack)
            .field("generation", &self.generation)
            .field("runs", &self.runs)
            .finish_non_exhaustive()
    }
}
