//! Scheduling policies and their Ready sets
//!
//! Each policy keeps the Ready slots in a structure ordered the way that
//! policy picks, so selection is a lookup instead of a scan of the table.
//! Selection order is exactly that of the scan it replaces:
//!
//! - **Priority**: greatest priority first, lowest slot index on ties.
//! - **FIFO**: smallest admission stamp first.
//! - **Round-robin**: first Ready slot after the caller, wrapping around.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::thread::Priority;

/// How the scheduler picks the next thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Policy {
    /// Strict priority
    #[default]
    Priority,
    /// Admission order
    Fifo,
    /// Circular table order
    RoundRobin,
}

impl Policy {
    pub const ALL: [Policy; 3] = [Policy::Priority, Policy::Fifo, Policy::RoundRobin];

    pub fn name(self) -> &'static str {
        match self {
            Policy::Priority => "priority",
            Policy::Fifo => "fifo",
            Policy::RoundRobin => "round-robin",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "priority" | "prio" | "other" => Ok(Policy::Priority),
            "fifo" => Ok(Policy::Fifo),
            "round-robin" | "roundrobin" | "rr" => Ok(Policy::RoundRobin),
            other => Err(format!("unknown scheduling policy '{other}'")),
        }
    }
}

/// The set of Ready slots, ordered for one policy
///
/// A slot is in the set exactly while its state is Ready.
pub(crate) trait ReadyQueue {
    /// `slot` just became Ready
    fn insert(&mut self, slot: usize, priority: Priority, admission: Option<u64>);

    /// Remove and return the slot to run after `caller`
    ///
    /// `caller` is Running or Unused, so it is never in the set.
    fn select(&mut self, caller: usize) -> Option<usize>;

    fn contains(&self, slot: usize) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn ready_queue_for(policy: Policy) -> Box<dyn ReadyQueue> {
    match policy {
        Policy::Priority => Box::new(PriorityQueue::default()),
        Policy::Fifo => Box::new(AdmissionQueue::default()),
        Policy::RoundRobin => Box::new(RingQueue::default()),
    }
}

/// Max-priority set; `Reverse` puts the greatest priority first and the
/// slot index breaks ties toward the start of the table.
#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    ready: BTreeSet<(Reverse<Priority>, usize)>,
}

impl ReadyQueue for PriorityQueue {
    fn insert(&mut self, slot: usize, priority: Priority, _admission: Option<u64>) {
        self.ready.insert((Reverse(priority), slot));
    }

    fn select(&mut self, _caller: usize) -> Option<usize> {
        self.ready.pop_first().map(|(_, slot)| slot)
    }

    fn contains(&self, slot: usize) -> bool {
        self.ready.iter().any(|&(_, s)| s == slot)
    }

    fn len(&self) -> usize {
        self.ready.len()
    }
}

/// FIFO queue keyed by admission stamp
#[derive(Debug, Default)]
pub(crate) struct AdmissionQueue {
    ready: BTreeSet<(u64, usize)>,
}

impl ReadyQueue for AdmissionQueue {
    fn insert(&mut self, slot: usize, _priority: Priority, admission: Option<u64>) {
        // Every Ready slot is stamped under FIFO; an unstamped one would
        // sort first, so make the breach loud in debug builds.
        debug_assert!(admission.is_some(), "slot {slot} Ready without admission stamp");
        self.ready.insert((admission.unwrap_or(0), slot));
    }

    fn select(&mut self, _caller: usize) -> Option<usize> {
        self.ready.pop_first().map(|(_, slot)| slot)
    }

    fn contains(&self, slot: usize) -> bool {
        self.ready.iter().any(|&(_, s)| s == slot)
    }

    fn len(&self) -> usize {
        self.ready.len()
    }
}

/// Ring cursor over slot indices
#[derive(Debug, Default)]
pub(crate) struct RingQueue {
    ready: BTreeSet<usize>,
}

impl ReadyQueue for RingQueue {
    fn insert(&mut self, slot: usize, _priority: Priority, _admission: Option<u64>) {
        self.ready.insert(slot);
    }

    fn select(&mut self, caller: usize) -> Option<usize> {
        let next = self
            .ready
            .range(caller + 1..)
            .next()
            .or_else(|| self.ready.range(..caller).next())
            .copied()?;
        self.ready.remove(&next);
        Some(next)
    }

    fn contains(&self, slot: usize) -> bool {
        self.ready.contains(&slot)
    }

    fn len(&self) -> usize {
        self.ready.len()
    }
}
