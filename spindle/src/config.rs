//! Scheduler configuration

use std::time::Duration;

use crate::policy::Policy;
use crate::stack::{Stack, DEFAULT_STACK_SIZE};
use crate::LoomError;

/// Default number of table slots, bootstrap included
pub const DEFAULT_CAPACITY: usize = 4;

/// Largest thread table a scheduler will build
pub const MAX_CAPACITY: usize = 4096;

/// Default advisory time slice
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_millis(10);

/// Settings fixed for the lifetime of a [`Loom`](crate::Loom)
///
/// ```
/// use spindle::{LoomConfig, Policy};
///
/// let config = LoomConfig::default()
///     .policy(Policy::RoundRobin)
///     .capacity(8)
///     .stack_size(64 * 1024);
/// assert_eq!(config.spawn_capacity(), 7);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoomConfig {
    pub(crate) policy: Policy,
    pub(crate) capacity: usize,
    pub(crate) stack_size: usize,
    pub(crate) time_slice: Duration,
}

impl Default for LoomConfig {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            capacity: DEFAULT_CAPACITY,
            stack_size: DEFAULT_STACK_SIZE,
            time_slice: DEFAULT_TIME_SLICE,
        }
    }
}

impl LoomConfig {
    pub fn new(policy: Policy) -> Self {
        Self::default().policy(policy)
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Number of table slots, including the bootstrap thread's slot 0
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Per-thread stack size; clamped and rounded like [`Stack::with_size`]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Stack::normalize_size(size);
        self
    }

    /// How long a thread may run before [`Loom::slice_expired`] reports true.
    /// Zero makes every check expire.
    ///
    /// [`Loom::slice_expired`]: crate::Loom::slice_expired
    pub fn time_slice(mut self, slice: Duration) -> Self {
        self.time_slice = slice;
        self
    }

    pub fn get_policy(&self) -> Policy {
        self.policy
    }

    pub fn get_capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn get_time_slice(&self) -> Duration {
        self.time_slice
    }

    /// How many threads can be alive besides the bootstrap thread
    pub fn spawn_capacity(&self) -> usize {
        self.capacity.saturating_sub(1)
    }

    pub(crate) fn validate(&self) -> Result<(), LoomError> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(LoomError::InvalidCapacity(self.capacity));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{MAX_STACK_SIZE, MIN_STACK_SIZE};

    #[test]
    fn test_defaults() {
        let config = LoomConfig::default();
        assert_eq!(config.get_policy(), Policy::Priority);
        assert_eq!(config.get_capacity(), DEFAULT_CAPACITY);
        assert_eq!(config.get_stack_size(), DEFAULT_STACK_SIZE);
        assert_eq!(config.get_time_slice(), DEFAULT_TIME_SLICE);
        assert_eq!(config.spawn_capacity(), DEFAULT_CAPACITY - 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LoomConfig::new(Policy::Fifo)
            .capacity(16)
            .stack_size(1)
            .time_slice(Duration::ZERO);
        assert_eq!(config.get_policy(), Policy::Fifo);
        assert_eq!(config.get_capacity(), 16);
        assert_eq!(config.get_stack_size(), MIN_STACK_SIZE);
        assert_eq!(config.get_time_slice(), Duration::ZERO);

        let config = config.stack_size(usize::MAX / 2);
        assert_eq!(config.get_stack_size(), MAX_STACK_SIZE);
    }

    #[test]
    fn test_capacity_validation() {
        assert_eq!(
            LoomConfig::default().capacity(0).validate(),
            Err(LoomError::InvalidCapacity(0))
        );
        assert_eq!(
            LoomConfig::default().capacity(MAX_CAPACITY + 1).validate(),
            Err(LoomError::InvalidCapacity(MAX_CAPACITY + 1))
        );
        // Bootstrap only: valid, but nothing can be spawned.
        let solo = LoomConfig::default().capacity(1);
        assert!(solo.validate().is_ok());
        assert_eq!(solo.spawn_capacity(), 0);
    }
}
