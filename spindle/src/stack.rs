//! # Thread stacks
//!
//! Every spawned thread runs on a stack of its own: an anonymous mapping
//! with one inaccessible guard page below the usable region, so running
//! off the end faults instead of writing into neighbouring memory. The
//! bootstrap thread keeps the stack the process started on.
//!
//! Stacks belong to table slots, not to thread generations: a thread that
//! finishes is still standing on its stack while it hands control away, so
//! the mapping is kept with the slot and reused by the next spawn into it.

use std::ops::Range;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

/// Default stack size: 256 KiB
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Minimum stack size: 16 KiB
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Maximum stack size: 8 MiB
pub const MAX_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Stacks are aligned for the System V ABI.
pub const STACK_ALIGN: usize = 16;

fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(page).ok().filter(|&p| p > 0).unwrap_or(4096)
    })
}

#[cfg(test)]
thread_local! {
    static REFUSE_ALLOCATIONS: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Make every later [`Stack::with_size`] on this OS thread fail
#[cfg(test)]
pub(crate) fn refuse_allocations(refuse: bool) {
    REFUSE_ALLOCATIONS.with(|r| r.set(refuse));
}

#[cfg(test)]
fn allocation_refused() -> bool {
    REFUSE_ALLOCATIONS.with(std::cell::Cell::get)
}

#[cfg(not(test))]
fn allocation_refused() -> bool {
    false
}

/// One guarded stack mapping
///
/// ```text
/// base          guard end    bottom                     top
///  | guard page  | page slack |  size usable bytes       |
///  +-------------+------------+--------------------------+
/// ```
///
/// `top` is page aligned and `size` a multiple of 16, so both ends of the
/// usable region keep the ABI alignment.
pub struct Stack {
    base: NonNull<u8>,
    mapped: usize,
    size: usize,
}

impl Stack {
    /// The size a request for `size` bytes actually gets: clamped to
    /// [`MIN_STACK_SIZE`]..=[`MAX_STACK_SIZE`], rounded up to 16
    pub fn normalize_size(size: usize) -> usize {
        let size = size.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE);
        (size + STACK_ALIGN - 1) & !(STACK_ALIGN - 1)
    }

    pub fn new() -> Option<Self> {
        Self::with_size(DEFAULT_STACK_SIZE)
    }

    /// Map a guarded stack of at least `size` usable bytes
    ///
    /// `None` when the mapping or its guard page cannot be set up.
    pub fn with_size(size: usize) -> Option<Self> {
        if allocation_refused() {
            return None;
        }

        let size = Self::normalize_size(size);
        let guard = page_size();
        let mapped = guard.checked_add(size.checked_next_multiple_of(guard)?)?;

        // SAFETY: a fresh private anonymous mapping aliases nothing.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::warn!("mmap of a {mapped}-byte stack failed: {}", std::io::Error::last_os_error());
            return None;
        }

        // SAFETY: the first page of the mapping created above.
        if unsafe { libc::mprotect(addr, guard, libc::PROT_NONE) } != 0 {
            log::warn!("could not protect stack guard page: {}", std::io::Error::last_os_error());
            // SAFETY: unmapping exactly what was mapped; nothing uses it yet.
            unsafe { libc::munmap(addr, mapped) };
            return None;
        }

        NonNull::new(addr.cast::<u8>()).map(|base| Stack { base, mapped, size })
    }

    /// Lowest usable address
    pub fn bottom(&self) -> usize {
        self.top() - self.size
    }

    /// One past the highest usable address; the stack grows down from here
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.mapped
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The inaccessible page below the stack
    pub fn guard(&self) -> Range<usize> {
        let base = self.base.as_ptr() as usize;
        base..base + page_size()
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.bottom()..self.top()).contains(&addr)
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: `base` and `mapped` describe the mapping made in
        // `with_size`, and the slot owning this stack no longer runs on it.
        if unsafe { libc::munmap(self.base.as_ptr().cast(), self.mapped) } != 0 {
            log::warn!("munmap of stack at {:#x} failed", self.bottom());
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &format_args!("{:#x}", self.bottom()))
            .field("top", &format_args!("{:#x}", self.top()))
            .field("size", &self.size)
            .finish()
    }
}
