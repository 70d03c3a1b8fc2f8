//! # Thread Context
//!
//! The smallest amount of machine state that lets a thread stop in the
//! middle of a function call and pick up again later: the stack pointer and
//! the registers the System V ABI makes callees preserve. Everything else
//! (caller-saved registers, flags) is already dead across the call to
//! [`switch_context`], so the compiler has spilled whatever it needed.
//!
//! This is the only module that touches raw stack memory or registers.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("spindle context switching is only implemented for x86_64");

use core::arch::naked_asm;
use core::mem::{offset_of, size_of};

use static_assertions::const_assert_eq;

use crate::stack::{Stack, STACK_ALIGN};

/// Function a fresh context lands in, called with the two words given to
/// [`Context::fresh`]. It must never return.
pub type StartFn = extern "C" fn(usize, usize) -> !;

/// Saved execution state of a suspended thread
///
/// Field order is load-bearing: the assembly below addresses fields by
/// offset.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub rsp: u64,
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
}

const_assert_eq!(size_of::<Context>(), 0x38);
const_assert_eq!(offset_of!(Context, rsp), 0x00);
const_assert_eq!(offset_of!(Context, r15), 0x08);
const_assert_eq!(offset_of!(Context, r14), 0x10);
const_assert_eq!(offset_of!(Context, r13), 0x18);
const_assert_eq!(offset_of!(Context, r12), 0x20);
const_assert_eq!(offset_of!(Context, rbx), 0x28);
const_assert_eq!(offset_of!(Context, rbp), 0x30);

impl Context {
    /// Lay out the top of `stack` so that switching to the returned context
    /// enters `start(arg0, arg1)` with a correctly aligned stack.
    ///
    /// Stack after the call (high addresses first):
    ///
    /// ```text
    /// top - 8   0            end of the frame chain
    /// top - 16  0            padding
    /// top - 24  trampoline   <- rsp; popped by the `ret` in switch_context
    /// ```
    ///
    /// The trampoline finds its arguments in callee-saved registers, which
    /// `switch_context` restores before it returns: `r12` and `r13` carry
    /// the two words and `r14` the function.
    pub fn fresh(stack: &mut Stack, start: StartFn, arg0: usize, arg1: usize) -> Self {
        let top = stack.top();
        debug_assert_eq!(top % STACK_ALIGN, 0);

        let frame = (top - 3 * size_of::<u64>()) as *mut u64;
        // SAFETY: `stack` is borrowed mutably and at least MIN_STACK_SIZE
        // bytes long, so the three words below `top` are ours to write.
        unsafe {
            frame.write(trampoline as *const () as usize as u64);
            frame.add(1).write(0);
            frame.add(2).write(0);
        }

        Context {
            rsp: frame as u64,
            r12: arg0 as u64,
            r13: arg1 as u64,
            r14: start as *const () as usize as u64,
            ..Context::default()
        }
    }
}

/// Save the running thread into `old` and resume the thread saved in `new`
///
/// Returns when some later `switch_context` names `old` as its `new`, as if
/// this were an ordinary call. A context built by [`Context::fresh`] is
/// entered through the trampoline instead.
///
/// # Safety
/// - `old` must be valid for writes and `new` valid for reads, and they
///   must not alias.
/// - `new` must hold a context saved by this function or built by
///   [`Context::fresh`], whose stack is still alive.
/// - No other flow of control may use either context concurrently.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // rdi = old, rsi = new
        // Our return address is at [rsp]; saving rsp keeps it for later.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], r15",
        "mov [rdi + 0x10], r14",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], rbx",
        "mov [rdi + 0x30], rbp",
        "mov rsp, [rsi + 0x00]",
        "mov r15, [rsi + 0x08]",
        "mov r14, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov rbx, [rsi + 0x28]",
        "mov rbp, [rsi + 0x30]",
        // Resumed thread: back into its own switch_context caller.
        // Fresh thread: into the trampoline.
        "ret",
    );
}

/// First instructions of every spawned thread
///
/// Entered by `ret` with rsp 16-byte aligned, so the `call` below gives the
/// start function the alignment the ABI expects.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() -> ! {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, r12",
        "mov rsi, r13",
        "call r14",
        // The start function never returns.
        "ud2",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::addr_of_mut;

    struct PingPong {
        main: Context,
        child: Context,
        hits: usize,
        seen: Vec<usize>,
    }

    extern "C" fn bounce(arg: usize, tag: usize) -> ! {
        let pp = arg as *mut PingPong;
        // A local that must survive every suspension.
        let mut local = tag * 100;
        loop {
            // SAFETY: `pp` outlives the test; only one side runs at a time.
            unsafe {
                (*pp).hits += 1;
                (*pp).seen.push(local);
                local += 1;
                switch_context(addr_of_mut!((*pp).child), addr_of_mut!((*pp).main));
            }
        }
    }

    #[test]
    fn test_fresh_frame_layout() {
        let mut stack = Stack::new().expect("Failed to allocate stack");
        let ctx = Context::fresh(&mut stack, bounce, 0x1111, 0x2222);

        assert_eq!(ctx.rsp as usize, stack.top() - 24);
        // After the `ret` pops the trampoline, rsp is 16-byte aligned.
        assert_eq!((ctx.rsp as usize + 8) % 16, 0);
        assert_eq!(ctx.r12, 0x1111);
        assert_eq!(ctx.r13, 0x2222);
        assert_eq!(ctx.r14, bounce as *const () as usize as u64);
        assert!(stack.contains(ctx.rsp as usize));

        // SAFETY: rsp points at the three words written by `fresh`.
        let words = unsafe { core::slice::from_raw_parts(ctx.rsp as *const u64, 3) };
        assert_eq!(words[0], trampoline as *const () as usize as u64);
        assert_eq!(words[1], 0);
        assert_eq!(words[2], 0);
    }

    #[test]
    fn test_empty_context() {
        let ctx = Context::default();
        assert_eq!(ctx.rsp, 0);
        assert_eq!(ctx.r12, 0);
        assert_eq!(ctx.rbp, 0);
    }

    #[test]
    fn test_switch_round_trip() {
        let mut stack = Stack::new().expect("Failed to allocate stack");
        let mut pp = Box::new(PingPong {
            main: Context::default(),
            child: Context::default(),
            hits: 0,
            seen: Vec::new(),
        });
        let ptr: *mut PingPong = &mut *pp;

        // SAFETY: `pp` and `stack` outlive every switch below.
        unsafe {
            (*ptr).child = Context::fresh(&mut stack, bounce, ptr as usize, 7);
            for round in 1..=5 {
                let before = round * 3;
                switch_context(addr_of_mut!((*ptr).main), addr_of_mut!((*ptr).child));
                // Our own locals are intact after being resumed.
                assert_eq!(before, round * 3);
                assert_eq!((*ptr).hits, round);
            }
        }

        assert_eq!(pp.seen, vec![700, 701, 702, 703, 704]);
    }

    #[test]
    fn test_two_children_interleave() {
        let mut stack_a = Stack::new().expect("Failed to allocate stack");
        let mut stack_b = Stack::new().expect("Failed to allocate stack");
        let mut a = Box::new(PingPong {
            main: Context::default(),
            child: Context::default(),
            hits: 0,
            seen: Vec::new(),
        });
        let mut b = Box::new(PingPong {
            main: Context::default(),
            child: Context::default(),
            hits: 0,
            seen: Vec::new(),
        });
        let pa: *mut PingPong = &mut *a;
        let pb: *mut PingPong = &mut *b;

        // SAFETY: both boxes and stacks outlive every switch below.
        unsafe {
            (*pa).child = Context::fresh(&mut stack_a, bounce, pa as usize, 1);
            (*pb).child = Context::fresh(&mut stack_b, bounce, pb as usize, 2);
            for _ in 0..3 {
                switch_context(addr_of_mut!((*pa).main), addr_of_mut!((*pa).child));
                switch_context(addr_of_mut!((*pb).main), addr_of_mut!((*pb).child));
            }
        }

        assert_eq!(a.seen, vec![100, 101, 102]);
        assert_eq!(b.seen, vec![200, 201, 202]);
    }
}
