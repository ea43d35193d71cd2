//! Architecture seam
//!
//! Everything the scheduling core needs from the machine goes through
//! [`Platform`]: processor identity, local interrupt control, the timer
//! registration hook and the context-switch primitives. The bare-metal
//! x86_64 backend and the hosted simulator implement it.

use alloc::boxed::Box;

use crate::error::KernResult;
use crate::kern::thread::Thread;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

#[cfg(any(test, feature = "std"))]
pub mod hosted;

/// Callback run on every timer interrupt
pub type TimerHandler = Box<dyn Fn() + Send + Sync>;

/// Saved local interrupt state, as returned by
/// [`Platform::save_and_disable_interrupts`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags(pub usize);

/// Machine services consumed by the kernel
pub trait Platform: Send + Sync {
    /// Index of the executing processor
    fn cpu_id(&self) -> usize;

    fn interrupts_enabled(&self) -> bool;

    fn enable_interrupts(&self);

    fn disable_interrupts(&self);

    /// Mask local interrupts, returning the state to hand back to
    /// [`Platform::restore_interrupts`]
    fn save_and_disable_interrupts(&self) -> IrqFlags;

    fn restore_interrupts(&self, flags: IrqFlags);

    /// Sleep until the next interrupt. Callers enable interrupts first.
    fn wait_for_interrupt(&self);

    /// Install the tick callback. Only one handler may be registered.
    fn register_timer_handler(&self, handler: TimerHandler) -> KernResult<()>;

    /// Instruction address a fresh context starts at
    fn start_address(&self) -> usize;

    /// Save the running context into `prev` and resume `next`.
    ///
    /// # Safety
    /// Interrupts must be masked and `next` must hold a valid context that
    /// is not running on any processor.
    unsafe fn switch_context(&self, prev: &Thread, next: &Thread);

    /// Resume `next` without saving the caller's context.
    ///
    /// # Safety
    /// Same as [`Platform::switch_context`]. The calling context is
    /// abandoned.
    unsafe fn switch_initial(&self, next: &Thread);

    /// Leave the finished thread `dead` for good and resume `next`.
    ///
    /// # Safety
    /// Same as [`Platform::switch_initial`].
    unsafe fn exit_context(&self, dead: &Thread, next: &Thread);

    /// Stop this processor
    fn halt(&self) -> ! {
        loop {
            self.disable_interrupts();
            self.wait_for_interrupt();
        }
    }
}

// ============================================================================
// Execution context
// ============================================================================

/// Initial RFLAGS for a new context: reserved bit 1 set, interrupts masked
pub const INITIAL_RFLAGS: usize = 0x2;

/// Callee-saved register set restored on a context switch
///
/// Field offsets are fixed; the switch routines address them directly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub rbx: usize,
    pub rbp: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub r15: usize,
    pub rsp: usize,
    pub rip: usize,
    pub rflags: usize,
}

impl Context {
    /// Build the context a thread resumes into on first dispatch.
    ///
    /// Execution begins at `start` with the stack pointer at `stack_top`
    /// rounded down to 16 bytes. The start stub calls `routine(arg0, arg1)`,
    /// which are carried in r14, r12 and r13.
    pub const fn initial(
        stack_top: usize,
        start: usize,
        routine: usize,
        arg0: usize,
        arg1: usize,
    ) -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: arg0,
            r13: arg1,
            r14: routine,
            r15: 0,
            rsp: stack_top & !0xF,
            rip: start,
            rflags: INITIAL_RFLAGS,
        }
    }

    /// Routine and arguments a fresh context was built with
    pub const fn start_routine(&self) -> (usize, usize, usize) {
        (self.r14, self.r12, self.r13)
    }
}
