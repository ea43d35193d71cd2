//! x86_64 bare-metal backend
//!
//! Interrupt control through RFLAGS.IF, `hlt` for idling and three small
//! assembly routines for context switching. Processor identity comes from
//! boot code (usually the local APIC id mapped to a table index), and the
//! timer interrupt handler installed by boot code forwards to
//! [`X86Platform::timer_irq`].

use core::arch::{asm, global_asm};

use super::{Context, IrqFlags, Platform, TimerHandler};
use crate::error::{KernError, KernResult};
use crate::kern::thread::Thread;

pub mod serial;

/// RFLAGS interrupt-enable bit
const RFLAGS_IF: usize = 1 << 9;

// Context field offsets: rbx 0, rbp 8, r12 16, r13 24, r14 32, r15 40,
// rsp 48, rip 56, rflags 64.
global_asm!(
    ".global mpk_switch_context",
    "mpk_switch_context:",
    // rdi = *mut Context (outgoing), rsi = *const Context (incoming)
    "mov [rdi + 0], rbx",
    "mov [rdi + 8], rbp",
    "mov [rdi + 16], r12",
    "mov [rdi + 24], r13",
    "mov [rdi + 32], r14",
    "mov [rdi + 40], r15",
    // Resume as if returning from this call
    "lea rax, [rsp + 8]",
    "mov [rdi + 48], rax",
    "mov rax, [rsp]",
    "mov [rdi + 56], rax",
    "pushfq",
    "pop rax",
    "mov [rdi + 64], rax",
    "mov rdi, rsi",
    "jmp mpk_load_context",
    "",
    ".global mpk_load_context",
    "mpk_load_context:",
    // rdi = *const Context
    "mov rbx, [rdi + 0]",
    "mov rbp, [rdi + 8]",
    "mov r12, [rdi + 16]",
    "mov r13, [rdi + 24]",
    "mov r14, [rdi + 32]",
    "mov r15, [rdi + 40]",
    "mov rsp, [rdi + 48]",
    "push qword ptr [rdi + 64]",
    "popfq",
    "jmp qword ptr [rdi + 56]",
    "",
    ".global mpk_thread_start",
    "mpk_thread_start:",
    // First dispatch of a thread: routine in r14, arguments in r12 and r13
    "mov rdi, r12",
    "mov rsi, r13",
    "call r14",
    "ud2",
);

extern "C" {
    fn mpk_switch_context(prev: *mut Context, next: *const Context);
    fn mpk_load_context(next: *const Context) -> !;
    fn mpk_thread_start();
}

/// Bare-metal platform
pub struct X86Platform {
    cpu_id: fn() -> usize,
    timer: spin::Once<TimerHandler>,
}

impl X86Platform {
    /// `cpu_id` must return a dense index below the configured processor
    /// count
    pub const fn new(cpu_id: fn() -> usize) -> Self {
        Self {
            cpu_id,
            timer: spin::Once::new(),
        }
    }

    /// Entry from the timer interrupt handler, after the interrupt
    /// controller has been acknowledged
    pub fn timer_irq(&self) {
        if let Some(handler) = self.timer.get() {
            handler();
        }
    }
}

fn read_rflags() -> usize {
    let flags: usize;
    unsafe {
        asm!("pushfq; pop {}", out(reg) flags);
    }
    flags
}

impl Platform for X86Platform {
    fn cpu_id(&self) -> usize {
        (self.cpu_id)()
    }

    fn interrupts_enabled(&self) -> bool {
        read_rflags() & RFLAGS_IF != 0
    }

    fn enable_interrupts(&self) {
        unsafe {
            asm!("sti", options(nomem, nostack));
        }
    }

    fn disable_interrupts(&self) {
        unsafe {
            asm!("cli", options(nomem, nostack));
        }
    }

    fn save_and_disable_interrupts(&self) -> IrqFlags {
        let flags = read_rflags();
        self.disable_interrupts();
        IrqFlags(flags)
    }

    fn restore_interrupts(&self, flags: IrqFlags) {
        if flags.0 & RFLAGS_IF != 0 {
            self.enable_interrupts();
        } else {
            self.disable_interrupts();
        }
    }

    fn wait_for_interrupt(&self) {
        unsafe {
            asm!("hlt", options(nomem, nostack));
        }
    }

    fn register_timer_handler(&self, handler: TimerHandler) -> KernResult<()> {
        let mut installed = false;
        self.timer.call_once(|| {
            installed = true;
            handler
        });
        if installed {
            Ok(())
        } else {
            Err(KernError::TimerBusy)
        }
    }

    fn start_address(&self) -> usize {
        mpk_thread_start as usize
    }

    unsafe fn switch_context(&self, prev: &Thread, next: &Thread) {
        mpk_switch_context(prev.context_ptr(), next.context_ptr());
    }

    unsafe fn switch_initial(&self, next: &Thread) {
        mpk_load_context(next.context_ptr());
    }

    unsafe fn exit_context(&self, _dead: &Thread, next: &Thread) {
        mpk_load_context(next.context_ptr());
    }
}
