//! Per-record execution state
//!
//! User-mode register snapshot and the kernel stack owned by each record.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::config::KERNEL_STACK_SIZE;
use crate::error::{ProcError, Result};

/// User code segment selector (GDT index 4, RPL 3).
pub const USER_CS: u64 = 0x23;

/// User data segment selector (GDT index 3, RPL 3).
pub const USER_DS: u64 = 0x1B;

/// RFLAGS for user mode: IF set, reserved bit 1 set.
const USER_RFLAGS: u64 = 0x200 | 0x2;

/// User-mode registers saved at kernel entry.
///
/// The trap return path restores the user program from this block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    /// System-call return register.
    pub rax: u64,

    // Pushed by the CPU on entry
    /// Instruction pointer
    pub rip: u64,
    /// Code segment
    pub cs: u64,
    /// RFLAGS register
    pub rflags: u64,
    /// Stack pointer
    pub rsp: u64,
    /// Stack segment
    pub ss: u64,
}

impl TrapFrame {
    /// Frame that enters user mode at `entry` with stack pointer `stack`.
    pub const fn new_user(entry: u64, stack: u64) -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            rbx: 0,
            rbp: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rax: 0,
            rip: entry,
            cs: USER_CS,
            rflags: USER_RFLAGS,
            rsp: stack,
            ss: USER_DS,
        }
    }

    /// Value the interrupted system call returns to user space.
    pub fn set_return_value(&mut self, value: u64) {
        self.rax = value;
    }

    /// Redirect the user program to `entry` running on `stack`.
    pub fn set_entry(&mut self, entry: u64, stack: u64) {
        self.rip = entry;
        self.rsp = stack;
    }
}

/// Exclusively owned kernel stack of one record.
pub struct KernelStack(Box<[u8]>);

impl KernelStack {
    /// Allocate a zeroed stack, reporting allocation failure instead of aborting.
    pub fn allocate() -> Result<Self> {
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(KERNEL_STACK_SIZE)
            .map_err(|_| ProcError::ExhaustedTable)?;
        memory.resize(KERNEL_STACK_SIZE, 0u8);
        Ok(KernelStack(memory.into_boxed_slice()))
    }

    /// Lowest address of the stack.
    pub fn bottom(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// One past the highest address (initial stack pointer).
    pub fn top(&self) -> usize {
        self.bottom() + self.0.len()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl core::fmt::Debug for KernelStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "KernelStack({:#x}..{:#x})", self.bottom(), self.top())
    }
}
