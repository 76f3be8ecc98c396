//! Context switch implementation.

use core::arch::naked_asm;

/// Callee-saved register block for kernel-to-kernel switches.
///
/// The calling convention already preserves everything else across the
/// call into [`switch_context`].
#[derive(Debug, Default, Clone)]
#[repr(C)]
pub struct SwitchContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    /// Stack pointer after the switch returns.
    pub rsp: u64,
    /// Where the switch returns to.
    pub rip: u64,
}

impl SwitchContext {
    /// Context whose first switch jumps to `entry` on the stack ending at
    /// `stack_top`.
    pub fn new(entry: u64, stack_top: u64) -> Self {
        SwitchContext {
            // System V: rsp + 8 is 16-byte aligned at function entry.
            rsp: (stack_top & !0xF) - 8,
            rip: entry,
            ..Default::default()
        }
    }
}

/// Save callee-saved registers into `current` and resume `next`.
///
/// # Safety
///
/// Both pointers must be valid, and `next` must hold either a context saved
/// by this function or one built by [`SwitchContext::new`].
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_current: *mut SwitchContext, _next: *const SwitchContext) {
    // rdi = current, rsi = next
    naked_asm!(
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], rbx",
        "mov [rdi + 0x28], rbp",
        // Resume past our own return address
        "mov rax, [rsp]",
        "mov [rdi + 0x38], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x30], rax",
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov rbx, [rsi + 0x20]",
        "mov rbp, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "jmp qword ptr [rsi + 0x38]",
    );
}
