//! Architecture-specific code for x86_64.
//!
//! [`X86Machine`] provides the CPU half of [`Machine`]. An embedding
//! kernel delegates its `Machine` impl here and adds its own page-table
//! and file-system collaborators.

pub mod cpu;
pub mod switch;

pub use cpu::CpuMap;
pub use switch::SwitchContext;

use crate::config::NCPU;
use crate::hal::Machine;
use crate::process::KernelStack;

/// Bare-metal x86_64 CPU primitives.
pub struct X86Machine {
    cpus: CpuMap,
    /// Entry of fresh records: must call `first_return` on the manager
    /// and then leave through the trap return path.
    fork_entry: extern "C" fn() -> !,
}

impl X86Machine {
    pub const fn new(fork_entry: extern "C" fn() -> !) -> Self {
        Self {
            cpus: CpuMap::new(),
            fork_entry,
        }
    }

    /// Register the executing CPU. Returns its index.
    pub fn register_cpu(&self) -> Option<usize> {
        self.cpus.register()
    }
}

impl Machine for X86Machine {
    type Context = SwitchContext;

    fn cpu_id(&self) -> usize {
        // An unregistered CPU maps past the per-CPU array and trips the
        // manager's check.
        self.cpus.index().unwrap_or(NCPU)
    }

    #[inline]
    fn interrupts_enabled(&self) -> bool {
        x86_64::instructions::interrupts::are_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        x86_64::instructions::interrupts::disable();
    }

    #[inline]
    fn enable_interrupts(&self) {
        x86_64::instructions::interrupts::enable();
    }

    fn first_run_context(&self, kstack: &KernelStack) -> SwitchContext {
        SwitchContext::new(self.fork_entry as usize as u64, kstack.top() as u64)
    }

    unsafe fn switch_context(&self, from: *mut SwitchContext, to: *const SwitchContext) {
        switch::switch_context(from, to);
    }

    fn idle(&self) {
        // Wait for an interrupt to make something runnable.
        x86_64::instructions::interrupts::enable_and_hlt();
    }
}
