//! Collaborator interfaces.
//!
//! The lifecycle manager owns the record table and the scheduling state
//! machine; everything below it (register-level switching, page tables,
//! files) is reached through the traits in this module. A concrete kernel
//! implements all of them on one type and hands it to
//! [`ProcessManager`](crate::process::ProcessManager).

pub mod fs;
pub mod vm;

pub use fs::FileSystem;
pub use vm::{AddressSpaces, PageFlags};

use crate::process::context::KernelStack;

/// CPU primitives: identification, interrupt flag and context switch.
pub trait Machine: Sync {
    /// Saved callee-side register block used by [`Machine::switch_context`].
    type Context: Default + Send;

    /// Index of the executing CPU. Only meaningful with interrupts disabled.
    fn cpu_id(&self) -> usize;

    /// Whether the executing CPU currently accepts interrupts.
    fn interrupts_enabled(&self) -> bool;

    /// Mask interrupts on the executing CPU.
    fn disable_interrupts(&self);

    /// Unmask interrupts on the executing CPU.
    fn enable_interrupts(&self);

    /// Build the context of a fresh record.
    ///
    /// The first switch into it must run
    /// [`ProcessManager::first_return`](crate::process::ProcessManager::first_return)
    /// on `kstack` and then return to user mode through the record's trap frame.
    fn first_run_context(&self, kstack: &KernelStack) -> Self::Context;

    /// Save the running context into `from` and resume `to`.
    ///
    /// Returns when some other context switches back into `from`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference live contexts that stay in place until
    /// the switch back. The caller holds the process table lock; the resumed
    /// side inherits it.
    unsafe fn switch_context(&self, from: *mut Self::Context, to: *const Self::Context);

    /// Called by a scheduler pass that found nothing runnable.
    fn idle(&self) {
        core::hint::spin_loop();
    }
}

/// Everything the lifecycle manager needs from the rest of the kernel.
pub trait Platform: Machine + AddressSpaces + FileSystem + Send + Sync + 'static {}

impl<T> Platform for T where T: Machine + AddressSpaces + FileSystem + Send + Sync + 'static {}
