//! Per-CPU scheduler state.
//!
//! Each CPU owns the context its scheduler loop runs on, the record it is
//! currently running and the interrupt-disable nesting depth. The fields
//! are only touched by the owning CPU with interrupts masked.

use core::cell::{Cell, UnsafeCell};

use crate::hal::Platform;
use crate::process::table::Slot;
use crate::process::ProcessManager;

/// State of one CPU.
pub struct Cpu<C> {
    /// Context the scheduler loop is suspended in while a record runs.
    scheduler: UnsafeCell<C>,
    /// Record running on this CPU, if any.
    current: Cell<Option<Slot>>,
    /// Depth of `push_off` nesting.
    ncli: Cell<u32>,
    /// Were interrupts enabled before the outermost `push_off`?
    intena: Cell<bool>,
}

// SAFETY: a CPU's fields are only accessed from that CPU with interrupts
// disabled, so no two contexts touch them at the same time.
unsafe impl<C: Send> Sync for Cpu<C> {}

impl<C: Default> Cpu<C> {
    pub fn new() -> Self {
        Self {
            scheduler: UnsafeCell::new(C::default()),
            current: Cell::new(None),
            ncli: Cell::new(0),
            intena: Cell::new(false),
        }
    }
}

impl<C: Default> Default for Cpu<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Cpu<C> {
    pub fn current(&self) -> Option<Slot> {
        self.current.get()
    }

    pub(crate) fn set_current(&self, slot: Option<Slot>) {
        self.current.set(slot);
    }

    pub fn depth(&self) -> u32 {
        self.ncli.get()
    }

    pub(crate) fn intena(&self) -> bool {
        self.intena.get()
    }

    pub(crate) fn set_intena(&self, enabled: bool) {
        self.intena.set(enabled);
    }

    pub(crate) fn scheduler_context(&self) -> *mut C {
        self.scheduler.get()
    }
}

impl<P: Platform> ProcessManager<P> {
    /// State of the executing CPU. Interrupts must be disabled.
    pub(crate) fn this_cpu(&self) -> &Cpu<P::Context> {
        let id = self.platform().cpu_id();
        match self.cpus.get(id) {
            Some(cpu) => cpu,
            None => fatal!("unknown apicid {}", id),
        }
    }

    /// Disable interrupts, remembering the outermost previous state.
    ///
    /// Matched by [`ProcessManager::pop_off`]; two `push_off` calls need two
    /// `pop_off` calls before interrupts come back.
    pub fn push_off(&self) {
        let enabled = self.platform().interrupts_enabled();
        self.platform().disable_interrupts();
        let cpu = self.this_cpu();
        if cpu.ncli.get() == 0 {
            cpu.intena.set(enabled);
        }
        cpu.ncli.set(cpu.ncli.get() + 1);
    }

    pub fn pop_off(&self) {
        if self.platform().interrupts_enabled() {
            fatal!("pop_off - interruptible");
        }
        let cpu = self.this_cpu();
        let depth = cpu.ncli.get();
        if depth == 0 {
            fatal!("pop_off");
        }
        cpu.ncli.set(depth - 1);
        if depth == 1 && cpu.intena.get() {
            self.platform().enable_interrupts();
        }
    }

    /// Record running on the executing CPU.
    pub(crate) fn current(&self) -> Slot {
        self.push_off();
        let current = self.this_cpu().current();
        self.pop_off();
        match current {
            Some(slot) => slot,
            None => fatal!("no current record"),
        }
    }
}
