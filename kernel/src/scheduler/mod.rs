//! Kernel scheduler module.
//!
//! One loop per CPU scans the process table in slot order and runs every
//! Runnable record it finds. A record gives the CPU back by changing its
//! own state and switching to the loop through `sched`; the table lock is
//! held across every switch in both directions.

pub mod cpu;
pub mod priority;

pub use cpu::Cpu;
pub use priority::QueueLevel;

use crate::config::NPROC;
use crate::hal::Platform;
use crate::process::table::{ProcState, Slot};
use crate::process::ProcessManager;
use crate::sync::TableGuard;

impl<P: Platform> ProcessManager<P> {
    /// Per-CPU scheduler loop. Never returns.
    pub fn scheduler(&self) -> ! {
        self.push_off();
        self.this_cpu().set_current(None);
        log::info!("[SCHED] cpu{} entering scheduler", self.platform().cpu_id());
        self.pop_off();

        loop {
            // Let devices interrupt an otherwise idle CPU.
            self.platform().enable_interrupts();

            if !self.schedule_pass() {
                self.platform().idle();
            }
        }
    }

    /// Run every Runnable record once, in slot order.
    ///
    /// Returns false when nothing was runnable.
    pub fn schedule_pass(&self) -> bool {
        let mut table = self.lock();
        let mut ran = false;

        for index in 0..NPROC {
            let slot = Slot(index);
            if table[slot].state != ProcState::Runnable {
                continue;
            }
            ran = true;

            let cpu = self.this_cpu();
            cpu.set_current(Some(slot));
            match (table.image(slot), table[slot].kstack.as_ref()) {
                (Some(image), Some(kstack)) => self.platform().activate_space(&image.space, kstack),
                (_, None) => fatal!("switchuvm: no kstack"),
                (None, _) => fatal!("switchuvm: no pgdir"),
            }
            table[slot].state = ProcState::Running;

            #[cfg(feature = "trace-sched")]
            log::trace!(
                "[SCHED] cpu{} -> pid {} tid {}",
                self.platform().cpu_id(),
                table[slot].pid,
                table[slot].tid
            );

            let to: *const P::Context = &table[slot].context;
            // SAFETY: both contexts live inside the manager and the table
            // lock travels with the switch.
            unsafe { self.platform().switch_context(cpu.scheduler_context(), to) };

            // Back from the record: it changed its own state first.
            self.platform().activate_kernel_space();
            self.this_cpu().set_current(None);
        }

        drop(table);
        ran
    }

    /// Switch from the calling record to this CPU's scheduler loop.
    ///
    /// The guard argument is proof of the table lock. The caller must hold
    /// nothing else, must already have moved out of Running, and gets the
    /// lock back when it is next scheduled.
    pub(crate) fn sched<'a>(&'a self, mut table: TableGuard<'a, P>) -> TableGuard<'a, P> {
        let cpu = self.this_cpu();
        let checked = match cpu.current() {
            None => Err("sched: no current record"),
            Some(_) if cpu.depth() != 1 => Err("sched locks"),
            Some(me) if table[me].state == ProcState::Running => Err("sched running"),
            Some(_) if self.platform().interrupts_enabled() => Err("sched interruptible"),
            Some(me) => Ok(me),
        };
        let me = match checked {
            Ok(me) => me,
            Err(violation) => {
                // The lock stays held; releasing it would touch the
                // interrupt nesting that was just found broken.
                core::mem::forget(table);
                fatal!("{}", violation)
            }
        };

        let intena = cpu.intena();
        let from: *mut P::Context = &mut table[me].context;
        // SAFETY: the context stays in place until the slot is recycled,
        // and a recycled record is never switched back into.
        unsafe { self.platform().switch_context(from, cpu.scheduler_context()) };
        self.this_cpu().set_intena(intena);

        table
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_now(&self) {
        let me = self.current();
        let mut table = self.lock();
        table[me].state = ProcState::Runnable;
        let _table = self.sched(table);
    }
}
