//! Process table lock guard.
//!
//! Holding the table lock implies interrupts are disabled on the holding
//! CPU. Dropping the guard releases the lock first and then restores the
//! interrupt state, so an interrupt handler on the same CPU can never spin
//! on a lock its own CPU holds.
//!
//! The lock is handed across a context switch: a record that enters the
//! scheduler with the lock held gets its guard back when some scheduler
//! loop switches into it again, possibly on another CPU.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use spin::MutexGuard;

use crate::hal::Platform;
use crate::process::table::Table;
use crate::process::ProcessManager;

/// Exclusive access to the process table.
pub struct TableGuard<'a, P: Platform> {
    inner: ManuallyDrop<MutexGuard<'a, Table<P>>>,
    manager: &'a ProcessManager<P>,
}

impl<'a, P: Platform> TableGuard<'a, P> {
    pub(crate) fn new(manager: &'a ProcessManager<P>, inner: MutexGuard<'a, Table<P>>) -> Self {
        Self {
            inner: ManuallyDrop::new(inner),
            manager,
        }
    }
}

impl<P: Platform> ProcessManager<P> {
    /// Acquire the table lock with interrupts disabled.
    pub fn lock(&self) -> TableGuard<'_, P> {
        self.push_off();
        let inner = self.table.lock();
        TableGuard::new(self, inner)
    }

    /// Acquire the table lock only if it is free right now.
    pub fn try_lock(&self) -> Option<TableGuard<'_, P>> {
        self.push_off();
        match self.table.try_lock() {
            Some(inner) => Some(TableGuard::new(self, inner)),
            None => {
                self.pop_off();
                None
            }
        }
    }

    pub fn holding(&self) -> bool {
        self.table.is_locked()
    }
}

impl<P: Platform> Deref for TableGuard<'_, P> {
    type Target = Table<P>;

    fn deref(&self) -> &Table<P> {
        &self.inner
    }
}

impl<P: Platform> DerefMut for TableGuard<'_, P> {
    fn deref_mut(&mut self) -> &mut Table<P> {
        &mut self.inner
    }
}

impl<P: Platform> Drop for TableGuard<'_, P> {
    fn drop(&mut self) {
        // SAFETY: `inner` is never touched again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        self.manager.pop_off();
    }
}
