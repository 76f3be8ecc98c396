//! Sleep/wakeup channels.
//!
//! A sleeper names the condition it waits for with a [`Channel`]; a waker
//! makes every record sleeping on that channel runnable. Channels carry no
//! state: the condition itself must be re-checked after waking, under the
//! lock that protects it.

use spin::{Mutex, MutexGuard};

use super::TableGuard;
use crate::hal::Platform;
use crate::process::table::{ProcState, Slot, Table, Tid};
use crate::process::ProcessManager;

/// Identifier of a condition a record can sleep on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Events concerning a record: a child exiting, a thread finishing.
    Record(Slot),
    /// The thread with this id has exited.
    ThreadExit(Tid),
    /// Free-form channel for other subsystems (buffers, console, ticks).
    Addr(usize),
}

impl<P: Platform> Table<P> {
    /// Make every record sleeping on `chan` runnable. Returns how many woke.
    pub fn wake(&mut self, chan: Channel) -> usize {
        let mut woken = 0;
        for slot in self.slots() {
            let record = &mut self[slot];
            if record.state == ProcState::Sleeping && record.chan == Some(chan) {
                record.state = ProcState::Runnable;
                woken += 1;
            }
        }
        woken
    }
}

impl<P: Platform> ProcessManager<P> {
    /// Atomically release `guard` and sleep on `chan`; reacquires `lock`
    /// before returning.
    ///
    /// The table lock is taken before `guard` is dropped, so a waker that
    /// must hold `lock` to change the condition cannot slip its wakeup in
    /// between the check and the sleep.
    pub fn sleep<'a, T>(
        &self,
        chan: Channel,
        lock: &'a Mutex<T>,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        let table = self.lock();
        drop(guard);
        let table = self.sleep_locked(chan, table);
        drop(table);
        lock.lock()
    }

    /// Sleep on `chan` while holding only the table lock.
    pub(crate) fn sleep_locked<'a>(
        &'a self,
        chan: Channel,
        mut table: TableGuard<'a, P>,
    ) -> TableGuard<'a, P> {
        let me = match self.this_cpu().current() {
            Some(slot) => slot,
            None => fatal!("sleep"),
        };

        table[me].chan = Some(chan);
        table[me].state = ProcState::Sleeping;

        let mut table = self.sched(table);

        table[me].chan = None;
        table
    }

    /// Wake every record sleeping on `chan`.
    pub fn wakeup(&self, chan: Channel) {
        let mut table = self.lock();
        table.wake(chan);
    }
}
