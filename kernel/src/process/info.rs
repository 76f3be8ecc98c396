//! Process listing and table dump.

use alloc::string::String;
use alloc::vec::Vec;

use super::table::{Pid, ProcState, Role, Tid};
use super::ProcessManager;
use crate::hal::Platform;

/// One live process as shown by the process manager console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: Pid,
    pub stack_pages: usize,
    /// Committed image size in bytes.
    pub size: usize,
    /// Memory ceiling in bytes, 0 = unlimited.
    pub limit: usize,
    /// Secondary threads sharing the image.
    pub threads: Vec<Tid>,
}

impl core::fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "name: {} | pid: {} | stack pages: {} | memory: {} | memlim: {} |",
            self.name, self.pid, self.stack_pages, self.size, self.limit
        )?;
        for tid in &self.threads {
            write!(f, "\n   thread for process {} with thread id: {}", self.pid, tid)?;
        }
        Ok(())
    }
}

impl<P: Platform> ProcessManager<P> {
    /// Snapshot of every runnable, running or sleeping process.
    pub fn process_list(&self) -> Vec<ProcessInfo> {
        let table = self.lock();
        table
            .slots()
            .filter(|&slot| {
                matches!(
                    table[slot].state,
                    ProcState::Runnable | ProcState::Running | ProcState::Sleeping
                )
            })
            .filter_map(|slot| {
                let record = &table[slot];
                let Role::Process(image) = &record.role else {
                    return None;
                };
                Some(ProcessInfo {
                    name: String::from(record.name.as_str()),
                    pid: record.pid,
                    stack_pages: record.stack_pages,
                    size: image.size,
                    limit: image.limit,
                    threads: table.threads_of(slot),
                })
            })
            .collect()
    }

    /// Print the table to the kernel log (console ^P).
    ///
    /// Never waits for the table lock: a busy table is reported instead of
    /// dumped, so this is safe from a path that already holds it.
    pub fn dump(&self) {
        let Some(table) = self.try_lock() else {
            log::warn!("[PROC] dump: table busy");
            return;
        };
        for slot in table.slots() {
            let record = &table[slot];
            if record.is_unused() {
                continue;
            }
            log::info!(
                "[PROC] {} {} {} tid {}{}",
                record.pid,
                record.state.label(),
                record.name,
                record.tid,
                if record.killed { " killed" } else { "" }
            );
        }
    }
}
