//! Lightweight threads
//!
//! A thread is a record that shares its process's pid and image. It gets
//! its own kernel stack, trap frame and a two-page slot at the top of the
//! image: an inaccessible guard page followed by its user stack.

use core::mem::size_of;

use super::table::{ProcState, Role, Tid};
use super::ProcessManager;
use crate::config::{PAGE_SIZE, THREAD_EXIT_SENTINEL};
use crate::error::{ProcError, Result};
use crate::hal::{PageFlags, Platform};
use crate::sync::Channel;

const WORD: usize = size_of::<usize>();

/// Initial user stack of a thread: return address, then the argument.
fn initial_stack(arg: usize) -> [u8; 2 * WORD] {
    let mut words = [0u8; 2 * WORD];
    words[..WORD].copy_from_slice(&THREAD_EXIT_SENTINEL.to_le_bytes());
    words[WORD..].copy_from_slice(&arg.to_le_bytes());
    words
}

impl<P: Platform> ProcessManager<P> {
    /// Start a thread running `start(arg)` in the calling process.
    ///
    /// Returns the new thread id. Nothing is left behind on failure: the
    /// slot is recycled and any image growth is undone.
    pub fn thread_create(&self, start: usize, arg: usize) -> Result<Tid> {
        let me = self.current();
        let pid = self.lock()[me].pid;
        let slot = self.allocate(Some(pid))?;

        let mut table = self.lock();
        let main = table.main_of(me);
        let Some(tid) = table.fresh_tid() else {
            self.abandon(table, slot);
            return Err(ProcError::ExhaustedTable);
        };

        let Some(image) = table.image_mut(main) else {
            self.abandon(table, slot);
            return Err(ProcError::AddressSpaceFailure);
        };
        let base = image.size;
        let top = match base.checked_add(2 * PAGE_SIZE) {
            Some(top) if image.admits(top) => top,
            Some(_) => {
                self.abandon(table, slot);
                return Err(ProcError::QuotaExceeded);
            }
            None => {
                self.abandon(table, slot);
                return Err(ProcError::AddressSpaceFailure);
            }
        };
        if self
            .platform()
            .grow_space(&mut image.space, base, top, PageFlags::USER_DATA)
            .is_none()
        {
            self.abandon(table, slot);
            return Err(ProcError::AddressSpaceFailure);
        }
        self.platform().protect_inaccessible(&mut image.space, base);

        let sp = top - 2 * WORD;
        if self
            .platform()
            .copy_out(&mut image.space, sp, &initial_stack(arg))
            .is_none()
        {
            if self
                .platform()
                .shrink_space(&mut image.space, top, base)
                .is_none()
            {
                // Still mapped, so still part of the image.
                log::warn!(
                    "[THREAD] pid {} could not release stack pages {:#x}..{:#x}",
                    pid,
                    base,
                    top
                );
                image.size = top;
            }
            self.abandon(table, slot);
            return Err(ProcError::AddressSpaceFailure);
        }
        image.size = top;

        let owner = &table[main];
        let parent = owner.parent;
        let name = owner.name;
        let mut trap_frame = owner.trap_frame;
        trap_frame.set_return_value(0);
        trap_frame.set_entry(start as u64, sp as u64);
        let files = core::array::from_fn(|i| {
            owner.files[i]
                .as_ref()
                .map(|file| self.platform().dup_file(file))
        });
        let cwd = owner.cwd.as_ref().map(|dir| self.platform().dup_dir(dir));

        let record = &mut table[slot];
        record.tid = tid;
        record.role = Role::Thread { main };
        record.parent = parent;
        record.trap_frame = trap_frame;
        record.files = files;
        record.cwd = cwd;
        record.name = name;
        record.state = ProcState::Runnable;

        log::debug!("[THREAD] pid {} created tid {} (stack {:#x})", pid, tid, sp);
        Ok(tid)
    }

    /// Finish the calling thread with `retval`. Never returns.
    ///
    /// Called on a main thread this ends the whole process, as its image
    /// cannot outlive it.
    pub fn thread_exit(&self, retval: usize) -> ! {
        let me = self.current();
        let handles = {
            let mut table = self.lock();
            if table.init == Some(me) {
                fatal!("init exiting");
            }
            table[me].retval = retval;
            if !matches!(table[me].role, Role::Thread { .. }) {
                drop(table);
                self.exit();
            }
            table[me].take_handles()
        };
        self.release_handles(handles);

        let mut table = self.lock();
        match table[me].role {
            Role::Thread { main } => {
                table.wake(Channel::Record(main));
            }
            _ => {
                if let Some(parent) = table[me].parent {
                    table.wake(Channel::Record(parent));
                }
            }
        }
        let tid = table[me].tid;
        table.wake(Channel::ThreadExit(tid));

        log::debug!("[THREAD] tid {} exited with {:#x}", tid, retval);

        table[me].state = ProcState::Zombie;
        let _table = self.sched(table);
        fatal!("zombie exit");
    }

    /// Wait for thread `tid` of the calling process to exit and return its
    /// exit value. The thread's slot is recycled.
    pub fn thread_join(&self, tid: Tid) -> Result<usize> {
        let me = self.current();
        let mut table = self.lock();

        loop {
            let pid = table[me].pid;
            let target = table
                .find_tid(tid)
                .filter(|&slot| slot != me && table[slot].pid == pid)
                .ok_or(ProcError::InvalidTarget)?;

            if table[target].state == ProcState::Zombie {
                let retval = table[target].retval;
                let remains = table.recycle(target);
                drop(table);
                self.release(remains);
                return Ok(retval);
            }

            if table[me].killed {
                return Err(ProcError::InvalidTarget);
            }

            table = self.sleep_locked(Channel::ThreadExit(tid), table);
        }
    }

    /// Recycle the slot of thread `tid` of the calling process, whatever its
    /// state. Used by process managers that drop threads without joining.
    pub fn clean_thread(&self, tid: Tid) -> Result<()> {
        let me = self.current();
        let mut table = self.lock();
        let pid = table[me].pid;
        let target = table
            .find_tid(tid)
            .filter(|&slot| slot != me && table[slot].pid == pid)
            .ok_or(ProcError::InvalidTarget)?;
        if matches!(table[target].state, ProcState::Running | ProcState::Embryo) {
            table[target].killed = true;
            return Err(ProcError::InvalidTarget);
        }
        let remains = table.recycle(target);
        // Joiners of the tid re-check and find it gone.
        table.wake(Channel::ThreadExit(tid));
        drop(table);
        self.release(remains);
        Ok(())
    }
}
