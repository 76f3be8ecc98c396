//! Process Manager
//!
//! Process-level lifecycle: allocation, fork, exit, wait, kill, memory
//! limits and image growth. Thread operations live in
//! [`thread`](super::thread), the CPU hand-off in [`crate::scheduler`].

use alloc::vec::Vec;
use spin::Mutex;

use super::context::{KernelStack, TrapFrame};
use super::table::{Handles, Image, Name, Pid, ProcState, Remains, Role, Slot, Table, Tid};
use crate::config::{DEFAULT_STACK_PAGES, FIRST_USER_PID, NCPU, PAGE_SIZE};
use crate::error::{ProcError, Result};
use crate::hal::{PageFlags, Platform};
use crate::scheduler::cpu::Cpu;
use crate::sync::Channel;

/// Freshly built user image handed to [`ProcessManager::replace_image`].
pub struct NewImage<S> {
    pub space: S,
    pub size: usize,
    pub entry: usize,
    pub stack_pointer: usize,
    pub stack_pages: usize,
}

/// Owner of the process table and the per-CPU scheduler state.
pub struct ProcessManager<P: Platform> {
    pub(crate) table: Mutex<Table<P>>,
    pub(crate) cpus: [Cpu<P::Context>; NCPU],
    platform: P,
}

impl<P: Platform> ProcessManager<P> {
    /// Create a manager with an empty table.
    pub fn new(platform: P) -> Self {
        Self {
            table: Mutex::new(Table::new()),
            cpus: core::array::from_fn(|_| Cpu::new()),
            platform,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// First code a new record runs, on its own kernel stack.
    ///
    /// The scheduler switched here with the table lock held; release it on
    /// the scheduler's behalf. The caller then returns to user mode through
    /// the record's trap frame.
    pub fn first_return(&self) {
        // SAFETY: the lock was taken by the scheduler loop of this CPU,
        // which is suspended until this record gives the CPU back.
        unsafe { self.table.force_unlock() };
        self.pop_off();
    }

    /// Reserve a slot and give it a kernel stack and a first-run context.
    ///
    /// The record is left Embryo; the caller populates it and makes it
    /// Runnable, or hands it back through [`ProcessManager::abandon`].
    pub(crate) fn allocate(&self, pid: Option<Pid>) -> Result<Slot> {
        let slot = {
            let mut table = self.lock();
            table.reserve(pid).ok_or(ProcError::ExhaustedTable)?
        };

        let kstack = match KernelStack::allocate() {
            Ok(kstack) => kstack,
            Err(e) => {
                self.lock().recycle(slot);
                return Err(e);
            }
        };
        let context = self.platform.first_run_context(&kstack);

        let mut table = self.lock();
        let record = &mut table[slot];
        record.context = context;
        record.trap_frame = TrapFrame::default();
        record.kstack = Some(kstack);
        record.stack_pages = DEFAULT_STACK_PAGES;
        Ok(slot)
    }

    /// Undo a partial allocation while the table lock is held.
    pub(crate) fn abandon(&self, mut table: crate::sync::TableGuard<'_, P>, slot: Slot) {
        let remains = table.recycle(slot);
        drop(table);
        self.release(remains);
    }

    /// Close detached file handles. Must run without the table lock.
    pub(crate) fn release_handles(&self, handles: Handles<P>) {
        for file in handles.files {
            self.platform.close_file(file);
        }
        if let Some(cwd) = handles.cwd {
            self.platform.begin_op();
            self.platform.release_dir(cwd);
            self.platform.end_op();
        }
    }

    /// Release everything a recycled slot held.
    pub(crate) fn release(&self, remains: Remains<P>) {
        self.release_handles(remains.handles);
        if let Some(space) = remains.space {
            self.platform.destroy_space(space);
        }
        drop(remains.kstack);
    }

    /// Slot of the live record with `pid` (its main thread when it has one).
    ///
    /// The table lock is released before returning; re-validate the slot
    /// under the lock before relying on it.
    pub fn find_by_pid(&self, pid: Pid) -> Result<Slot> {
        self.lock().find_pid(pid).ok_or(ProcError::InvalidTarget)
    }

    /// Process id of the calling record.
    pub fn getpid(&self) -> Pid {
        let me = self.current();
        self.lock()[me].pid
    }

    /// Thread id of the calling record (0 for a main thread).
    pub fn gettid(&self) -> Tid {
        let me = self.current();
        self.lock()[me].tid
    }

    /// Whether the calling record has been asked to die.
    pub fn killed(&self) -> bool {
        let me = self.current();
        self.lock()[me].killed
    }

    /// Run `f` on the calling record's trap frame.
    pub fn with_trap_frame<R>(&self, f: impl FnOnce(&mut TrapFrame) -> R) -> R {
        let me = self.current();
        let mut table = self.lock();
        f(&mut table[me].trap_frame)
    }

    /// Set up the first user process from a one-page image.
    pub fn user_init(&self, initcode: &[u8]) -> Result<Pid> {
        if initcode.len() > PAGE_SIZE {
            return Err(ProcError::InvalidArgument);
        }

        let slot = self.allocate(None)?;
        let space = self.platform.create_space().and_then(|mut space| {
            let mapped = self
                .platform
                .grow_space(&mut space, 0, PAGE_SIZE, PageFlags::USER_DATA)
                .and_then(|_| self.platform.copy_out(&mut space, 0, initcode));
            match mapped {
                Some(()) => Some(space),
                None => {
                    self.platform.destroy_space(space);
                    None
                }
            }
        });

        let mut table = self.lock();
        let Some(space) = space else {
            self.abandon(table, slot);
            return Err(ProcError::AddressSpaceFailure);
        };

        let cwd = self.platform.root_dir();
        let record = &mut table[slot];
        record.role = Role::Process(Image {
            space,
            size: PAGE_SIZE,
            limit: 0,
        });
        record.trap_frame = TrapFrame::new_user(0, PAGE_SIZE as u64);
        record.name = Name::new("initcode");
        record.cwd = Some(cwd);
        record.state = ProcState::Runnable;
        let pid = record.pid;
        table.init = Some(slot);

        log::info!("[PROC] init process created (pid {})", pid);
        Ok(pid)
    }

    /// Create a copy of the calling process. Returns the child's pid; the
    /// child itself sees 0.
    pub fn fork(&self) -> Result<Pid> {
        let me = self.current();
        let child = self.allocate(None)?;

        let mut table = self.lock();
        let copied = table.image(me).and_then(|image| {
            self.platform
                .copy_space(&image.space, image.size)
                .map(|space| Image {
                    space,
                    size: image.size,
                    limit: image.limit,
                })
        });
        let Some(image) = copied else {
            self.abandon(table, child);
            return Err(ProcError::AddressSpaceFailure);
        };

        let main = table.main_of(me);
        let stack_pages = table[main].stack_pages;
        let parent = &table[me];
        let mut trap_frame = parent.trap_frame;
        trap_frame.set_return_value(0);
        let name = parent.name;
        let files = core::array::from_fn(|i| {
            parent.files[i]
                .as_ref()
                .map(|file| self.platform.dup_file(file))
        });
        let cwd = parent.cwd.as_ref().map(|dir| self.platform.dup_dir(dir));
        let parent_pid = parent.pid;

        let record = &mut table[child];
        record.role = Role::Process(image);
        record.parent = Some(main);
        record.trap_frame = trap_frame;
        record.files = files;
        record.cwd = cwd;
        record.name = name;
        record.stack_pages = stack_pages;
        record.state = ProcState::Runnable;
        let pid = record.pid;

        log::debug!("[PROC] fork: {} -> {}", parent_pid, pid);
        Ok(pid)
    }

    /// Terminate the calling process. Never returns.
    ///
    /// Every other thread of the process is torn down first. A secondary
    /// thread calling this is promoted to main thread so that the image is
    /// released exactly once, by whoever reaps the process.
    pub fn exit(&self) -> ! {
        let me = self.current();
        let victim = {
            let mut table = self.lock();
            if table.init == Some(me) {
                fatal!("init exiting");
            }
            let victim = table
                .siblings(me)
                .into_iter()
                .any(|s| table[s].exiting);
            if !victim {
                table[me].exiting = true;
            }
            victim
        };

        if victim {
            // Another thread is already taking the process down and will
            // recycle this record.
            self.vanish(me);
        }

        self.promote_to_main(me);
        self.purge_other_threads(me);

        let handles = self.lock()[me].take_handles();
        self.release_handles(handles);

        let mut table = self.lock();

        if let Some(parent) = table[me].parent {
            table.wake(Channel::Record(parent));
        }

        let init = table.init;
        let mut orphan_zombie = false;
        for slot in table.slots() {
            if table[slot].parent == Some(me) {
                table[slot].parent = init;
                orphan_zombie |= table[slot].state == ProcState::Zombie;
            }
        }
        if let (true, Some(init)) = (orphan_zombie, init) {
            table.wake(Channel::Record(init));
        }

        log::debug!("[PROC] exit: pid {}", table[me].pid);

        table[me].state = ProcState::Zombie;
        let _table = self.sched(table);
        fatal!("zombie exit");
    }

    /// Become a Zombie without touching the rest of the process.
    pub(crate) fn vanish(&self, me: Slot) -> ! {
        let handles = self.lock()[me].take_handles();
        self.release_handles(handles);

        let mut table = self.lock();
        table[me].state = ProcState::Zombie;
        let _table = self.sched(table);
        fatal!("zombie exit");
    }

    /// Reap one exited child process and return its pid.
    ///
    /// Sleeps until a child exits. Fails with `NoSuchWork` when there are no
    /// child processes or the caller has been killed.
    pub fn wait(&self) -> Result<Pid> {
        let me = self.current();
        let mut table = self.lock();
        let parent = table.main_of(me);

        loop {
            let mut have_kids = false;
            for slot in table.slots() {
                let record = &table[slot];
                if record.parent != Some(parent) || !record.role.is_process() {
                    continue;
                }
                have_kids = true;
                if record.state == ProcState::Zombie {
                    let pid = record.pid;
                    let remains = table.recycle(slot);
                    drop(table);
                    self.release(remains);
                    log::debug!("[PROC] wait: reaped pid {}", pid);
                    return Ok(pid);
                }
            }

            if !have_kids || table[me].killed {
                return Err(ProcError::NoSuchWork);
            }

            table = self.sleep_locked(Channel::Record(parent), table);
        }
    }

    /// Ask every record of process `pid` to die.
    ///
    /// Sleeping records are made runnable so they notice the flag.
    pub fn kill(&self, pid: Pid) -> Result<()> {
        let mut table = self.lock();
        let mut found = false;
        for slot in table.slots() {
            let record = &mut table[slot];
            if record.is_unused() || record.pid != pid {
                continue;
            }
            found = true;
            record.killed = true;
            if record.state == ProcState::Sleeping {
                record.state = ProcState::Runnable;
            }
        }

        if found {
            log::debug!("[PROC] kill: pid {}", pid);
            Ok(())
        } else {
            Err(ProcError::InvalidTarget)
        }
    }

    /// Install a memory ceiling (bytes, 0 = unlimited) on process `pid`.
    pub fn set_memory_limit(&self, pid: Pid, limit: isize) -> Result<()> {
        if pid.as_u32() < FIRST_USER_PID {
            log::warn!("[PROC] cannot set memory limit for kernel process {}", pid);
            return Err(ProcError::InvalidTarget);
        }
        let limit = usize::try_from(limit).map_err(|_| ProcError::InvalidArgument)?;

        let mut table = self.lock();
        let slot = table.find_pid(pid).ok_or(ProcError::InvalidTarget)?;
        let image = table.image_mut(slot).ok_or(ProcError::InvalidTarget)?;
        if limit < image.size {
            return Err(ProcError::QuotaExceeded);
        }
        image.limit = limit;
        Ok(())
    }

    /// Grow or shrink the calling process's image by `delta` bytes.
    ///
    /// Returns the size before the change. The new size is visible to every
    /// thread of the process.
    pub fn grow(&self, delta: isize) -> Result<usize> {
        let me = self.current();
        let mut table = self.lock();
        let image = table.image_mut(me).ok_or(ProcError::AddressSpaceFailure)?;
        let old_size = image.size;
        let new_size = old_size
            .checked_add_signed(delta)
            .ok_or(ProcError::AddressSpaceFailure)?;

        if delta > 0 {
            if !image.admits(new_size) {
                return Err(ProcError::QuotaExceeded);
            }
            image.size = self
                .platform
                .grow_space(&mut image.space, old_size, new_size, PageFlags::USER_DATA)
                .ok_or(ProcError::AddressSpaceFailure)?;
        } else if delta < 0 {
            image.size = self
                .platform
                .shrink_space(&mut image.space, old_size, new_size)
                .ok_or(ProcError::AddressSpaceFailure)?;
        }

        if let (Some(image), Some(kstack)) = (table.image(me), table[me].kstack.as_ref()) {
            self.platform.activate_space(&image.space, kstack);
        }
        Ok(old_size)
    }

    /// Commit a freshly loaded image for the calling process.
    ///
    /// Every other thread of the process is removed, the caller becomes the
    /// main thread and the old image is destroyed. On error the new space is
    /// destroyed and the caller keeps running its old image.
    pub fn replace_image(&self, new: NewImage<P::Space>, name: &str) -> Result<()> {
        let me = self.current();
        let admitted = {
            let table = self.lock();
            table.image(me).map(|image| image.limit == 0 || new.size <= image.limit)
        };
        match admitted {
            Some(true) => {}
            Some(false) => {
                self.platform.destroy_space(new.space);
                return Err(ProcError::QuotaExceeded);
            }
            None => {
                self.platform.destroy_space(new.space);
                return Err(ProcError::AddressSpaceFailure);
            }
        }

        self.promote_to_main(me);
        self.purge_other_threads(me);

        let mut table = self.lock();
        let old = match &mut table[me].role {
            Role::Process(image) => {
                image.size = new.size;
                core::mem::replace(&mut image.space, new.space)
            }
            _ => fatal!("exec: no image"),
        };
        let record = &mut table[me];
        record
            .trap_frame
            .set_entry(new.entry as u64, new.stack_pointer as u64);
        record.stack_pages = new.stack_pages;
        record.name = Name::new(name);

        if let (Some(image), Some(kstack)) = (table.image(me), table[me].kstack.as_ref()) {
            self.platform.activate_space(&image.space, kstack);
        }
        drop(table);

        self.platform.destroy_space(old);
        Ok(())
    }

    /// Make the calling thread the main thread of its process.
    ///
    /// The image moves to the caller, the old main thread becomes an
    /// ordinary secondary thread and children are re-homed to the caller.
    pub(crate) fn promote_to_main(&self, me: Slot) {
        let mut table = self.lock();
        let Role::Thread { main } = table[me].role else {
            return;
        };

        let image = match core::mem::replace(&mut table[main].role, Role::Thread { main: me }) {
            Role::Process(image) => image,
            _ => fatal!("promote: main thread without image"),
        };
        table[me].role = Role::Process(image);

        let tid = table[me].tid;
        table[me].tid = table[main].tid;
        table[main].tid = tid;
        table[me].parent = table[main].parent;
        table[me].stack_pages = table[main].stack_pages;

        for slot in table.slots() {
            if let Role::Thread { main: owner } = &mut table[slot].role {
                if *owner == main {
                    *owner = me;
                }
            }
            if table[slot].parent == Some(main) {
                table[slot].parent = Some(me);
            }
        }
        if table.init == Some(main) {
            table.init = Some(me);
        }

        log::debug!("[THREAD] tid {} promoted to main of pid {}", tid, table[me].pid);
    }

    /// Recycle every other record sharing the caller's pid.
    ///
    /// A sibling still on a CPU (or still being built) is marked killed and
    /// the caller yields until it has left.
    pub(crate) fn purge_other_threads(&self, me: Slot) {
        loop {
            let mut table = self.lock();
            let mut remains = Vec::new();
            let mut busy = false;

            for slot in table.siblings(me) {
                match table[slot].state {
                    ProcState::Running | ProcState::Embryo => {
                        table[slot].killed = true;
                        busy = true;
                    }
                    _ => remains.push(table.recycle(slot)),
                }
            }
            drop(table);

            for remains in remains {
                self.release(remains);
            }
            if !busy {
                return;
            }
            self.yield_now();
        }
    }
}
