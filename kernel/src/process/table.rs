//! Process Table
//!
//! Fixed-capacity arena of execution-context records. Every access goes
//! through the table lock held by [`ProcessManager`](super::ProcessManager);
//! nothing in this module locks on its own.

use alloc::vec::Vec;
use core::fmt;
use core::ops::{Index, IndexMut};

use super::context::{KernelStack, TrapFrame};
use crate::config::{NAME_LEN, NOFILE, NPROC};
use crate::hal::Platform;
use crate::scheduler::priority::QueueLevel;
use crate::sync::Channel;

/// Process ID type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(pub u32);

impl Pid {
    /// Init process ID (always 1)
    pub const INIT: Pid = Pid(1);

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread ID type. Zero marks the main thread of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tid(pub u32);

impl Tid {
    pub const MAIN: Tid = Tid(0);

    pub const fn is_main(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a record in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(pub(crate) usize);

impl Slot {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Record state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcState {
    /// Slot is free
    #[default]
    Unused,
    /// Slot reserved, record being populated
    Embryo,
    /// Blocked on a channel
    Sleeping,
    /// Ready to run
    Runnable,
    /// Currently on a CPU
    Running,
    /// Exited, waiting to be reaped
    Zombie,
}

impl ProcState {
    /// Fixed-width label used by the process dump.
    pub fn label(self) -> &'static str {
        match self {
            ProcState::Unused => "unused",
            ProcState::Embryo => "embryo",
            ProcState::Sleeping => "sleep ",
            ProcState::Runnable => "runble",
            ProcState::Running => "run   ",
            ProcState::Zombie => "zombie",
        }
    }
}

/// User image owned by the main thread of a process.
#[derive(Debug)]
pub struct Image<S> {
    /// Page-table handle.
    pub space: S,
    /// Committed size in bytes.
    pub size: usize,
    /// Memory ceiling in bytes, 0 = unlimited.
    pub limit: usize,
}

impl<S> Image<S> {
    /// Whether growing to `new_size` stays under the ceiling.
    pub fn admits(&self, new_size: usize) -> bool {
        self.limit == 0 || new_size <= self.limit
    }
}

/// What a record is to its address space.
#[derive(Debug, Default)]
pub enum Role<S> {
    /// Free or not yet populated.
    #[default]
    Vacant,
    /// Main thread; owns the image.
    Process(Image<S>),
    /// Secondary thread sharing the image of `main`.
    Thread { main: Slot },
}

impl<S> Role<S> {
    pub fn is_process(&self) -> bool {
        matches!(self, Role::Process(_))
    }
}

/// Display name, truncated to `NAME_LEN - 1` bytes.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Name {
    bytes: [u8; NAME_LEN],
    len: usize,
}

impl Name {
    pub fn new(name: &str) -> Self {
        let mut len = name.len().min(NAME_LEN - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        let mut bytes = [0u8; NAME_LEN];
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self { bytes, len }
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

/// Execution-context record: a whole process or one lightweight thread.
pub struct Record<P: Platform> {
    pub pid: Pid,
    pub tid: Tid,
    pub state: ProcState,
    pub role: Role<P::Space>,
    /// Meaningful for process-level records; threads carry their
    /// process's parent.
    pub parent: Option<Slot>,
    pub chan: Option<Channel>,
    pub killed: bool,
    /// Set while this record tears its process down.
    pub exiting: bool,
    pub files: [Option<P::File>; NOFILE],
    pub cwd: Option<P::Dir>,
    pub name: Name,
    pub context: P::Context,
    pub trap_frame: TrapFrame,
    pub kstack: Option<KernelStack>,
    /// Thread exit value, consumed by join.
    pub retval: usize,
    pub stack_pages: usize,
    /// Reserved for a multilevel queue policy.
    pub priority: QueueLevel,
    /// Reserved for a multilevel queue policy.
    pub exec_ticks: u64,
}

impl<P: Platform> Record<P> {
    fn vacant() -> Self {
        Self {
            pid: Pid(0),
            tid: Tid::MAIN,
            state: ProcState::Unused,
            role: Role::Vacant,
            parent: None,
            chan: None,
            killed: false,
            exiting: false,
            files: core::array::from_fn(|_| None),
            cwd: None,
            name: Name::default(),
            context: P::Context::default(),
            trap_frame: TrapFrame::default(),
            kstack: None,
            retval: 0,
            stack_pages: 0,
            priority: QueueLevel::default(),
            exec_ticks: 0,
        }
    }

    pub fn is_unused(&self) -> bool {
        self.state == ProcState::Unused
    }

    /// Take the open files and working directory out of the record.
    pub fn take_handles(&mut self) -> Handles<P> {
        let files = self.files.iter_mut().filter_map(Option::take).collect();
        Handles {
            files,
            cwd: self.cwd.take(),
        }
    }
}

/// File handles detached from a record, closed once the table lock is dropped.
pub struct Handles<P: Platform> {
    pub files: Vec<P::File>,
    pub cwd: Option<P::Dir>,
}

impl<P: Platform> Handles<P> {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.cwd.is_none()
    }
}

/// Resources of a recycled slot still to be released.
pub struct Remains<P: Platform> {
    pub handles: Handles<P>,
    pub space: Option<P::Space>,
    pub kstack: Option<KernelStack>,
}

/// The record arena plus id counters.
pub struct Table<P: Platform> {
    records: [Record<P>; NPROC],
    next_pid: u32,
    next_tid: u32,
    pub(crate) init: Option<Slot>,
}

impl<P: Platform> Table<P> {
    pub fn new() -> Self {
        Self {
            records: core::array::from_fn(|_| Record::vacant()),
            next_pid: 1,
            next_tid: 1,
            init: None,
        }
    }

    /// All slot indices in physical order.
    pub fn slots(&self) -> impl Iterator<Item = Slot> {
        (0..NPROC).map(Slot)
    }

    /// Reserve the first Unused slot as an Embryo.
    ///
    /// The record gets `pid` when given (threads join their process);
    /// otherwise the next process id is drawn from the counter. Fails when
    /// no slot is free or the pid counter is spent.
    pub fn reserve(&mut self, pid: Option<Pid>) -> Option<Slot> {
        let slot = self.slots().find(|&s| self[s].is_unused())?;
        let pid = match pid {
            Some(pid) => pid,
            None => {
                let pid = Pid(self.next_pid);
                self.next_pid = self.next_pid.checked_add(1)?;
                pid
            }
        };

        let record = &mut self[slot];
        record.state = ProcState::Embryo;
        record.pid = pid;
        record.tid = Tid::MAIN;
        Some(slot)
    }

    /// Next thread id, or `None` once the counter is spent.
    pub fn fresh_tid(&mut self) -> Option<Tid> {
        let tid = Tid(self.next_tid);
        self.next_tid = self.next_tid.checked_add(1)?;
        Some(tid)
    }

    /// Live record with `pid`, preferring the main thread.
    pub fn find_pid(&self, pid: Pid) -> Option<Slot> {
        let mut found = None;
        for slot in self.slots() {
            let record = &self[slot];
            if record.is_unused() || record.pid != pid {
                continue;
            }
            if record.role.is_process() {
                return Some(slot);
            }
            found.get_or_insert(slot);
        }
        found
    }

    /// Live secondary thread with `tid`.
    pub fn find_tid(&self, tid: Tid) -> Option<Slot> {
        if tid.is_main() {
            return None;
        }
        self.slots()
            .find(|&s| !self[s].is_unused() && self[s].tid == tid)
    }

    /// Slot holding the image `slot` runs in.
    pub fn main_of(&self, slot: Slot) -> Slot {
        match self[slot].role {
            Role::Thread { main } => main,
            _ => slot,
        }
    }

    /// Image of the process `slot` belongs to.
    pub fn image(&self, slot: Slot) -> Option<&Image<P::Space>> {
        match &self[self.main_of(slot)].role {
            Role::Process(image) => Some(image),
            _ => None,
        }
    }

    pub fn image_mut(&mut self, slot: Slot) -> Option<&mut Image<P::Space>> {
        let main = self.main_of(slot);
        match &mut self[main].role {
            Role::Process(image) => Some(image),
            _ => None,
        }
    }

    /// Other live records sharing the pid of `slot`.
    pub fn siblings(&self, slot: Slot) -> Vec<Slot> {
        let pid = self[slot].pid;
        self.slots()
            .filter(|&s| s != slot && !self[s].is_unused() && self[s].pid == pid)
            .collect()
    }

    /// Thread ids of the live secondary threads of `main`.
    pub fn threads_of(&self, main: Slot) -> Vec<Tid> {
        self.slots()
            .filter(|&s| {
                !self[s].is_unused() && matches!(self[s].role, Role::Thread { main: m } if m == main)
            })
            .map(|s| self[s].tid)
            .collect()
    }

    /// Clear the record in `slot` and mark it Unused.
    pub fn recycle(&mut self, slot: Slot) -> Remains<P> {
        let record = &mut self[slot];
        let handles = record.take_handles();
        let kstack = record.kstack.take();
        let space = match core::mem::replace(&mut record.role, Role::Vacant) {
            Role::Process(image) => Some(image.space),
            _ => None,
        };
        *record = Record::vacant();
        Remains {
            handles,
            space,
            kstack,
        }
    }

    /// Number of live records.
    pub fn live(&self) -> usize {
        self.records.iter().filter(|r| !r.is_unused()).count()
    }
}

impl<P: Platform> Default for Table<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> Index<Slot> for Table<P> {
    type Output = Record<P>;

    fn index(&self, slot: Slot) -> &Record<P> {
        &self.records[slot.0]
    }
}

impl<P: Platform> IndexMut<Slot> for Table<P> {
    fn index_mut(&mut self, slot: Slot) -> &mut Record<P> {
        &mut self.records[slot.0]
    }
}
