//! Host simulation of the kernel collaborators.
//!
//! Every execution context is an OS thread. A context switch hands a baton
//! (carrying the CPU index) to the target thread and blocks on the caller's
//! own baton, so exactly one thread runs per simulated CPU. "User programs"
//! are closures registered per (pid, tid) and looked up by the record's
//! first run.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::NCPU;
use crate::hal::{AddressSpaces, FileSystem, Machine, PageFlags};
use crate::process::{KernelStack, Pid, ProcessManager, Tid};
use crate::sync::Channel;

pub type Kernel = ProcessManager<Sim>;

/// Program run by a record: everything between its first return to user
/// mode and its exit.
pub type Program = Box<dyn FnOnce(&'static Kernel) + Send>;

/// CPU index seen by threads that are not simulated CPUs (the test body
/// inspecting a booted kernel).
const OBSERVER_CPU: usize = NCPU - 1;

const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(OBSERVER_CPU) };
}

fn set_cpu(cpu: usize) {
    CPU.with(|c| c.set(cpu));
}

struct Baton {
    cpu: Mutex<Option<usize>>,
    ready: Condvar,
}

impl Baton {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cpu: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn give(&self, cpu: usize) {
        *self.cpu.lock().unwrap() = Some(cpu);
        self.ready.notify_one();
    }

    fn take(&self) -> usize {
        let mut cpu = self.cpu.lock().unwrap();
        loop {
            if let Some(cpu) = cpu.take() {
                return cpu;
            }
            cpu = self.ready.wait(cpu).unwrap();
        }
    }
}

/// Saved context: the baton its thread blocks on.
pub struct SimContext {
    baton: Arc<Baton>,
    fresh: AtomicBool,
}

impl Default for SimContext {
    fn default() -> Self {
        Self {
            baton: Baton::new(),
            fresh: AtomicBool::new(false),
        }
    }
}

/// Registry of programs waiting for their record to start.
#[derive(Default)]
pub struct Programs {
    pending: Mutex<HashMap<(Pid, Tid), Program>>,
    added: Condvar,
}

impl Programs {
    pub fn register(&self, pid: Pid, tid: Tid, program: Program) {
        self.pending.lock().unwrap().insert((pid, tid), program);
        self.added.notify_all();
    }

    fn claim(&self, pid: Pid, tid: Tid) -> Program {
        let mut pending = self.pending.lock().unwrap();
        loop {
            if let Some(program) = pending.remove(&(pid, tid)) {
                return program;
            }
            pending = self.added.wait(pending).unwrap();
        }
    }
}

/// Handle to a simulated page table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SimSpace {
    pub id: usize,
}

#[derive(Default)]
struct SpaceState {
    size: usize,
    bytes: BTreeMap<usize, u8>,
    guards: Vec<usize>,
}

#[derive(Default)]
struct VmState {
    next_id: usize,
    spaces: HashMap<usize, SpaceState>,
    double_frees: usize,
}

/// In-memory address spaces with injectable failures.
#[derive(Default)]
pub struct SimVm {
    state: Mutex<VmState>,
    fail_create: AtomicBool,
    fail_copy: AtomicBool,
    fail_grow: AtomicBool,
    fail_copy_out: AtomicBool,
    fail_shrink: AtomicBool,
}

impl SimVm {
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_copy(&self, fail: bool) {
        self.fail_copy.store(fail, Ordering::SeqCst);
    }

    pub fn fail_grow(&self, fail: bool) {
        self.fail_grow.store(fail, Ordering::SeqCst);
    }

    pub fn fail_copy_out(&self, fail: bool) {
        self.fail_copy_out.store(fail, Ordering::SeqCst);
    }

    pub fn fail_shrink(&self, fail: bool) {
        self.fail_shrink.store(fail, Ordering::SeqCst);
    }

    fn insert(&self, space: SpaceState) -> SimSpace {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.spaces.insert(id, space);
        SimSpace { id }
    }

    /// Number of spaces created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().spaces.len()
    }

    pub fn double_frees(&self) -> usize {
        self.state.lock().unwrap().double_frees
    }

    pub fn size_of(&self, id: usize) -> Option<usize> {
        self.state.lock().unwrap().spaces.get(&id).map(|s| s.size)
    }

    pub fn guards(&self, id: usize) -> Vec<usize> {
        self.state
            .lock()
            .unwrap()
            .spaces
            .get(&id)
            .map(|s| s.guards.clone())
            .unwrap_or_default()
    }

    pub fn read_word(&self, id: usize, va: usize) -> Option<usize> {
        let state = self.state.lock().unwrap();
        let space = state.spaces.get(&id)?;
        let mut word = [0u8; core::mem::size_of::<usize>()];
        for (i, byte) in word.iter_mut().enumerate() {
            *byte = *space.bytes.get(&(va + i))?;
        }
        Some(usize::from_le_bytes(word))
    }
}

/// File handle: counted, never backed by anything.
#[derive(Debug, PartialEq, Eq)]
pub struct SimFile(pub usize);

/// Directory handle.
#[derive(Debug, PartialEq, Eq)]
pub struct SimDir;

/// Reference-counting file system.
#[derive(Default)]
pub struct SimFs {
    open_files: AtomicIsize,
    dir_refs: AtomicIsize,
    in_op: AtomicIsize,
    unbracketed: AtomicUsize,
}

impl SimFs {
    /// Open a new file (as `open` would) for a program to install.
    pub fn open(&self, id: usize) -> SimFile {
        self.open_files.fetch_add(1, Ordering::SeqCst);
        SimFile(id)
    }

    pub fn open_files(&self) -> isize {
        self.open_files.load(Ordering::SeqCst)
    }

    pub fn dir_refs(&self) -> isize {
        self.dir_refs.load(Ordering::SeqCst)
    }

    pub fn unbracketed(&self) -> usize {
        self.unbracketed.load(Ordering::SeqCst)
    }
}

/// The simulated platform.
pub struct Sim {
    intr: [AtomicBool; NCPU],
    kernel: AtomicPtr<Kernel>,
    halted: AtomicBool,
    switches: AtomicUsize,
    pub vm: SimVm,
    pub fs: SimFs,
    pub programs: Programs,
}

impl Sim {
    pub fn new(ncpu: usize) -> Self {
        assert!(ncpu > 0 && ncpu < NCPU, "simulated CPUs must leave room for the observer");
        Self {
            intr: core::array::from_fn(|_| AtomicBool::new(false)),
            kernel: AtomicPtr::new(std::ptr::null_mut()),
            halted: AtomicBool::new(false),
            switches: AtomicUsize::new(0),
            vm: SimVm::default(),
            fs: SimFs::default(),
            programs: Programs::default(),
        }
    }

    fn kernel(&self) -> &'static Kernel {
        let kernel = self.kernel.load(Ordering::SeqCst);
        assert!(!kernel.is_null(), "simulated kernel not booted");
        // SAFETY: only ever set by `boot`, to a leaked manager.
        unsafe { &*kernel }
    }

    /// Stop idle CPUs from polling.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    fn start_record(&self, baton: Arc<Baton>) {
        let kernel = self.kernel();
        thread::spawn(move || run_record(kernel, baton));
    }
}

fn run_record(kernel: &'static Kernel, baton: Arc<Baton>) {
    set_cpu(baton.take());
    kernel.first_return();

    let pid = kernel.getpid();
    let tid = kernel.gettid();
    let program = kernel.platform().programs.claim(pid, tid);
    program(kernel);

    // Falling off the end of a program.
    if tid.is_main() {
        kernel.exit()
    } else {
        kernel.thread_exit(0)
    }
}

impl Machine for Sim {
    type Context = SimContext;

    fn cpu_id(&self) -> usize {
        CPU.with(|c| c.get())
    }

    fn interrupts_enabled(&self) -> bool {
        self.intr[self.cpu_id()].load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) {
        self.intr[self.cpu_id()].store(false, Ordering::SeqCst);
    }

    fn enable_interrupts(&self) {
        self.intr[self.cpu_id()].store(true, Ordering::SeqCst);
    }

    fn first_run_context(&self, _kstack: &KernelStack) -> SimContext {
        SimContext {
            baton: Baton::new(),
            fresh: AtomicBool::new(true),
        }
    }

    unsafe fn switch_context(&self, from: *mut SimContext, to: *const SimContext) {
        let cpu = self.cpu_id();
        let mine = Arc::clone(&(*from).baton);
        let next = &*to;
        self.switches.fetch_add(1, Ordering::SeqCst);

        if next.fresh.swap(false, Ordering::SeqCst) {
            self.start_record(Arc::clone(&next.baton));
        }
        next.baton.give(cpu);

        set_cpu(mine.take());
    }

    fn idle(&self) {
        if self.halted.load(Ordering::SeqCst) {
            loop {
                thread::park();
            }
        }
        thread::sleep(Duration::from_micros(200));
    }
}

impl AddressSpaces for Sim {
    type Space = SimSpace;

    fn create_space(&self) -> Option<SimSpace> {
        if self.vm.fail_create.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.vm.insert(SpaceState::default()))
    }

    fn copy_space(&self, src: &SimSpace, size: usize) -> Option<SimSpace> {
        if self.vm.fail_copy.load(Ordering::SeqCst) {
            return None;
        }
        let copy = {
            let state = self.vm.state.lock().unwrap();
            let src = state.spaces.get(&src.id)?;
            SpaceState {
                size,
                bytes: src.bytes.range(..size).map(|(k, v)| (*k, *v)).collect(),
                guards: src.guards.clone(),
            }
        };
        Some(self.vm.insert(copy))
    }

    fn grow_space(
        &self,
        space: &mut SimSpace,
        old_size: usize,
        new_size: usize,
        flags: PageFlags,
    ) -> Option<usize> {
        assert!(flags.contains(PageFlags::USER));
        if self.vm.fail_grow.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.vm.state.lock().unwrap();
        let space = state.spaces.get_mut(&space.id)?;
        assert_eq!(space.size, old_size, "grow from a stale size");
        space.size = new_size;
        Some(new_size)
    }

    fn shrink_space(&self, space: &mut SimSpace, old_size: usize, new_size: usize) -> Option<usize> {
        if self.vm.fail_shrink.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.vm.state.lock().unwrap();
        let space = state.spaces.get_mut(&space.id)?;
        assert_eq!(space.size, old_size, "shrink from a stale size");
        space.size = new_size;
        space.bytes.retain(|va, _| *va < new_size);
        space.guards.retain(|va| *va < new_size);
        Some(new_size)
    }

    fn destroy_space(&self, space: SimSpace) {
        let mut state = self.vm.state.lock().unwrap();
        if state.spaces.remove(&space.id).is_none() {
            state.double_frees += 1;
        }
    }

    fn copy_out(&self, space: &mut SimSpace, va: usize, bytes: &[u8]) -> Option<()> {
        if self.vm.fail_copy_out.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.vm.state.lock().unwrap();
        let space = state.spaces.get_mut(&space.id)?;
        if va + bytes.len() > space.size {
            return None;
        }
        for (i, byte) in bytes.iter().enumerate() {
            space.bytes.insert(va + i, *byte);
        }
        Some(())
    }

    fn protect_inaccessible(&self, space: &mut SimSpace, va: usize) {
        let mut state = self.vm.state.lock().unwrap();
        if let Some(space) = state.spaces.get_mut(&space.id) {
            space.guards.push(va);
        }
    }

    fn activate_space(&self, space: &SimSpace, _kstack: &KernelStack) {
        let state = self.vm.state.lock().unwrap();
        assert!(state.spaces.contains_key(&space.id), "activating a destroyed space");
    }

    fn activate_kernel_space(&self) {}
}

impl FileSystem for Sim {
    type File = SimFile;
    type Dir = SimDir;

    fn dup_file(&self, file: &SimFile) -> SimFile {
        self.fs.open_files.fetch_add(1, Ordering::SeqCst);
        SimFile(file.0)
    }

    fn close_file(&self, _file: SimFile) {
        self.fs.open_files.fetch_sub(1, Ordering::SeqCst);
    }

    fn dup_dir(&self, _dir: &SimDir) -> SimDir {
        self.fs.dir_refs.fetch_add(1, Ordering::SeqCst);
        SimDir
    }

    fn release_dir(&self, _dir: SimDir) {
        if self.fs.in_op.load(Ordering::SeqCst) <= 0 {
            self.fs.unbracketed.fetch_add(1, Ordering::SeqCst);
        }
        self.fs.dir_refs.fetch_sub(1, Ordering::SeqCst);
    }

    fn begin_op(&self) {
        self.fs.in_op.fetch_add(1, Ordering::SeqCst);
    }

    fn end_op(&self) {
        self.fs.in_op.fetch_sub(1, Ordering::SeqCst);
    }

    fn root_dir(&self) -> SimDir {
        self.fs.dir_refs.fetch_add(1, Ordering::SeqCst);
        SimDir
    }
}

/// Block the calling record forever.
pub fn park(kernel: &'static Kernel) -> ! {
    static NEVER: spin::Mutex<()> = spin::Mutex::new(());
    loop {
        let guard = NEVER.lock();
        let _guard = kernel.sleep(Channel::Addr(usize::MAX), &NEVER, guard);
    }
}

/// Register `program` for a record created by fork or thread_create.
pub fn spawn(kernel: &'static Kernel, pid: Pid, tid: Tid, program: impl FnOnce(&'static Kernel) + Send + 'static) {
    kernel.platform().programs.register(pid, tid, Box::new(program));
}

/// Fork the calling process; the child runs `program` and then exits.
pub fn fork_with(kernel: &'static Kernel, program: impl FnOnce(&'static Kernel) + Send + 'static) -> Pid {
    let pid = kernel.fork().expect("fork");
    spawn(kernel, pid, Tid::MAIN, program);
    pid
}

/// Create a thread of the calling process running `program`.
pub fn thread_with(
    kernel: &'static Kernel,
    arg: usize,
    program: impl FnOnce(&'static Kernel) + Send + 'static,
) -> Tid {
    let tid = kernel.thread_create(0x1000, arg).expect("thread_create");
    spawn(kernel, kernel.getpid(), tid, program);
    tid
}

/// Boot a kernel on `ncpu` simulated CPUs with `body` as the init program.
pub fn boot(ncpu: usize, body: impl FnOnce(&'static Kernel) + Send + 'static) -> &'static Kernel {
    let kernel: &'static Kernel = Box::leak(Box::new(ProcessManager::new(Sim::new(ncpu))));
    kernel
        .platform()
        .kernel
        .store(kernel as *const Kernel as *mut Kernel, Ordering::SeqCst);

    let pid = kernel.user_init(&[0x90; 16]).expect("user_init");
    spawn(kernel, pid, Tid::MAIN, move |kernel| {
        body(kernel);
        park(kernel);
    });

    for cpu in 0..ncpu {
        thread::spawn(move || {
            set_cpu(cpu);
            kernel.scheduler();
        });
    }
    kernel
}

/// Boot, run `body` as init and return its result together with the
/// kernel for inspection.
pub fn run<R, F>(ncpu: usize, body: F) -> (R, &'static Kernel)
where
    R: Send + 'static,
    F: FnOnce(&'static Kernel) -> R + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let kernel = boot(ncpu, move |kernel| {
        let result = body(kernel);
        let _ = tx.send(result);
    });
    let result = rx.recv_timeout(RESULT_TIMEOUT).expect("simulated kernel stalled");
    (result, kernel)
}

/// Wait until `cond` holds for the kernel, polling from the observer CPU.
pub fn settle(kernel: &'static Kernel, cond: impl Fn(&'static Kernel) -> bool) {
    let deadline = std::time::Instant::now() + RESULT_TIMEOUT;
    while !cond(kernel) {
        assert!(std::time::Instant::now() < deadline, "kernel never settled");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Sleep on a private channel until someone kills the calling record.
///
/// Only race-free on a single simulated CPU: a kill landing between the
/// check and the sleep is not re-delivered.
pub fn sleep_until_killed(kernel: &'static Kernel) {
    static LOCK: spin::Mutex<()> = spin::Mutex::new(());
    while !kernel.killed() {
        let guard = LOCK.lock();
        let _guard = kernel.sleep(Channel::Addr(0xdead), &LOCK, guard);
    }
}

/// State of the live record with `pid`.
pub fn state_of(kernel: &'static Kernel, pid: Pid) -> Option<crate::process::ProcState> {
    let table = kernel.lock();
    table.find_pid(pid).map(|slot| table[slot].state)
}
