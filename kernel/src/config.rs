//! Kernel configuration constants.
//!
//! Compile-time limits for the process table, per-CPU state and the
//! user memory layout used by the lifecycle manager.

/// Maximum number of execution-context records (processes and threads).
pub const NPROC: usize = 64;

/// Maximum number of CPUs supported.
pub const NCPU: usize = 8;

/// Open files per record.
pub const NOFILE: usize = 16;

/// Stack size per kernel context (4 KB).
pub const KERNEL_STACK_SIZE: usize = 4096;

/// Page size (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Process ids below this value belong to kernel-internal processes.
pub const FIRST_USER_PID: u32 = 2;

/// Maximum length of a record's display name.
pub const NAME_LEN: usize = 16;

/// User stack pages given to a fresh image when the loader does not ask
/// for a specific count.
pub const DEFAULT_STACK_PAGES: usize = 1;

/// Return address planted under a new thread's argument. Returning from the
/// start routine faults on it instead of running off into stale stack.
pub const THREAD_EXIT_SENTINEL: usize = usize::MAX;
