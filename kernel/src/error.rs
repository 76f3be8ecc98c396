//! Lifecycle error types.
//!
//! Recoverable conditions travel back to the caller as [`ProcError`].
//! Broken invariants of the shared table are not errors: they go through
//! `fatal!` and halt the machine.

use core::fmt;

/// Recoverable failure of a lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// No free slot in the record table (or no memory for a kernel stack).
    ExhaustedTable,
    /// The address-space collaborator failed to copy, grow or shrink.
    AddressSpaceFailure,
    /// Growth would exceed the process memory ceiling.
    QuotaExceeded,
    /// Unknown pid/tid, or a pid reserved for kernel-internal processes.
    InvalidTarget,
    /// Nothing to wait for, or the caller was killed while waiting.
    NoSuchWork,
    /// Malformed argument (e.g. a negative memory limit).
    InvalidArgument,
}

impl ProcError {
    /// Value handed back to user space by the system-call layer.
    pub const fn as_syscall_return(self) -> isize {
        -1
    }
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcError::ExhaustedTable => write!(f, "process table exhausted"),
            ProcError::AddressSpaceFailure => write!(f, "address space operation failed"),
            ProcError::QuotaExceeded => write!(f, "memory limit exceeded"),
            ProcError::InvalidTarget => write!(f, "no such process or thread"),
            ProcError::NoSuchWork => write!(f, "nothing to wait for"),
            ProcError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = core::result::Result<T, ProcError>;

/// Halt on a broken invariant of the shared process table.
///
/// Continuing would operate on inconsistent shared state, so this never
/// unwinds into the caller: the kernel panic handler stops the machine.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!("[PROC] fatal: {}", format_args!($($arg)*));
        panic!($($arg)*)
    }};
}

/// Convert a lifecycle result into the integer convention of the
/// system-call layer (`-1` on any failure).
pub fn syscall_return(result: Result<usize>) -> isize {
    match result {
        Ok(value) => value as isize,
        Err(e) => e.as_syscall_return(),
    }
}
