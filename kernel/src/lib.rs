//! Process and thread lifecycle manager.
//!
//! A fixed table of execution-context records shared by all CPUs, the
//! per-CPU scheduler loop, sleep/wakeup channels and per-process memory
//! limits. Page tables, files and the register-level context switch are
//! supplied by the embedding kernel through the traits in [`hal`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod error;

pub mod config;
pub mod hal;
pub mod process;
pub mod scheduler;
pub mod sync;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;

#[cfg(test)]
mod tests;

pub use error::{ProcError, Result};
pub use hal::Platform;
pub use process::{Pid, ProcessInfo, ProcessManager, Tid};
pub use sync::Channel;
