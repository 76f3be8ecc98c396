//! Process Management
//!
//! The process table and everything that changes it: process creation and
//! teardown, lightweight threads and memory limits.

pub mod context;
pub mod info;
pub mod manager;
pub mod table;
pub mod thread;

pub use context::{KernelStack, TrapFrame};
pub use info::ProcessInfo;
pub use manager::{NewImage, ProcessManager};
pub use table::{Pid, ProcState, Slot, Tid};
