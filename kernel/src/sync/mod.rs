//! Synchronization primitives
//!
//! The process table lock and the sleep/wakeup channel primitive built on it.

pub mod guard;
pub mod sleep;

pub use guard::TableGuard;
pub use sleep::Channel;
