//! Kernel Unit Tests Module
//!
//! Scenario tests that boot the lifecycle manager on simulated CPUs and run
//! small programs as records.

pub mod sim;
