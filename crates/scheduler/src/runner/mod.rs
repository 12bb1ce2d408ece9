//! Task scheduler runner: dispatch loop, worker slots and attempt execution.
//!
//! Split into focused submodules:
//! - `core`: Scheduler handle, constructor, configuration and queries
//! - `scheduling`: submission, cancellation and waiting for results
//! - `execution`: lifecycle, dispatch loop and per-attempt supervision

mod core;
mod execution;
mod scheduling;
#[cfg(test)]
mod tests;

pub use self::core::Scheduler;
