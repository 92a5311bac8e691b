//! Keel kernel core: tasks, per-core scheduling and message passing
//!
//! The crate is freestanding (`no_std` + `alloc`). Paging, heaps, the
//! interrupt controller and the context switch are reached through the
//! traits in [`traits`]. The `sim` feature adds a host implementation of
//! them so the whole core can be exercised by ordinary tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod arch;
pub mod config;
pub mod cpu;
pub mod error;
pub mod ipc;
pub mod metrics;
pub mod sched;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod traits;

pub use config::KernelConfig;
pub use cpu::{Kernel, Placement};
pub use error::{KernelError, KernelResult, Resource};
pub use ipc::{Message, MessageFilter, Namespace, Payload, Recipient};
pub use sched::{Priority, TaskId, TaskState};
