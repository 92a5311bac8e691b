//! Contracts for the collaborators the scheduler core consumes
//!
//! Paging, allocators, interrupt controllers and timers live outside this
//! crate. The core only talks to them through these traits, which keeps it
//! testable on the host against the `sim` feature's simulation.

pub mod addrspace;
pub mod heap;
pub mod platform;

pub use addrspace::{AddressSpace, PageFlags};
pub use heap::{GlobalHeap, Heap};
pub use platform::{EntryPoints, InterruptGuard, Platform, SwitchFrame, TimerMode};
