/// Configuration constants for the Keel kernel core

/// Scheduler tick frequency in Hz (100 Hz = 10ms per tick)
/// Higher frequency = more responsive scheduling and faster sleep/wake
pub const SCHED_HZ: u64 = 100;

/// Length of one timeslice in milliseconds
pub const TIMESLICE_MS: u64 = 1000 / SCHED_HZ;

/// Maximum number of CPUs supported by the kernel
pub const MAX_CPUS: usize = 16;

/// Size of every task's kernel stack in bytes
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Number of 4 KiB pages reserved for a user task's stack
pub const USER_STACK_PAGES: usize = 4;

/// Page size used when talking to the address-space manager
pub const PAGE_SIZE: usize = 4096;

/// Bytes of ring buffer backing each task's mailbox
pub const MAILBOX_SIZE: usize = 4096;

/// Upper bound on simultaneously live task ids
pub const MAX_TASK_IDS: usize = 1024;

/// Messages a core will hold for remote delivery before refusing more
pub const INBOX_CAPACITY: usize = 64;

/// Fixed virtual placement of a user task's stack (top of the lower half, below the guard)
pub const USER_STACK_BASE: u64 = 0x0000_7fff_ff00_0000;

/// Fixed virtual placement of a user task's TSS snapshot
pub const USER_TSS_BASE: u64 = 0x0000_7fff_fe00_0000;

/// Fixed virtual placement of the page holding a user task's path argument
pub const USER_ARGS_BASE: u64 = 0x0000_7fff_fd00_0000;

/// Runtime configuration for one kernel context
///
/// Built once at boot from the constants above. Tests construct their own
/// with smaller limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Milliseconds added to a core's clock on every timer interrupt
    pub timeslice_ms: u64,
    /// Number of cores the kernel manages (<= MAX_CPUS)
    pub core_count: usize,
    /// Kernel stack size for new tasks
    pub kernel_stack_size: usize,
    /// User stack size in pages
    pub user_stack_pages: usize,
    /// Mailbox ring size in bytes
    pub mailbox_size: usize,
    /// Task id limit
    pub max_task_ids: usize,
    /// Remote-delivery inbox depth per core
    pub inbox_capacity: usize,
}

impl KernelConfig {
    /// Configuration for `core_count` cores with every other value at its default
    pub const fn with_cores(core_count: usize) -> Self {
        Self {
            timeslice_ms: TIMESLICE_MS,
            core_count,
            kernel_stack_size: KERNEL_STACK_SIZE,
            user_stack_pages: USER_STACK_PAGES,
            mailbox_size: MAILBOX_SIZE,
            max_task_ids: MAX_TASK_IDS,
            inbox_capacity: INBOX_CAPACITY,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::with_cores(1)
    }
}
