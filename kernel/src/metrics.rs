/// Kernel metrics collection module
/// Tracks scheduler and IPC statistics using atomic counters for SMP safety

use core::sync::atomic::{AtomicU64, Ordering};

/// Counters for one kernel context
///
/// All counters use relaxed ordering; they are diagnostics, not
/// synchronization.
pub struct KernelMetrics {
    /// Total context switches across all CPUs
    pub context_switches: AtomicU64,

    /// Switches caused by timeslice expiry rather than blocking
    pub preemptions: AtomicU64,

    /// Timer interrupts that reached a started scheduler
    pub timer_ticks: AtomicU64,

    /// Messages accepted into a mailbox or remote inbox
    pub ipc_sends: AtomicU64,

    /// Messages handed to a receiving task
    pub ipc_receives: AtomicU64,

    /// Sends refused with MailboxFull
    pub ipc_mailbox_full: AtomicU64,

    /// Tasks put to sleep
    pub sleeps: AtomicU64,

    /// Tasks moved from the blocked queue back to ready
    pub wakes: AtomicU64,

    /// Tasks handed to the Director
    pub tasks_spawned: AtomicU64,

    /// Exited tasks whose resources were reclaimed
    pub tasks_reaped: AtomicU64,

    /// Inter-processor interrupts sent
    pub ipis_sent: AtomicU64,
}

impl KernelMetrics {
    /// Create a new KernelMetrics instance with all counters at zero
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            timer_ticks: AtomicU64::new(0),
            ipc_sends: AtomicU64::new(0),
            ipc_receives: AtomicU64::new(0),
            ipc_mailbox_full: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
            wakes: AtomicU64::new(0),
            tasks_spawned: AtomicU64::new(0),
            tasks_reaped: AtomicU64::new(0),
            ipis_sent: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Take a consistent-enough copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            timer_ticks: self.timer_ticks.load(Ordering::Relaxed),
            ipc_sends: self.ipc_sends.load(Ordering::Relaxed),
            ipc_receives: self.ipc_receives.load(Ordering::Relaxed),
            ipc_mailbox_full: self.ipc_mailbox_full.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
            wakes: self.wakes.load(Ordering::Relaxed),
            tasks_spawned: self.tasks_spawned.load(Ordering::Relaxed),
            tasks_reaped: self.tasks_reaped.load(Ordering::Relaxed),
            ipis_sent: self.ipis_sent.load(Ordering::Relaxed),
        }
    }
}

impl Default for KernelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub context_switches: u64,
    pub preemptions: u64,
    pub timer_ticks: u64,
    pub ipc_sends: u64,
    pub ipc_receives: u64,
    pub ipc_mailbox_full: u64,
    pub sleeps: u64,
    pub wakes: u64,
    pub tasks_spawned: u64,
    pub tasks_reaped: u64,
    pub ipis_sent: u64,
}
