//! Kernel error taxonomy
//!
//! Resource exhaustion and routing failures are returned to the calling task.
//! `InvalidQueueState` marks a broken internal invariant and is treated as
//! fatal for the core that observed it (see `cpu::Kernel::core_fault`).

use core::fmt;

/// Resource whose allocation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    KernelStack,
    UserStack,
    Mailbox,
    AddressSpace,
    Heap,
    TaskState,
    Arguments,
}

impl Resource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Resource::KernelStack => "kernel stack",
            Resource::UserStack => "user stack",
            Resource::Mailbox => "mailbox",
            Resource::AddressSpace => "address space",
            Resource::Heap => "heap",
            Resource::TaskState => "task-state segment",
            Resource::Arguments => "argument page",
        }
    }
}

/// Kernel error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Stack, mailbox, address space, heap or TSS allocation exhausted
    AllocationFailed(Resource),
    /// The recipient's mailbox (or remote inbox) cannot take the message
    MailboxFull,
    /// The recipient does not resolve to a live task
    RecipientNotFound,
    /// Task id space is exhausted
    OutOfIds,
    /// An internal scheduler or mailbox invariant was violated
    InvalidQueueState,
    /// Encoded message exceeds MAX_MESSAGE_SIZE
    MessageTooLarge,
    /// Bytes on the wire do not form a valid message
    MalformedMessage,
    /// Operation needs a current task but the core is idle or not started
    NoCurrentTask,
    /// Core ordinal outside the configured range
    InvalidCore,
}

impl KernelError {
    /// Whether this error means the core's own state can no longer be trusted
    pub const fn is_fatal(&self) -> bool {
        matches!(self, KernelError::InvalidQueueState)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::AllocationFailed(resource) => {
                write!(f, "allocation failed: {}", resource.as_str())
            }
            KernelError::MailboxFull => write!(f, "mailbox full"),
            KernelError::RecipientNotFound => write!(f, "recipient not found"),
            KernelError::OutOfIds => write!(f, "out of task ids"),
            KernelError::InvalidQueueState => write!(f, "invalid queue state"),
            KernelError::MessageTooLarge => write!(f, "message too large"),
            KernelError::MalformedMessage => write!(f, "malformed message"),
            KernelError::NoCurrentTask => write!(f, "no current task"),
            KernelError::InvalidCore => write!(f, "invalid core"),
        }
    }
}

/// Result type for kernel core operations
pub type KernelResult<T> = Result<T, KernelError>;
