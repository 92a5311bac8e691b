//! Task Management
//!
//! The task record and the resources it owns. Everything a task owns is
//! released by dropping it: the kernel stack returns to its heap, and a
//! user task unmaps its stack and TSS pages before its address space goes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::mem::size_of;
use core::ptr::NonNull;

use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::arch::x86_64::context::{CpuContext, CALLEE_SAVED_REGISTERS};
use crate::error::{KernelError, KernelResult, Resource};
use crate::ipc::Mailbox;
use crate::traits::{AddressSpace, EntryPoints, Heap};

/// Task identifier type
pub type TaskId = usize;

/// Task state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// In the ready queue, waiting for its turn
    Ready,
    /// The core's current task
    Running,
    /// In the blocked queue until its wake time
    Sleeping,
    /// In the blocked queue until a message arrives
    Blocked,
    /// In the delete queue, waiting for the cleanup task
    Exited,
}

/// Placement priority; only the Director looks at it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Idle,
    Other,
    Io,
    Ui,
    Input,
    Irq,
}

impl Priority {
    /// Contribution of one task at this priority to its core's score
    pub const fn weight(self) -> u32 {
        match self {
            Priority::Irq => 32,
            Priority::Input => 16,
            Priority::Ui => 8,
            Priority::Io => 4,
            Priority::Other => 2,
            Priority::Idle => 0,
        }
    }
}

/// Why the current task leaves the ready queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Sleep for this many milliseconds
    Sleep(u64),
    /// Wait for mail. With `since`, only a delivery that moves the mailbox's
    /// send counter past it wakes the task.
    WaitingForMessage { since: Option<u64> },
}

pub const STACK_ALIGN: usize = 16;

/// Kernel stack memory owned by one task
pub struct KernelStack {
    base: NonNull<u8>,
    size: usize,
    heap: Arc<dyn Heap>,
}

// SAFETY: the stack memory is exclusively owned by this value.
unsafe impl Send for KernelStack {}

impl KernelStack {
    pub fn allocate(heap: Arc<dyn Heap>, size: usize) -> KernelResult<Self> {
        let size = (size + STACK_ALIGN - 1) & !(STACK_ALIGN - 1);
        let base = heap
            .aligned_allocate(STACK_ALIGN, size)
            .ok_or(KernelError::AllocationFailed(Resource::KernelStack))?;
        Ok(Self { base, size, heap })
    }

    pub fn top(&self) -> u64 {
        self.base.as_ptr() as u64 + self.size as u64
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Lay out the frame the first switch into this task resumes from
    ///
    /// From the top down: `task_finished` (the return address of the entry
    /// function), `extras` with `extras[0]` lowest, the entry address,
    /// `task_start`, and zeroed callee-saved registers. Returns the
    /// initial stack pointer.
    pub fn write_initial_frame(
        &mut self,
        entries: &EntryPoints,
        entry: u64,
        extras: &[u64],
    ) -> KernelResult<u64> {
        let slots = 3 + extras.len() + CALLEE_SAVED_REGISTERS;
        if slots * size_of::<u64>() > self.size {
            return Err(KernelError::AllocationFailed(Resource::KernelStack));
        }

        let mut rsp = self.top() as *mut u64;
        let mut push = |value: u64| {
            // SAFETY: the slot count was checked against the stack size and
            // the top is 16-byte aligned.
            unsafe {
                rsp = rsp.sub(1);
                rsp.write(value);
            }
        };
        push(entries.task_finished);
        for value in extras.iter().rev() {
            push(*value);
        }
        push(entry);
        push(entries.task_start);
        for _ in 0..CALLEE_SAVED_REGISTERS {
            push(0);
        }
        Ok(rsp as u64)
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        // SAFETY: allocated by this heap with this alignment and size.
        unsafe { self.heap.free(self.base, STACK_ALIGN, self.size) };
    }
}

/// One bit per I/O port plus the terminating 0xFF byte, padded so the
/// record has no padding bytes
pub const IO_BITMAP_BYTES: usize = 65536 / 8 + 4;

/// TSS snapshot copied into a user task's address space
#[repr(C)]
pub struct TaskStateRecord {
    pub tss: TaskStateSegment,
    pub io_bitmap: [u8; IO_BITMAP_BYTES],
}

impl TaskStateRecord {
    /// TSS whose ring-0 stack is `kernel_stack_top` and whose bitmap denies
    /// every port
    pub fn new(kernel_stack_top: u64) -> Box<Self> {
        let mut tss = TaskStateSegment::new();
        let mut stacks = tss.privilege_stack_table;
        stacks[0] = VirtAddr::new_truncate(kernel_stack_top);
        tss.privilege_stack_table = stacks;
        tss.iomap_base = size_of::<TaskStateSegment>() as u16;
        Box::new(Self {
            tss,
            io_bitmap: [0xFF; IO_BITMAP_BYTES],
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) over plain integer data with no padding.
        unsafe {
            core::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>())
        }
    }
}

/// Mapping owned by a user task inside its address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub base: VirtAddr,
    pub pages: usize,
}

/// Ring-3 side of a user task
pub struct UserImage {
    pub address_space: Arc<dyn AddressSpace>,
    pub stack: Option<Mapping>,
    pub tss_mapping: Option<Mapping>,
    pub tss: Option<Box<TaskStateRecord>>,
    /// NUL-terminated executable path, readable from ring 3
    pub args: Option<Mapping>,
}

impl UserImage {
    pub fn new(address_space: Arc<dyn AddressSpace>) -> Self {
        Self {
            address_space,
            stack: None,
            tss_mapping: None,
            tss: None,
            args: None,
        }
    }
}

impl Drop for UserImage {
    fn drop(&mut self) {
        for mapping in [self.stack.take(), self.tss_mapping.take(), self.args.take()].into_iter().flatten() {
            self.address_space.free_pages(mapping.base, mapping.pages);
        }
    }
}

/// Task Control Block (TCB)
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Human-readable task name
    pub name: &'static str,

    pub state: TaskState,

    pub priority: Priority,

    /// Absolute core time (ms) at which a sleeping task becomes runnable
    pub wake_time: u64,

    /// Core that last scheduled this task
    pub last_core: Option<usize>,

    /// Send counter snapshot for a filtered message wait
    pub wait_since: Option<u64>,

    pub context: CpuContext,

    pub mailbox: Mailbox,

    pub address_space: Arc<dyn AddressSpace>,

    pub heap: Arc<dyn Heap>,

    /// Present for user tasks only
    pub user: Option<UserImage>,

    kernel_stack: KernelStack,
}

impl Task {
    pub fn new(
        id: TaskId,
        name: &'static str,
        priority: Priority,
        kernel_stack: KernelStack,
        initial_rsp: u64,
        mailbox: Mailbox,
        address_space: Arc<dyn AddressSpace>,
        heap: Arc<dyn Heap>,
    ) -> Self {
        Self {
            id,
            name,
            state: TaskState::Ready,
            priority,
            wake_time: 0,
            last_core: None,
            wait_since: None,
            context: CpuContext::with_stack(initial_rsp),
            mailbox,
            address_space,
            heap,
            user: None,
            kernel_stack,
        }
    }

    pub fn is_user(&self) -> bool {
        self.user.is_some()
    }

    /// Stack the CPU switches to on a ring 3 to ring 0 transition
    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack.top()
    }

    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    /// Whether a blocked task's wait condition now holds at `elapsed_ms`
    pub fn is_wakeable(&self, elapsed_ms: u64) -> bool {
        match self.state {
            TaskState::Sleeping => self.wake_time <= elapsed_ms,
            TaskState::Blocked => match self.wait_since {
                Some(since) => self.mailbox.sends_completed() > since,
                None => self.mailbox.has_unread_messages(),
            },
            _ => false,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("wake_time", &self.wake_time)
            .field("user", &self.is_user())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::GlobalHeap;

    fn entries() -> EntryPoints {
        EntryPoints {
            task_start: 0x1000,
            task_finished: 0x2000,
            user_launch: 0x3000,
            idle_loop: 0x4000,
            cleanup_loop: 0x5000,
        }
    }

    fn slots(rsp: u64, count: usize) -> alloc::vec::Vec<u64> {
        (0..count)
            .map(|i| unsafe { *(rsp as *const u64).add(i) })
            .collect()
    }

    #[test]
    fn test_priority_order_and_weights() {
        assert!(Priority::Irq > Priority::Input);
        assert!(Priority::Input > Priority::Ui);
        assert!(Priority::Ui > Priority::Io);
        assert!(Priority::Io > Priority::Other);
        assert!(Priority::Other > Priority::Idle);
        assert_eq!(Priority::Idle.weight(), 0);
        assert!(Priority::Irq.weight() > Priority::Input.weight());
    }

    #[test]
    fn test_kernel_frame_layout() {
        let mut stack = KernelStack::allocate(Arc::new(GlobalHeap), 4096).unwrap();
        let top = stack.top();
        assert_eq!(top % 16, 0);
        let rsp = stack.write_initial_frame(&entries(), 0xABCD, &[]).unwrap();
        assert_eq!(rsp, top - 9 * 8);
        assert_eq!(
            slots(rsp, 9),
            [0, 0, 0, 0, 0, 0, 0x1000, 0xABCD, 0x2000]
        );
    }

    #[test]
    fn test_entry_sees_abi_aligned_stack() {
        let mut stack = KernelStack::allocate(Arc::new(GlobalHeap), 4096).unwrap();
        let rsp = stack.write_initial_frame(&entries(), 0xABCD, &[]).unwrap();
        // After the six pops, the ret and task_start's pop
        let at_entry = rsp + (CALLEE_SAVED_REGISTERS as u64 + 2) * 8;
        assert_eq!(at_entry % 16, 8);
    }

    #[test]
    fn test_extras_sit_between_entry_and_finish() {
        let mut stack = KernelStack::allocate(Arc::new(GlobalHeap), 4096).unwrap();
        let rsp = stack
            .write_initial_frame(&entries(), 0x3000, &[11, 22, 33, 44])
            .unwrap();
        assert_eq!(
            slots(rsp + 6 * 8, 7),
            [0x1000, 0x3000, 11, 22, 33, 44, 0x2000]
        );
    }

    #[test]
    fn test_frame_must_fit_stack() {
        let mut stack = KernelStack::allocate(Arc::new(GlobalHeap), 64).unwrap();
        assert_eq!(
            stack.write_initial_frame(&entries(), 1, &[]),
            Err(KernelError::AllocationFailed(Resource::KernelStack))
        );
    }

    #[test]
    fn test_tss_record_denies_all_ports() {
        let record = TaskStateRecord::new(0xFFFF_8000_0001_0000);
        let stacks = { record.tss.privilege_stack_table };
        assert_eq!(stacks[0].as_u64(), 0xFFFF_8000_0001_0000);
        let iomap_base = { record.tss.iomap_base };
        assert_eq!(iomap_base as usize, size_of::<TaskStateSegment>());
        assert!(record.io_bitmap.iter().all(|byte| *byte == 0xFF));
        assert_eq!(record.as_bytes().len(), size_of::<TaskStateSegment>() + IO_BITMAP_BYTES);
    }
}
