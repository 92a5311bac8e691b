/// Per-core control blocks
///
/// One block per core, created once when the kernel context is built and
/// indexed by core ordinal. The scheduler lock is only ever taken by the
/// owning core with interrupts masked; other cores reach it through the
/// inbox and a reschedule IPI.
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::ipc::Message;
use crate::sched::{Scheduler, Task, TaskId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoreFlags: u8 {
        /// Idle and cleanup tasks are installed
        const ONLINE = 1 << 0;
        const SCHEDULER_STARTED = 1 << 1;
        const TIMER_ARMED = 1 << 2;
        /// Halted after an internal invariant broke
        const FAULTED = 1 << 3;
    }
}

const NO_TASK: usize = usize::MAX;

/// Work other cores hand to this one
pub struct CoreInbox {
    tasks: VecDeque<Box<Task>>,
    mail: VecDeque<(TaskId, Message)>,
    capacity: usize,
}

impl CoreInbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: VecDeque::new(),
            mail: VecDeque::new(),
            capacity,
        }
    }

    pub fn push_task(&mut self, task: Box<Task>) {
        self.tasks.push_back(task);
    }

    /// Queue mail for a task on this core; refused once `capacity` are waiting
    pub fn push_mail(&mut self, recipient: TaskId, message: Message) -> KernelResult<()> {
        if self.mail.len() >= self.capacity {
            return Err(KernelError::MailboxFull);
        }
        self.mail.push_back((recipient, message));
        Ok(())
    }

    pub fn pending_mail(&self) -> usize {
        self.mail.len()
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn take_tasks(&mut self) -> VecDeque<Box<Task>> {
        core::mem::take(&mut self.tasks)
    }

    pub fn take_mail(&mut self) -> VecDeque<(TaskId, Message)> {
        core::mem::take(&mut self.mail)
    }

    /// Put undelivered mail back ahead of anything that arrived meanwhile
    pub fn restore_mail(&mut self, mut retained: VecDeque<(TaskId, Message)>) {
        retained.append(&mut self.mail);
        self.mail = retained;
    }
}

/// Control block of one core
///
/// Cache-line aligned so cores do not false-share their atomics.
#[repr(C, align(64))]
pub struct CoreBlock {
    /// Core ordinal (index in the kernel's core array)
    pub id: usize,

    /// Local APIC id IPIs are addressed to
    pub apic_id: u8,

    flags: AtomicU8,

    /// Published priority score, read by the Director
    load: AtomicU32,

    /// Published current task, read by the logger
    current: AtomicUsize,

    pub(crate) scheduler: Mutex<Scheduler>,

    pub(crate) inbox: Mutex<CoreInbox>,
}

impl CoreBlock {
    pub fn new(id: usize, apic_id: u8, timeslice_ms: u64, inbox_capacity: usize) -> Self {
        Self {
            id,
            apic_id,
            flags: AtomicU8::new(0),
            load: AtomicU32::new(0),
            current: AtomicUsize::new(NO_TASK),
            scheduler: Mutex::new(Scheduler::new(id, timeslice_ms)),
            inbox: Mutex::new(CoreInbox::new(inbox_capacity)),
        }
    }

    pub fn flags(&self) -> CoreFlags {
        CoreFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: CoreFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn is_online(&self) -> bool {
        self.flags().contains(CoreFlags::ONLINE)
    }

    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Relaxed)
    }

    pub fn current_task(&self) -> Option<TaskId> {
        match self.current.load(Ordering::Relaxed) {
            NO_TASK => None,
            id => Some(id),
        }
    }

    /// Count a task handed over through the inbox before the core drains it
    pub(crate) fn reserve_load(&self, weight: u32) {
        self.load.fetch_add(weight, Ordering::Relaxed);
    }

    pub fn pending_mail(&self) -> usize {
        self.inbox.lock().pending_mail()
    }

    pub fn pending_tasks(&self) -> usize {
        self.inbox.lock().pending_tasks()
    }

    /// Mirror the scheduler's load and current task into the atomics
    pub(crate) fn publish(&self, scheduler: &Scheduler) {
        self.load.store(scheduler.priority_score(), Ordering::Relaxed);
        self.current.store(
            scheduler.current_task().unwrap_or(NO_TASK),
            Ordering::Relaxed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Payload, Recipient, SchedulerMessage};

    fn ping(token: u32) -> Message {
        Message::new(
            Recipient::Task(1),
            Payload::Scheduler(SchedulerMessage::Ping { token }),
        )
    }

    #[test]
    fn test_core_block_is_cache_aligned() {
        assert_eq!(core::mem::align_of::<CoreBlock>(), 64);
    }

    #[test]
    fn test_flags_accumulate() {
        let block = CoreBlock::new(0, 0, 10, 4);
        assert!(!block.is_online());
        block.set_flags(CoreFlags::ONLINE);
        block.set_flags(CoreFlags::TIMER_ARMED);
        assert!(block.flags().contains(CoreFlags::ONLINE | CoreFlags::TIMER_ARMED));
        assert_eq!(block.current_task(), None);
    }

    #[test]
    fn test_inbox_is_bounded_and_restores_in_order() {
        let mut inbox = CoreInbox::new(2);
        inbox.push_mail(1, ping(1)).unwrap();
        inbox.push_mail(1, ping(2)).unwrap();
        assert_eq!(inbox.push_mail(1, ping(3)), Err(KernelError::MailboxFull));

        let mut taken = inbox.take_mail();
        let first = taken.pop_front().unwrap();
        inbox.push_mail(1, ping(4)).unwrap();
        inbox.restore_mail(taken);
        let order: alloc::vec::Vec<Message> =
            inbox.take_mail().into_iter().map(|(_, m)| m).collect();
        assert_eq!(order, [ping(2), ping(4)]);
        assert_eq!(first.1, ping(1));
    }
}
