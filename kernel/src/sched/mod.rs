//! Task Scheduler Module
//!
//! One `Scheduler` per core, holding that core's ready, blocked and delete
//! queues. It is a state machine: operations that change which task runs
//! return a `Switch`, and the dispatch layer in `crate::cpu` performs the
//! actual context switch once the scheduler lock is released.
//!
//! # Queues
//!
//! - ready: round-robin ring in insertion order. The running task stays in
//!   it, so the next task is simply the running task's successor.
//! - blocked: sleepers in ascending wake time, mixed with message waiters.
//! - delete: exited tasks, owned here until the cleanup task drops them.
//!
//! The idle task is in none of these; it runs when the ready ring is empty.
//! Priority only feeds the Director's placement score.

/// Scheduler logging macros with consistent [SCHED] subsystem tag
#[macro_export]
macro_rules! sched_log {
    ($($arg:tt)*) => {
        $crate::log_debug!("SCHED", $($arg)*)
    };
}

/// Log important scheduler information
#[macro_export]
macro_rules! sched_info {
    ($($arg:tt)*) => {
        $crate::log_info!("SCHED", $($arg)*)
    };
}

/// Log scheduler warnings
#[macro_export]
macro_rules! sched_warn {
    ($($arg:tt)*) => {
        $crate::log_warn!("SCHED", $($arg)*)
    };
}

/// Log scheduler errors
#[macro_export]
macro_rules! sched_error {
    ($($arg:tt)*) => {
        $crate::log_error!("SCHED", $($arg)*)
    };
}

pub mod director;
pub mod id;
pub mod launcher;
pub mod list;
pub mod task;

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::x86_64::context::CpuContext;
use crate::error::{KernelError, KernelResult};
use crate::ipc::{Message, MessageFilter};
use crate::traits::{AddressSpace, SwitchFrame};
use list::TaskList;
pub use task::{BlockReason, Priority, Task, TaskId, TaskState};

/// Decision to stop running `from` and resume `to`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// `None` when the core was still on its boot stack
    pub from: Option<TaskId>,
    pub to: TaskId,
    /// Caused by timeslice expiry
    pub preempted: bool,
}

/// Everything the dispatch layer needs to carry out a `Switch`
pub struct PreparedSwitch {
    pub frame: SwitchFrame,
    /// Space to load first, when the incoming task lives in another one
    pub activate: Option<Arc<dyn AddressSpace>>,
    pub preempted: bool,
}

/// Result of `receive_or_block`
#[derive(Debug)]
pub enum ReceiveOutcome {
    Received(Message),
    /// Nothing suitable was pending; the caller has been blocked
    Blocked(Option<Switch>),
}

/// Result of `exit_current`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub task: TaskId,
    pub switch: Option<Switch>,
}

pub struct Scheduler {
    core: usize,
    timeslice_ms: u64,
    elapsed_ms: u64,
    started: bool,
    tasks: BTreeMap<TaskId, Box<Task>>,
    ready: TaskList,
    blocked: TaskList,
    deleted: VecDeque<Box<Task>>,
    current: Option<TaskId>,
    idle: Option<TaskId>,
    cleanup: Option<TaskId>,
    score: u32,
    /// Where the boot stack is saved on the first switch
    boot_context: CpuContext,
}

impl Scheduler {
    pub const fn new(core: usize, timeslice_ms: u64) -> Self {
        Self {
            core,
            timeslice_ms,
            elapsed_ms: 0,
            started: false,
            tasks: BTreeMap::new(),
            ready: TaskList::new(),
            blocked: TaskList::new(),
            deleted: VecDeque::new(),
            current: None,
            idle: None,
            cleanup: None,
            score: 0,
            boot_context: CpuContext::new(),
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    /// Milliseconds of timeslices this core has counted since it started
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.current
    }

    pub fn idle_task(&self) -> Option<TaskId> {
        self.idle
    }

    pub fn cleanup_task(&self) -> Option<TaskId> {
        self.cleanup
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id).map(|task| &**task)
    }

    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&id).map(|task| &mut **task)
    }

    /// Whether `id` is a live task on this core
    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.ready.iter().collect()
    }

    pub fn blocked_tasks(&self) -> Vec<TaskId> {
        self.blocked.iter().collect()
    }

    pub fn is_ready(&self, id: TaskId) -> bool {
        self.ready.contains(id)
    }

    pub fn is_blocked(&self, id: TaskId) -> bool {
        self.blocked.contains(id)
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    /// Sum of the priority weights of this core's tasks
    pub fn priority_score(&self) -> u32 {
        self.score
    }

    /// Make `task` this core's idle task. It is never queued.
    pub fn install_idle_task(&mut self, mut task: Box<Task>) -> KernelResult<()> {
        let id = task.id;
        if self.tasks.contains_key(&id) || self.idle.is_some() {
            return Err(KernelError::InvalidQueueState);
        }
        task.state = TaskState::Ready;
        task.last_core = Some(self.core);
        self.tasks.insert(id, task);
        self.idle = Some(id);
        Ok(())
    }

    /// Queue `task` as this core's cleanup task
    pub fn install_cleanup_task(&mut self, task: Box<Task>) -> KernelResult<()> {
        let id = task.id;
        self.schedule_task(task)?;
        self.cleanup = Some(id);
        Ok(())
    }

    /// Append a task to the ready ring
    pub fn schedule_task(&mut self, mut task: Box<Task>) -> KernelResult<()> {
        let id = task.id;
        if self.tasks.contains_key(&id) {
            return Err(KernelError::InvalidQueueState);
        }
        task.state = TaskState::Ready;
        task.last_core = Some(self.core);
        self.score += task.priority.weight();
        self.tasks.insert(id, task);
        self.ready.append(id);
        sched_log!("core {} queued task {}", self.core, id);
        Ok(())
    }

    /// Start dispatching. Returns the first switch away from the boot stack.
    pub fn start(&mut self) -> Option<Switch> {
        self.started = true;
        self.switch_to_next(None, false)
    }

    /// Switch away from the idle task if something became ready
    pub fn reschedule(&mut self) -> Option<Switch> {
        if !self.started || (self.current.is_some() && self.current != self.idle) {
            return None;
        }
        self.switch_to_next(None, false)
    }

    /// Take the current task off the ready ring and pick another one
    pub fn block_current(&mut self, reason: BlockReason) -> KernelResult<Option<Switch>> {
        let id = self.current.ok_or(KernelError::NoCurrentTask)?;
        if Some(id) == self.idle {
            return Err(KernelError::NoCurrentTask);
        }
        if !self.ready.contains(id) {
            return Err(KernelError::InvalidQueueState);
        }

        let successor = self.ready.next(id);
        self.ready.remove(id);
        let elapsed = self.elapsed_ms;
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(KernelError::InvalidQueueState)?;

        match reason {
            BlockReason::Sleep(ms) => {
                task.state = TaskState::Sleeping;
                task.wake_time = elapsed.saturating_add(ms);
                let wake_time = task.wake_time;
                let tasks = &self.tasks;
                let before = self.blocked.iter().find(|other| {
                    tasks.get(other).is_some_and(|other| {
                        other.state == TaskState::Sleeping && other.wake_time > wake_time
                    })
                });
                self.blocked.insert_before(id, before);
                sched_log!("task {} sleeps until {} ms", id, wake_time);
            }
            BlockReason::WaitingForMessage { since } => {
                task.state = TaskState::Blocked;
                task.wait_since = since;
                self.blocked.append(id);
            }
        }

        Ok(self.switch_to_next(successor, false))
    }

    /// Move a blocked task back to the ready ring without switching
    ///
    /// A sleeper whose wake time has not yet come stays blocked; use
    /// `wake` to cut a sleep short. Returns whether the task moved.
    pub fn unblock_task(&mut self, id: TaskId) -> bool {
        if !self.blocked.contains(id) {
            return false;
        }
        let premature = self.tasks.get(&id).is_some_and(|task| {
            task.state == TaskState::Sleeping && task.wake_time > self.elapsed_ms
        });
        if premature {
            return false;
        }
        self.make_ready(id);
        true
    }

    /// Move a blocked or sleeping task to the ready ring regardless of its
    /// wait condition
    pub fn wake(&mut self, id: TaskId) -> bool {
        if !self.blocked.contains(id) {
            return false;
        }
        self.make_ready(id);
        true
    }

    /// Ready every blocked task whose wait is over. Returns how many moved.
    pub fn unblock_wakeable_tasks(&mut self) -> usize {
        let mut woken = 0;
        let mut cursor = self.blocked.head();
        while let Some(id) = cursor {
            cursor = self.blocked.next(id);
            let wakeable = self
                .tasks
                .get(&id)
                .is_some_and(|task| task.is_wakeable(self.elapsed_ms));
            if wakeable {
                self.make_ready(id);
                woken += 1;
            }
        }
        woken
    }

    /// Timer tick: advance the clock, wake due tasks and rotate
    pub fn notify_timeslice_expired(&mut self) -> Option<Switch> {
        if !self.started {
            return None;
        }
        self.elapsed_ms += self.timeslice_ms;
        self.unblock_wakeable_tasks();
        self.switch_to_next(None, true)
    }

    /// Next task in round-robin order, or `None` when only idle can run
    pub fn find_next_task(&mut self) -> Option<TaskId> {
        self.select_next(None)
    }

    /// Pick the next task and make it current
    pub fn run_next_task(&mut self) -> Option<Switch> {
        self.switch_to_next(None, false)
    }

    /// Put `message` into a task's mailbox, readying it if it waited for mail
    ///
    /// Returns whether the recipient was woken.
    pub fn deliver(&mut self, recipient: TaskId, message: &Message) -> KernelResult<bool> {
        if !self.blocked.contains(recipient) && !self.ready.contains(recipient) {
            return Err(KernelError::RecipientNotFound);
        }
        let task = self
            .tasks
            .get_mut(&recipient)
            .ok_or(KernelError::RecipientNotFound)?;
        task.mailbox.send(message)?;
        let wake = task.state == TaskState::Blocked && task.is_wakeable(self.elapsed_ms);
        if wake {
            self.make_ready(recipient);
        }
        Ok(wake)
    }

    /// Take a message for the current task or block it until one arrives
    ///
    /// A filtered wait is only ended by a new delivery; the mismatched
    /// messages already queued do not wake it.
    pub fn receive_or_block(
        &mut self,
        filter: Option<&MessageFilter>,
    ) -> KernelResult<ReceiveOutcome> {
        let id = self.current.ok_or(KernelError::NoCurrentTask)?;
        if Some(id) == self.idle {
            return Err(KernelError::NoCurrentTask);
        }
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(KernelError::InvalidQueueState)?;
        let received = match filter {
            Some(filter) => task.mailbox.receive_matching(filter)?,
            None => task.mailbox.receive()?,
        };
        if let Some(message) = received {
            return Ok(ReceiveOutcome::Received(message));
        }

        let since = filter.map(|_| task.mailbox.sends_completed());
        let switch = self.block_current(BlockReason::WaitingForMessage { since })?;
        Ok(ReceiveOutcome::Blocked(switch))
    }

    /// Retire the current task
    ///
    /// Its mailbox memory is released at once; the rest of the task stays in
    /// the delete queue until `reap_deleted`, since its kernel stack is still
    /// in use until the switch away completes. The cleanup task is woken.
    pub fn exit_current(&mut self) -> KernelResult<Exit> {
        let id = self.current.ok_or(KernelError::NoCurrentTask)?;
        if Some(id) == self.idle || Some(id) == self.cleanup {
            return Err(KernelError::NoCurrentTask);
        }
        if !self.ready.contains(id) {
            return Err(KernelError::InvalidQueueState);
        }

        let successor = self.ready.next(id);
        self.ready.remove(id);
        let mut task = self
            .tasks
            .remove(&id)
            .ok_or(KernelError::InvalidQueueState)?;
        task.state = TaskState::Exited;
        task.mailbox.release();
        self.score = self.score.saturating_sub(task.priority.weight());
        self.deleted.push_back(task);
        sched_log!("task {} exited on core {}", id, self.core);

        if let Some(cleanup) = self.cleanup {
            self.wake(cleanup);
        }
        let switch = self.switch_to_next(successor, false);
        Ok(Exit { task: id, switch })
    }

    /// Hand exited tasks to the caller, who drops them outside the lock
    pub fn reap_deleted(&mut self) -> Vec<Box<Task>> {
        self.deleted.drain(..).collect()
    }

    pub fn change_priority(&mut self, id: TaskId, priority: Priority) -> KernelResult<()> {
        let is_idle = Some(id) == self.idle;
        let task = self
            .tasks
            .get_mut(&id)
            .ok_or(KernelError::RecipientNotFound)?;
        if !is_idle {
            self.score = self.score.saturating_sub(task.priority.weight()) + priority.weight();
        }
        task.priority = priority;
        Ok(())
    }

    /// Resolve a `Switch` into context pointers
    ///
    /// The pointers stay valid after the lock is dropped: tasks are boxed,
    /// and an exited task is only freed by the cleanup task, which cannot
    /// run before this switch completes.
    pub fn prepare_switch(&mut self, switch: &Switch) -> KernelResult<PreparedSwitch> {
        let next = self
            .tasks
            .get(&switch.to)
            .ok_or(KernelError::InvalidQueueState)?;
        let to = &next.context as *const CpuContext;
        let kernel_stack_top = next.kernel_stack_top();
        let next_space = Arc::clone(&next.address_space);

        let (from, previous_root) = match switch.from {
            None => (&mut self.boot_context as *mut CpuContext, None),
            Some(id) => {
                let previous = match self.tasks.get_mut(&id) {
                    Some(task) => task,
                    // The newest exited task with this id; its id may be reused already
                    None => self
                        .deleted
                        .iter_mut()
                        .rev()
                        .find(|task| task.id == id)
                        .ok_or(KernelError::InvalidQueueState)?,
                };
                let root = previous.address_space.root();
                (&mut previous.context as *mut CpuContext, Some(root))
            }
        };

        let activate = (previous_root != Some(next_space.root())).then_some(next_space);
        Ok(PreparedSwitch {
            frame: SwitchFrame {
                from,
                to,
                kernel_stack_top,
            },
            activate,
            preempted: switch.preempted,
        })
    }

    fn make_ready(&mut self, id: TaskId) {
        self.blocked.remove(id);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = TaskState::Ready;
            task.wait_since = None;
        }
        self.ready.append(id);
    }

    fn select_next(&mut self, hint: Option<TaskId>) -> Option<TaskId> {
        if self.ready.is_empty() {
            self.unblock_wakeable_tasks();
            return self.ready.head();
        }
        if let Some(id) = hint.filter(|id| self.ready.contains(*id)) {
            return Some(id);
        }
        match self.current.filter(|id| self.ready.contains(*id)) {
            Some(id) => self.ready.next(id).or(self.ready.head()),
            None => self.ready.head(),
        }
    }

    fn switch_to_next(&mut self, hint: Option<TaskId>, preempted: bool) -> Option<Switch> {
        let previous = self.current;
        let Some(next) = self.select_next(hint).or(self.idle) else {
            // Nothing at all can run; forget a task that is no longer runnable
            let still_runnable = previous.is_some_and(|id| self.ready.contains(id));
            if !still_runnable {
                self.current = None;
            }
            return None;
        };
        if previous == Some(next) {
            return None;
        }

        if let Some(task) = previous.and_then(|id| self.tasks.get_mut(&id)) {
            if task.state == TaskState::Running {
                task.state = TaskState::Ready;
            }
        }
        let core = self.core;
        if let Some(task) = self.tasks.get_mut(&next) {
            task.state = TaskState::Running;
            task.last_core = Some(core);
        }
        self.current = Some(next);
        Some(Switch {
            from: previous,
            to: next,
            preempted,
        })
    }
}
