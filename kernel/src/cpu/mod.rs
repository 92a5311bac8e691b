//! CPU dispatch layer
//!
//! `Kernel` is the one object the rest of the system talks to. It owns the
//! per-core control blocks and the Director, and turns the scheduler's
//! `Switch` decisions into real context switches on the calling core.
//!
//! Every operation runs on the calling core: it masks interrupts, locks that
//! core's scheduler, first drains whatever other cores left in its inbox,
//! then performs the operation. The context switch itself happens after the
//! scheduler lock is released; interrupts stay masked until the task that
//! switched away is resumed and its guard is dropped.
//!
//! Lock order: core scheduler, then Director, then a core inbox.

pub mod ipi;
pub mod percpu;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::Mutex;

use crate::config::{KernelConfig, MAX_CPUS};
use crate::error::{KernelError, KernelResult};
use crate::ipc::{Message, MessageFilter, Payload, Recipient, ServiceMessage, KERNEL_SENDER};
use crate::log::LogContext;
use crate::metrics::KernelMetrics;
use crate::sched::director::Director;
use crate::sched::launcher::TaskLauncher;
use crate::sched::{
    BlockReason, PreparedSwitch, Priority, ReceiveOutcome, Scheduler, Switch, Task, TaskId,
};
use crate::traits::{InterruptGuard, Platform, TimerMode};
use ipi::{broadcast_ipi, IpiKind};
use percpu::{CoreBlock, CoreFlags};

/// Where `schedule_task` put a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Core(usize),
    /// No core is online yet; released by the first `bring_up_core`
    Parked,
}

pub struct Kernel<P: Platform> {
    config: KernelConfig,
    platform: P,
    cores: Vec<CoreBlock>,
    director: Mutex<Director>,
    launcher: TaskLauncher,
    metrics: KernelMetrics,
}

impl<P: Platform> Kernel<P> {
    /// Build the kernel context; `apic_ids[n]` is the local APIC id of core `n`
    pub fn new(config: KernelConfig, platform: P, apic_ids: &[u8]) -> KernelResult<Self> {
        if config.core_count == 0
            || config.core_count > MAX_CPUS
            || apic_ids.len() != config.core_count
        {
            return Err(KernelError::InvalidCore);
        }
        let cores = apic_ids
            .iter()
            .enumerate()
            .map(|(id, apic_id)| {
                CoreBlock::new(id, *apic_id, config.timeslice_ms, config.inbox_capacity)
            })
            .collect();
        Ok(Self {
            launcher: TaskLauncher::new(&config),
            director: Mutex::new(Director::new(config.max_task_ids)),
            metrics: KernelMetrics::new(),
            config,
            platform,
            cores,
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn metrics(&self) -> &KernelMetrics {
        &self.metrics
    }

    pub fn core(&self, id: usize) -> Option<&CoreBlock> {
        self.cores.get(id)
    }

    pub fn cores(&self) -> &[CoreBlock] {
        &self.cores
    }

    pub fn current_core(&self) -> usize {
        self.platform.current_core()
    }

    /// Task running on the calling core, as last published
    pub fn current_task(&self) -> Option<TaskId> {
        self.local().ok()?.current_task()
    }

    /// Core a live task was placed on
    pub fn home_of(&self, id: TaskId) -> Option<usize> {
        self.director.lock().home_of(id)
    }

    /// Number of task ids currently handed out
    pub fn live_tasks(&self) -> usize {
        self.director.lock().live_ids()
    }

    pub fn parked_tasks(&self) -> usize {
        self.director.lock().parked_count()
    }

    /// Route `Recipient::Registry` traffic to `task` instead of the kernel
    pub fn set_registry_task(&self, task: Option<TaskId>) {
        self.director.lock().registry_mut().set_registry_task(task);
    }

    /// Look at any core's scheduler
    ///
    /// Diagnostics only: this takes another core's scheduler lock, which
    /// regular operations never do.
    pub fn inspect<R>(&self, core: usize, f: impl FnOnce(&Scheduler) -> R) -> KernelResult<R> {
        let block = self.core(core).ok_or(KernelError::InvalidCore)?;
        let _guard = InterruptGuard::new(&self.platform);
        let scheduler = block.scheduler.lock();
        Ok(f(&scheduler))
    }

    /// Install the calling core's idle and cleanup tasks and mark it online
    ///
    /// Tasks spawned before any core was online are placed afterwards.
    pub fn bring_up_core(&self) -> KernelResult<()> {
        let block = self.local()?;
        if block.is_online() {
            return Ok(());
        }

        let entries = self.platform.entry_points();
        let idle = self.build_kernel_task("idle", entries.idle_loop, Priority::Idle)?;
        let cleanup = match self.build_kernel_task("cleanup", entries.cleanup_loop, Priority::Idle)
        {
            Ok(task) => task,
            Err(error) => {
                self.director.lock().free_id(idle.id);
                return Err(error);
            }
        };
        let (idle_id, cleanup_id) = (idle.id, cleanup.id);

        self.locked(|scheduler| {
            scheduler.install_idle_task(idle)?;
            scheduler.install_cleanup_task(cleanup)?;
            Ok(((), None))
        })?;
        {
            let mut director = self.director.lock();
            director.record_home(idle_id, block.id);
            director.record_home(cleanup_id, block.id);
        }
        block.set_flags(CoreFlags::ONLINE);
        crate::log_info!(
            "CPU",
            "core {} online (apic {}), idle={} cleanup={}",
            block.id,
            block.apic_id,
            idle_id,
            cleanup_id
        );

        self.release_parked()
    }

    /// Create a kernel task and hand it to the Director
    pub fn spawn_kernel_task(
        &self,
        name: &'static str,
        entry: u64,
        priority: Priority,
    ) -> KernelResult<TaskId> {
        let task = self.build_kernel_task(name, entry, priority)?;
        self.spawn(task)
    }

    /// Create a user task entering ring 3 at `entry` and hand it to the Director
    pub fn spawn_user_task(
        &self,
        name: &'static str,
        entry: u64,
        path: Option<&str>,
        priority: Priority,
    ) -> KernelResult<TaskId> {
        let id = self.director.lock().generate_id()?;
        let task = self
            .launcher
            .create_user_task(&self.platform, id, name, entry, path, priority)
            .inspect_err(|error| {
                self.director.lock().free_id(id);
                crate::sched_warn!("user task '{}' not created: {}", name, error);
            })?;
        self.spawn(task)
    }

    /// Place a task on the best-scoring online core
    ///
    /// A task for the calling core is queued at once; one for another core
    /// goes through that core's inbox and a reschedule IPI.
    pub fn schedule_task(&self, task: Box<Task>) -> KernelResult<Placement> {
        let loads: Vec<(usize, u32)> = self
            .cores
            .iter()
            .filter(|core| core.is_online())
            .map(|core| (core.id, core.load()))
            .collect();
        let id = task.id;

        let core = {
            let mut director = self.director.lock();
            match director.choose_core(&task, loads) {
                Some(core) => {
                    director.record_home(id, core);
                    core
                }
                None => {
                    director.park(task);
                    crate::sched_log!("task {} parked until a core is online", id);
                    return Ok(Placement::Parked);
                }
            }
        };

        if core == self.platform.current_core() {
            self.locked(|scheduler| {
                scheduler.schedule_task(task)?;
                Ok(((), scheduler.reschedule()))
            })?;
        } else {
            let target = self.core(core).ok_or(KernelError::InvalidCore)?;
            target.reserve_load(task.priority.weight());
            self.platform
                .without_interrupts(|| target.inbox.lock().push_task(task));
            self.send_ipi(target, IpiKind::Reschedule);
        }
        crate::sched_log!("task {} placed on core {}", id, core);
        Ok(Placement::Core(core))
    }

    /// Retire the calling task; the core moves on to the next one
    ///
    /// On hardware this does not return to the exiting task.
    pub fn exit_current_task(&self) -> KernelResult<TaskId> {
        self.locked(|scheduler| {
            let exit = scheduler.exit_current()?;
            self.director.lock().forget(exit.task);
            Ok((exit.task, exit.switch))
        })
    }

    /// Put the calling task to sleep for at least `milliseconds`
    pub fn sleep_current_task(&self, milliseconds: u64) -> KernelResult<()> {
        self.locked(|scheduler| {
            let switch = scheduler.block_current(BlockReason::Sleep(milliseconds))?;
            KernelMetrics::inc(&self.metrics.sleeps);
            Ok(((), switch))
        })
    }

    /// Cut a sleep or message wait short. Only tasks of the calling core.
    pub fn wake_task(&self, id: TaskId) -> KernelResult<bool> {
        self.check_local(id)?;
        self.locked(|scheduler| {
            if !scheduler.wake(id) {
                return Ok((false, None));
            }
            KernelMetrics::inc(&self.metrics.wakes);
            Ok((true, scheduler.reschedule()))
        })
    }

    /// Timer interrupt handler body
    pub fn notify_timeslice_expired(&self) -> KernelResult<()> {
        self.locked(|scheduler| {
            if !scheduler.is_started() {
                return Ok(((), None));
            }
            KernelMetrics::inc(&self.metrics.timer_ticks);
            let blocked = scheduler.blocked_count();
            let switch = scheduler.notify_timeslice_expired();
            let woken = blocked.saturating_sub(scheduler.blocked_count());
            KernelMetrics::add(&self.metrics.wakes, woken as u64);
            Ok(((), switch))
        })
    }

    /// Send a message from the calling task
    ///
    /// The sender field is filled in here: the running task, or
    /// `KERNEL_SENDER` before the core has started.
    pub fn send_message(&self, mut message: Message) -> KernelResult<()> {
        message.sender = self.current_task().unwrap_or(KERNEL_SENDER);

        let registry_task = self.director.lock().registry().registry_task();
        if message.recipient == Recipient::Registry && registry_task.is_none() {
            return self.handle_registry_message(message);
        }
        self.route(message)
    }

    /// Take the next message (matching `filter`, if given) or block once
    ///
    /// When nothing suitable is pending the calling task is blocked and the
    /// core switches away; `None` is returned after the task is resumed.
    pub fn try_receive_message(
        &self,
        filter: Option<&MessageFilter>,
    ) -> KernelResult<Option<Message>> {
        let received = self.locked(|scheduler| match scheduler.receive_or_block(filter)? {
            ReceiveOutcome::Received(message) => Ok((Some(message), None)),
            ReceiveOutcome::Blocked(switch) => Ok((None, switch)),
        })?;
        if received.is_some() {
            KernelMetrics::inc(&self.metrics.ipc_receives);
        }
        Ok(received)
    }

    /// Block until a message (matching `filter`, if given) arrives
    pub fn receive_message(&self, filter: Option<&MessageFilter>) -> KernelResult<Message> {
        loop {
            if let Some(message) = self.try_receive_message(filter)? {
                return Ok(message);
            }
        }
    }

    /// Change a task's priority. Only tasks of the calling core.
    pub fn change_priority(&self, id: TaskId, priority: Priority) -> KernelResult<()> {
        self.check_local(id)?;
        self.locked(|scheduler| {
            scheduler.change_priority(id, priority)?;
            Ok(((), None))
        })
    }

    /// Start dispatching on every online core
    ///
    /// The other cores are told by IPI; the calling core leaves its boot
    /// stack last, since on hardware that switch does not come back.
    pub fn start_scheduler(&self) -> KernelResult<()> {
        self.broadcast(IpiKind::StartScheduler);
        self.start_local()
    }

    /// Flush stale translations on every core
    pub fn invalidate_tlb(&self) {
        self.platform.flush_tlb();
        self.broadcast(IpiKind::InvalidateTlb);
    }

    /// Arm the periodic timeslice timer on every core
    pub fn propagate_timeslice_setup(&self) -> KernelResult<()> {
        self.arm_local_timer()?;
        self.broadcast(IpiKind::SetupTimeslice);
        Ok(())
    }

    /// Receiving side of the IPIs sent above
    pub fn handle_ipi(&self, kind: IpiKind) -> KernelResult<()> {
        match kind {
            IpiKind::Reschedule => self.locked(|scheduler| Ok(((), scheduler.reschedule()))),
            IpiKind::StartScheduler => self.start_local(),
            IpiKind::InvalidateTlb => {
                self.platform.flush_tlb();
                Ok(())
            }
            IpiKind::SetupTimeslice => self.arm_local_timer(),
        }
    }

    /// Free every task that exited on the calling core
    ///
    /// Body of the cleanup task, alternating with `park_cleanup_task`; any
    /// other caller gets `NoCurrentTask`. The tasks are dropped after the
    /// scheduler lock is released.
    pub fn run_cleanup(&self) -> KernelResult<usize> {
        let reaped = self.locked(|scheduler| {
            Self::check_cleanup_current(scheduler)?;
            Ok((scheduler.reap_deleted(), None))
        })?;
        let count = reaped.len();
        for task in &reaped {
            crate::sched_log!("reaping task {} '{}'", task.id, task.name);
        }
        drop(reaped);
        KernelMetrics::add(&self.metrics.tasks_reaped, count as u64);
        Ok(count)
    }

    /// Block the cleanup task until the next exit, unless one is pending
    pub fn park_cleanup_task(&self) -> KernelResult<()> {
        self.locked(|scheduler| {
            Self::check_cleanup_current(scheduler)?;
            if scheduler.deleted_count() > 0 {
                return Ok(((), None));
            }
            let switch =
                scheduler.block_current(BlockReason::WaitingForMessage { since: None })?;
            Ok(((), switch))
        })
    }

    /// Only the core's cleanup task may reap or park itself
    fn check_cleanup_current(scheduler: &Scheduler) -> KernelResult<()> {
        match scheduler.cleanup_task() {
            Some(cleanup) if scheduler.current_task() == Some(cleanup) => Ok(()),
            _ => Err(KernelError::NoCurrentTask),
        }
    }

    fn local(&self) -> KernelResult<&CoreBlock> {
        self.core(self.platform.current_core())
            .ok_or(KernelError::InvalidCore)
    }

    fn check_local(&self, id: TaskId) -> KernelResult<()> {
        match self.home_of(id) {
            None => Err(KernelError::RecipientNotFound),
            Some(core) if core != self.platform.current_core() => Err(KernelError::InvalidCore),
            Some(_) => Ok(()),
        }
    }

    fn build_kernel_task(
        &self,
        name: &'static str,
        entry: u64,
        priority: Priority,
    ) -> KernelResult<Box<Task>> {
        let id = self.director.lock().generate_id()?;
        self.launcher
            .create_kernel_task(&self.platform, id, name, entry, priority)
            .inspect_err(|error| {
                self.director.lock().free_id(id);
                crate::sched_warn!("kernel task '{}' not created: {}", name, error);
            })
    }

    fn spawn(&self, task: Box<Task>) -> KernelResult<TaskId> {
        let id = task.id;
        self.schedule_task(task)?;
        KernelMetrics::inc(&self.metrics.tasks_spawned);
        Ok(id)
    }

    fn release_parked(&self) -> KernelResult<()> {
        let parked = self.director.lock().take_parked();
        for task in parked {
            self.schedule_task(task)?;
        }
        Ok(())
    }

    fn start_local(&self) -> KernelResult<()> {
        let block = self.local()?;
        self.locked(|scheduler| {
            if scheduler.is_started() {
                return Ok(((), None));
            }
            block.set_flags(CoreFlags::SCHEDULER_STARTED);
            crate::sched_info!("core {} starting scheduler", block.id);
            Ok(((), scheduler.start()))
        })
    }

    fn arm_local_timer(&self) -> KernelResult<()> {
        let block = self.local()?;
        self.platform
            .set_timer(TimerMode::Periodic, self.config.timeslice_ms);
        block.set_flags(CoreFlags::TIMER_ARMED);
        Ok(())
    }

    fn broadcast(&self, kind: IpiKind) -> usize {
        let sent = broadcast_ipi(
            &self.platform,
            &self.cores,
            kind,
            self.platform.current_core(),
        );
        KernelMetrics::add(&self.metrics.ipis_sent, sent as u64);
        sent
    }

    fn send_ipi(&self, target: &CoreBlock, kind: IpiKind) {
        self.platform.send_ipi(target.apic_id, kind);
        KernelMetrics::inc(&self.metrics.ipis_sent);
    }

    /// Deliver an already stamped message to whoever it resolves to
    fn route(&self, message: Message) -> KernelResult<()> {
        let (recipient, home) = self.director.lock().resolve(&message.recipient)?;
        let result = if home == self.platform.current_core() {
            self.locked(|scheduler| {
                if !scheduler.deliver(recipient, &message)? {
                    return Ok(((), None));
                }
                KernelMetrics::inc(&self.metrics.wakes);
                Ok(((), scheduler.reschedule()))
            })
        } else {
            self.post_remote(home, recipient, message)
        };

        match result {
            Ok(()) => KernelMetrics::inc(&self.metrics.ipc_sends),
            Err(KernelError::MailboxFull) => KernelMetrics::inc(&self.metrics.ipc_mailbox_full),
            Err(_) => {}
        }
        result
    }

    fn post_remote(&self, core: usize, recipient: TaskId, message: Message) -> KernelResult<()> {
        // Refuse what the recipient's mailbox would reject before it is queued
        message.encode()?;
        let target = self.core(core).ok_or(KernelError::InvalidCore)?;
        self.platform
            .without_interrupts(|| target.inbox.lock().push_mail(recipient, message))?;
        self.send_ipi(target, IpiKind::Reschedule);
        Ok(())
    }

    /// Service-registry requests when no registry task is installed
    fn handle_registry_message(&self, message: Message) -> KernelResult<()> {
        let Payload::Services(request) = message.payload else {
            return Err(KernelError::MalformedMessage);
        };
        let sender = message.sender;
        match request {
            ServiceMessage::Register { service } => {
                if let Some(previous) = self.director.lock().registry_mut().register(service, sender)
                {
                    crate::log_info!(
                        "IPC",
                        "{:?} moved from task {} to task {}",
                        service,
                        previous,
                        sender
                    );
                }
                Ok(())
            }
            ServiceMessage::Unregister { service } => {
                self.director
                    .lock()
                    .registry_mut()
                    .unregister(service, sender);
                Ok(())
            }
            ServiceMessage::Lookup { service } => {
                let task = self.director.lock().registry().provider(service);
                let mut reply = Message::new(
                    Recipient::Task(sender),
                    Payload::Services(ServiceMessage::LookupReply { service, task }),
                );
                reply.sender = KERNEL_SENDER;
                self.route(reply)
            }
            ServiceMessage::LookupReply { .. } => Err(KernelError::MalformedMessage),
        }
    }

    /// Run `op` on the calling core's scheduler and carry out its switch
    fn locked<R>(
        &self,
        op: impl FnOnce(&mut Scheduler) -> KernelResult<(R, Option<Switch>)>,
    ) -> KernelResult<R> {
        let block = self.local()?;
        let _guard = InterruptGuard::new(&self.platform);
        let mut scheduler = block.scheduler.lock();
        self.drain_inbox(block, &mut scheduler);

        let (value, switch) = match op(&mut scheduler) {
            Ok(result) => result,
            Err(error) if error.is_fatal() => self.core_fault(block, error),
            Err(error) => {
                block.publish(&scheduler);
                return Err(error);
            }
        };
        let prepared = match switch.map(|switch| scheduler.prepare_switch(&switch)) {
            Some(Ok(prepared)) => Some(prepared),
            Some(Err(error)) => self.core_fault(block, error),
            None => None,
        };
        block.publish(&scheduler);
        drop(scheduler);

        if let Some(prepared) = prepared {
            self.perform_switch(prepared);
        }
        Ok(value)
    }

    fn perform_switch(&self, prepared: PreparedSwitch) {
        let PreparedSwitch {
            frame,
            activate,
            preempted,
        } = prepared;
        // Nothing owned may stay on this stack: an exiting task never resumes
        if let Some(space) = activate {
            space.activate();
        }
        KernelMetrics::inc(&self.metrics.context_switches);
        if preempted {
            KernelMetrics::inc(&self.metrics.preemptions);
        }
        // SAFETY: the frame was prepared under the scheduler lock from boxed
        // tasks that stay alive until the cleanup task runs after this switch.
        unsafe { self.platform.switch_context(frame) };
    }

    /// Queue tasks and deliver mail other cores left for this one
    ///
    /// Mail for a full mailbox goes back to the inbox, and later mail for
    /// the same task waits behind it so delivery order holds.
    fn drain_inbox(&self, block: &CoreBlock, scheduler: &mut Scheduler) {
        let (tasks, mail) = {
            let mut inbox = block.inbox.lock();
            (inbox.take_tasks(), inbox.take_mail())
        };
        for task in tasks {
            if let Err(error) = scheduler.schedule_task(task) {
                self.core_fault(block, error);
            }
        }
        if mail.is_empty() {
            return;
        }

        let mut retained = VecDeque::new();
        let mut stalled: Vec<TaskId> = Vec::new();
        for (recipient, message) in mail {
            if stalled.contains(&recipient) {
                retained.push_back((recipient, message));
                continue;
            }
            match scheduler.deliver(recipient, &message) {
                Ok(true) => KernelMetrics::inc(&self.metrics.wakes),
                Ok(false) => {}
                Err(KernelError::MailboxFull) => {
                    stalled.push(recipient);
                    retained.push_back((recipient, message));
                }
                Err(error) => crate::log_warn!(
                    "IPC",
                    "dropped mail from task {} to task {}: {}",
                    message.sender,
                    recipient,
                    error
                ),
            }
        }
        if !retained.is_empty() {
            block.inbox.lock().restore_mail(retained);
        }
    }

    /// A broken invariant: report it and stop this core
    fn core_fault(&self, block: &CoreBlock, error: KernelError) -> ! {
        crate::log_error!("CPU", "core {} fault: {}", block.id, error);
        block.set_flags(CoreFlags::FAULTED);
        self.platform.halt_core()
    }
}

impl<P: Platform + 'static> Kernel<P> {
    /// Make log lines carry this kernel's core and task ids
    pub fn install_log_context(&'static self) {
        crate::log::set_context(self);
    }
}

impl<P: Platform> LogContext for Kernel<P> {
    fn cpu_id(&self) -> usize {
        self.platform.current_core()
    }

    fn task_id(&self) -> Option<usize> {
        self.current_task()
    }
}
