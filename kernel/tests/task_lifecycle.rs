//! Task Lifecycle Integration Tests
//!
//! Creation, exit and reclamation of kernel and user tasks, including the
//! failure paths of task creation.

use keel_kernel::ipc::SchedulerMessage;
use keel_kernel::sim::SimPlatform;
use keel_kernel::{
    Kernel, KernelConfig, KernelError, Message, Payload, Priority, Recipient, Resource, TaskId,
};

fn kernel() -> Kernel<SimPlatform> {
    let kernel = Kernel::new(KernelConfig::with_cores(1), SimPlatform::new(1), &[0]).unwrap();
    kernel.bring_up_core().unwrap();
    kernel
}

fn start(kernel: &Kernel<SimPlatform>) {
    kernel.start_scheduler().unwrap();
    kernel.park_cleanup_task().unwrap();
}

fn queued(kernel: &Kernel<SimPlatform>, id: TaskId) -> bool {
    kernel
        .inspect(0, |s| s.is_ready(id) || s.is_blocked(id) || s.contains(id))
        .unwrap()
}

#[test]
fn test_user_task_exit_returns_every_resource() {
    let kernel = kernel();
    let stats = kernel.platform().stats();
    let kernel_stacks = stats.kernel_heap_live();

    let id = kernel
        .spawn_user_task("init", 0x40_0000, Some("/sbin/init"), Priority::Ui)
        .unwrap();
    assert_eq!(stats.user_spaces_live(), 1);
    assert!(stats.user_pages_mapped() > 0);
    assert_eq!(stats.kernel_heap_live(), kernel_stacks + 1);
    assert!(kernel.inspect(0, |s| s.task(id).unwrap().is_user()).unwrap());

    start(&kernel);
    assert_eq!(kernel.current_task(), Some(id));
    // Entering the task loaded its address space
    assert_ne!(stats.active_root(), kernel.platform().kernel_root());

    assert_eq!(kernel.exit_current_task(), Ok(id));
    assert!(!queued(&kernel, id));
    assert_eq!(kernel.home_of(id), None);
    // Cleanup was woken and runs next
    let cleanup = kernel.inspect(0, |s| s.cleanup_task()).unwrap();
    assert_eq!(kernel.current_task(), cleanup);
    assert_eq!(stats.active_root(), kernel.platform().kernel_root());

    assert_eq!(kernel.run_cleanup(), Ok(1));
    assert_eq!(stats.user_spaces_live(), 0);
    assert_eq!(stats.user_pages_mapped(), 0);
    assert_eq!(stats.kernel_heap_live(), kernel_stacks);
    assert_eq!(kernel.run_cleanup(), Ok(0));
    assert_eq!(kernel.metrics().snapshot().tasks_reaped, 1);

    kernel.park_cleanup_task().unwrap();
    assert_eq!(kernel.current_task(), kernel.inspect(0, |s| s.idle_task()).unwrap());
}

#[test]
fn test_exited_id_is_recycled() {
    let kernel = kernel();
    let first = kernel
        .spawn_kernel_task("short", 0x10_0000, Priority::Other)
        .unwrap();
    let live = kernel.live_tasks();
    start(&kernel);

    kernel.exit_current_task().unwrap();
    assert_eq!(kernel.live_tasks(), live - 1);

    let second = kernel
        .spawn_kernel_task("next", 0x11_0000, Priority::Other)
        .unwrap();
    assert_eq!(second, first);
    assert!(kernel.inspect(0, |s| s.is_ready(second)).unwrap());
}

#[test]
fn test_mail_to_exited_task_is_refused() {
    let kernel = kernel();
    let a = kernel
        .spawn_kernel_task("a", 0x10_0000, Priority::Other)
        .unwrap();
    let b = kernel
        .spawn_kernel_task("b", 0x11_0000, Priority::Other)
        .unwrap();
    start(&kernel);

    assert_eq!(kernel.exit_current_task(), Ok(a));
    // B is next; the woken cleanup task queues behind it
    assert_eq!(kernel.current_task(), Some(b));
    kernel.notify_timeslice_expired().unwrap();
    assert_eq!(kernel.current_task(), kernel.inspect(0, |s| s.cleanup_task()).unwrap());
    assert_eq!(kernel.run_cleanup(), Ok(1));
    kernel.park_cleanup_task().unwrap();
    assert_eq!(kernel.current_task(), Some(b));

    let message = Message::new(
        Recipient::Task(a),
        Payload::Scheduler(SchedulerMessage::Ping { token: 0 }),
    );
    assert_eq!(
        kernel.send_message(message),
        Err(KernelError::RecipientNotFound)
    );
}

#[test]
fn test_only_cleanup_task_reaps_or_parks() {
    let kernel = kernel();
    let a = kernel
        .spawn_kernel_task("a", 0x10_0000, Priority::Other)
        .unwrap();
    let b = kernel
        .spawn_kernel_task("b", 0x11_0000, Priority::Other)
        .unwrap();
    start(&kernel);

    assert_eq!(kernel.exit_current_task(), Ok(a));
    assert_eq!(kernel.current_task(), Some(b));
    assert_eq!(
        kernel.park_cleanup_task(),
        Err(KernelError::NoCurrentTask)
    );
    assert_eq!(kernel.run_cleanup(), Err(KernelError::NoCurrentTask));
    // B keeps running and the exited task is still waiting to be freed
    assert_eq!(kernel.current_task(), Some(b));
    assert!(kernel.inspect(0, |s| s.is_ready(b)).unwrap());
    assert_eq!(kernel.inspect(0, |s| s.deleted_count()).unwrap(), 1);
}

#[test]
fn test_idle_and_cleanup_cannot_exit() {
    let kernel = kernel();
    kernel.start_scheduler().unwrap();
    // The cleanup task is current
    assert_eq!(kernel.exit_current_task(), Err(KernelError::NoCurrentTask));
    kernel.park_cleanup_task().unwrap();
    assert_eq!(kernel.exit_current_task(), Err(KernelError::NoCurrentTask));
}

#[test]
fn test_failed_creation_schedules_nothing() {
    let kernel = kernel();
    let stats = kernel.platform().stats();
    let faults = kernel.platform().faults();
    let live = kernel.live_tasks();
    let kernel_stacks = stats.kernel_heap_live();

    let cases = [
        (0, KernelError::AllocationFailed(Resource::AddressSpace)),
        (1, KernelError::AllocationFailed(Resource::TaskState)),
        (2, KernelError::AllocationFailed(Resource::Heap)),
        (3, KernelError::AllocationFailed(Resource::TaskState)),
        (4, KernelError::AllocationFailed(Resource::KernelStack)),
    ];
    for (fault, expected) in cases {
        faults.fail_clone(fault == 0);
        faults.fail_user_pages(fault == 1);
        faults.fail_heap_creation(fault == 2);
        faults.fail_write_bytes(fault == 3);
        faults.fail_kernel_heap(fault == 4);

        let result = kernel.spawn_user_task("broken", 0x40_0000, None, Priority::Other);
        assert_eq!(result, Err(expected), "fault {}", fault);
        assert_eq!(kernel.live_tasks(), live);
        assert_eq!(stats.user_spaces_live(), 0);
        assert_eq!(stats.user_pages_mapped(), 0);
        assert_eq!(stats.kernel_heap_live(), kernel_stacks);
        assert_eq!(kernel.inspect(0, |s| s.ready_tasks().len()).unwrap(), 1);
    }

    faults.fail_kernel_heap(true);
    assert_eq!(
        kernel.spawn_kernel_task("broken", 0x10_0000, Priority::Other),
        Err(KernelError::AllocationFailed(Resource::KernelStack))
    );
    assert_eq!(kernel.live_tasks(), live);
    assert_eq!(kernel.metrics().snapshot().tasks_spawned, 0);
}

#[test]
fn test_id_space_exhaustion_is_reported() {
    let mut config = KernelConfig::with_cores(1);
    config.max_task_ids = 4;
    let kernel = Kernel::new(config, SimPlatform::new(1), &[0]).unwrap();
    kernel.bring_up_core().unwrap();
    kernel
        .spawn_kernel_task("one", 0x10_0000, Priority::Other)
        .unwrap();
    kernel
        .spawn_kernel_task("two", 0x11_0000, Priority::Other)
        .unwrap();
    assert_eq!(
        kernel.spawn_kernel_task("three", 0x12_0000, Priority::Other),
        Err(KernelError::OutOfIds)
    );
}
