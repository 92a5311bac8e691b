//! Scheduler Integration Tests
//!
//! Drives one simulated core through the kernel context: round-robin
//! rotation, the sleep queue and timer-driven wakes.

use keel_kernel::sim::SimPlatform;
use keel_kernel::{Kernel, KernelConfig, KernelError, Priority, TaskId};

/// One started core whose cleanup task has already parked itself
fn boot(timeslice_ms: u64, tasks: usize) -> (Kernel<SimPlatform>, Vec<TaskId>) {
    let mut config = KernelConfig::with_cores(1);
    config.timeslice_ms = timeslice_ms;
    let kernel = Kernel::new(config, SimPlatform::new(1), &[0]).unwrap();
    kernel.bring_up_core().unwrap();
    let ids = (0..tasks)
        .map(|n| {
            kernel
                .spawn_kernel_task("worker", 0x10_0000 + n as u64 * 0x1000, Priority::Other)
                .unwrap()
        })
        .collect();
    kernel.start_scheduler().unwrap();
    kernel.park_cleanup_task().unwrap();
    (kernel, ids)
}

fn idle(kernel: &Kernel<SimPlatform>) -> TaskId {
    kernel.inspect(0, |s| s.idle_task()).unwrap().unwrap()
}

#[test]
fn test_three_tasks_cycle_in_order() {
    let (kernel, ids) = boot(10, 3);
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    assert_eq!(kernel.current_task(), Some(a));

    let mut order = Vec::new();
    for _ in 0..6 {
        kernel.notify_timeslice_expired().unwrap();
        order.push(kernel.current_task().unwrap());
    }
    assert_eq!(order, [b, c, a, b, c, a]);

    let metrics = kernel.metrics().snapshot();
    assert_eq!(metrics.timer_ticks, 6);
    assert_eq!(metrics.preemptions, 6);
}

#[test]
fn test_single_task_keeps_running() {
    let (kernel, ids) = boot(10, 1);
    let before = kernel.platform().switches().len();
    for _ in 0..5 {
        kernel.notify_timeslice_expired().unwrap();
        assert_eq!(kernel.current_task(), Some(ids[0]));
    }
    assert_eq!(kernel.platform().switches().len(), before);
}

#[test]
fn test_sleepers_are_ordered_by_wake_time() {
    let (kernel, ids) = boot(1, 3);
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    kernel.sleep_current_task(100).unwrap();
    assert_eq!(kernel.current_task(), Some(b));
    kernel.sleep_current_task(50).unwrap();
    assert_eq!(kernel.current_task(), Some(c));
    kernel.sleep_current_task(75).unwrap();
    assert_eq!(kernel.current_task(), Some(idle(&kernel)));

    let sleepers: Vec<TaskId> = kernel
        .inspect(0, |s| {
            s.blocked_tasks()
                .into_iter()
                .filter(|id| Some(*id) != s.cleanup_task())
                .collect()
        })
        .unwrap();
    assert_eq!(sleepers, [b, c, a]);
    assert_eq!(kernel.metrics().snapshot().sleeps, 3);
}

#[test]
fn test_sleepers_wake_exactly_on_time() {
    let (kernel, ids) = boot(1, 3);
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    kernel.sleep_current_task(100).unwrap();
    kernel.sleep_current_task(50).unwrap();
    kernel.sleep_current_task(75).unwrap();

    for (task, wake_time) in [(b, 50), (c, 75), (a, 100)] {
        while kernel.inspect(0, |s| s.elapsed_ms()).unwrap() < wake_time - 1 {
            kernel.notify_timeslice_expired().unwrap();
        }
        assert!(!kernel.inspect(0, |s| s.is_ready(task)).unwrap());

        kernel.notify_timeslice_expired().unwrap();
        assert!(kernel.inspect(0, |s| s.is_ready(task)).unwrap());
        assert_eq!(kernel.current_task(), Some(task));

        // Back to sleep for good so the next sleeper is observed from idle
        kernel.sleep_current_task(1_000_000).unwrap();
    }
}

#[test]
fn test_wake_cuts_sleep_short() {
    let (kernel, ids) = boot(10, 1);
    kernel.sleep_current_task(10_000).unwrap();
    assert_eq!(kernel.current_task(), Some(idle(&kernel)));

    assert_eq!(kernel.wake_task(ids[0]), Ok(true));
    assert_eq!(kernel.current_task(), Some(ids[0]));
    assert_eq!(kernel.wake_task(ids[0]), Ok(false));
}

#[test]
fn test_idle_task_cannot_sleep() {
    let (kernel, _) = boot(10, 0);
    assert_eq!(kernel.current_task(), Some(idle(&kernel)));
    assert_eq!(
        kernel.sleep_current_task(10),
        Err(KernelError::NoCurrentTask)
    );
}

#[test]
fn test_priority_change_moves_core_load() {
    let (kernel, ids) = boot(10, 2);
    assert_eq!(kernel.core(0).unwrap().load(), 2 * Priority::Other.weight());
    kernel.change_priority(ids[1], Priority::Input).unwrap();
    assert_eq!(
        kernel.core(0).unwrap().load(),
        Priority::Other.weight() + Priority::Input.weight()
    );
}
