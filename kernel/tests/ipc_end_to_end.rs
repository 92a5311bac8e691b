//! IPC Integration Tests
//!
//! Message exchange between tasks on one core: blocking receive, wake on
//! delivery, filtered waits and service addressing.

use keel_kernel::ipc::{SchedulerMessage, ServiceMessage, ServiceType, KERNEL_SENDER};
use keel_kernel::sim::SimPlatform;
use keel_kernel::{
    Kernel, KernelConfig, Message, MessageFilter, Namespace, Payload, Priority, Recipient, TaskId,
    TaskState,
};

fn boot(tasks: usize) -> (Kernel<SimPlatform>, Vec<TaskId>) {
    let kernel = Kernel::new(KernelConfig::with_cores(1), SimPlatform::new(1), &[0]).unwrap();
    kernel.bring_up_core().unwrap();
    let ids = (0..tasks)
        .map(|n| {
            kernel
                .spawn_kernel_task("peer", 0x20_0000 + n as u64 * 0x1000, Priority::Other)
                .unwrap()
        })
        .collect();
    kernel.start_scheduler().unwrap();
    kernel.park_cleanup_task().unwrap();
    (kernel, ids)
}

fn scheduler_message(to: Recipient, message: SchedulerMessage) -> Message {
    Message::new(to, Payload::Scheduler(message))
}

fn state(kernel: &Kernel<SimPlatform>, id: TaskId) -> TaskState {
    kernel.inspect(0, |s| s.task(id).unwrap().state).unwrap()
}

#[test]
fn test_ping_wakes_blocked_receiver() {
    let (kernel, ids) = boot(2);
    let (a, b) = (ids[0], ids[1]);

    // B runs first and waits for mail
    kernel.notify_timeslice_expired().unwrap();
    assert_eq!(kernel.current_task(), Some(b));
    assert_eq!(kernel.try_receive_message(None).unwrap(), None);
    assert_eq!(state(&kernel, b), TaskState::Blocked);
    assert_eq!(kernel.current_task(), Some(a));

    kernel
        .send_message(scheduler_message(
            Recipient::Task(b),
            SchedulerMessage::Ping { token: 7 },
        ))
        .unwrap();
    assert!(kernel.inspect(0, |s| s.is_ready(b)).unwrap());

    kernel.notify_timeslice_expired().unwrap();
    assert_eq!(kernel.current_task(), Some(b));
    assert_eq!(state(&kernel, b), TaskState::Running);

    let switches = kernel.platform().switches().len();
    let ping = kernel.try_receive_message(None).unwrap().unwrap();
    assert_eq!(ping.sender, a);
    assert_eq!(ping.payload, Payload::Scheduler(SchedulerMessage::Ping { token: 7 }));
    // Taking a pending message never blocks
    assert_eq!(kernel.platform().switches().len(), switches);
    assert_eq!(kernel.current_task(), Some(b));

    kernel
        .send_message(scheduler_message(
            Recipient::Task(a),
            SchedulerMessage::Pong { token: 7 },
        ))
        .unwrap();
    kernel.notify_timeslice_expired().unwrap();
    let pong = kernel.receive_message(None).unwrap();
    assert_eq!(pong.sender, b);
}

#[test]
fn test_filtered_wait_does_not_spin_on_backlog() {
    let (kernel, ids) = boot(2);
    let (a, b) = (ids[0], ids[1]);
    let pong_only = MessageFilter::kind(Namespace::Scheduler, 1);

    kernel.notify_timeslice_expired().unwrap();
    assert_eq!(kernel.try_receive_message(Some(&pong_only)).unwrap(), None);

    // Unrelated traffic lets B look once more, then it waits again
    kernel
        .send_message(Message::new(
            Recipient::Task(b),
            Payload::Opaque {
                namespace: Namespace::Vfs,
                kind: 4,
                data: vec![1, 2, 3],
            },
        ))
        .unwrap();
    kernel.notify_timeslice_expired().unwrap();
    assert_eq!(kernel.current_task(), Some(b));
    assert_eq!(kernel.try_receive_message(Some(&pong_only)).unwrap(), None);
    assert_eq!(kernel.current_task(), Some(a));

    let switches = kernel.platform().switches().len();
    for _ in 0..10 {
        kernel.notify_timeslice_expired().unwrap();
        assert_eq!(kernel.current_task(), Some(a));
    }
    assert_eq!(kernel.platform().switches().len(), switches);

    kernel
        .send_message(scheduler_message(
            Recipient::Task(b),
            SchedulerMessage::Pong { token: 1 },
        ))
        .unwrap();
    kernel.notify_timeslice_expired().unwrap();
    let pong = kernel.try_receive_message(Some(&pong_only)).unwrap().unwrap();
    assert_eq!(pong.payload, Payload::Scheduler(SchedulerMessage::Pong { token: 1 }));

    // The backlog is still there, untouched
    let rest = kernel.try_receive_message(None).unwrap().unwrap();
    assert_eq!(rest.namespace(), Namespace::Vfs);
}

#[test]
fn test_service_lookup_through_kernel_registry() {
    let (kernel, ids) = boot(2);
    let (provider, client) = (ids[0], ids[1]);

    kernel
        .send_message(Message::new(
            Recipient::Registry,
            Payload::Services(ServiceMessage::Register {
                service: ServiceType::Input,
            }),
        ))
        .unwrap();
    kernel.notify_timeslice_expired().unwrap();
    assert_eq!(kernel.current_task(), Some(client));

    kernel
        .send_message(Message::new(
            Recipient::Registry,
            Payload::Services(ServiceMessage::Lookup {
                service: ServiceType::Input,
            }),
        ))
        .unwrap();
    let reply = kernel.try_receive_message(None).unwrap().unwrap();
    assert_eq!(reply.sender, KERNEL_SENDER);
    assert_eq!(
        reply.payload,
        Payload::Services(ServiceMessage::LookupReply {
            service: ServiceType::Input,
            task: Some(provider),
        })
    );

    kernel
        .send_message(scheduler_message(
            Recipient::Service(ServiceType::Input),
            SchedulerMessage::Ping { token: 2 },
        ))
        .unwrap();
    kernel.notify_timeslice_expired().unwrap();
    assert_eq!(kernel.current_task(), Some(provider));
    let ping = kernel.try_receive_message(None).unwrap().unwrap();
    assert_eq!(ping.sender, client);
}

#[test]
fn test_registry_task_takes_over_registry_traffic() {
    let (kernel, ids) = boot(2);
    let (registry, client) = (ids[0], ids[1]);
    kernel.set_registry_task(Some(registry));

    kernel.notify_timeslice_expired().unwrap();
    assert_eq!(kernel.current_task(), Some(client));
    let request = Message::new(
        Recipient::Registry,
        Payload::Services(ServiceMessage::Lookup {
            service: ServiceType::Clock,
        }),
    );
    kernel.send_message(request).unwrap();

    kernel.notify_timeslice_expired().unwrap();
    let received = kernel.try_receive_message(None).unwrap().unwrap();
    assert_eq!(received.sender, client);
    assert_eq!(received.recipient, Recipient::Registry);
}
