//! Mailbox Integration Tests
//!
//! Streams messages between two tasks through a deliberately small mailbox
//! so frames keep crossing the end of the ring.

use keel_kernel::ipc::{SchedulerMessage, MAX_MESSAGE_SIZE};
use keel_kernel::sim::SimPlatform;
use keel_kernel::{
    Kernel, KernelConfig, KernelError, Message, MessageFilter, Namespace, Payload, Priority,
    Recipient, TaskId,
};

/// A Ping frame is 20 bytes: three fill the ring up to `capacity - 3`
const RING: usize = 63;

fn boot() -> (Kernel<SimPlatform>, TaskId, TaskId) {
    let mut config = KernelConfig::with_cores(1);
    config.mailbox_size = RING;
    let kernel = Kernel::new(config, SimPlatform::new(1), &[0]).unwrap();
    kernel.bring_up_core().unwrap();
    let a = kernel
        .spawn_kernel_task("sender", 0x10_0000, Priority::Other)
        .unwrap();
    let b = kernel
        .spawn_kernel_task("receiver", 0x11_0000, Priority::Other)
        .unwrap();
    kernel.start_scheduler().unwrap();
    kernel.park_cleanup_task().unwrap();
    assert_eq!(kernel.current_task(), Some(a));
    (kernel, a, b)
}

fn ping(to: TaskId, token: u32) -> Message {
    Message::new(
        Recipient::Task(to),
        Payload::Scheduler(SchedulerMessage::Ping { token }),
    )
}

fn offsets(kernel: &Kernel<SimPlatform>, task: TaskId) -> (usize, usize) {
    kernel
        .inspect(0, |s| {
            let mailbox = &s.task(task).unwrap().mailbox;
            (mailbox.read_offset(), mailbox.write_offset())
        })
        .unwrap()
}

#[test]
fn test_full_mailbox_pushes_back_on_sender() {
    let (kernel, _a, b) = boot();
    for token in 0..3 {
        kernel.send_message(ping(b, token)).unwrap();
    }
    assert_eq!(offsets(&kernel, b), (0, RING - 3));
    assert_eq!(
        kernel.send_message(ping(b, 3)),
        Err(KernelError::MailboxFull)
    );
    assert_eq!(offsets(&kernel, b), (0, RING - 3));

    let metrics = kernel.metrics().snapshot();
    assert_eq!(metrics.ipc_sends, 3);
    assert_eq!(metrics.ipc_mailbox_full, 1);
}

#[test]
fn test_stream_survives_repeated_wraparound() {
    let (kernel, a, b) = boot();
    let mut next_token = 0u32;
    let mut expected = 0u32;

    for _ in 0..25 {
        // Sender's turn
        assert_eq!(kernel.current_task(), Some(a));
        for _ in 0..3 {
            kernel.send_message(ping(b, next_token)).unwrap();
            next_token += 1;
        }
        kernel.notify_timeslice_expired().unwrap();

        // Receiver's turn
        assert_eq!(kernel.current_task(), Some(b));
        for _ in 0..3 {
            let message = kernel.try_receive_message(None).unwrap().unwrap();
            assert_eq!(message.sender, a);
            assert_eq!(
                message.payload,
                Payload::Scheduler(SchedulerMessage::Ping { token: expected })
            );
            expected += 1;
        }
        let (read, write) = offsets(&kernel, b);
        assert_eq!(read, write);
        assert!(write < RING);
        kernel.notify_timeslice_expired().unwrap();
    }
    assert_eq!(kernel.metrics().snapshot().ipc_receives, 75);
}

#[test]
fn test_opaque_payload_crosses_the_boundary_intact() {
    let (kernel, _a, b) = boot();
    // Move the offsets to capacity - 3
    for token in 0..3 {
        kernel.send_message(ping(b, token)).unwrap();
    }
    kernel.notify_timeslice_expired().unwrap();
    for _ in 0..3 {
        kernel.try_receive_message(None).unwrap().unwrap();
    }
    assert_eq!(offsets(&kernel, b), (RING - 3, RING - 3));
    kernel.notify_timeslice_expired().unwrap();

    let data: Vec<u8> = (0..40u8).collect();
    let opaque = Message::new(
        Recipient::Task(b),
        Payload::Opaque {
            namespace: Namespace::Window,
            kind: 12,
            data: data.clone(),
        },
    );
    kernel.send_message(opaque).unwrap();
    assert_eq!(offsets(&kernel, b), (RING - 3, 56 - 3));

    kernel.notify_timeslice_expired().unwrap();
    let received = kernel.try_receive_message(None).unwrap().unwrap();
    assert_eq!(
        received.payload,
        Payload::Opaque {
            namespace: Namespace::Window,
            kind: 12,
            data,
        }
    );
}

#[test]
fn test_filtered_receive_keeps_the_rest_in_order() {
    let (kernel, _a, b) = boot();
    let vfs = |kind: u16| {
        Message::new(
            Recipient::Task(b),
            Payload::Opaque {
                namespace: Namespace::Vfs,
                kind,
                data: vec![kind as u8],
            },
        )
    };
    kernel.send_message(vfs(1)).unwrap();
    kernel.send_message(ping(b, 9)).unwrap();
    kernel.notify_timeslice_expired().unwrap();

    let filter = MessageFilter::namespace(Namespace::Scheduler);
    let message = kernel.try_receive_message(Some(&filter)).unwrap().unwrap();
    assert_eq!(message.kind(), 0);
    let message = kernel.try_receive_message(None).unwrap().unwrap();
    assert_eq!(message.namespace(), Namespace::Vfs);
}

#[test]
fn test_oversized_payload_is_refused() {
    let (kernel, _a, b) = boot();
    let message = Message::new(
        Recipient::Task(b),
        Payload::Opaque {
            namespace: Namespace::HardwareFs,
            kind: 0,
            data: vec![0; MAX_MESSAGE_SIZE],
        },
    );
    assert_eq!(
        kernel.send_message(message),
        Err(KernelError::MessageTooLarge)
    );
}
