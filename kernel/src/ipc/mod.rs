//! Inter-process communication: message frames, mailboxes, service lookup

pub mod mailbox;
pub mod message;
pub mod registry;

pub use mailbox::Mailbox;
pub use message::{
    Message, MessageFilter, Namespace, Payload, Recipient, SchedulerMessage, ServiceMessage,
    ServiceType, KERNEL_SENDER, MAX_MESSAGE_SIZE,
};
pub use registry::ServiceRegistry;
