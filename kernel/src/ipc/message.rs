//! Message format
//!
//! In the kernel a message is a typed value: one payload enum per
//! namespace. In a mailbox it is a little-endian frame:
//!
//! ```text
//! offset  size  field
//!      0     4  length of the whole frame, header included
//!      4     4  sender task id
//!      8     4  recipient task id or service type
//!     12     1  namespace
//!     13     1  recipient kind (0 task, 1 service, 2 registry)
//!     14     2  message kind within the namespace
//!     16     -  payload
//! ```

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::sched::task::TaskId;

pub const HEADER_SIZE: usize = 16;

/// Largest frame a mailbox accepts, header included
pub const MAX_MESSAGE_SIZE: usize = 256;

pub const MAX_PAYLOAD_SIZE: usize = MAX_MESSAGE_SIZE - HEADER_SIZE;

/// Wire value meaning "no task" in id-carrying payloads
const NO_TASK: u32 = u32::MAX;

/// Sender id of replies the kernel itself writes
pub const KERNEL_SENDER: TaskId = 0xFFFF_FFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Namespace {
    Scheduler = 0,
    Services = 1,
    Vfs = 2,
    HardwareFs = 3,
    Window = 4,
}

impl Namespace {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Namespace::Scheduler),
            1 => Some(Namespace::Services),
            2 => Some(Namespace::Vfs),
            3 => Some(Namespace::HardwareFs),
            4 => Some(Namespace::Window),
            _ => None,
        }
    }

    /// Namespaces whose payloads the kernel itself interprets
    pub const fn is_typed(self) -> bool {
        matches!(self, Namespace::Scheduler | Namespace::Services)
    }
}

/// Well-known services a task can register for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ServiceType {
    Vfs = 1,
    HardwareFs = 2,
    Window = 3,
    Input = 4,
    Clock = 5,
}

impl ServiceType {
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ServiceType::Vfs),
            2 => Some(ServiceType::HardwareFs),
            3 => Some(ServiceType::Window),
            4 => Some(ServiceType::Input),
            5 => Some(ServiceType::Clock),
            _ => None,
        }
    }
}

/// Logical destination of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Task(TaskId),
    /// Whichever task is registered for the service
    Service(ServiceType),
    /// The service registry itself
    Registry,
}

impl Recipient {
    fn to_wire(self) -> (u8, u32) {
        match self {
            Recipient::Task(id) => (0, id as u32),
            Recipient::Service(service) => (1, service as u32),
            Recipient::Registry => (2, 0),
        }
    }

    fn from_wire(kind: u8, value: u32) -> KernelResult<Self> {
        match kind {
            0 => Ok(Recipient::Task(value as TaskId)),
            1 => ServiceType::from_u32(value)
                .map(Recipient::Service)
                .ok_or(KernelError::MalformedMessage),
            2 => Ok(Recipient::Registry),
            _ => Err(KernelError::MalformedMessage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMessage {
    Ping { token: u32 },
    Pong { token: u32 },
    /// Lets a service announce that a task it tracked has gone
    TaskExited { task: TaskId },
}

impl SchedulerMessage {
    const PING: u16 = 0;
    const PONG: u16 = 1;
    const TASK_EXITED: u16 = 2;

    fn kind(&self) -> u16 {
        match self {
            SchedulerMessage::Ping { .. } => Self::PING,
            SchedulerMessage::Pong { .. } => Self::PONG,
            SchedulerMessage::TaskExited { .. } => Self::TASK_EXITED,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let value = match *self {
            SchedulerMessage::Ping { token } | SchedulerMessage::Pong { token } => token,
            SchedulerMessage::TaskExited { task } => task as u32,
        };
        out.extend_from_slice(&value.to_le_bytes());
    }

    fn decode(kind: u16, payload: &[u8]) -> KernelResult<Self> {
        let value = read_u32(payload, 0)?;
        if payload.len() != 4 {
            return Err(KernelError::MalformedMessage);
        }
        match kind {
            Self::PING => Ok(SchedulerMessage::Ping { token: value }),
            Self::PONG => Ok(SchedulerMessage::Pong { token: value }),
            Self::TASK_EXITED => Ok(SchedulerMessage::TaskExited {
                task: value as TaskId,
            }),
            _ => Err(KernelError::MalformedMessage),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMessage {
    /// Register the sender as the provider of `service`
    Register { service: ServiceType },
    Unregister { service: ServiceType },
    Lookup { service: ServiceType },
    LookupReply {
        service: ServiceType,
        task: Option<TaskId>,
    },
}

impl ServiceMessage {
    const REGISTER: u16 = 0;
    const UNREGISTER: u16 = 1;
    const LOOKUP: u16 = 2;
    const LOOKUP_REPLY: u16 = 3;

    fn kind(&self) -> u16 {
        match self {
            ServiceMessage::Register { .. } => Self::REGISTER,
            ServiceMessage::Unregister { .. } => Self::UNREGISTER,
            ServiceMessage::Lookup { .. } => Self::LOOKUP,
            ServiceMessage::LookupReply { .. } => Self::LOOKUP_REPLY,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            ServiceMessage::Register { service }
            | ServiceMessage::Unregister { service }
            | ServiceMessage::Lookup { service } => {
                out.extend_from_slice(&(service as u32).to_le_bytes());
            }
            ServiceMessage::LookupReply { service, task } => {
                out.extend_from_slice(&(service as u32).to_le_bytes());
                let task = task.map_or(NO_TASK, |id| id as u32);
                out.extend_from_slice(&task.to_le_bytes());
            }
        }
    }

    fn decode(kind: u16, payload: &[u8]) -> KernelResult<Self> {
        let service =
            ServiceType::from_u32(read_u32(payload, 0)?).ok_or(KernelError::MalformedMessage)?;
        let expected = if kind == Self::LOOKUP_REPLY { 8 } else { 4 };
        if payload.len() != expected {
            return Err(KernelError::MalformedMessage);
        }
        match kind {
            Self::REGISTER => Ok(ServiceMessage::Register { service }),
            Self::UNREGISTER => Ok(ServiceMessage::Unregister { service }),
            Self::LOOKUP => Ok(ServiceMessage::Lookup { service }),
            Self::LOOKUP_REPLY => {
                let task = match read_u32(payload, 4)? {
                    NO_TASK => None,
                    id => Some(id as TaskId),
                };
                Ok(ServiceMessage::LookupReply { service, task })
            }
            _ => Err(KernelError::MalformedMessage),
        }
    }
}

/// Namespace-tagged payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Scheduler(SchedulerMessage),
    Services(ServiceMessage),
    /// Payload of a namespace owned by a service; the kernel only copies it
    Opaque {
        namespace: Namespace,
        kind: u16,
        data: Vec<u8>,
    },
}

impl Payload {
    pub fn namespace(&self) -> Namespace {
        match self {
            Payload::Scheduler(_) => Namespace::Scheduler,
            Payload::Services(_) => Namespace::Services,
            Payload::Opaque { namespace, .. } => *namespace,
        }
    }

    pub fn kind(&self) -> u16 {
        match self {
            Payload::Scheduler(message) => message.kind(),
            Payload::Services(message) => message.kind(),
            Payload::Opaque { kind, .. } => *kind,
        }
    }
}

/// Selects messages for a filtered receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFilter {
    pub namespace: Namespace,
    /// Any kind when `None`
    pub kind: Option<u16>,
}

impl MessageFilter {
    pub const fn namespace(namespace: Namespace) -> Self {
        Self {
            namespace,
            kind: None,
        }
    }

    pub const fn kind(namespace: Namespace, kind: u16) -> Self {
        Self {
            namespace,
            kind: Some(kind),
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        message.namespace() == self.namespace
            && self.kind.map_or(true, |kind| kind == message.kind())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Filled in by the kernel on send
    pub sender: TaskId,
    pub recipient: Recipient,
    pub payload: Payload,
}

impl Message {
    pub fn new(recipient: Recipient, payload: Payload) -> Self {
        Self {
            sender: 0,
            recipient,
            payload,
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.payload.namespace()
    }

    pub fn kind(&self) -> u16 {
        self.payload.kind()
    }

    /// Serialize into a frame
    pub fn encode(&self) -> KernelResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(MAX_MESSAGE_SIZE);
        frame.resize(HEADER_SIZE, 0);
        match &self.payload {
            Payload::Scheduler(message) => message.encode(&mut frame),
            Payload::Services(message) => message.encode(&mut frame),
            Payload::Opaque {
                namespace, data, ..
            } => {
                if namespace.is_typed() {
                    return Err(KernelError::MalformedMessage);
                }
                if data.len() > MAX_PAYLOAD_SIZE {
                    return Err(KernelError::MessageTooLarge);
                }
                frame.extend_from_slice(data);
            }
        }

        let length = frame.len() as u32;
        let (recipient_kind, recipient) = self.recipient.to_wire();
        frame[0..4].copy_from_slice(&length.to_le_bytes());
        frame[4..8].copy_from_slice(&(self.sender as u32).to_le_bytes());
        frame[8..12].copy_from_slice(&recipient.to_le_bytes());
        frame[12] = self.namespace() as u8;
        frame[13] = recipient_kind;
        frame[14..16].copy_from_slice(&self.kind().to_le_bytes());
        Ok(frame)
    }

    /// Parse one complete frame
    pub fn decode(frame: &[u8]) -> KernelResult<Self> {
        let length = frame_length(frame)?;
        if length != frame.len() {
            return Err(KernelError::MalformedMessage);
        }
        let sender = read_u32(frame, 4)? as TaskId;
        let recipient = Recipient::from_wire(frame[13], read_u32(frame, 8)?)?;
        let namespace = Namespace::from_u8(frame[12]).ok_or(KernelError::MalformedMessage)?;
        let kind = u16::from_le_bytes([frame[14], frame[15]]);
        let payload = &frame[HEADER_SIZE..];

        let payload = match namespace {
            Namespace::Scheduler => Payload::Scheduler(SchedulerMessage::decode(kind, payload)?),
            Namespace::Services => Payload::Services(ServiceMessage::decode(kind, payload)?),
            _ => Payload::Opaque {
                namespace,
                kind,
                data: payload.to_vec(),
            },
        };
        Ok(Self {
            sender,
            recipient,
            payload,
        })
    }
}

/// Length field of a frame header
pub fn frame_length(header: &[u8]) -> KernelResult<usize> {
    let length = read_u32(header, 0)? as usize;
    if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&length) {
        return Err(KernelError::MalformedMessage);
    }
    Ok(length)
}

fn read_u32(bytes: &[u8], offset: usize) -> KernelResult<u32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|slice| slice.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(KernelError::MalformedMessage)
}
