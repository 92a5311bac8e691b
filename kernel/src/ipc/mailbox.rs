//! Per-task mailbox
//!
//! A byte ring holding encoded message frames back to back. Offsets are
//! always reduced modulo the capacity, so they can never point outside the
//! buffer. A frame that runs into the end of the buffer continues at
//! offset 0, and its header may be split the same way.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::message::{frame_length, Message, MessageFilter, HEADER_SIZE};
use crate::error::{KernelError, KernelResult, Resource};

#[derive(Debug)]
pub struct Mailbox {
    buffer: Box<[u8]>,
    read_offset: usize,
    write_offset: usize,
    /// Bytes between read and write offset; disambiguates full from empty
    used: usize,
    unread: usize,
    sends_completed: u64,
}

impl Mailbox {
    /// Allocate a ring of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> KernelResult<Self> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| KernelError::AllocationFailed(Resource::Mailbox))?;
        buffer.resize(capacity, 0);
        Ok(Self {
            buffer: buffer.into_boxed_slice(),
            read_offset: 0,
            write_offset: 0,
            used: 0,
            unread: 0,
            sends_completed: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity() - self.used
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn has_unread_messages(&self) -> bool {
        self.unread > 0
    }

    /// Number of successful sends over the mailbox's lifetime
    pub fn sends_completed(&self) -> u64 {
        self.sends_completed
    }

    pub fn read_offset(&self) -> usize {
        self.read_offset
    }

    pub fn write_offset(&self) -> usize {
        self.write_offset
    }

    pub fn is_released(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Free the ring. Later sends fail with `MailboxFull`.
    pub fn release(&mut self) {
        self.buffer = Box::default();
        self.read_offset = 0;
        self.write_offset = 0;
        self.used = 0;
        self.unread = 0;
    }

    /// Queue a message
    pub fn send(&mut self, message: &Message) -> KernelResult<()> {
        let frame = message.encode()?;
        self.send_frame(&frame)
    }

    /// Queue an encoded frame; on `MailboxFull` nothing changes
    pub fn send_frame(&mut self, frame: &[u8]) -> KernelResult<()> {
        self.push_frame(frame)?;
        self.sends_completed += 1;
        Ok(())
    }

    /// Oldest message, or `None` when nothing is pending
    pub fn receive(&mut self) -> KernelResult<Option<Message>> {
        match self.receive_frame()? {
            Some(frame) => decode_stored(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Oldest frame, or `None` when nothing is pending
    pub fn receive_frame(&mut self) -> KernelResult<Option<Vec<u8>>> {
        if self.unread == 0 {
            return Ok(None);
        }
        if self.used < HEADER_SIZE {
            return Err(KernelError::InvalidQueueState);
        }

        let mut header = [0u8; HEADER_SIZE];
        self.copy_out(self.read_offset, &mut header);
        let length = frame_length(&header).map_err(|_| KernelError::InvalidQueueState)?;
        if length > self.used {
            return Err(KernelError::InvalidQueueState);
        }

        let mut frame = Vec::new();
        frame.resize(length, 0);
        self.copy_out(self.read_offset, &mut frame);
        self.read_offset = (self.read_offset + length) % self.capacity();
        self.used -= length;
        self.unread -= 1;
        Ok(Some(frame))
    }

    /// First pending message accepted by `filter`
    ///
    /// Every pending message is visited once. The others are cycled back
    /// through the ring so they stay queued in their original order.
    pub fn receive_matching(&mut self, filter: &MessageFilter) -> KernelResult<Option<Message>> {
        let pending = self.unread;
        let mut found = None;
        for _ in 0..pending {
            let Some(frame) = self.receive_frame()? else {
                return Err(KernelError::InvalidQueueState);
            };
            let message = decode_stored(&frame)?;
            if found.is_none() && filter.matches(&message) {
                found = Some(message);
            } else {
                // Room for the frame was freed just above
                self.push_frame(&frame)?;
            }
        }
        Ok(found)
    }

    fn push_frame(&mut self, frame: &[u8]) -> KernelResult<()> {
        if frame.len() > self.available() || frame.is_empty() {
            return Err(KernelError::MailboxFull);
        }
        let capacity = self.capacity();
        let space_until_end = capacity - self.write_offset;
        if frame.len() > space_until_end {
            let (tail, rest) = frame.split_at(space_until_end);
            self.buffer[self.write_offset..].copy_from_slice(tail);
            self.buffer[..rest.len()].copy_from_slice(rest);
        } else {
            self.buffer[self.write_offset..self.write_offset + frame.len()]
                .copy_from_slice(frame);
        }
        self.write_offset = (self.write_offset + frame.len()) % capacity;
        self.used += frame.len();
        self.unread += 1;
        Ok(())
    }

    fn copy_out(&self, offset: usize, destination: &mut [u8]) {
        let space_until_end = self.capacity() - offset;
        if destination.len() > space_until_end {
            let (tail, rest) = destination.split_at_mut(space_until_end);
            tail.copy_from_slice(&self.buffer[offset..]);
            let rest_len = rest.len();
            rest.copy_from_slice(&self.buffer[..rest_len]);
        } else {
            destination.copy_from_slice(&self.buffer[offset..offset + destination.len()]);
        }
    }
}

// Frames were validated on the way in; a bad one means the ring is corrupt
fn decode_stored(frame: &[u8]) -> KernelResult<Message> {
    Message::decode(frame).map_err(|_| KernelError::InvalidQueueState)
}
