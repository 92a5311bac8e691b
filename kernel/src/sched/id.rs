//! Task id allocator
//!
//! One bit per id in 32-bit blocks; a set bit means the id is free. Blocks
//! are appended on demand until `max_ids` is reached, after which
//! `generate_id` fails with `OutOfIds`. The allocator does no locking of its
//! own; the Director serializes access to it.

use alloc::vec::Vec;

use super::task::TaskId;
use crate::error::{KernelError, KernelResult};

const BITS_PER_BLOCK: usize = u32::BITS as usize;

#[derive(Debug)]
pub struct IdAllocator {
    blocks: Vec<u32>,
    max_ids: usize,
    allocated: usize,
}

impl IdAllocator {
    pub const fn new(max_ids: usize) -> Self {
        Self {
            blocks: Vec::new(),
            max_ids,
            allocated: 0,
        }
    }

    /// Lowest free id
    pub fn generate_id(&mut self) -> KernelResult<TaskId> {
        let index = match self.blocks.iter().position(|block| *block != 0) {
            Some(index) => index,
            None => self.grow()?,
        };
        let block = &mut self.blocks[index];
        let bit = block.trailing_zeros() as usize;
        *block &= !(1 << bit);
        self.allocated += 1;
        Ok(index * BITS_PER_BLOCK + bit)
    }

    /// Return `id` to the pool. Returns false for ids that were not allocated.
    pub fn free_id(&mut self, id: TaskId) -> bool {
        if !self.is_allocated(id) {
            return false;
        }
        self.blocks[id / BITS_PER_BLOCK] |= 1 << (id % BITS_PER_BLOCK);
        self.allocated -= 1;
        true
    }

    pub fn is_allocated(&self, id: TaskId) -> bool {
        id < self.max_ids
            && self
                .blocks
                .get(id / BITS_PER_BLOCK)
                .is_some_and(|block| block & (1 << (id % BITS_PER_BLOCK)) == 0)
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    fn grow(&mut self) -> KernelResult<usize> {
        let base = self.blocks.len() * BITS_PER_BLOCK;
        if base >= self.max_ids {
            return Err(KernelError::OutOfIds);
        }
        // Ids at or beyond the limit are never marked free
        let valid = core::cmp::min(BITS_PER_BLOCK, self.max_ids - base);
        let block = if valid == BITS_PER_BLOCK {
            u32::MAX
        } else {
            (1u32 << valid) - 1
        };
        self.blocks.push(block);
        Ok(self.blocks.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;

    #[test]
    fn test_ids_are_unique_while_live() {
        let mut ids = IdAllocator::new(256);
        let mut seen = BTreeSet::new();
        for _ in 0..100 {
            assert!(seen.insert(ids.generate_id().unwrap()));
        }
        assert_eq!(ids.allocated(), 100);
    }

    #[test]
    fn test_lowest_free_id_is_reused() {
        let mut ids = IdAllocator::new(64);
        for expected in 0..40 {
            assert_eq!(ids.generate_id().unwrap(), expected);
        }
        assert!(ids.free_id(33));
        assert!(ids.free_id(5));
        assert_eq!(ids.generate_id().unwrap(), 5);
        assert_eq!(ids.generate_id().unwrap(), 33);
        assert_eq!(ids.generate_id().unwrap(), 40);
    }

    #[test]
    fn test_free_rejects_unknown_ids() {
        let mut ids = IdAllocator::new(64);
        assert!(!ids.free_id(0));
        let id = ids.generate_id().unwrap();
        assert!(ids.free_id(id));
        assert!(!ids.free_id(id));
        assert!(!ids.free_id(1000));
    }

    #[test]
    fn test_bounded_allocator_reports_exhaustion() {
        let mut ids = IdAllocator::new(40);
        for _ in 0..40 {
            ids.generate_id().unwrap();
        }
        assert_eq!(ids.generate_id(), Err(KernelError::OutOfIds));
        ids.free_id(17);
        assert_eq!(ids.generate_id(), Ok(17));
    }
}
