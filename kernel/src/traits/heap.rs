//! Heap allocator contract

use core::alloc::Layout;
use core::ptr::NonNull;

/// Aligned allocator backing kernel stacks and task-owned memory
pub trait Heap: Send + Sync {
    /// Allocate `size` bytes aligned to `align`, or `None` when exhausted
    fn aligned_allocate(&self, align: usize, size: usize) -> Option<NonNull<u8>>;

    /// Return memory to the heap
    ///
    /// # Safety
    ///
    /// `ptr` must come from `aligned_allocate` on this heap with the same
    /// `align` and `size`, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>, align: usize, size: usize);
}

/// Forwards to the global allocator the kernel image registers
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalHeap;

impl Heap for GlobalHeap {
    fn aligned_allocate(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, align).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: the layout has a non-zero size.
        NonNull::new(unsafe { alloc::alloc::alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, align: usize, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, align) {
            alloc::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}
