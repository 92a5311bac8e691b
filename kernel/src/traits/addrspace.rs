//! Address-space manager contract

use alloc::sync::Arc;
use bitflags::bitflags;
use x86_64::VirtAddr;

use super::heap::Heap;

bitflags! {
    /// Mapping attributes requested from the address-space manager
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const NO_EXECUTE = 1 << 63;
    }
}

impl PageFlags {
    /// Data pages reachable from ring 3
    pub const USER_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::NO_EXECUTE);

    /// Data pages only the kernel may touch
    pub const KERNEL_DATA: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::NO_EXECUTE);
}

/// One set of page tables plus the allocator that manages its lower half
///
/// Implementations use interior mutability: a space is shared through an
/// `Arc` by every task that runs in it. Failures are reported as `None`;
/// the launcher maps them onto `KernelError::AllocationFailed`.
pub trait AddressSpace: Send + Sync {
    /// Physical address of the top-level page table (the CR3 value)
    fn root(&self) -> u64;

    /// Copy the kernel half into a fresh set of page tables for a user task
    fn clone_for_usermode(&self) -> Option<Arc<dyn AddressSpace>>;

    /// Load this space on the calling core
    fn activate(&self);

    /// Map `count` zeroed pages. With `placement` the pages must start there.
    fn allocate_pages(
        &self,
        count: usize,
        flags: PageFlags,
        placement: Option<VirtAddr>,
    ) -> Option<VirtAddr>;

    /// Unmap pages previously returned by `allocate_pages`
    fn free_pages(&self, base: VirtAddr, count: usize);

    /// Copy bytes into memory mapped in this space
    fn write_bytes(&self, destination: VirtAddr, bytes: &[u8]) -> Option<()>;

    /// Heap allocator scoped to this space
    fn create_heap(&self) -> Option<Arc<dyn Heap>>;
}
