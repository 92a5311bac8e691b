//! Hosted platform simulation
//!
//! Stands in for the interrupt controller, timers, paging and heaps so the
//! scheduler core can be driven on the host. Context switches are recorded
//! rather than performed: after a switch the caller simply keeps running,
//! and tests observe the scheduler's decision instead.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;
use x86_64::VirtAddr;

use crate::config::PAGE_SIZE;
use crate::cpu::ipi::IpiKind;
use crate::traits::{
    AddressSpace, EntryPoints, GlobalHeap, Heap, PageFlags, Platform, SwitchFrame, TimerMode,
};

const KERNEL_ROOT: u64 = 0x1000;

/// Where `allocate_pages` without a placement starts handing out addresses
const DYNAMIC_BASE: u64 = 0x0000_1000_0000_0000;

const ENTRY_POINTS: EntryPoints = EntryPoints {
    task_start: 0xFFFF_FFFF_8000_1000,
    task_finished: 0xFFFF_FFFF_8000_2000,
    user_launch: 0xFFFF_FFFF_8000_3000,
    idle_loop: 0xFFFF_FFFF_8000_4000,
    cleanup_loop: 0xFFFF_FFFF_8000_5000,
};

/// Switches that make the simulated collaborators fail
#[derive(Debug, Default)]
pub struct SimFaults {
    clone: AtomicBool,
    user_pages: AtomicBool,
    heap_creation: AtomicBool,
    kernel_heap: AtomicBool,
    write_bytes: AtomicBool,
}

impl SimFaults {
    pub fn fail_clone(&self, fail: bool) {
        self.clone.store(fail, Ordering::SeqCst);
    }

    pub fn fail_user_pages(&self, fail: bool) {
        self.user_pages.store(fail, Ordering::SeqCst);
    }

    pub fn fail_heap_creation(&self, fail: bool) {
        self.heap_creation.store(fail, Ordering::SeqCst);
    }

    pub fn fail_kernel_heap(&self, fail: bool) {
        self.kernel_heap.store(fail, Ordering::SeqCst);
    }

    pub fn fail_write_bytes(&self, fail: bool) {
        self.write_bytes.store(fail, Ordering::SeqCst);
    }
}

/// Live resource counts, used to check that exits give everything back
#[derive(Debug, Default)]
pub struct SimStats {
    user_spaces_live: AtomicUsize,
    user_pages_mapped: AtomicUsize,
    kernel_heap_live: AtomicUsize,
    activations: AtomicUsize,
    active_root: AtomicU64,
}

impl SimStats {
    pub fn user_spaces_live(&self) -> usize {
        self.user_spaces_live.load(Ordering::SeqCst)
    }

    pub fn user_pages_mapped(&self) -> usize {
        self.user_pages_mapped.load(Ordering::SeqCst)
    }

    /// Outstanding allocations on the kernel heap (kernel stacks)
    pub fn kernel_heap_live(&self) -> usize {
        self.kernel_heap_live.load(Ordering::SeqCst)
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn active_root(&self) -> u64 {
        self.active_root.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct SimShared {
    faults: SimFaults,
    stats: SimStats,
    next_root: AtomicU64,
    writes: Mutex<BTreeMap<(u64, u64), Vec<u8>>>,
}

pub struct SimAddressSpace {
    root: u64,
    user: bool,
    shared: Arc<SimShared>,
    mapped: Mutex<BTreeMap<u64, usize>>,
    next_free: AtomicU64,
}

impl SimAddressSpace {
    fn new(root: u64, user: bool, shared: Arc<SimShared>) -> Self {
        if user {
            shared.stats.user_spaces_live.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            root,
            user,
            shared,
            mapped: Mutex::new(BTreeMap::new()),
            next_free: AtomicU64::new(DYNAMIC_BASE),
        }
    }

    /// Pages currently mapped in this space
    pub fn mapped_pages(&self) -> usize {
        self.mapped.lock().values().sum()
    }
}

impl AddressSpace for SimAddressSpace {
    fn root(&self) -> u64 {
        self.root
    }

    fn clone_for_usermode(&self) -> Option<Arc<dyn AddressSpace>> {
        if self.shared.faults.clone.load(Ordering::SeqCst) {
            return None;
        }
        let root = self.shared.next_root.fetch_add(PAGE_SIZE as u64, Ordering::SeqCst);
        Some(Arc::new(SimAddressSpace::new(
            root,
            true,
            Arc::clone(&self.shared),
        )))
    }

    fn activate(&self) {
        self.shared.stats.activations.fetch_add(1, Ordering::SeqCst);
        self.shared.stats.active_root.store(self.root, Ordering::SeqCst);
    }

    fn allocate_pages(
        &self,
        count: usize,
        _flags: PageFlags,
        placement: Option<VirtAddr>,
    ) -> Option<VirtAddr> {
        if count == 0 || self.shared.faults.user_pages.load(Ordering::SeqCst) {
            return None;
        }
        let bytes = (count * PAGE_SIZE) as u64;
        let base = match placement {
            Some(base) => base.as_u64(),
            None => self.next_free.fetch_add(bytes, Ordering::SeqCst),
        };
        let mut mapped = self.mapped.lock();
        if mapped.contains_key(&base) {
            return None;
        }
        mapped.insert(base, count);
        if self.user {
            self.shared
                .stats
                .user_pages_mapped
                .fetch_add(count, Ordering::SeqCst);
        }
        Some(VirtAddr::new_truncate(base))
    }

    fn free_pages(&self, base: VirtAddr, count: usize) {
        let removed = self.mapped.lock().remove(&base.as_u64());
        if removed == Some(count) && self.user {
            self.shared
                .stats
                .user_pages_mapped
                .fetch_sub(count, Ordering::SeqCst);
        }
        self.shared.writes.lock().remove(&(self.root, base.as_u64()));
    }

    fn write_bytes(&self, destination: VirtAddr, bytes: &[u8]) -> Option<()> {
        if self.shared.faults.write_bytes.load(Ordering::SeqCst) {
            return None;
        }
        let pages = *self.mapped.lock().get(&destination.as_u64())?;
        if bytes.len() > pages * PAGE_SIZE {
            return None;
        }
        self.shared
            .writes
            .lock()
            .insert((self.root, destination.as_u64()), bytes.to_vec());
        Some(())
    }

    fn create_heap(&self) -> Option<Arc<dyn Heap>> {
        if self.shared.faults.heap_creation.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(SimHeap {
            shared: Arc::clone(&self.shared),
            kernel: false,
        }))
    }
}

impl Drop for SimAddressSpace {
    fn drop(&mut self) {
        if self.user {
            self.shared
                .stats
                .user_spaces_live
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct SimHeap {
    shared: Arc<SimShared>,
    kernel: bool,
}

impl Heap for SimHeap {
    fn aligned_allocate(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        if self.kernel {
            if self.shared.faults.kernel_heap.load(Ordering::SeqCst) {
                return None;
            }
            let ptr = GlobalHeap.aligned_allocate(align, size)?;
            self.shared
                .stats
                .kernel_heap_live
                .fetch_add(1, Ordering::SeqCst);
            return Some(ptr);
        }
        GlobalHeap.aligned_allocate(align, size)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, align: usize, size: usize) {
        GlobalHeap.free(ptr, align, size);
        if self.kernel {
            self.shared
                .stats
                .kernel_heap_live
                .fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A recorded inter-processor interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentIpi {
    pub from_core: usize,
    pub apic_id: u8,
    pub kind: IpiKind,
}

/// A recorded timer programming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub core: usize,
    pub mode: TimerMode,
    pub milliseconds: u64,
}

pub struct SimPlatform {
    core_count: usize,
    current_core: AtomicUsize,
    interrupts_enabled: AtomicBool,
    shared: Arc<SimShared>,
    kernel_space: Arc<SimAddressSpace>,
    kernel_heap: Arc<SimHeap>,
    ipis: Mutex<Vec<SentIpi>>,
    timers: Mutex<Vec<ArmedTimer>>,
    switches: Mutex<Vec<u64>>,
    tlb_flushes: AtomicUsize,
}

impl SimPlatform {
    pub fn new(core_count: usize) -> Self {
        let shared = Arc::new(SimShared::default());
        shared
            .next_root
            .store(KERNEL_ROOT + PAGE_SIZE as u64, Ordering::SeqCst);
        Self {
            core_count,
            current_core: AtomicUsize::new(0),
            interrupts_enabled: AtomicBool::new(true),
            kernel_space: Arc::new(SimAddressSpace::new(
                KERNEL_ROOT,
                false,
                Arc::clone(&shared),
            )),
            kernel_heap: Arc::new(SimHeap {
                shared: Arc::clone(&shared),
                kernel: true,
            }),
            shared,
            ipis: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            switches: Mutex::new(Vec::new()),
            tlb_flushes: AtomicUsize::new(0),
        }
    }

    pub fn core_count(&self) -> usize {
        self.core_count
    }

    /// Pretend the following calls run on `core`
    pub fn set_current_core(&self, core: usize) {
        self.current_core.store(core, Ordering::SeqCst);
    }

    pub fn faults(&self) -> &SimFaults {
        &self.shared.faults
    }

    pub fn stats(&self) -> &SimStats {
        &self.shared.stats
    }

    pub fn kernel_root(&self) -> u64 {
        KERNEL_ROOT
    }

    /// Bytes written with `write_bytes` at `base` in the space with `root`
    pub fn space_bytes(&self, root: u64, base: VirtAddr) -> Option<Vec<u8>> {
        self.shared.writes.lock().get(&(root, base.as_u64())).cloned()
    }

    pub fn sent_ipis(&self) -> Vec<SentIpi> {
        self.ipis.lock().clone()
    }

    pub fn take_ipis(&self) -> Vec<SentIpi> {
        core::mem::take(&mut *self.ipis.lock())
    }

    pub fn armed_timers(&self) -> Vec<ArmedTimer> {
        self.timers.lock().clone()
    }

    /// Stack pointers of every context switched to, in order
    pub fn switches(&self) -> Vec<u64> {
        self.switches.lock().clone()
    }

    pub fn tlb_flushes(&self) -> usize {
        self.tlb_flushes.load(Ordering::SeqCst)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }
}

impl Platform for SimPlatform {
    fn current_core(&self) -> usize {
        self.current_core.load(Ordering::SeqCst)
    }

    fn send_ipi(&self, apic_id: u8, kind: IpiKind) {
        self.ipis.lock().push(SentIpi {
            from_core: self.current_core(),
            apic_id,
            kind,
        });
    }

    fn set_timer(&self, mode: TimerMode, milliseconds: u64) {
        self.timers.lock().push(ArmedTimer {
            core: self.current_core(),
            mode,
            milliseconds,
        });
    }

    fn disable_interrupts(&self) -> bool {
        self.interrupts_enabled.swap(false, Ordering::SeqCst)
    }

    fn restore_interrupts(&self, were_enabled: bool) {
        self.interrupts_enabled.store(were_enabled, Ordering::SeqCst);
    }

    unsafe fn switch_context(&self, frame: SwitchFrame) {
        // SAFETY: the caller guarantees `to` points at a live context.
        let rsp = unsafe { (*frame.to).rsp };
        self.switches.lock().push(rsp);
    }

    fn flush_tlb(&self) {
        self.tlb_flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn halt_core(&self) -> ! {
        panic!("core {} halted", self.current_core());
    }

    fn kernel_address_space(&self) -> Arc<dyn AddressSpace> {
        self.kernel_space.clone()
    }

    fn kernel_heap(&self) -> Arc<dyn Heap> {
        self.kernel_heap.clone()
    }

    fn entry_points(&self) -> EntryPoints {
        ENTRY_POINTS
    }
}
