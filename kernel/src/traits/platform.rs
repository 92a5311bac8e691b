//! Hardware platform contract: interrupts, timers, IPIs and context switches

use alloc::sync::Arc;

use super::{AddressSpace, Heap};
use crate::arch::x86_64::context::CpuContext;
use crate::cpu::ipi::IpiKind;

/// Local timer programming mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Periodic,
    OneShot,
}

/// Code addresses the launcher writes into new task stacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoints {
    /// First `ret` target of a new task: pops the entry and jumps to it
    pub task_start: u64,
    /// Return address under every entry function; leads to the exit path
    pub task_finished: u64,
    /// Drops to ring 3 using the extras pushed by `create_user_task`
    pub user_launch: u64,
    /// Body of each core's idle task
    pub idle_loop: u64,
    /// Body of each core's cleanup task
    pub cleanup_loop: u64,
}

/// Everything the platform needs to resume another task
#[derive(Debug, Clone, Copy)]
pub struct SwitchFrame {
    /// Where the outgoing stack pointer is stored
    pub from: *mut CpuContext,
    /// Where the incoming stack pointer is loaded from
    pub to: *const CpuContext,
    /// Kernel stack top for the incoming task (TSS.rsp0)
    pub kernel_stack_top: u64,
}

pub trait Platform: Send + Sync {
    /// Ordinal of the calling core
    fn current_core(&self) -> usize;

    fn send_ipi(&self, apic_id: u8, kind: IpiKind);

    /// Program the calling core's local timer
    fn set_timer(&self, mode: TimerMode, milliseconds: u64);

    /// Mask interrupts on the calling core, returning whether they were enabled
    fn disable_interrupts(&self) -> bool;

    /// Undo `disable_interrupts`
    fn restore_interrupts(&self, were_enabled: bool);

    /// Save the current stack into `frame.from` and resume `frame.to`
    ///
    /// # Safety
    ///
    /// Both pointers must reference live contexts. The incoming context must
    /// hold a stack written by the launcher or saved by a previous switch.
    unsafe fn switch_context(&self, frame: SwitchFrame);

    /// Flush the calling core's TLB
    fn flush_tlb(&self);

    /// Stop the calling core for good
    fn halt_core(&self) -> !;

    /// Space every kernel task shares
    fn kernel_address_space(&self) -> Arc<dyn AddressSpace>;

    /// Heap every kernel task shares; kernel stacks come from here
    fn kernel_heap(&self) -> Arc<dyn Heap>;

    fn entry_points(&self) -> EntryPoints;

    /// Run `f` with interrupts masked on the calling core
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R
    where
        Self: Sized,
    {
        let _guard = InterruptGuard::new(self);
        f()
    }
}

/// Keeps interrupts masked on the calling core until dropped
pub struct InterruptGuard<'a, P: Platform + ?Sized> {
    platform: &'a P,
    were_enabled: bool,
}

impl<'a, P: Platform + ?Sized> InterruptGuard<'a, P> {
    pub fn new(platform: &'a P) -> Self {
        let were_enabled = platform.disable_interrupts();
        Self {
            platform,
            were_enabled,
        }
    }
}

impl<P: Platform + ?Sized> Drop for InterruptGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.were_enabled);
    }
}
