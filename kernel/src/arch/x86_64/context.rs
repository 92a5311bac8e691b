//! CPU Context and Context Switching
//!
//! A task's callee-saved registers live on its own kernel stack; the
//! context only records where that stack was left. The assembly entry
//! points below exist only when building for the bare-metal target.

/// Saved execution state of a suspended task
///
/// The layout is read by `context_switch`; `rsp` must stay at offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuContext {
    /// Stack pointer at the moment the task was switched out
    pub rsp: u64,
}

impl CpuContext {
    pub const fn new() -> Self {
        Self { rsp: 0 }
    }

    pub const fn with_stack(rsp: u64) -> Self {
        Self { rsp }
    }
}

/// Registers pushed by `context_switch` before it saves `rsp`
pub const CALLEE_SAVED_REGISTERS: usize = 6;

/// Ring 3 code selector (GDT index 7, RPL 3)
pub const USER_CODE_SELECTOR: u16 = 0x3B;

/// Ring 3 data selector (GDT index 8, RPL 3)
pub const USER_DATA_SELECTOR: u16 = 0x43;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::bare::*;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod bare {
    use super::{CpuContext, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
    use crate::traits::EntryPoints;
    use spin::Once;

    static EXIT_HOOK: Once<fn() -> !> = Once::new();

    /// Register the function `task_finished` lands in
    ///
    /// The boot code passes a function that calls
    /// `Kernel::exit_current_task` on its static kernel context.
    pub fn set_exit_hook(hook: fn() -> !) {
        EXIT_HOOK.call_once(|| hook);
    }

    /// Entry addresses for `Platform::entry_points`
    pub fn entry_points(idle_loop: u64, cleanup_loop: u64) -> EntryPoints {
        EntryPoints {
            task_start: task_start as usize as u64,
            task_finished: task_finished as usize as u64,
            user_launch: user_launch as usize as u64,
            idle_loop,
            cleanup_loop,
        }
    }

    /// Save the callee-saved registers on the current stack, store `rsp`
    /// into `current`, load `next` and pop its registers
    ///
    /// # Safety
    ///
    /// Both contexts must be valid; `next.rsp` must point at a frame laid
    /// out by the launcher or by an earlier call of this function.
    #[unsafe(naked)]
    pub unsafe extern "C" fn context_switch(current: *mut CpuContext, next: *const CpuContext) {
        core::arch::naked_asm!(
            "push rbx",
            "push rbp",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [rdi], rsp",
            "mov rsp, [rsi]",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbp",
            "pop rbx",
            // New tasks return into task_start
            "ret",
        )
    }

    /// First code a new task runs: the entry address sits on top of the stack
    #[unsafe(naked)]
    unsafe extern "C" fn task_start() -> ! {
        core::arch::naked_asm!(
            "pop rax",
            // The switch happened with interrupts masked
            "sti",
            // rsp now points at the task_finished slot, so a returning entry
            // function lands there
            "jmp rax",
        )
    }

    /// Landing pad for entry functions that return
    #[unsafe(naked)]
    unsafe extern "C" fn task_finished() -> ! {
        core::arch::naked_asm!(
            "and rsp, -16",
            "call {hook}",
            "2:",
            "hlt",
            "jmp 2b",
            hook = sym run_exit_hook,
        )
    }

    extern "C" fn run_exit_hook() -> ! {
        match EXIT_HOOK.get() {
            Some(hook) => hook(),
            None => loop {
                x86_64::instructions::interrupts::disable();
                x86_64::instructions::hlt();
            },
        }
    }

    /// Drop to ring 3
    ///
    /// Stack on entry (lowest address first): address-space root, user
    /// stack pointer, user entry, path pointer (0 when absent).
    #[unsafe(naked)]
    unsafe extern "C" fn user_launch() -> ! {
        core::arch::naked_asm!(
            "cli",
            "pop rax",
            "mov cr3, rax",
            "pop rcx",
            "pop rdx",
            // Path pointer becomes the user entry's first argument
            "pop rdi",
            "mov ax, {data}",
            "mov ds, ax",
            "mov es, ax",
            "push {data}",
            "push rcx",
            "push 0x202",
            "push {code}",
            "push rdx",
            "iretq",
            data = const USER_DATA_SELECTOR,
            code = const USER_CODE_SELECTOR,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_layout() {
        use core::mem::{align_of, offset_of, size_of};

        assert_eq!(size_of::<CpuContext>(), 8);
        assert_eq!(align_of::<CpuContext>(), 8);
        assert_eq!(offset_of!(CpuContext, rsp), 0);
    }

    #[test]
    fn test_user_selectors_request_ring_3() {
        assert_eq!(USER_CODE_SELECTOR & 3, 3);
        assert_eq!(USER_DATA_SELECTOR & 3, 3);
    }
}
