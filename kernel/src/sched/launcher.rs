//! Task Launcher
//!
//! Builds kernel and user tasks ready for their first context switch. A
//! task is only returned once every resource it needs exists; on any
//! failure the pieces acquired so far are dropped, which gives them back.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem::size_of;

use x86_64::VirtAddr;

use super::task::{Mapping, Priority, Task, TaskId, TaskStateRecord, UserImage};
use crate::config::{KernelConfig, PAGE_SIZE, USER_ARGS_BASE, USER_STACK_BASE, USER_TSS_BASE};
use crate::error::{KernelError, KernelResult, Resource};
use crate::ipc::Mailbox;
use crate::sched::task::KernelStack;
use crate::traits::{AddressSpace, PageFlags, Platform};

#[derive(Debug, Clone, Copy)]
pub struct TaskLauncher {
    kernel_stack_size: usize,
    user_stack_pages: usize,
    mailbox_size: usize,
}

impl TaskLauncher {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            kernel_stack_size: config.kernel_stack_size,
            user_stack_pages: config.user_stack_pages,
            mailbox_size: config.mailbox_size,
        }
    }

    /// Kernel task that starts at `entry` in the kernel's address space
    pub fn create_kernel_task<P: Platform>(
        &self,
        platform: &P,
        id: TaskId,
        name: &'static str,
        entry: u64,
        priority: Priority,
    ) -> KernelResult<Box<Task>> {
        self.build(platform, id, name, entry, priority, &[])
            .map(Box::new)
    }

    /// User task that enters ring 3 at `entry`
    ///
    /// The task starts as a kernel task in the user-launch trampoline, which
    /// pops the address-space root, user stack pointer, user entry and path
    /// pointer from its stack.
    pub fn create_user_task<P: Platform>(
        &self,
        platform: &P,
        id: TaskId,
        name: &'static str,
        entry: u64,
        path: Option<&str>,
        priority: Priority,
    ) -> KernelResult<Box<Task>> {
        let space = platform
            .kernel_address_space()
            .clone_for_usermode()
            .ok_or(KernelError::AllocationFailed(Resource::AddressSpace))?;
        let mut image = UserImage::new(space.clone());

        let tss_pages = size_of::<TaskStateRecord>().div_ceil(PAGE_SIZE);
        let tss_base = space
            .allocate_pages(
                tss_pages,
                PageFlags::KERNEL_DATA,
                Some(VirtAddr::new(USER_TSS_BASE)),
            )
            .ok_or(KernelError::AllocationFailed(Resource::TaskState))?;
        image.tss_mapping = Some(Mapping {
            base: tss_base,
            pages: tss_pages,
        });

        let stack_base = space
            .allocate_pages(
                self.user_stack_pages,
                PageFlags::USER_DATA,
                Some(VirtAddr::new(USER_STACK_BASE)),
            )
            .ok_or(KernelError::AllocationFailed(Resource::UserStack))?;
        image.stack = Some(Mapping {
            base: stack_base,
            pages: self.user_stack_pages,
        });
        let user_stack_top = stack_base.as_u64() + (self.user_stack_pages * PAGE_SIZE) as u64;

        let heap = space
            .create_heap()
            .ok_or(KernelError::AllocationFailed(Resource::Heap))?;

        let path_ptr = match path {
            Some(path) => {
                let mapping = Self::copy_path(space.as_ref(), path)?;
                image.args = Some(mapping);
                mapping.base.as_u64()
            }
            None => 0,
        };

        let extras = [space.root(), user_stack_top, entry, path_ptr];
        let mut task = self.build(
            platform,
            id,
            name,
            platform.entry_points().user_launch,
            priority,
            &extras,
        )?;

        let record = TaskStateRecord::new(task.kernel_stack_top());
        space
            .write_bytes(tss_base, record.as_bytes())
            .ok_or(KernelError::AllocationFailed(Resource::TaskState))?;
        image.tss = Some(record);

        task.address_space = space;
        task.heap = heap;
        task.user = Some(image);
        Ok(Box::new(task))
    }

    /// Map a user page at `USER_ARGS_BASE` holding `path` plus a NUL
    fn copy_path(space: &dyn AddressSpace, path: &str) -> KernelResult<Mapping> {
        let mut bytes = Vec::with_capacity(path.len() + 1);
        bytes.extend_from_slice(path.as_bytes());
        bytes.push(0);

        let pages = bytes.len().div_ceil(PAGE_SIZE);
        let base = space
            .allocate_pages(pages, PageFlags::USER_DATA, Some(VirtAddr::new(USER_ARGS_BASE)))
            .ok_or(KernelError::AllocationFailed(Resource::Arguments))?;
        let mapping = Mapping { base, pages };
        if space.write_bytes(base, &bytes).is_none() {
            space.free_pages(base, pages);
            return Err(KernelError::AllocationFailed(Resource::Arguments));
        }
        Ok(mapping)
    }

    fn build<P: Platform>(
        &self,
        platform: &P,
        id: TaskId,
        name: &'static str,
        entry: u64,
        priority: Priority,
        extras: &[u64],
    ) -> KernelResult<Task> {
        let heap = platform.kernel_heap();
        let mut stack = KernelStack::allocate(Arc::clone(&heap), self.kernel_stack_size)?;
        let rsp = stack.write_initial_frame(&platform.entry_points(), entry, extras)?;
        let mailbox = Mailbox::with_capacity(self.mailbox_size)?;
        Ok(Task::new(
            id,
            name,
            priority,
            stack,
            rsp,
            mailbox,
            platform.kernel_address_space(),
            heap,
        ))
    }
}
