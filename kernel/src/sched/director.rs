//! Director: cluster-wide task bookkeeping
//!
//! Chooses the core a new task goes to, and owns the state every core
//! shares: the id allocator, the table of which core each task lives on,
//! the service registry, and tasks parked until a core is online.
//!
//! Placement score (lower wins):
//!
//! ```text
//! BASE_SCORE - (AFFINITY_BIAS if the task last ran there) + core's priority score
//! ```
//!
//! This is an affinity + load heuristic for small core counts, not a load
//! balancer; tasks never migrate once placed.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use super::id::IdAllocator;
use super::task::{Task, TaskId};
use crate::error::{KernelError, KernelResult};
use crate::ipc::{Recipient, ServiceRegistry};

pub const BASE_SCORE: u32 = 1000;

/// Bonus for the core a task last ran on; less than one Io-priority task
pub const AFFINITY_BIAS: u32 = 3;

pub struct Director {
    ids: IdAllocator,
    homes: BTreeMap<TaskId, usize>,
    registry: ServiceRegistry,
    parked: VecDeque<Box<Task>>,
}

impl Director {
    pub fn new(max_task_ids: usize) -> Self {
        Self {
            ids: IdAllocator::new(max_task_ids),
            homes: BTreeMap::new(),
            registry: ServiceRegistry::new(),
            parked: VecDeque::new(),
        }
    }

    pub fn generate_id(&mut self) -> KernelResult<TaskId> {
        self.ids.generate_id()
    }

    pub fn free_id(&mut self, id: TaskId) -> bool {
        self.ids.free_id(id)
    }

    pub fn live_ids(&self) -> usize {
        self.ids.allocated()
    }

    pub fn score(last_core: Option<usize>, core: usize, load: u32) -> u32 {
        let bias = if last_core == Some(core) {
            AFFINITY_BIAS
        } else {
            0
        };
        BASE_SCORE - bias + load
    }

    /// Lowest-scoring candidate `(core, priority score)`; ties go to the
    /// lower core ordinal
    pub fn choose_core(
        &self,
        task: &Task,
        candidates: impl IntoIterator<Item = (usize, u32)>,
    ) -> Option<usize> {
        candidates
            .into_iter()
            .min_by_key(|(core, load)| (Self::score(task.last_core, *core, *load), *core))
            .map(|(core, _)| core)
    }

    pub fn record_home(&mut self, id: TaskId, core: usize) {
        self.homes.insert(id, core);
    }

    pub fn home_of(&self, id: TaskId) -> Option<usize> {
        self.homes.get(&id).copied()
    }

    /// Concrete task and the core it lives on
    pub fn resolve(&self, recipient: &Recipient) -> KernelResult<(TaskId, usize)> {
        let id = self.registry.resolve(recipient)?;
        let home = self.home_of(id).ok_or(KernelError::RecipientNotFound)?;
        Ok((id, home))
    }

    /// Drop every trace of an exited task and recycle its id
    pub fn forget(&mut self, id: TaskId) {
        self.homes.remove(&id);
        self.registry.remove_task(id);
        if !self.ids.free_id(id) {
            crate::sched_warn!("task {} exited with an id that was not allocated", id);
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ServiceRegistry {
        &mut self.registry
    }

    /// Hold a task until some core comes online
    pub fn park(&mut self, task: Box<Task>) {
        self.parked.push_back(task);
    }

    pub fn parked_count(&self) -> usize {
        self.parked.len()
    }

    pub fn take_parked(&mut self) -> Vec<Box<Task>> {
        self.parked.drain(..).collect()
    }
}
