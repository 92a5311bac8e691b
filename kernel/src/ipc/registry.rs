//! Service registry: maps service types to the task that provides them

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::message::{Recipient, ServiceType};
use crate::error::{KernelError, KernelResult};
use crate::sched::task::TaskId;

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    providers: BTreeMap<ServiceType, TaskId>,
    /// Task that handles `Recipient::Registry` traffic, if one registered
    registry_task: Option<TaskId>,
}

impl ServiceRegistry {
    pub const fn new() -> Self {
        Self {
            providers: BTreeMap::new(),
            registry_task: None,
        }
    }

    /// Make `task` the provider of `service`, returning the previous provider
    pub fn register(&mut self, service: ServiceType, task: TaskId) -> Option<TaskId> {
        self.providers.insert(service, task)
    }

    /// Drop the registration if `task` still owns it
    pub fn unregister(&mut self, service: ServiceType, task: TaskId) -> bool {
        if self.providers.get(&service) == Some(&task) {
            self.providers.remove(&service);
            return true;
        }
        false
    }

    pub fn provider(&self, service: ServiceType) -> Option<TaskId> {
        self.providers.get(&service).copied()
    }

    pub fn set_registry_task(&mut self, task: Option<TaskId>) {
        self.registry_task = task;
    }

    pub fn registry_task(&self) -> Option<TaskId> {
        self.registry_task
    }

    /// Concrete task for a logical recipient
    pub fn resolve(&self, recipient: &Recipient) -> KernelResult<TaskId> {
        match *recipient {
            Recipient::Task(id) => Ok(id),
            Recipient::Service(service) => {
                self.provider(service).ok_or(KernelError::RecipientNotFound)
            }
            Recipient::Registry => self.registry_task.ok_or(KernelError::RecipientNotFound),
        }
    }

    /// Forget everything `task` provided. Returns the services it held.
    pub fn remove_task(&mut self, task: TaskId) -> Vec<ServiceType> {
        let services: Vec<ServiceType> = self
            .providers
            .iter()
            .filter(|(_, provider)| **provider == task)
            .map(|(service, _)| *service)
            .collect();
        for service in &services {
            self.providers.remove(service);
        }
        if self.registry_task == Some(task) {
            self.registry_task = None;
        }
        services
    }
}
