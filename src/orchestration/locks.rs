//! Exclusive resource locks for concurrently running tasks.
//!
//! Acquisition is all-or-nothing: a task either receives every resource it
//! declared or none of them, so no task ever holds a partial set while it
//! waits. Conflicts are detected from declared resources only.

use crate::core::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A live exclusive claim on one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub resource: String,
    pub owner: TaskId,
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of [`ResourceLockTable::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// Every requested resource is now held by the task.
    Granted,
    /// `resource` is held by `holder`; nothing was acquired.
    Conflict { holder: TaskId, resource: String },
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, LockOutcome::Granted)
    }
}

/// Mapping from resource id to the task currently holding it.
#[derive(Debug, Default)]
pub struct ResourceLockTable {
    locks: HashMap<String, ResourceLock>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire every resource in `resources` for `task`, or none.
    ///
    /// Resources the task already holds do not conflict with themselves.
    pub fn acquire(&mut self, task: &TaskId, resources: &[String]) -> LockOutcome {
        for resource in resources {
            if let Some(lock) = self.locks.get(resource) {
                if &lock.owner != task {
                    return LockOutcome::Conflict {
                        holder: lock.owner.clone(),
                        resource: resource.clone(),
                    };
                }
            }
        }

        let now = Utc::now();
        for resource in resources {
            self.locks
                .entry(resource.clone())
                .or_insert_with(|| ResourceLock {
                    resource: resource.clone(),
                    owner: task.clone(),
                    acquired_at: now,
                });
        }
        LockOutcome::Granted
    }

    /// Release everything `task` holds; returns the freed resources, sorted.
    pub fn release(&mut self, task: &TaskId) -> Vec<String> {
        let mut freed: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, lock)| &lock.owner == task)
            .map(|(resource, _)| resource.clone())
            .collect();
        for resource in &freed {
            self.locks.remove(resource);
        }
        freed.sort();
        freed
    }

    pub fn holder(&self, resource: &str) -> Option<&TaskId> {
        self.locks.get(resource).map(|lock| &lock.owner)
    }

    pub fn get(&self, resource: &str) -> Option<&ResourceLock> {
        self.locks.get(resource)
    }

    pub fn held_by(&self, task: &TaskId) -> Vec<&str> {
        let mut held: Vec<&str> = self
            .locks
            .values()
            .filter(|lock| &lock.owner == task)
            .map(|lock| lock.resource.as_str())
            .collect();
        held.sort_unstable();
        held
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
