//! The process registry: the one shared piece of mutable state in the Core.
//!
//! Every instance is in exactly one of `Starting`, `Running`, `Exiting`, or
//! `Terminated`, and all transitions go through this module. The dispatcher
//! reserves a transition here, releases the lock, calls the process-manager
//! collaborator, and then commits or rolls back; the lock is only ever held
//! for the duration of a single map operation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("an instance with identifier '{0}' already exists")]
    DuplicateIdentifier(String),
    #[error("no instance with identifier '{0}'")]
    UnknownIdentifier(String),
    /// A second lifecycle mutation arrived while one was already reserved.
    #[error("instance '{identifier}' is already {state}")]
    InvalidTransition {
        identifier: String,
        state: InstanceState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    Exiting,
    Terminated,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceState::Starting => "Starting",
            InstanceState::Running => "Running",
            InstanceState::Exiting => "Exiting",
            InstanceState::Terminated => "Terminated",
        })
    }
}

/// One managed application instance.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub identifier: String,
    pub executable: String,
    pub working_directory: String,
    pub arguments: String,
    /// Set for GUI-launched instances, `None` for plain Tray starts.
    pub cluster: Option<String>,
    pub state: InstanceState,
}

#[derive(Default)]
pub struct ProcessRegistry {
    instances: Mutex<HashMap<String, InstanceRecord>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, InstanceRecord>> {
        self.instances.lock().expect("registry mutex poisoned")
    }

    /// Reserves a slot for a new instance in `Starting` state. Fails without
    /// touching the map if the identifier already names a live instance.
    pub fn reserve(&self, mut record: InstanceRecord) -> Result<(), RegistryError> {
        record.state = InstanceState::Starting;
        let mut instances = self.lock();
        if instances.contains_key(&record.identifier) {
            return Err(RegistryError::DuplicateIdentifier(record.identifier));
        }
        instances.insert(record.identifier.clone(), record);
        Ok(())
    }

    /// `Starting -> Running`, once the collaborator has confirmed the launch.
    pub fn commit_running(&self, identifier: &str) -> Result<(), RegistryError> {
        let mut instances = self.lock();
        let record = instances
            .get_mut(identifier)
            .ok_or_else(|| RegistryError::UnknownIdentifier(identifier.to_string()))?;
        match record.state {
            InstanceState::Starting => {
                record.state = InstanceState::Running;
                Ok(())
            }
            state => Err(RegistryError::InvalidTransition {
                identifier: identifier.to_string(),
                state,
            }),
        }
    }

    /// Reserves the graceful-shutdown path: `Starting|Running -> Exiting`.
    /// Returns the prior state so a collaborator failure can roll it back.
    pub fn begin_exit(&self, identifier: &str) -> Result<InstanceState, RegistryError> {
        let mut instances = self.lock();
        let record = instances
            .get_mut(identifier)
            .ok_or_else(|| RegistryError::UnknownIdentifier(identifier.to_string()))?;
        match record.state {
            InstanceState::Starting | InstanceState::Running => {
                let prior = record.state;
                record.state = InstanceState::Exiting;
                Ok(prior)
            }
            state => Err(RegistryError::InvalidTransition {
                identifier: identifier.to_string(),
                state,
            }),
        }
    }

    /// Restores the state saved by [`begin_exit`](Self::begin_exit) after a
    /// collaborator failure.
    pub fn restore_state(&self, identifier: &str, state: InstanceState) {
        if let Some(record) = self.lock().get_mut(identifier) {
            record.state = state;
        }
    }

    /// Drops the record. Used for confirmed terminations and for rolling
    /// back a reservation whose launch failed.
    pub fn remove(&self, identifier: &str) -> Result<InstanceRecord, RegistryError> {
        self.lock()
            .remove(identifier)
            .ok_or_else(|| RegistryError::UnknownIdentifier(identifier.to_string()))
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.lock().contains_key(identifier)
    }

    pub fn state_of(&self, identifier: &str) -> Option<InstanceState> {
        self.lock().get(identifier).map(|record| record.state)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        records
    }
}
