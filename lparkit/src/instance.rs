//! Compute-instance view consumed by the driver.
//!
//! The orchestrator owns instances; tasks only hold a shared reference and
//! read `task_state` to decide how to revert.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Orchestrator task state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduling,
    Spawning,
    Rebuilding,
    RebuildBlockDeviceMapping,
    /// Spawning the replacement VM during a rebuild.
    RebuildSpawning,
    ResizePrep,
    ResizeMigrating,
    ResizeFinish,
    PoweringOn,
    PoweringOff,
    Deleting,
}

/// Compute flavor (shape) of an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl Flavor {
    pub fn new(name: impl Into<String>, vcpus: u32, memory_mb: u64) -> Self {
        Self {
            name: name.into(),
            vcpus,
            memory_mb,
            extra_specs: BTreeMap::new(),
        }
    }

    /// Add an extra spec (e.g. `powervm:proc_units`).
    pub fn with_extra_spec(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_specs.insert(key.into(), value.into());
        self
    }
}

/// Guest instance as seen by the driver.
#[derive(Debug)]
pub struct Instance {
    pub uuid: Uuid,
    pub name: String,
    /// Guest OS distribution reported by the image (`ibmi`, `rhel`, ...).
    pub os_distro: Option<String>,
    task_state: RwLock<Option<TaskState>>,
}

/// Shared, borrowed instance reference held by tasks.
pub type SharedInstance = Arc<Instance>;

impl Instance {
    pub fn new(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            os_distro: None,
            task_state: RwLock::new(None),
        }
    }

    pub fn with_os_distro(mut self, distro: impl Into<String>) -> Self {
        self.os_distro = Some(distro.into());
        self
    }

    pub fn task_state(&self) -> Option<TaskState> {
        *self.task_state.read()
    }

    /// Updated by the orchestrator; the driver never calls this itself.
    pub fn set_task_state(&self, state: Option<TaskState>) {
        *self.task_state.write() = state;
    }

    pub fn is_ibmi(&self) -> bool {
        self.os_distro
            .as_deref()
            .is_some_and(|distro| distro.eq_ignore_ascii_case("ibmi"))
    }

    pub fn into_shared(self) -> SharedInstance {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_roundtrip() {
        let instance = Instance::new(Uuid::new_v4(), "vm1");
        assert_eq!(instance.task_state(), None);

        instance.set_task_state(Some(TaskState::RebuildSpawning));
        assert_eq!(instance.task_state(), Some(TaskState::RebuildSpawning));
    }

    #[test]
    fn test_is_ibmi() {
        let instance = Instance::new(Uuid::new_v4(), "vm1").with_os_distro("IBMi");
        assert!(instance.is_ibmi());
        assert!(!Instance::new(Uuid::new_v4(), "vm2").is_ibmi());
    }

    #[test]
    fn test_task_state_serde_names() {
        let json = serde_json::to_string(&TaskState::RebuildSpawning).unwrap();
        assert_eq!(json, "\"rebuild_spawning\"");
    }
}
