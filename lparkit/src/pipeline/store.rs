//! Values published by tasks for later tasks in the same flow.

use super::task::TaskOutput;
use crate::api::LparWrapper;
use lparkit_shared::errors::{LparkitError, LparkitResult};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Store key for the partition wrapper produced by get/create/resize/rename.
pub const LPAR_WRAP: &str = "lpar_wrap";

/// Per-run output store. Parallel branches may publish concurrently.
#[derive(Debug, Default)]
pub struct FlowStore {
    values: RwLock<HashMap<String, TaskOutput>>,
}

impl FlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: TaskOutput) {
        self.values.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<TaskOutput> {
        self.values.read().get(key).cloned()
    }

    /// Partition wrapper published under `key`.
    ///
    /// # Errors
    ///
    /// `Internal` when no earlier task provided it.
    pub fn lpar(&self, key: &str) -> LparkitResult<LparWrapper> {
        match self.get(key) {
            Some(TaskOutput::Lpar(wrapper)) => Ok(wrapper),
            _ => Err(LparkitError::Internal(format!(
                "'{}' was not provided by an earlier task",
                key
            ))),
        }
    }
}
