//! Task contract for flow execution.

use super::store::FlowStore;
use crate::api::LparWrapper;
use async_trait::async_trait;
use lparkit_shared::errors::{LparkitError, LparkitResult};

/// Value a task hands to later tasks under its `provides` name.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    None,
    Lpar(LparWrapper),
}

/// Why a task is being reverted.
///
/// Revert logic branches on whether the task's own `execute` failed (there
/// is usually nothing to undo) or whether it completed and a later task in
/// the same flow failed.
#[derive(Debug, Clone, Copy)]
pub enum RevertCause<'a> {
    /// This task's own `execute` returned the error.
    ExecuteFailed(&'a LparkitError),
    /// This task completed; `task` failed afterwards.
    DownstreamFailed {
        task: &'a str,
        error: &'a LparkitError,
    },
}

impl<'a> RevertCause<'a> {
    pub fn is_own_failure(&self) -> bool {
        matches!(self, Self::ExecuteFailed(_))
    }

    /// The error that triggered the revert.
    pub fn error(&self) -> &'a LparkitError {
        match self {
            Self::ExecuteFailed(error) | Self::DownstreamFailed { error, .. } => error,
        }
    }
}

/// Trait for tasks that can be executed in a flow.
///
/// `execute` is called at most once per flow run. `revert` is called zero or
/// one times, only after `execute` ran in the same run.
#[async_trait]
pub trait FlowTask: Send + Sync {
    /// Human-readable name, unique within a flow.
    fn name(&self) -> &str;

    /// Store key under which `execute`'s output is published.
    fn provides(&self) -> Option<&str> {
        None
    }

    async fn execute(&self, store: &FlowStore) -> LparkitResult<TaskOutput>;

    /// Compensating action; no-op unless the task overrides it.
    async fn revert(&self, _cause: RevertCause<'_>, _store: &FlowStore) -> LparkitResult<()> {
        Ok(())
    }
}

pub type BoxedTask = Box<dyn FlowTask>;
