//! Task grouping inside a flow.

/// How the tasks of one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// All tasks start together and each runs to completion even if a
    /// sibling fails. Completed siblings are reverted with the rest of the
    /// flow.
    Parallel,
    /// Tasks run in order. The first failure ends the stage; later tasks
    /// never execute and so are never reverted.
    Sequential,
}

/// Tasks a flow runs as one unit before moving to the next stage.
///
/// A failing stage stops the flow. Reverts then cover the failed tasks and
/// every task completed in this or an earlier stage.
#[derive(Debug, Clone)]
pub struct Stage<T> {
    pub tasks: Vec<T>,
    pub execution: ExecutionMode,
}

impl<T> Stage<T> {
    /// Independent tasks with no outputs consumed within the stage.
    pub fn parallel(tasks: Vec<T>) -> Self {
        Self {
            tasks,
            execution: ExecutionMode::Parallel,
        }
    }

    /// Ordered tasks; each sees the outputs of those before it.
    pub fn sequential(tasks: Vec<T>) -> Self {
        Self {
            tasks,
            execution: ExecutionMode::Sequential,
        }
    }

    pub fn single(task: T) -> Self {
        Self::sequential(vec![task])
    }
}
