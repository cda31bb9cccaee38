//! Flow assembly and execution with compensating reverts.

use super::metrics::{FlowMetrics, StageMetrics, TaskMetrics};
use super::stage::{ExecutionMode, Stage};
use super::store::FlowStore;
use super::task::{BoxedTask, RevertCause, TaskOutput};
use futures::stream::{FuturesUnordered, StreamExt};
use lparkit_shared::errors::{LparkitError, LparkitResult, RevertFailure};
use std::collections::HashSet;
use std::time::Instant;

/// Ordered stages of tasks making up one lifecycle operation.
pub struct Flow {
    name: String,
    stages: Vec<Stage<BoxedTask>>,
}

impl Flow {
    /// Assemble a flow.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when two tasks share a name or a `provides` key.
    pub fn new(name: impl Into<String>, stages: Vec<Stage<BoxedTask>>) -> LparkitResult<Self> {
        let name = name.into();
        let mut names = HashSet::new();
        let mut provided = HashSet::new();

        for task in stages.iter().flat_map(|stage| stage.tasks.iter()) {
            if !names.insert(task.name().to_string()) {
                return Err(LparkitError::InvalidArgument(format!(
                    "flow '{}' contains task '{}' more than once",
                    name,
                    task.name()
                )));
            }
            if let Some(key) = task.provides()
                && !provided.insert(key.to_string())
            {
                return Err(LparkitError::InvalidArgument(format!(
                    "flow '{}': '{}' is provided by more than one task",
                    name, key
                )));
            }
        }

        Ok(Self { name, stages })
    }

    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.stages
            .iter()
            .flat_map(|stage| stage.tasks.iter())
            .map(|task| task.name())
            .collect()
    }
}

/// Incremental flow construction.
pub struct FlowBuilder {
    name: String,
    stages: Vec<Stage<BoxedTask>>,
}

impl FlowBuilder {
    /// Append a task in its own sequential stage.
    pub fn then(mut self, task: BoxedTask) -> Self {
        self.stages.push(Stage::single(task));
        self
    }

    /// Append a parallel group of independent tasks.
    pub fn parallel(mut self, tasks: Vec<BoxedTask>) -> Self {
        self.stages.push(Stage::parallel(tasks));
        self
    }

    pub fn stage(mut self, stage: Stage<BoxedTask>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> LparkitResult<Flow> {
        Flow::new(self.name, self.stages)
    }
}

struct TaskOutcome {
    index: usize,
    result: LparkitResult<TaskOutput>,
    duration_ms: u128,
}

/// Flow executor.
///
/// On the first failing stage, every task that failed is reverted with
/// [`RevertCause::ExecuteFailed`], then every completed task is reverted in
/// reverse completion order with [`RevertCause::DownstreamFailed`]. Revert
/// errors never stop the remaining reverts. Once all reverts ran the
/// triggering error is returned, wrapped in
/// [`LparkitError::RevertFailed`] when any revert failed.
///
/// Within a sequential stage a task's output is visible to the next task.
/// Outputs of a parallel stage become visible when the whole stage is done.
pub struct FlowExecutor;

impl FlowExecutor {
    pub async fn run(flow: Flow, store: &FlowStore) -> LparkitResult<FlowMetrics> {
        let Flow { name, stages } = flow;
        let total_start = Instant::now();
        let mut stage_metrics = Vec::new();
        let mut completed: Vec<BoxedTask> = Vec::new();

        tracing::debug!(flow = %name, stages = stages.len(), "Starting flow");

        for (index, stage) in stages.into_iter().enumerate() {
            let Stage { tasks, execution } = stage;
            let stage_start = Instant::now();

            let outcomes = match execution {
                ExecutionMode::Parallel => Self::run_parallel(&name, &tasks, store).await,
                ExecutionMode::Sequential => Self::run_sequential(&name, &tasks, store).await,
            };

            let mut slots: Vec<Option<BoxedTask>> = tasks.into_iter().map(Some).collect();
            let mut task_metrics = Vec::new();
            let mut failures = Vec::new();

            for outcome in outcomes {
                let Some(task) = slots.get_mut(outcome.index).and_then(Option::take) else {
                    continue;
                };
                match outcome.result {
                    Ok(output) => {
                        if execution == ExecutionMode::Parallel
                            && let Some(key) = task.provides()
                        {
                            store.insert(key, output);
                        }
                        task_metrics.push(TaskMetrics {
                            name: task.name().to_string(),
                            duration_ms: outcome.duration_ms,
                        });
                        completed.push(task);
                    }
                    Err(error) => failures.push((task, error)),
                }
            }

            if !failures.is_empty() {
                return Err(Self::revert(&name, completed, failures, store).await);
            }

            stage_metrics.push(StageMetrics {
                index,
                execution,
                duration_ms: stage_start.elapsed().as_millis(),
                tasks: task_metrics,
            });
        }

        tracing::debug!(flow = %name, "Flow completed");

        Ok(FlowMetrics {
            flow: name,
            total_duration_ms: total_start.elapsed().as_millis(),
            stages: stage_metrics,
        })
    }

    async fn run_sequential(
        flow: &str,
        tasks: &[BoxedTask],
        store: &FlowStore,
    ) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        for (index, task) in tasks.iter().enumerate() {
            let outcome = Self::run_task(flow, index, task, store).await;
            let failed = match &outcome.result {
                Ok(output) => {
                    if let Some(key) = task.provides() {
                        store.insert(key, output.clone());
                    }
                    false
                }
                Err(_) => true,
            };
            outcomes.push(outcome);
            if failed {
                break;
            }
        }
        outcomes
    }

    /// Outcomes are returned in completion order.
    async fn run_parallel(flow: &str, tasks: &[BoxedTask], store: &FlowStore) -> Vec<TaskOutcome> {
        let mut pending: FuturesUnordered<_> = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| Self::run_task(flow, index, task, store))
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(outcome) = pending.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_task(
        flow: &str,
        index: usize,
        task: &BoxedTask,
        store: &FlowStore,
    ) -> TaskOutcome {
        let task_start = Instant::now();
        tracing::debug!(flow, task = task.name(), "Executing task");
        let result = task.execute(store).await;
        if let Err(ref error) = result {
            tracing::error!(flow, task = task.name(), error = %error, "Task failed");
        }
        TaskOutcome {
            index,
            result,
            duration_ms: task_start.elapsed().as_millis(),
        }
    }

    async fn revert(
        flow: &str,
        completed: Vec<BoxedTask>,
        failures: Vec<(BoxedTask, LparkitError)>,
        store: &FlowStore,
    ) -> LparkitError {
        tracing::warn!(flow, failed = failures.len(), reverting = completed.len(), "Flow failed, reverting");
        let mut revert_failures = Vec::new();

        for (task, error) in &failures {
            let cause = RevertCause::ExecuteFailed(error);
            revert_failures.extend(Self::revert_task(flow, task, cause, store).await);
        }

        if let Some((failed, error)) = failures.first() {
            let cause = RevertCause::DownstreamFailed {
                task: failed.name(),
                error,
            };
            for task in completed.iter().rev() {
                revert_failures.extend(Self::revert_task(flow, task, cause, store).await);
            }
        }

        let mut failures = failures.into_iter();
        let error = match failures.next() {
            Some((_, error)) => {
                for (task, extra) in failures {
                    tracing::warn!(flow, task = task.name(), error = %extra, "Additional task failure in stage");
                }
                error
            }
            None => LparkitError::Internal(format!("flow '{}' reverted without a failure", flow)),
        };

        if revert_failures.is_empty() {
            error
        } else {
            LparkitError::RevertFailed {
                cause: Box::new(error),
                failures: revert_failures,
            }
        }
    }

    async fn revert_task(
        flow: &str,
        task: &BoxedTask,
        cause: RevertCause<'_>,
        store: &FlowStore,
    ) -> Option<RevertFailure> {
        tracing::debug!(flow, task = task.name(), "Reverting task");
        match task.revert(cause, store).await {
            Ok(()) => None,
            Err(error) => {
                tracing::error!(flow, task = task.name(), error = %error, "Revert failed, continuing with remaining reverts");
                Some(RevertFailure {
                    task: task.name().to_string(),
                    error,
                })
            }
        }
    }
}
