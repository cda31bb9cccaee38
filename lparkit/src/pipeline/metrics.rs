use crate::pipeline::ExecutionMode;

#[derive(Debug, Clone)]
pub struct TaskMetrics {
    pub name: String,
    pub duration_ms: u128,
}

#[derive(Debug, Clone)]
pub struct StageMetrics {
    pub index: usize,
    pub execution: ExecutionMode,
    pub duration_ms: u128,
    /// In completion order.
    pub tasks: Vec<TaskMetrics>,
}

#[derive(Debug, Clone)]
pub struct FlowMetrics {
    pub flow: String,
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl FlowMetrics {
    /// Completed tasks in completion order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskMetrics> {
        self.stages.iter().flat_map(|stage| stage.tasks.iter())
    }
}
