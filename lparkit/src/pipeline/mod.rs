//! Lifecycle flow execution.
//!
//! ## Architecture
//!
//! ```text
//! Flow → Stages → Tasks
//!
//! - Flow: Orchestrates execution of all stages, reverts on failure
//! - Stage: Groups related tasks with an execution mode (parallel/sequential)
//! - Task: Atomic unit of work with an optional compensating revert
//! ```
//!
//! Tasks publish outputs into a [`FlowStore`] under their `provides` key so
//! later tasks can consume them (e.g. `lpar_wrap`).

mod flow;
mod metrics;
mod stage;
mod store;
mod task;

pub use flow::{Flow, FlowBuilder, FlowExecutor};
pub use metrics::{FlowMetrics, StageMetrics, TaskMetrics};
pub use stage::{ExecutionMode, Stage};
pub use store::{FlowStore, LPAR_WRAP};
pub use task::{BoxedTask, FlowTask, RevertCause, TaskOutput};
