//! lparkit - PowerVM partition lifecycle for compute orchestration.
//!
//! Lifecycle verbs (spawn, rebuild, destroy, resize, power on/off) are
//! expressed as flows of small tasks with compensating reverts. The
//! management API client is injected through [`api::ManagementApi`].

pub mod api;
pub mod config;
pub mod driver;
pub mod instance;
pub mod logging;
pub mod media;
pub mod nvram;
pub mod pipeline;
pub mod storage;
pub mod tasks;
pub mod vm;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ManagementApi, SharedApi};
pub use config::{FcAttachStrategy, LparkitOptions, NvramStoreKind};
pub use driver::{Driver, HostCapacity};
pub use instance::{Flavor, Instance, SharedInstance, TaskState};
pub use logging::{LogGuard, init_logging};
pub use lparkit_shared::{LparkitError, LparkitResult, RevertFailure, StoragePoolError};
pub use pipeline::{Flow, FlowExecutor, FlowMetrics, FlowStore, FlowTask, RevertCause};
pub use storage::{FeedTask, SspResolver};
