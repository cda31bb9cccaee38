//! Shared storage pool resolution and batched VIOS storage operations.
//!
//! - `SspResolver` - Resolves the configured (or only) shared storage pool once
//!   and refreshes it cheaply afterwards
//! - `FeedTask` - Collects per-VIOS mapping work from many tasks and applies it
//!   in as few remote calls as possible

mod feed_task;
mod ssp;

pub use feed_task::{FeedTask, FeedTaskSummary, PostOp, SharedFeedTask, StorageOp};
pub use ssp::{SspResolver, resolve_ssp};
