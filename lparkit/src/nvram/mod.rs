//! NVRAM persistence for partitions.
//!
//! The lifecycle tasks only see [`NvramManager`]. [`StoreNvramManager`] is the
//! bundled implementation: it reads the blob from the management API and
//! keeps it in an [`NvramStore`] such as [`SqliteNvramStore`].

mod manager;
mod store;

pub use manager::StoreNvramManager;
pub use store::{NvramRecord, NvramStore, SqliteNvramStore};

use crate::instance::Instance;
use async_trait::async_trait;
use lparkit_shared::errors::LparkitResult;
use std::sync::Arc;

/// Persists and retrieves a partition's NVRAM.
#[async_trait]
pub trait NvramManager: Send + Sync {
    /// Last stored blob for the instance, if any.
    async fn fetch(&self, instance: &Instance) -> LparkitResult<Option<String>>;

    /// Capture the current blob. Non-immediate stores may be deferred.
    async fn store(&self, instance: &Instance, immediate: bool) -> LparkitResult<()>;

    async fn remove(&self, instance: &Instance) -> LparkitResult<()>;
}

pub type SharedNvramManager = Arc<dyn NvramManager>;
