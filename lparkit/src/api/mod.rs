//! Seam to the remote virtualization-management API.
//!
//! The HTTP client and its object wrapping live outside this crate. The
//! driver talks to them only through [`ManagementApi`], which keeps every
//! task testable against an in-memory fake.

mod types;

pub use types::{
    BootType, LparEnv, LparSpec, LparState, LparWrapper, ManagementPartition, PowerOpts,
    ScsiMapping, SspWrapper, StorageElement, VOptMedia, VOptRepository, ViosWrapper,
};

use async_trait::async_trait;
use lparkit_shared::errors::LparkitResult;
use std::path::Path;
use std::sync::Arc;

/// Remote management API consumed by the driver.
///
/// Every call blocks the calling flow until the remote side answers.
/// Timeout and retry policy belong to the implementation.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    // ---- shared storage pools -------------------------------------------

    /// Name-filtered search for shared storage pools.
    async fn search_ssps(&self, name: &str) -> LparkitResult<Vec<SspWrapper>>;

    /// Full feed of shared storage pools on the host.
    async fn list_ssps(&self) -> LparkitResult<Vec<SspWrapper>>;

    /// Re-read an already identified pool.
    async fn refresh_ssp(&self, ssp: &SspWrapper) -> LparkitResult<SspWrapper>;

    // ---- partitions -----------------------------------------------------

    async fn get_lpar(&self, lpar_uuid: &str) -> LparkitResult<LparWrapper>;

    async fn create_lpar(&self, host_uuid: &str, spec: &LparSpec) -> LparkitResult<LparWrapper>;

    async fn update_lpar(&self, lpar_uuid: &str, spec: &LparSpec) -> LparkitResult<LparWrapper>;

    async fn rename_lpar(&self, lpar_uuid: &str, name: &str) -> LparkitResult<LparWrapper>;

    async fn delete_lpar(&self, lpar_uuid: &str) -> LparkitResult<()>;

    async fn power_on(&self, lpar_uuid: &str, opts: Option<&PowerOpts>) -> LparkitResult<()>;

    async fn power_off(&self, lpar_uuid: &str, force_immediate: bool) -> LparkitResult<()>;

    async fn update_ibmi_settings(&self, lpar_uuid: &str, boot_type: BootType)
    -> LparkitResult<()>;

    /// Current NVRAM of a partition, `None` when the partition has none.
    async fn read_nvram(&self, lpar_uuid: &str) -> LparkitResult<Option<String>>;

    // ---- virtual I/O servers --------------------------------------------

    /// Active VIOS feed of a host.
    async fn list_vios(&self, host_uuid: &str) -> LparkitResult<Vec<ViosWrapper>>;

    /// Write back a modified VIOS (mappings included) in one request.
    async fn update_vios(&self, vios: &ViosWrapper) -> LparkitResult<ViosWrapper>;

    async fn find_vopt_repository(&self) -> LparkitResult<VOptRepository>;

    async fn upload_vopt(
        &self,
        vios_uuid: &str,
        path: &Path,
        name: &str,
        size_bytes: u64,
    ) -> LparkitResult<VOptMedia>;

    /// Delete media from the repository in one request.
    async fn delete_vopt_media(&self, vios_uuid: &str, names: &[String]) -> LparkitResult<()>;

    // ---- management partition -------------------------------------------

    async fn get_mgmt_partition(&self) -> LparkitResult<ManagementPartition>;

    async fn discover_iscsi_initiator(&self, mgmt: &ManagementPartition)
    -> LparkitResult<String>;
}

/// Shared handle to the management API.
pub type SharedApi = Arc<dyn ManagementApi>;
