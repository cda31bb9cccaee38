//! Partition lifecycle tasks.

use crate::api::{BootType, PowerOpts, SharedApi};
use crate::instance::{Flavor, SharedInstance, TaskState};
use crate::nvram::SharedNvramManager;
use crate::pipeline::{FlowStore, FlowTask, LPAR_WRAP, RevertCause, TaskOutput};
use crate::storage::{FeedTask, SharedFeedTask};
use crate::vm::{self, HostDescriptor, SlotManager};
use async_trait::async_trait;
use lparkit_shared::errors::LparkitResult;
use std::sync::Arc;

/// Name of the coordinator `Create` builds when none is supplied.
pub const CREATE_SCRUBBER: &str = "create_scrubber";

/// Look up the partition of an existing instance.
pub struct Get {
    api: SharedApi,
    host_uuid: String,
    instance: SharedInstance,
}

impl Get {
    pub fn new(api: SharedApi, host_uuid: impl Into<String>, instance: SharedInstance) -> Self {
        Self {
            api,
            host_uuid: host_uuid.into(),
            instance,
        }
    }
}

#[async_trait]
impl FlowTask for Get {
    fn name(&self) -> &str {
        "get_vm"
    }

    fn provides(&self) -> Option<&str> {
        Some(LPAR_WRAP)
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        tracing::debug!(instance = %self.instance.uuid, host = %self.host_uuid, "Getting partition");
        let wrapper = vm::get_instance_wrapper(self.api.as_ref(), &self.instance).await?;
        Ok(TaskOutput::Lpar(wrapper))
    }
}

/// Create the partition and scrub stale storage left on its id.
///
/// Revert only deletes the partition of a failed rebuild. A failed spawn is
/// cleaned up by the caller's destroy.
pub struct Create {
    api: SharedApi,
    host: HostDescriptor,
    instance: SharedInstance,
    flavor: Flavor,
    stg_ftsk: Option<SharedFeedTask>,
    nvram_mgr: Option<SharedNvramManager>,
    slot_mgr: Option<Arc<dyn SlotManager>>,
}

impl Create {
    pub fn new(api: SharedApi, host: HostDescriptor, instance: SharedInstance, flavor: Flavor) -> Self {
        Self {
            api,
            host,
            instance,
            flavor,
            stg_ftsk: None,
            nvram_mgr: None,
            slot_mgr: None,
        }
    }

    /// Register the scrub on a shared coordinator the caller executes later.
    pub fn with_feed_task(mut self, stg_ftsk: SharedFeedTask) -> Self {
        self.stg_ftsk = Some(stg_ftsk);
        self
    }

    pub fn with_nvram_mgr(mut self, nvram_mgr: Option<SharedNvramManager>) -> Self {
        self.nvram_mgr = nvram_mgr;
        self
    }

    pub fn with_slot_mgr(mut self, slot_mgr: Arc<dyn SlotManager>) -> Self {
        self.slot_mgr = Some(slot_mgr);
        self
    }
}

#[async_trait]
impl FlowTask for Create {
    fn name(&self) -> &str {
        "crt_vm"
    }

    fn provides(&self) -> Option<&str> {
        Some(LPAR_WRAP)
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        let nvram = match &self.nvram_mgr {
            Some(mgr) => {
                tracing::info!(instance = %self.instance.uuid, "Fetching NVRAM");
                mgr.fetch(&self.instance).await?
            }
            None => None,
        };

        let spec = vm::build_lpar_spec(
            &self.host,
            &self.instance,
            &self.flavor,
            None,
            nvram,
            self.slot_mgr.as_deref(),
        )?;
        let wrapper = vm::crt_lpar(self.api.as_ref(), &self.host, &spec).await?;

        match &self.stg_ftsk {
            Some(stg_ftsk) => stg_ftsk.add_scrub_lpar_storage(&[wrapper.id])?,
            None => {
                let scrubber =
                    FeedTask::active_vios(self.api.clone(), self.host.uuid.clone(), CREATE_SCRUBBER);
                scrubber.add_scrub_lpar_storage(&[wrapper.id])?;
                tracing::info!(instance = %self.instance.uuid, "Scrubbing storage as part of rebuild");
                scrubber.execute().await?;
            }
        }

        Ok(TaskOutput::Lpar(wrapper))
    }

    async fn revert(&self, cause: RevertCause<'_>, _store: &FlowStore) -> LparkitResult<()> {
        if self.instance.task_state() != Some(TaskState::RebuildSpawning) {
            return Ok(());
        }
        tracing::info!(instance = %self.instance.uuid, error = %cause.error(), "Rebuild failed, deleting partition from destination");
        vm::dlt_lpar(self.api.as_ref(), &vm::pvm_uuid(&self.instance)).await
    }
}

/// Apply a new flavor to an existing partition.
pub struct Resize {
    api: SharedApi,
    host: HostDescriptor,
    instance: SharedInstance,
    flavor: Flavor,
    vm_name: Option<String>,
}

impl Resize {
    pub fn new(
        api: SharedApi,
        host: HostDescriptor,
        instance: SharedInstance,
        flavor: Flavor,
        vm_name: Option<String>,
    ) -> Self {
        Self {
            api,
            host,
            instance,
            flavor,
            vm_name,
        }
    }
}

#[async_trait]
impl FlowTask for Resize {
    fn name(&self) -> &str {
        "resize_vm"
    }

    fn provides(&self) -> Option<&str> {
        Some(LPAR_WRAP)
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        let spec = vm::build_lpar_spec(
            &self.host,
            &self.instance,
            &self.flavor,
            self.vm_name.as_deref(),
            None,
            None,
        )?;
        let wrapper = vm::update(self.api.as_ref(), &self.instance, &spec).await?;
        Ok(TaskOutput::Lpar(wrapper))
    }
}

pub struct Rename {
    api: SharedApi,
    instance: SharedInstance,
    vm_name: String,
    task_name: String,
}

impl Rename {
    pub fn new(api: SharedApi, instance: SharedInstance, vm_name: impl Into<String>) -> Self {
        let vm_name = vm_name.into();
        Self {
            api,
            instance,
            task_name: format!("rename_vm_{}", vm_name),
            vm_name,
        }
    }
}

#[async_trait]
impl FlowTask for Rename {
    fn name(&self) -> &str {
        &self.task_name
    }

    fn provides(&self) -> Option<&str> {
        Some(LPAR_WRAP)
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        tracing::info!(instance = %self.instance.uuid, name = %self.vm_name, "Renaming partition");
        let wrapper = vm::rename(self.api.as_ref(), &self.instance, &self.vm_name).await?;
        Ok(TaskOutput::Lpar(wrapper))
    }
}

/// Power the partition on. Reverting forces it off again.
pub struct PowerOn {
    api: SharedApi,
    instance: SharedInstance,
    pwr_opts: Option<PowerOpts>,
}

impl PowerOn {
    pub fn new(api: SharedApi, instance: SharedInstance, pwr_opts: Option<PowerOpts>) -> Self {
        Self {
            api,
            instance,
            pwr_opts,
        }
    }
}

#[async_trait]
impl FlowTask for PowerOn {
    fn name(&self) -> &str {
        "pwr_vm"
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        vm::power_on(self.api.as_ref(), &self.instance, self.pwr_opts.as_ref()).await?;
        Ok(TaskOutput::None)
    }

    async fn revert(&self, cause: RevertCause<'_>, _store: &FlowStore) -> LparkitResult<()> {
        if cause.is_own_failure() {
            tracing::debug!(instance = %self.instance.uuid, "Power on failed, not performing power off");
            return Ok(());
        }
        tracing::warn!(instance = %self.instance.uuid, error = %cause.error(), "Powering off instance");
        vm::power_off(self.api.as_ref(), &self.instance, true).await?;
        Ok(())
    }
}

pub struct PowerOff {
    api: SharedApi,
    instance: SharedInstance,
    force_immediate: bool,
}

impl PowerOff {
    pub fn new(api: SharedApi, instance: SharedInstance, force_immediate: bool) -> Self {
        Self {
            api,
            instance,
            force_immediate,
        }
    }
}

#[async_trait]
impl FlowTask for PowerOff {
    fn name(&self) -> &str {
        "pwr_off_vm"
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        vm::power_off(self.api.as_ref(), &self.instance, self.force_immediate).await?;
        Ok(TaskOutput::None)
    }
}

/// Best-effort NVRAM capture. Failures are logged, never returned.
pub struct StoreNvram {
    nvram_mgr: Option<SharedNvramManager>,
    instance: SharedInstance,
    immediate: bool,
}

impl StoreNvram {
    pub fn new(nvram_mgr: Option<SharedNvramManager>, instance: SharedInstance, immediate: bool) -> Self {
        Self {
            nvram_mgr,
            instance,
            immediate,
        }
    }
}

#[async_trait]
impl FlowTask for StoreNvram {
    fn name(&self) -> &str {
        "store_nvram"
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        let Some(mgr) = &self.nvram_mgr else {
            return Ok(TaskOutput::None);
        };
        if let Err(e) = mgr.store(&self.instance, self.immediate).await {
            tracing::error!(instance = %self.instance.uuid, error = %e, "Unable to store NVRAM");
        }
        Ok(TaskOutput::None)
    }
}

/// Best-effort NVRAM removal. Failures are logged, never returned.
pub struct DeleteNvram {
    nvram_mgr: Option<SharedNvramManager>,
    instance: SharedInstance,
}

impl DeleteNvram {
    pub fn new(nvram_mgr: Option<SharedNvramManager>, instance: SharedInstance) -> Self {
        Self { nvram_mgr, instance }
    }
}

#[async_trait]
impl FlowTask for DeleteNvram {
    fn name(&self) -> &str {
        "delete_nvram"
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        let Some(mgr) = &self.nvram_mgr else {
            tracing::info!(instance = %self.instance.uuid, "No op for NVRAM delete");
            return Ok(TaskOutput::None);
        };
        tracing::info!(instance = %self.instance.uuid, "Deleting NVRAM");
        if let Err(e) = mgr.remove(&self.instance).await {
            tracing::error!(instance = %self.instance.uuid, error = %e, "Unable to delete NVRAM");
        }
        Ok(TaskOutput::None)
    }
}

pub struct Delete {
    api: SharedApi,
    lpar_uuid: String,
    instance: SharedInstance,
}

impl Delete {
    pub fn new(api: SharedApi, lpar_uuid: impl Into<String>, instance: SharedInstance) -> Self {
        Self {
            api,
            lpar_uuid: lpar_uuid.into(),
            instance,
        }
    }
}

#[async_trait]
impl FlowTask for Delete {
    fn name(&self) -> &str {
        "dlt_vm"
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        tracing::info!(instance = %self.instance.uuid, lpar = %self.lpar_uuid, "Deleting partition");
        vm::dlt_lpar(self.api.as_ref(), &self.lpar_uuid).await?;
        Ok(TaskOutput::None)
    }
}

pub struct UpdateIBMiSettings {
    api: SharedApi,
    instance: SharedInstance,
    boot_type: BootType,
}

impl UpdateIBMiSettings {
    pub fn new(api: SharedApi, instance: SharedInstance, boot_type: BootType) -> Self {
        Self {
            api,
            instance,
            boot_type,
        }
    }
}

#[async_trait]
impl FlowTask for UpdateIBMiSettings {
    fn name(&self) -> &str {
        "update_ibmi_settings"
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        vm::update_ibmi_settings(self.api.as_ref(), &self.instance, self.boot_type).await?;
        Ok(TaskOutput::None)
    }
}
