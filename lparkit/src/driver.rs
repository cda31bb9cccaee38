//! Lifecycle operations assembled from tasks.
//!
//! ## Flows
//!
//! ```text
//! spawn:    crt_vm -> [cfg_vopt] -> spawn_stg -> [update_ibmi_settings] -> pwr_vm
//! rebuild:  crt_vm (private scrubber) -> [cfg_vopt] -> pwr_vm
//! destroy:  pwr_off_vm -> [vopt_delete] -> destroy_stg -> delete_nvram -> dlt_vm
//! resize:   pwr_off_vm -> resize_vm -> store_nvram
//! power on: pwr_vm
//! power off: pwr_off_vm -> store_nvram (deferred)
//! ```
//!
//! Bracketed steps depend on the instance and the options. Storage work of a
//! spawn or destroy is registered on one coordinator and executed by its
//! `*_stg` step.

use crate::api::{BootType, LparWrapper, PowerOpts, SharedApi};
use crate::config::{FcAttachStrategy, LparkitOptions, NvramStoreKind};
use crate::instance::{Flavor, SharedInstance};
use crate::media::{ConfigDrive, ConfigDriveBuilder, ConfigDriveRequest};
use crate::nvram::{SharedNvramManager, SqliteNvramStore, StoreNvramManager};
use crate::pipeline::{BoxedTask, Flow, FlowExecutor, FlowMetrics, FlowStore};
use crate::storage::{FeedTask, SspResolver};
use crate::tasks::{
    Create, CreateAndConnectCfgDrive, Delete, DeleteNvram, DeleteVOpt, ExecuteStorageFeed,
    PowerOff, PowerOn, Resize, StoreNvram, UpdateIBMiSettings,
};
use crate::vm::{self, HostDescriptor};
use crate::volume::{self, IscsiInitiatorCache, VolumeDriverKind};
use lparkit_shared::errors::{LparkitError, LparkitResult};
use std::sync::Arc;

const NVRAM_DB_FILE: &str = "nvram.db";

/// Storage pool capacity in GB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostCapacity {
    pub total_gb: f64,
    pub used_gb: f64,
}

/// Entry point for lifecycle operations on one managed system.
pub struct Driver {
    api: SharedApi,
    options: LparkitOptions,
    host: HostDescriptor,
    ssp: SspResolver,
    nvram_mgr: Option<SharedNvramManager>,
    /// Concrete handle of a configured store, used for deferred flushes.
    stored_nvram: Option<Arc<StoreNvramManager>>,
    cfg_drive: Option<Arc<ConfigDrive>>,
    iscsi_initiator: IscsiInitiatorCache,
}

impl Driver {
    /// Validate the options and resolve host resources.
    ///
    /// # Errors
    ///
    /// Invalid options, an ambiguous or missing storage pool, a config drive
    /// enabled without a builder, or a host without a media repository.
    pub async fn new(
        api: SharedApi,
        options: LparkitOptions,
        cfg_builder: Option<Arc<dyn ConfigDriveBuilder>>,
    ) -> LparkitResult<Self> {
        options.validate()?;

        let ssp = SspResolver::new(api.clone(), options.ssp_name.clone()).await?;

        let stored_nvram = match options.nvram_store {
            NvramStoreKind::None => None,
            NvramStoreKind::Sqlite => {
                let store = SqliteNvramStore::open(&options.db_dir().join(NVRAM_DB_FILE))?;
                Some(Arc::new(StoreNvramManager::new(api.clone(), Arc::new(store))))
            }
        };
        let nvram_mgr = stored_nvram
            .clone()
            .map(|mgr| mgr as SharedNvramManager);

        let cfg_drive = if options.config_drive {
            let builder = cfg_builder.ok_or_else(|| {
                LparkitError::Config("config_drive is enabled but no builder was supplied".into())
            })?;
            Some(Arc::new(
                ConfigDrive::new(api.clone(), options.host_uuid.clone(), builder).await?,
            ))
        } else {
            None
        };

        tracing::info!(
            host = %options.host_uuid,
            ssp = %ssp.name(),
            config_drive = cfg_drive.is_some(),
            nvram = ?options.nvram_store,
            "Driver initialized"
        );

        Ok(Self {
            host: HostDescriptor::from_options(&options),
            api,
            options,
            ssp,
            nvram_mgr,
            stored_nvram,
            cfg_drive,
            iscsi_initiator: IscsiInitiatorCache::new(),
        })
    }

    /// Use an external NVRAM manager instead of the configured store.
    pub fn with_nvram_manager(mut self, nvram_mgr: SharedNvramManager) -> Self {
        self.nvram_mgr = Some(nvram_mgr);
        self.stored_nvram = None;
        self
    }

    pub fn options(&self) -> &LparkitOptions {
        &self.options
    }

    // ========================================================================
    // FLOWS
    // ========================================================================

    pub fn spawn_flow(
        &self,
        instance: &SharedInstance,
        flavor: &Flavor,
        cfg_request: Option<ConfigDriveRequest>,
    ) -> LparkitResult<Flow> {
        let stg_ftsk =
            FeedTask::active_vios(self.api.clone(), self.host.uuid.clone(), "spawn_stg").shared();

        let mut tasks: Vec<BoxedTask> = vec![Box::new(
            Create::new(
                self.api.clone(),
                self.host.clone(),
                instance.clone(),
                flavor.clone(),
            )
            .with_feed_task(Arc::clone(&stg_ftsk))
            .with_nvram_mgr(self.nvram_mgr.clone()),
        )];

        if let Some(cfg_drive) = &self.cfg_drive
            && let Some(request) = cfg_request
        {
            tasks.push(Box::new(CreateAndConnectCfgDrive::new(
                Arc::clone(cfg_drive),
                instance.clone(),
                request,
                Some(Arc::clone(&stg_ftsk)),
            )));
        }

        tasks.push(Box::new(ExecuteStorageFeed::new(stg_ftsk)));

        if instance.is_ibmi() {
            tasks.push(Box::new(UpdateIBMiSettings::new(
                self.api.clone(),
                instance.clone(),
                self.boot_type(),
            )));
        }

        tasks.push(Box::new(PowerOn::new(self.api.clone(), instance.clone(), None)));

        sequential("spawn", tasks)
    }

    /// Rebuild onto this host. The caller sets the rebuild-spawning task
    /// state so a failure deletes the new partition.
    pub fn rebuild_flow(
        &self,
        instance: &SharedInstance,
        flavor: &Flavor,
        cfg_request: Option<ConfigDriveRequest>,
    ) -> LparkitResult<Flow> {
        let mut tasks: Vec<BoxedTask> = vec![Box::new(
            Create::new(
                self.api.clone(),
                self.host.clone(),
                instance.clone(),
                flavor.clone(),
            )
            .with_nvram_mgr(self.nvram_mgr.clone()),
        )];

        if let Some(cfg_drive) = &self.cfg_drive
            && let Some(request) = cfg_request
        {
            tasks.push(Box::new(CreateAndConnectCfgDrive::new(
                Arc::clone(cfg_drive),
                instance.clone(),
                request,
                None,
            )));
        }

        tasks.push(Box::new(PowerOn::new(self.api.clone(), instance.clone(), None)));

        sequential("rebuild", tasks)
    }

    pub fn destroy_flow(&self, instance: &SharedInstance, lpar: &LparWrapper) -> LparkitResult<Flow> {
        let stg_ftsk =
            FeedTask::active_vios(self.api.clone(), self.host.uuid.clone(), "destroy_stg").shared();

        let mut tasks: Vec<BoxedTask> =
            vec![Box::new(PowerOff::new(self.api.clone(), instance.clone(), true))];

        if let Some(cfg_drive) = &self.cfg_drive {
            tasks.push(Box::new(DeleteVOpt::new(
                Arc::clone(cfg_drive),
                instance.clone(),
                lpar.id,
                Some(Arc::clone(&stg_ftsk)),
            )));
        }

        tasks.push(Box::new(ExecuteStorageFeed::new(stg_ftsk)));
        tasks.push(Box::new(DeleteNvram::new(self.nvram_mgr.clone(), instance.clone())));
        tasks.push(Box::new(Delete::new(
            self.api.clone(),
            lpar.uuid.clone(),
            instance.clone(),
        )));

        sequential("destroy", tasks)
    }

    pub fn resize_flow(&self, instance: &SharedInstance, flavor: &Flavor) -> LparkitResult<Flow> {
        let tasks: Vec<BoxedTask> = vec![
            Box::new(PowerOff::new(self.api.clone(), instance.clone(), false)),
            Box::new(Resize::new(
                self.api.clone(),
                self.host.clone(),
                instance.clone(),
                flavor.clone(),
                None,
            )),
            Box::new(StoreNvram::new(self.nvram_mgr.clone(), instance.clone(), true)),
        ];
        sequential("resize", tasks)
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    pub async fn spawn(
        &self,
        instance: &SharedInstance,
        flavor: &Flavor,
        cfg_request: Option<ConfigDriveRequest>,
    ) -> LparkitResult<FlowMetrics> {
        tracing::info!(instance = %instance.uuid, flavor = %flavor.name, "Spawning instance");
        run(self.spawn_flow(instance, flavor, cfg_request)?).await
    }

    pub async fn rebuild(
        &self,
        instance: &SharedInstance,
        flavor: &Flavor,
        cfg_request: Option<ConfigDriveRequest>,
    ) -> LparkitResult<FlowMetrics> {
        tracing::info!(instance = %instance.uuid, "Rebuilding instance");
        run(self.rebuild_flow(instance, flavor, cfg_request)?).await
    }

    /// Remove the instance's partition and everything attached to it.
    ///
    /// Returns `None` when the partition does not exist.
    pub async fn destroy(&self, instance: &SharedInstance) -> LparkitResult<Option<FlowMetrics>> {
        tracing::info!(instance = %instance.uuid, "Destroying instance");
        let lpar = match vm::get_instance_wrapper(self.api.as_ref(), instance).await {
            Ok(lpar) => lpar,
            Err(LparkitError::NotFound(_)) => {
                tracing::info!(instance = %instance.uuid, "Partition not found on host, nothing to destroy");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        run(self.destroy_flow(instance, &lpar)?).await.map(Some)
    }

    pub async fn resize(&self, instance: &SharedInstance, flavor: &Flavor) -> LparkitResult<FlowMetrics> {
        tracing::info!(instance = %instance.uuid, flavor = %flavor.name, "Resizing instance");
        run(self.resize_flow(instance, flavor)?).await
    }

    pub async fn power_on(
        &self,
        instance: &SharedInstance,
        opts: Option<PowerOpts>,
    ) -> LparkitResult<FlowMetrics> {
        let flow = Flow::builder("power_on")
            .then(Box::new(PowerOn::new(self.api.clone(), instance.clone(), opts)))
            .build()?;
        run(flow).await
    }

    pub async fn power_off(
        &self,
        instance: &SharedInstance,
        force_immediate: bool,
    ) -> LparkitResult<FlowMetrics> {
        let flow = Flow::builder("power_off")
            .then(Box::new(PowerOff::new(
                self.api.clone(),
                instance.clone(),
                force_immediate,
            )))
            .then(Box::new(StoreNvram::new(
                self.nvram_mgr.clone(),
                instance.clone(),
                false,
            )))
            .build()?;
        run(flow).await
    }

    /// Write NVRAM stores deferred by earlier operations.
    pub async fn flush_nvram(&self) -> usize {
        match &self.stored_nvram {
            Some(mgr) => mgr.flush().await,
            None => 0,
        }
    }

    // ========================================================================
    // HOST RESOURCES
    // ========================================================================

    /// Current capacity of the storage pool.
    pub async fn available_capacity(&self) -> LparkitResult<HostCapacity> {
        let ssp = self.ssp.refresh().await?;
        Ok(HostCapacity {
            total_gb: ssp.capacity,
            used_gb: ssp.capacity_used(),
        })
    }

    pub fn volume_driver_kind(&self, volume_type: &str) -> LparkitResult<VolumeDriverKind> {
        volume::volume_driver_kind(volume_type, self.options.fc_attach_strategy)
    }

    pub fn hostname_for_volume(&self, instance: &SharedInstance) -> String {
        volume::hostname_for_volume(
            &self.options.host_name,
            instance,
            self.options.fc_attach_strategy,
        )
    }

    pub async fn iscsi_initiator(&self) -> LparkitResult<&str> {
        self.iscsi_initiator.get(self.api.as_ref()).await
    }

    fn boot_type(&self) -> BootType {
        match self.options.fc_attach_strategy {
            FcAttachStrategy::Vscsi => BootType::Vscsi,
            FcAttachStrategy::Npiv => BootType::Npiv,
        }
    }
}

fn sequential(name: &str, tasks: Vec<BoxedTask>) -> LparkitResult<Flow> {
    tasks
        .into_iter()
        .fold(Flow::builder(name), |builder, task| builder.then(task))
        .build()
}

async fn run(flow: Flow) -> LparkitResult<FlowMetrics> {
    let name = flow.name().to_string();
    let store = FlowStore::new();
    match FlowExecutor::run(flow, &store).await {
        Ok(metrics) => {
            tracing::info!(flow = %name, duration_ms = metrics.total_duration_ms, "Operation completed");
            Ok(metrics)
        }
        Err(e) => {
            tracing::error!(flow = %name, error = %e, "Operation failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LparState, ScsiMapping, StorageElement, ViosWrapper};
    use crate::instance::{Instance, TaskState};
    use crate::media::InstanceMetadata;
    use crate::nvram::NvramStore;
    use crate::testing::{self, FakeApi, HOST_UUID, VIOS_UUID, ssp};
    use std::path::Path;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct TinyIso;

    impl ConfigDriveBuilder for TinyIso {
        fn make_drive(&self, _metadata: &InstanceMetadata, iso_path: &Path) -> std::io::Result<()> {
            std::fs::write(iso_path, b"iso9660")
        }
    }

    fn options(home: &TempDir) -> LparkitOptions {
        LparkitOptions {
            home_dir: home.path().to_path_buf(),
            host_uuid: HOST_UUID.into(),
            host_name: "compute1".into(),
            ssp_name: Some("ssp1".into()),
            ..Default::default()
        }
    }

    async fn driver(api: &Arc<FakeApi>, options: LparkitOptions) -> Driver {
        api.set_search_result(vec![ssp("ssp1", 49.88, 0.90)]);
        let cfg_builder: Option<Arc<dyn ConfigDriveBuilder>> = Some(Arc::new(TinyIso));
        Driver::new(api.clone(), options, cfg_builder).await.unwrap()
    }

    #[tokio::test]
    async fn test_new_rejects_config_drive_without_builder() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        api.set_search_result(vec![ssp("ssp1", 10.0, 5.0)]);
        let options = LparkitOptions {
            config_drive: true,
            ..options(&home)
        };

        let result = Driver::new(api, options, None).await;

        assert!(matches!(result, Err(LparkitError::Config(_))));
    }

    #[tokio::test]
    async fn test_new_surfaces_pool_ambiguity() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        api.set_search_result(vec![ssp("ssp1", 1.0, 1.0), ssp("ssp1", 2.0, 2.0)]);

        let result = Driver::new(api, options(&home), None).await;

        assert!(matches!(result, Err(LparkitError::StoragePool(_))));
    }

    #[tokio::test]
    async fn test_spawn_flow_order() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let driver = driver(
            &api,
            LparkitOptions {
                config_drive: true,
                ..options(&home)
            },
        )
        .await;
        let inst = testing::instance("vm1");

        let flow = driver
            .spawn_flow(&inst, &Flavor::new("small", 1, 1024), Some(ConfigDriveRequest::default()))
            .unwrap();

        assert_eq!(flow.task_names(), vec!["crt_vm", "cfg_vopt", "spawn_stg", "pwr_vm"]);
    }

    #[tokio::test]
    async fn test_spawn_ibmi_updates_settings_before_power_on() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let driver = driver(&api, options(&home)).await;
        let inst = Instance::new(Uuid::new_v4(), "ibmi1")
            .with_os_distro("ibmi")
            .into_shared();

        let flow = driver
            .spawn_flow(&inst, &Flavor::new("small", 1, 1024), None)
            .unwrap();

        assert_eq!(
            flow.task_names(),
            vec!["crt_vm", "spawn_stg", "update_ibmi_settings", "pwr_vm"]
        );
    }

    #[tokio::test]
    async fn test_spawn_batches_scrub_and_cfg_drive_mapping() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        api.set_vios(vec![ViosWrapper {
            uuid: VIOS_UUID.into(),
            name: "vios1".into(),
            scsi_mappings: vec![ScsiMapping::new(
                2,
                StorageElement::VirtualDisk {
                    name: "stale".into(),
                },
            )],
        }]);
        let driver = driver(
            &api,
            LparkitOptions {
                config_drive: true,
                ..options(&home)
            },
        )
        .await;
        let inst = testing::instance("vm1");

        driver
            .spawn(&inst, &Flavor::new("small", 1, 1024), Some(ConfigDriveRequest::default()))
            .await
            .unwrap();

        assert_eq!(api.count("list_vios"), 1);
        assert_eq!(api.count("update_vios"), 1);
        let mappings = &api.vios()[0].scsi_mappings;
        assert_eq!(mappings.len(), 1);
        assert!(mappings[0].backing_storage.as_ref().unwrap().is_vopt());
        assert_eq!(
            api.lpar(&vm::pvm_uuid(&inst)).unwrap().state,
            LparState::Running
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_powers_nothing_off_and_keeps_partition() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let driver = driver(&api, options(&home)).await;
        api.fail_on("power_on");
        let inst = testing::instance("vm1");

        let result = driver.spawn(&inst, &Flavor::new("small", 1, 1024), None).await;

        assert!(matches!(result, Err(LparkitError::Api { .. })));
        assert_eq!(api.count("power_off"), 0);
        assert_eq!(api.count("delete_lpar"), 0);
        assert!(api.lpar(&vm::pvm_uuid(&inst)).is_some());
    }

    #[tokio::test]
    async fn test_rebuild_failure_deletes_new_partition() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let driver = driver(&api, options(&home)).await;
        api.fail_on("power_on");
        let inst = testing::instance("vm1");
        inst.set_task_state(Some(TaskState::RebuildSpawning));

        let result = driver.rebuild(&inst, &Flavor::new("small", 1, 1024), None).await;

        assert!(result.is_err());
        assert_eq!(api.count("list_vios"), 1);
        assert_eq!(api.count("delete_lpar"), 1);
        assert!(api.lpar(&vm::pvm_uuid(&inst)).is_none());
    }

    #[tokio::test]
    async fn test_rebuild_failure_reports_failed_cleanup() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let driver = driver(&api, options(&home)).await;
        api.fail_on("power_on");
        api.fail_on("delete_lpar");
        let inst = testing::instance("vm1");
        inst.set_task_state(Some(TaskState::RebuildSpawning));

        let err = driver
            .rebuild(&inst, &Flavor::new("small", 1, 1024), None)
            .await
            .unwrap_err();

        assert!(matches!(err.root_cause(), LparkitError::Api { operation, .. } if operation == "power_on"));
        let failed: Vec<_> = err.revert_failures().iter().map(|f| f.task.as_str()).collect();
        assert_eq!(failed, vec!["crt_vm"]);
        assert!(api.lpar(&vm::pvm_uuid(&inst)).is_some());
    }

    #[tokio::test]
    async fn test_destroy_missing_partition() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let driver = driver(&api, options(&home)).await;

        let result = driver.destroy(&testing::instance("vm1")).await.unwrap();

        assert!(result.is_none());
        assert_eq!(api.count("delete_lpar"), 0);
    }

    #[tokio::test]
    async fn test_destroy_removes_media_nvram_and_partition() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let inst = testing::instance("vm1");
        let lpar = testing::lpar_for(&inst, 5, LparState::Running);
        api.add_lpar(lpar.clone());
        api.set_nvram(&lpar.uuid, "nvram");
        api.set_vios(vec![ViosWrapper {
            uuid: VIOS_UUID.into(),
            name: "vios1".into(),
            scsi_mappings: vec![ScsiMapping::new(
                5,
                StorageElement::VOptMedia {
                    name: "cfg_vm1.iso".into(),
                },
            )],
        }]);
        let driver = driver(
            &api,
            LparkitOptions {
                config_drive: true,
                nvram_store: NvramStoreKind::Sqlite,
                ..options(&home)
            },
        )
        .await;
        driver.power_off(&inst, false).await.unwrap();
        assert_eq!(driver.flush_nvram().await, 1);

        let flow = driver.destroy_flow(&inst, &lpar).unwrap();
        assert_eq!(
            flow.task_names(),
            vec!["pwr_off_vm", "vopt_delete", "destroy_stg", "delete_nvram", "dlt_vm"]
        );

        api.add_lpar(lpar.clone());
        driver.destroy(&inst).await.unwrap().unwrap();

        assert_eq!(api.power_off_forces(), vec![false, true]);
        assert!(api.lpar(&lpar.uuid).is_none());
        assert!(api.vios()[0].scsi_mappings.is_empty());
        assert_eq!(api.deleted_media(), vec!["cfg_vm1.iso".to_string()]);
        assert_eq!(driver.stored_nvram.as_ref().unwrap().pending(), 0);
        assert!(
            SqliteNvramStore::open(&home.path().join("db").join(NVRAM_DB_FILE))
                .unwrap()
                .get(&inst.uuid)
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_resize_flow_order_and_nvram_noop() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let inst = testing::instance("vm1");
        api.add_lpar(testing::lpar_for(&inst, 5, LparState::Running));
        let driver = driver(&api, options(&home)).await;
        let flavor = Flavor::new("large", 4, 8192);

        let flow = driver.resize_flow(&inst, &flavor).unwrap();
        assert_eq!(flow.task_names(), vec!["pwr_off_vm", "resize_vm", "store_nvram"]);

        driver.resize(&inst, &flavor).await.unwrap();
        assert_eq!(api.count("update_lpar"), 1);
        assert_eq!(api.count("read_nvram"), 0);
    }

    #[tokio::test]
    async fn test_available_capacity_refreshes_pool() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let driver = driver(&api, options(&home)).await;

        let capacity = driver.available_capacity().await.unwrap();

        assert_eq!(capacity.total_gb, 49.88);
        assert!((capacity.used_gb - 48.98).abs() < 1e-9);
        assert_eq!(api.count("search_ssps"), 1);
        assert_eq!(api.count("refresh_ssp"), 1);
    }

    #[tokio::test]
    async fn test_volume_helpers_follow_options() {
        let home = TempDir::new().unwrap();
        let api = FakeApi::new();
        let driver = driver(
            &api,
            LparkitOptions {
                fc_attach_strategy: FcAttachStrategy::Npiv,
                ..options(&home)
            },
        )
        .await;
        let inst = testing::instance("vm1");

        assert_eq!(
            driver.volume_driver_kind("fibre_channel").unwrap(),
            VolumeDriverKind::Npiv
        );
        assert_eq!(driver.hostname_for_volume(&inst), "compute1_vm1");
        assert_eq!(
            driver.iscsi_initiator().await.unwrap(),
            "iqn.1994-05.com.example:initiator"
        );
    }
}
