//! Storage tasks.

use crate::instance::SharedInstance;
use crate::media::{ConfigDrive, ConfigDriveRequest};
use crate::pipeline::{FlowStore, FlowTask, LPAR_WRAP, RevertCause, TaskOutput};
use crate::storage::SharedFeedTask;
use async_trait::async_trait;
use lparkit_shared::errors::LparkitResult;
use std::sync::Arc;

/// Run a shared storage coordinator as a step of the flow.
pub struct ExecuteStorageFeed {
    stg_ftsk: SharedFeedTask,
}

impl ExecuteStorageFeed {
    pub fn new(stg_ftsk: SharedFeedTask) -> Self {
        Self { stg_ftsk }
    }
}

#[async_trait]
impl FlowTask for ExecuteStorageFeed {
    fn name(&self) -> &str {
        self.stg_ftsk.name()
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        self.stg_ftsk.execute().await?;
        Ok(TaskOutput::None)
    }
}

/// Build the config drive and attach it to the partition in `lpar_wrap`.
///
/// Reverting removes the media again, best-effort.
pub struct CreateAndConnectCfgDrive {
    cfg_drive: Arc<ConfigDrive>,
    instance: SharedInstance,
    request: ConfigDriveRequest,
    stg_ftsk: Option<SharedFeedTask>,
}

impl CreateAndConnectCfgDrive {
    pub fn new(
        cfg_drive: Arc<ConfigDrive>,
        instance: SharedInstance,
        request: ConfigDriveRequest,
        stg_ftsk: Option<SharedFeedTask>,
    ) -> Self {
        Self {
            cfg_drive,
            instance,
            request,
            stg_ftsk,
        }
    }
}

#[async_trait]
impl FlowTask for CreateAndConnectCfgDrive {
    fn name(&self) -> &str {
        "cfg_vopt"
    }

    async fn execute(&self, store: &FlowStore) -> LparkitResult<TaskOutput> {
        let lpar = store.lpar(LPAR_WRAP)?;
        self.cfg_drive
            .create_cfg_drv_vopt(&self.instance, &self.request, &lpar, self.stg_ftsk.as_ref())
            .await?;
        Ok(TaskOutput::None)
    }

    async fn revert(&self, _cause: RevertCause<'_>, store: &FlowStore) -> LparkitResult<()> {
        let lpar = store.lpar(LPAR_WRAP)?;
        if let Err(e) = self.cfg_drive.dlt_vopt(lpar.id, None, true).await {
            tracing::warn!(instance = %self.instance.uuid, error = %e, "Unable to remove config drive during revert");
        }
        Ok(())
    }
}

/// Remove the partition's config drive media.
pub struct DeleteVOpt {
    cfg_drive: Arc<ConfigDrive>,
    instance: SharedInstance,
    lpar_id: u32,
    stg_ftsk: Option<SharedFeedTask>,
}

impl DeleteVOpt {
    pub fn new(
        cfg_drive: Arc<ConfigDrive>,
        instance: SharedInstance,
        lpar_id: u32,
        stg_ftsk: Option<SharedFeedTask>,
    ) -> Self {
        Self {
            cfg_drive,
            instance,
            lpar_id,
            stg_ftsk,
        }
    }
}

#[async_trait]
impl FlowTask for DeleteVOpt {
    fn name(&self) -> &str {
        "vopt_delete"
    }

    async fn execute(&self, _store: &FlowStore) -> LparkitResult<TaskOutput> {
        tracing::info!(instance = %self.instance.uuid, lpar_id = self.lpar_id, "Deleting config drive media");
        self.cfg_drive
            .dlt_vopt(self.lpar_id, self.stg_ftsk.as_ref(), true)
            .await?;
        Ok(TaskOutput::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{LparState, ScsiMapping, StorageElement, ViosWrapper};
    use crate::media::{ConfigDriveBuilder, InstanceMetadata};
    use crate::storage::FeedTask;
    use crate::testing::{self, FakeApi, HOST_UUID, VIOS_UUID};
    use lparkit_shared::errors::LparkitError;
    use std::path::Path;

    struct EmptyIso;

    impl ConfigDriveBuilder for EmptyIso {
        fn make_drive(&self, _metadata: &InstanceMetadata, iso_path: &Path) -> std::io::Result<()> {
            std::fs::write(iso_path, b"iso")
        }
    }

    async fn cfg_drive(api: Arc<FakeApi>) -> Arc<ConfigDrive> {
        Arc::new(ConfigDrive::new(api, HOST_UUID, Arc::new(EmptyIso)).await.unwrap())
    }

    #[tokio::test]
    async fn test_execute_storage_feed_runs_coordinator() {
        let api = FakeApi::new();
        let stg_ftsk = FeedTask::active_vios(api.clone(), HOST_UUID, "spawn_stg").shared();
        let task = ExecuteStorageFeed::new(Arc::clone(&stg_ftsk));

        assert_eq!(task.name(), "spawn_stg");
        task.execute(&FlowStore::new()).await.unwrap();
        assert!(stg_ftsk.is_executed());
    }

    #[tokio::test]
    async fn test_cfg_drive_requires_lpar_wrap() {
        let api = FakeApi::new();
        let task = CreateAndConnectCfgDrive::new(
            cfg_drive(api.clone()).await,
            testing::instance("vm1"),
            ConfigDriveRequest::default(),
            None,
        );

        let result = task.execute(&FlowStore::new()).await;

        assert!(matches!(result, Err(LparkitError::Internal(_))));
        assert_eq!(api.count("upload_vopt"), 0);
    }

    #[tokio::test]
    async fn test_cfg_drive_revert_removes_media() {
        let api = FakeApi::new();
        let inst = testing::instance("vm1");
        let store = FlowStore::new();
        store.insert(
            LPAR_WRAP,
            TaskOutput::Lpar(testing::lpar_for(&inst, 6, LparState::NotActivated)),
        );
        let task = CreateAndConnectCfgDrive::new(
            cfg_drive(api.clone()).await,
            inst,
            ConfigDriveRequest::default(),
            None,
        );

        task.execute(&store).await.unwrap();
        assert_eq!(api.vios()[0].find_maps(6, true).len(), 1);

        let err = LparkitError::Internal("later".into());
        task.revert(
            RevertCause::DownstreamFailed {
                task: "pwr_vm",
                error: &err,
            },
            &store,
        )
        .await
        .unwrap();

        assert!(api.vios()[0].find_maps(6, true).is_empty());
        assert_eq!(api.deleted_media().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_vopt_registers_on_shared_coordinator() {
        let api = FakeApi::new();
        api.set_vios(vec![ViosWrapper {
            uuid: VIOS_UUID.into(),
            name: "vios1".into(),
            scsi_mappings: vec![ScsiMapping::new(
                6,
                StorageElement::VOptMedia {
                    name: "cfg_6.iso".into(),
                },
            )],
        }]);
        let stg_ftsk = FeedTask::active_vios(api.clone(), HOST_UUID, "destroy_stg").shared();
        let task = DeleteVOpt::new(
            cfg_drive(api.clone()).await,
            testing::instance("vm1"),
            6,
            Some(Arc::clone(&stg_ftsk)),
        );

        task.execute(&FlowStore::new()).await.unwrap();

        assert_eq!(api.count("update_vios"), 0);
        assert_eq!(stg_ftsk.pending_subtasks(), 1);
        assert_eq!(stg_ftsk.pending_post_execute(), 1);
    }
}
