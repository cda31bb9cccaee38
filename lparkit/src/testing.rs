//! In-memory management API used by unit tests.

use crate::api::{
    BootType, LparEnv, LparSpec, LparState, LparWrapper, ManagementApi, ManagementPartition,
    PowerOpts, SspWrapper, VOptMedia, VOptRepository, ViosWrapper,
};
use crate::instance::{Instance, SharedInstance};
use async_trait::async_trait;
use lparkit_shared::errors::{LparkitError, LparkitResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) const HOST_UUID: &str = "host-uuid";
pub(crate) const VIOS_UUID: &str = "vios-uuid";

#[derive(Default)]
struct FakeState {
    search_result: Vec<SspWrapper>,
    feed_result: Vec<SspWrapper>,
    refreshed: Option<SspWrapper>,
    ssp_gone: bool,
    lpars: HashMap<String, LparWrapper>,
    next_lpar_id: u32,
    vios: Vec<ViosWrapper>,
    nvram: HashMap<String, String>,
    deleted_media: Vec<String>,
    iscsi_initiator: String,
    failing: HashSet<String>,
    calls: Vec<String>,
    power_off_forces: Vec<bool>,
}

/// Recording fake of [`ManagementApi`].
#[derive(Default)]
pub(crate) struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub(crate) fn new() -> Arc<Self> {
        let api = Self::default();
        {
            let mut state = api.state.lock();
            state.next_lpar_id = 2;
            state.iscsi_initiator = "iqn.1994-05.com.example:initiator".into();
            state.vios.push(ViosWrapper {
                uuid: VIOS_UUID.into(),
                name: "vios1".into(),
                scsi_mappings: Vec::new(),
            });
        }
        Arc::new(api)
    }

    pub(crate) fn set_search_result(&self, ssps: Vec<SspWrapper>) {
        self.state.lock().search_result = ssps;
    }

    pub(crate) fn set_feed_result(&self, ssps: Vec<SspWrapper>) {
        self.state.lock().feed_result = ssps;
    }

    pub(crate) fn set_refreshed(&self, ssp: SspWrapper) {
        self.state.lock().refreshed = Some(ssp);
    }

    /// Report the cached pool as deleted on the next refresh.
    pub(crate) fn set_ssp_gone(&self, gone: bool) {
        self.state.lock().ssp_gone = gone;
    }

    pub(crate) fn add_lpar(&self, lpar: LparWrapper) {
        self.state.lock().lpars.insert(lpar.uuid.clone(), lpar);
    }

    pub(crate) fn lpar(&self, uuid: &str) -> Option<LparWrapper> {
        self.state.lock().lpars.get(uuid).cloned()
    }

    pub(crate) fn set_vios(&self, vios: Vec<ViosWrapper>) {
        self.state.lock().vios = vios;
    }

    pub(crate) fn vios(&self) -> Vec<ViosWrapper> {
        self.state.lock().vios.clone()
    }

    pub(crate) fn set_nvram(&self, lpar_uuid: &str, data: &str) {
        self.state.lock().nvram.insert(lpar_uuid.into(), data.into());
    }

    pub(crate) fn set_iscsi_initiator(&self, initiator: &str) {
        self.state.lock().iscsi_initiator = initiator.into();
    }

    pub(crate) fn deleted_media(&self) -> Vec<String> {
        self.state.lock().deleted_media.clone()
    }

    /// Make every call to `op` fail.
    pub(crate) fn fail_on(&self, op: &str) {
        self.state.lock().failing.insert(op.into());
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        self.state.lock().calls.iter().filter(|call| *call == op).count()
    }

    /// `force_immediate` of every `power_off` call, in call order.
    pub(crate) fn power_off_forces(&self) -> Vec<bool> {
        self.state.lock().power_off_forces.clone()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn record(&self, op: &str) -> LparkitResult<parking_lot::MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock();
        state.calls.push(op.to_string());
        if state.failing.contains(op) {
            return Err(LparkitError::api(op, "injected failure"));
        }
        Ok(state)
    }
}

pub(crate) fn ssp(name: &str, capacity: f64, free_space: f64) -> SspWrapper {
    SspWrapper {
        uuid: format!("{name}-uuid"),
        name: name.into(),
        capacity,
        free_space,
        physical_volumes: vec!["hdisk1".into()],
    }
}

pub(crate) fn instance(name: &str) -> SharedInstance {
    Instance::new(Uuid::new_v4(), name).into_shared()
}

pub(crate) fn lpar_for(instance: &Instance, id: u32, state: LparState) -> LparWrapper {
    LparWrapper {
        uuid: crate::vm::pvm_uuid(instance),
        id,
        name: instance.name.clone(),
        state,
        env: LparEnv::AixLinux,
    }
}

#[async_trait]
impl ManagementApi for FakeApi {
    async fn search_ssps(&self, _name: &str) -> LparkitResult<Vec<SspWrapper>> {
        Ok(self.record("search_ssps")?.search_result.clone())
    }

    async fn list_ssps(&self) -> LparkitResult<Vec<SspWrapper>> {
        Ok(self.record("list_ssps")?.feed_result.clone())
    }

    async fn refresh_ssp(&self, ssp: &SspWrapper) -> LparkitResult<SspWrapper> {
        let state = self.record("refresh_ssp")?;
        if state.ssp_gone {
            return Err(LparkitError::NotFound(ssp.uuid.clone()));
        }
        Ok(state.refreshed.clone().unwrap_or_else(|| ssp.clone()))
    }

    async fn get_lpar(&self, lpar_uuid: &str) -> LparkitResult<LparWrapper> {
        self.record("get_lpar")?
            .lpars
            .get(lpar_uuid)
            .cloned()
            .ok_or_else(|| LparkitError::NotFound(lpar_uuid.into()))
    }

    async fn create_lpar(&self, _host_uuid: &str, spec: &LparSpec) -> LparkitResult<LparWrapper> {
        let mut state = self.record("create_lpar")?;
        let id = state.next_lpar_id;
        state.next_lpar_id += 1;
        let wrapper = LparWrapper {
            uuid: spec.uuid.clone(),
            id,
            name: spec.name.clone(),
            state: LparState::NotActivated,
            env: spec.env,
        };
        state.lpars.insert(wrapper.uuid.clone(), wrapper.clone());
        Ok(wrapper)
    }

    async fn update_lpar(&self, lpar_uuid: &str, spec: &LparSpec) -> LparkitResult<LparWrapper> {
        let mut state = self.record("update_lpar")?;
        let wrapper = state
            .lpars
            .get_mut(lpar_uuid)
            .ok_or_else(|| LparkitError::NotFound(lpar_uuid.into()))?;
        wrapper.name = spec.name.clone();
        Ok(wrapper.clone())
    }

    async fn rename_lpar(&self, lpar_uuid: &str, name: &str) -> LparkitResult<LparWrapper> {
        let mut state = self.record("rename_lpar")?;
        let wrapper = state
            .lpars
            .get_mut(lpar_uuid)
            .ok_or_else(|| LparkitError::NotFound(lpar_uuid.into()))?;
        wrapper.name = name.into();
        Ok(wrapper.clone())
    }

    async fn delete_lpar(&self, lpar_uuid: &str) -> LparkitResult<()> {
        self.record("delete_lpar")?
            .lpars
            .remove(lpar_uuid)
            .map(|_| ())
            .ok_or_else(|| LparkitError::NotFound(lpar_uuid.into()))
    }

    async fn power_on(&self, lpar_uuid: &str, _opts: Option<&PowerOpts>) -> LparkitResult<()> {
        if let Some(wrapper) = self.record("power_on")?.lpars.get_mut(lpar_uuid) {
            wrapper.state = LparState::Running;
        }
        Ok(())
    }

    async fn power_off(&self, lpar_uuid: &str, force_immediate: bool) -> LparkitResult<()> {
        let mut state = self.record("power_off")?;
        state.power_off_forces.push(force_immediate);
        if let Some(wrapper) = state.lpars.get_mut(lpar_uuid) {
            wrapper.state = LparState::NotActivated;
        }
        Ok(())
    }

    async fn update_ibmi_settings(
        &self,
        _lpar_uuid: &str,
        _boot_type: BootType,
    ) -> LparkitResult<()> {
        self.record("update_ibmi_settings")?;
        Ok(())
    }

    async fn read_nvram(&self, lpar_uuid: &str) -> LparkitResult<Option<String>> {
        Ok(self.record("read_nvram")?.nvram.get(lpar_uuid).cloned())
    }

    async fn list_vios(&self, _host_uuid: &str) -> LparkitResult<Vec<ViosWrapper>> {
        Ok(self.record("list_vios")?.vios.clone())
    }

    async fn update_vios(&self, vios: &ViosWrapper) -> LparkitResult<ViosWrapper> {
        let mut state = self.record("update_vios")?;
        if let Some(existing) = state.vios.iter_mut().find(|v| v.uuid == vios.uuid) {
            *existing = vios.clone();
        }
        Ok(vios.clone())
    }

    async fn find_vopt_repository(&self) -> LparkitResult<VOptRepository> {
        self.record("find_vopt_repository")?;
        Ok(VOptRepository {
            vios_uuid: VIOS_UUID.into(),
            volume_group_uuid: "rootvg-uuid".into(),
        })
    }

    async fn upload_vopt(
        &self,
        _vios_uuid: &str,
        _path: &Path,
        name: &str,
        size_bytes: u64,
    ) -> LparkitResult<VOptMedia> {
        self.record("upload_vopt")?;
        Ok(VOptMedia {
            name: name.into(),
            size_bytes,
        })
    }

    async fn delete_vopt_media(&self, _vios_uuid: &str, names: &[String]) -> LparkitResult<()> {
        self.record("delete_vopt_media")?
            .deleted_media
            .extend(names.iter().cloned());
        Ok(())
    }

    async fn get_mgmt_partition(&self) -> LparkitResult<ManagementPartition> {
        self.record("get_mgmt_partition")?;
        Ok(ManagementPartition {
            uuid: "mgmt-uuid".into(),
            id: 1,
            name: "mgmt".into(),
        })
    }

    async fn discover_iscsi_initiator(
        &self,
        _mgmt: &ManagementPartition,
    ) -> LparkitResult<String> {
        Ok(self.record("discover_iscsi_initiator")?.iscsi_initiator.clone())
    }
}
