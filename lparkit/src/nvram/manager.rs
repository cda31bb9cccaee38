use super::NvramManager;
use super::store::NvramStore;
use crate::api::SharedApi;
use crate::instance::Instance;
use crate::vm::pvm_uuid;
use async_trait::async_trait;
use lparkit_shared::errors::LparkitResult;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// [`NvramManager`] that copies the blob from the host into a store.
///
/// Deferred stores are keyed by instance, so repeated requests before a
/// [`flush`](Self::flush) collapse into one read.
pub struct StoreNvramManager {
    api: SharedApi,
    store: Arc<dyn NvramStore>,
    /// Instance UUID to partition UUID.
    pending: Mutex<BTreeMap<Uuid, String>>,
}

impl StoreNvramManager {
    pub fn new(api: SharedApi, store: Arc<dyn NvramStore>) -> Self {
        Self {
            api,
            store,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Write every deferred store. Returns how many blobs were rewritten.
    ///
    /// A failing entry is logged and dropped; the others still run.
    pub async fn flush(&self) -> usize {
        let queued = std::mem::take(&mut *self.pending.lock());
        let mut written = 0;
        for (instance_uuid, lpar_uuid) in queued {
            match self.persist(&instance_uuid, &lpar_uuid).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(instance = %instance_uuid, error = %e, "Deferred NVRAM store failed");
                }
            }
        }
        written
    }

    /// Returns true when the stored blob changed.
    async fn persist(&self, instance_uuid: &Uuid, lpar_uuid: &str) -> LparkitResult<bool> {
        let Some(data) = self.api.read_nvram(lpar_uuid).await? else {
            tracing::debug!(instance = %instance_uuid, "Partition has no NVRAM");
            return Ok(false);
        };

        let digest = hex::encode(Sha256::digest(data.as_bytes()));
        if let Some(existing) = self.store.get(instance_uuid)?
            && existing.digest == digest
        {
            tracing::debug!(instance = %instance_uuid, "NVRAM unchanged");
            return Ok(false);
        }

        self.store.put(instance_uuid, &data, &digest)?;
        tracing::info!(instance = %instance_uuid, bytes = data.len(), "Stored NVRAM");
        Ok(true)
    }
}

#[async_trait]
impl NvramManager for StoreNvramManager {
    async fn fetch(&self, instance: &Instance) -> LparkitResult<Option<String>> {
        Ok(self.store.get(&instance.uuid)?.map(|record| record.data))
    }

    async fn store(&self, instance: &Instance, immediate: bool) -> LparkitResult<()> {
        let lpar_uuid = pvm_uuid(instance);
        if immediate {
            self.pending.lock().remove(&instance.uuid);
            self.persist(&instance.uuid, &lpar_uuid).await?;
        } else {
            self.pending.lock().insert(instance.uuid, lpar_uuid);
        }
        Ok(())
    }

    async fn remove(&self, instance: &Instance) -> LparkitResult<()> {
        self.pending.lock().remove(&instance.uuid);
        if self.store.delete(&instance.uuid)? {
            tracing::info!(instance = %instance.uuid, "Removed NVRAM");
        }
        Ok(())
    }
}
