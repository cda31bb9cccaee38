//! Shared storage pool resolver.

use crate::api::{ManagementApi, SharedApi, SspWrapper};
use lparkit_shared::errors::{LparkitError, LparkitResult, StoragePoolError};
use parking_lot::Mutex;

/// Identify the shared storage pool.
///
/// With a configured name this is a name-filtered search; without one it is
/// a scan of every pool on the host. Exactly one match is required.
pub async fn resolve_ssp(
    api: &dyn ManagementApi,
    configured_name: Option<&str>,
) -> LparkitResult<SspWrapper> {
    match configured_name {
        Some(name) => {
            let mut found = api.search_ssps(name).await?;
            match found.len() {
                0 => Err(StoragePoolError::NotFoundByName { name: name.into() }.into()),
                1 => Ok(found.remove(0)),
                count => Err(StoragePoolError::TooManyFound {
                    name: name.into(),
                    count,
                }
                .into()),
            }
        }
        None => {
            let mut found = api.list_ssps().await?;
            match found.len() {
                0 => Err(StoragePoolError::NoConfigNoneFound.into()),
                1 => Ok(found.remove(0)),
                count => Err(StoragePoolError::NoConfigTooManyFound { count }.into()),
            }
        }
    }
}

/// Resolved shared storage pool with a refresh-on-read cache.
///
/// Identity resolution is a host-wide scan and happens once, in
/// [`SspResolver::new`]. Later reads re-read the identified pool only.
pub struct SspResolver {
    api: SharedApi,
    configured_name: Option<String>,
    cached: Mutex<SspWrapper>,
}

impl std::fmt::Debug for SspResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SspResolver")
            .field("configured_name", &self.configured_name)
            .field("cached", &*self.cached.lock())
            .finish()
    }
}

impl SspResolver {
    /// Resolve the pool and cache it.
    ///
    /// # Errors
    ///
    /// One of the [`StoragePoolError`] kinds when the pool is absent or
    /// ambiguous; these are configuration problems and are not retried.
    pub async fn new(api: SharedApi, configured_name: Option<String>) -> LparkitResult<Self> {
        let ssp = resolve_ssp(api.as_ref(), configured_name.as_deref()).await?;
        tracing::info!(ssp = %ssp.name, ssp_uuid = %ssp.uuid, "Resolved shared storage pool");
        Ok(Self {
            api,
            configured_name,
            cached: Mutex::new(ssp),
        })
    }

    /// Cached pool without a remote call.
    pub fn cached(&self) -> SspWrapper {
        self.cached.lock().clone()
    }

    pub fn name(&self) -> String {
        self.cached.lock().name.clone()
    }

    /// Re-read the cached pool and update the cache.
    ///
    /// A pool that vanished since resolution invalidates the cache and
    /// triggers one full re-resolution.
    pub async fn refresh(&self) -> LparkitResult<SspWrapper> {
        let current = self.cached();
        let fresh = match self.api.refresh_ssp(&current).await {
            Ok(fresh) => fresh,
            Err(LparkitError::NotFound(_)) => {
                tracing::warn!(ssp = %current.name, "Cached shared storage pool is gone, resolving again");
                resolve_ssp(self.api.as_ref(), self.configured_name.as_deref()).await?
            }
            Err(e) => return Err(e),
        };
        *self.cached.lock() = fresh.clone();
        Ok(fresh)
    }

    /// Total capacity in GB.
    pub async fn capacity(&self) -> LparkitResult<f64> {
        Ok(self.refresh().await?.capacity)
    }

    /// Used capacity in GB, recomputed from a fresh read.
    pub async fn capacity_used(&self) -> LparkitResult<f64> {
        Ok(self.refresh().await?.capacity_used())
    }
}
