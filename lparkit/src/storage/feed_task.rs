//! Batched storage coordinator over the host's VIOS feed.
//!
//! Tasks register work against a `FeedTask` instead of calling the API
//! themselves. `execute` then reads the VIOS feed once, applies every
//! registered operation, writes back each modified VIOS in one request, and
//! finally runs the post-execute operations.

use crate::api::{ManagementApi, ScsiMapping, SharedApi, StorageElement, ViosWrapper};
use lparkit_shared::errors::{LparkitError, LparkitResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Mapping change applied to one VIOS wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Remove every mapping whose client is one of these partition ids.
    ScrubLparStorage { lpar_ids: Vec<u32> },
    /// Add a mapping unless an identical one exists.
    AddScsiMapping(ScsiMapping),
    /// Remove the virtual optical mappings of a client partition.
    RemoveVoptMappings { lpar_id: u32 },
}

/// Work run after every VIOS update succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOp {
    DeleteVoptMedia { vios_uuid: String, names: Vec<String> },
}

#[derive(Debug, Clone)]
struct Subtask {
    /// `None` applies the operation to every VIOS in the feed.
    vios_uuid: Option<String>,
    op: StorageOp,
}

#[derive(Debug, Default)]
struct Pending {
    subtasks: Vec<Subtask>,
    post_execute: Vec<PostOp>,
    executed: bool,
}

/// Counts reported after execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedTaskSummary {
    pub updated_vios: usize,
    pub added_mappings: usize,
    pub removed_mappings: usize,
    pub deleted_media: usize,
}

/// Shared handle; tasks of one flow register against the same coordinator.
pub type SharedFeedTask = Arc<FeedTask>;

/// Deferred, append-only storage coordinator. Executes once.
pub struct FeedTask {
    name: String,
    api: SharedApi,
    host_uuid: String,
    /// Restricts the feed to a single VIOS.
    only_vios: Option<String>,
    feed: OnceCell<Vec<ViosWrapper>>,
    pending: Mutex<Pending>,
}

impl std::fmt::Debug for FeedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedTask")
            .field("name", &self.name)
            .field("host_uuid", &self.host_uuid)
            .field("only_vios", &self.only_vios)
            .finish()
    }
}

impl FeedTask {
    /// Coordinator over every active VIOS of the host.
    pub fn active_vios(api: SharedApi, host_uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api,
            host_uuid: host_uuid.into(),
            only_vios: None,
            feed: OnceCell::new(),
            pending: Mutex::new(Pending::default()),
        }
    }

    /// Coordinator over a single VIOS.
    pub fn single_vios(
        api: SharedApi,
        host_uuid: impl Into<String>,
        name: impl Into<String>,
        vios_uuid: impl Into<String>,
    ) -> Self {
        Self {
            only_vios: Some(vios_uuid.into()),
            ..Self::active_vios(api, host_uuid, name)
        }
    }

    pub fn shared(self) -> SharedFeedTask {
        Arc::new(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_executed(&self) -> bool {
        self.pending.lock().executed
    }

    pub fn pending_subtasks(&self) -> usize {
        self.pending.lock().subtasks.len()
    }

    pub fn pending_post_execute(&self) -> usize {
        self.pending.lock().post_execute.len()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Scrub stale mappings of the given partition ids on every VIOS.
    pub fn add_scrub_lpar_storage(&self, lpar_ids: &[u32]) -> LparkitResult<()> {
        self.push(Subtask {
            vios_uuid: None,
            op: StorageOp::ScrubLparStorage {
                lpar_ids: lpar_ids.to_vec(),
            },
        })
    }

    pub fn add_vios_subtask(&self, vios_uuid: impl Into<String>, op: StorageOp) -> LparkitResult<()> {
        self.push(Subtask {
            vios_uuid: Some(vios_uuid.into()),
            op,
        })
    }

    pub fn add_post_execute(&self, op: PostOp) -> LparkitResult<()> {
        let mut pending = self.pending.lock();
        if pending.executed {
            return Err(self.already_executed());
        }
        pending.post_execute.push(op);
        Ok(())
    }

    fn push(&self, subtask: Subtask) -> LparkitResult<()> {
        let mut pending = self.pending.lock();
        if pending.executed {
            return Err(self.already_executed());
        }
        pending.subtasks.push(subtask);
        Ok(())
    }

    fn already_executed(&self) -> LparkitError {
        LparkitError::InvalidState(format!("storage feed task '{}' already executed", self.name))
    }

    // ------------------------------------------------------------------------
    // Feed access
    // ------------------------------------------------------------------------

    /// VIOS wrappers as read at first access.
    pub async fn wrappers(&self) -> LparkitResult<&[ViosWrapper]> {
        let feed = self
            .feed
            .get_or_try_init(|| async {
                let mut feed = self.api.list_vios(&self.host_uuid).await?;
                if let Some(only) = &self.only_vios {
                    feed.retain(|vios| &vios.uuid == only);
                    if feed.is_empty() {
                        return Err(LparkitError::NotFound(format!("VIOS {}", only)));
                    }
                }
                Ok::<_, LparkitError>(feed)
            })
            .await?;
        Ok(feed.as_slice())
    }

    pub async fn wrapper(&self, vios_uuid: &str) -> LparkitResult<ViosWrapper> {
        self.wrappers()
            .await?
            .iter()
            .find(|vios| vios.uuid == vios_uuid)
            .cloned()
            .ok_or_else(|| LparkitError::NotFound(format!("VIOS {}", vios_uuid)))
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Apply all registered work.
    ///
    /// # Errors
    ///
    /// `InvalidState` on a second call; API errors from the VIOS updates or
    /// post-execute operations.
    pub async fn execute(&self) -> LparkitResult<FeedTaskSummary> {
        let (subtasks, post_execute) = {
            let mut pending = self.pending.lock();
            if pending.executed {
                return Err(self.already_executed());
            }
            pending.executed = true;
            (
                std::mem::take(&mut pending.subtasks),
                std::mem::take(&mut pending.post_execute),
            )
        };

        let mut summary = FeedTaskSummary::default();
        if subtasks.is_empty() && post_execute.is_empty() {
            tracing::debug!(feed_task = %self.name, "No storage work registered");
            return Ok(summary);
        }

        tracing::debug!(
            feed_task = %self.name,
            subtasks = subtasks.len(),
            post_execute = post_execute.len(),
            "Executing storage feed task"
        );

        let mut post_execute = post_execute;
        for vios in self.wrappers().await? {
            let mut updated = vios.clone();
            let mut changed = false;
            for subtask in &subtasks {
                if subtask
                    .vios_uuid
                    .as_deref()
                    .is_some_and(|target| target != vios.uuid)
                {
                    continue;
                }
                changed |= apply(&mut updated, &subtask.op, &mut summary, &mut post_execute);
            }
            if changed {
                self.api.update_vios(&updated).await?;
                summary.updated_vios += 1;
            }
        }

        summary.deleted_media = run_post_execute(self.api.as_ref(), post_execute).await?;

        tracing::info!(
            feed_task = %self.name,
            updated_vios = summary.updated_vios,
            added = summary.added_mappings,
            removed = summary.removed_mappings,
            deleted_media = summary.deleted_media,
            "Storage feed task executed"
        );
        Ok(summary)
    }
}

/// Returns true when the wrapper changed.
fn apply(
    vios: &mut ViosWrapper,
    op: &StorageOp,
    summary: &mut FeedTaskSummary,
    post_execute: &mut Vec<PostOp>,
) -> bool {
    match op {
        StorageOp::ScrubLparStorage { lpar_ids } => {
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut vios.scsi_mappings)
                .into_iter()
                .partition(|mapping| lpar_ids.contains(&mapping.client_lpar_id));
            vios.scsi_mappings = kept;

            let media: Vec<String> = removed
                .iter()
                .filter_map(|mapping| mapping.backing_storage.as_ref())
                .filter(|storage| storage.is_vopt())
                .map(|storage| storage.name().to_string())
                .collect();
            if !media.is_empty() {
                post_execute.push(PostOp::DeleteVoptMedia {
                    vios_uuid: vios.uuid.clone(),
                    names: media,
                });
            }

            if !removed.is_empty() {
                tracing::info!(vios = %vios.name, lpar_ids = ?lpar_ids, removed = removed.len(), "Scrubbed stale storage mappings");
            }
            summary.removed_mappings += removed.len();
            !removed.is_empty()
        }
        StorageOp::AddScsiMapping(mapping) => {
            if vios.scsi_mappings.contains(mapping) {
                return false;
            }
            vios.scsi_mappings.push(mapping.clone());
            summary.added_mappings += 1;
            true
        }
        StorageOp::RemoveVoptMappings { lpar_id } => {
            let before = vios.scsi_mappings.len();
            vios.scsi_mappings.retain(|mapping| {
                mapping.client_lpar_id != *lpar_id
                    || !mapping
                        .backing_storage
                        .as_ref()
                        .is_some_and(StorageElement::is_vopt)
            });
            let removed = before - vios.scsi_mappings.len();
            summary.removed_mappings += removed;
            removed > 0
        }
    }
}

/// Media deletions are merged into one request per VIOS.
async fn run_post_execute(api: &dyn ManagementApi, ops: Vec<PostOp>) -> LparkitResult<usize> {
    let mut by_vios: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for op in ops {
        match op {
            PostOp::DeleteVoptMedia { vios_uuid, names } => {
                let entry = by_vios.entry(vios_uuid).or_default();
                for name in names {
                    if !entry.contains(&name) {
                        entry.push(name);
                    }
                }
            }
        }
    }

    let mut deleted = 0;
    for (vios_uuid, names) in by_vios {
        if names.is_empty() {
            continue;
        }
        api.delete_vopt_media(&vios_uuid, &names).await?;
        deleted += names.len();
    }
    Ok(deleted)
}
