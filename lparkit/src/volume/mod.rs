//! Volume attachment helpers.
//!
//! The attach/detach adapters themselves live outside this crate; this module
//! picks which one a connection needs and computes the host-side names they
//! register with storage.

use crate::api::ManagementApi;
use crate::config::FcAttachStrategy;
use crate::instance::Instance;
use lparkit_shared::errors::{LparkitError, LparkitResult};
use tokio::sync::OnceCell;

/// NPIV host names are truncated to this many characters.
const NPIV_HOST_PREFIX_LEN: usize = 20;

/// Volume adapter that serves a connection type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeDriverKind {
    Iscsi,
    Local,
    Nfs,
    Gpfs,
    VscsiFibreChannel,
    Npiv,
}

/// Adapter for a `driver_volume_type`.
///
/// # Errors
///
/// `InvalidArgument` for connection types no adapter handles.
pub fn volume_driver_kind(
    volume_type: &str,
    strategy: FcAttachStrategy,
) -> LparkitResult<VolumeDriverKind> {
    match volume_type {
        "iscsi" => Ok(VolumeDriverKind::Iscsi),
        "local" => Ok(VolumeDriverKind::Local),
        "nfs" => Ok(VolumeDriverKind::Nfs),
        "gpfs" => Ok(VolumeDriverKind::Gpfs),
        "fibre_channel" => Ok(match strategy {
            FcAttachStrategy::Vscsi => VolumeDriverKind::VscsiFibreChannel,
            FcAttachStrategy::Npiv => VolumeDriverKind::Npiv,
        }),
        other => Err(LparkitError::InvalidArgument(format!(
            "unsupported volume type '{}'",
            other
        ))),
    }
}

/// Host name to register with the storage backend.
///
/// vSCSI volumes are attached through the VIOS, so every instance shares the
/// compute host name. NPIV exposes the client partition directly and needs a
/// per-instance name.
pub fn hostname_for_volume(host: &str, instance: &Instance, strategy: FcAttachStrategy) -> String {
    match strategy {
        FcAttachStrategy::Vscsi => host.to_string(),
        FcAttachStrategy::Npiv => {
            let prefix: String = host.chars().take(NPIV_HOST_PREFIX_LEN).collect();
            format!("{}_{}", prefix, instance.name)
        }
    }
}

/// iSCSI initiator of the management partition, looked up once.
///
/// A failed lookup is not cached and is retried by the next caller. After
/// the first success the value is never invalidated.
#[derive(Debug, Default)]
pub struct IscsiInitiatorCache {
    initiator: OnceCell<String>,
}

impl IscsiInitiatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, api: &dyn ManagementApi) -> LparkitResult<&str> {
        let initiator = self
            .initiator
            .get_or_try_init(|| async {
                let mgmt = api.get_mgmt_partition().await?;
                let initiator = api.discover_iscsi_initiator(&mgmt).await?;
                let initiator = initiator.trim_end().to_string();
                tracing::info!(initiator = %initiator, mgmt = %mgmt.name, "Discovered iSCSI initiator");
                Ok::<_, LparkitError>(initiator)
            })
            .await?;
        Ok(initiator.as_str())
    }

    pub fn cached(&self) -> Option<&str> {
        self.initiator.get().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use uuid::Uuid;

    #[test]
    fn test_volume_driver_table() {
        for (volume_type, kind) in [
            ("iscsi", VolumeDriverKind::Iscsi),
            ("local", VolumeDriverKind::Local),
            ("nfs", VolumeDriverKind::Nfs),
            ("gpfs", VolumeDriverKind::Gpfs),
        ] {
            assert_eq!(
                volume_driver_kind(volume_type, FcAttachStrategy::Vscsi).unwrap(),
                kind
            );
        }

        assert_eq!(
            volume_driver_kind("fibre_channel", FcAttachStrategy::Vscsi).unwrap(),
            VolumeDriverKind::VscsiFibreChannel
        );
        assert_eq!(
            volume_driver_kind("fibre_channel", FcAttachStrategy::Npiv).unwrap(),
            VolumeDriverKind::Npiv
        );
        assert!(matches!(
            volume_driver_kind("rbd", FcAttachStrategy::Vscsi),
            Err(LparkitError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_hostname_for_volume() {
        let inst = Instance::new(Uuid::new_v4(), "instance");

        assert_eq!(
            hostname_for_volume("test_host", &inst, FcAttachStrategy::Vscsi),
            "test_host"
        );
        assert_eq!(
            hostname_for_volume("test_host", &inst, FcAttachStrategy::Npiv),
            "test_host_instance"
        );
        assert_eq!(
            hostname_for_volume("really_long_host_name_too_long", &inst, FcAttachStrategy::Npiv),
            "really_long_host_nam_instance"
        );
    }

    #[tokio::test]
    async fn test_iscsi_initiator_looked_up_once() {
        let api = FakeApi::new();
        api.set_iscsi_initiator("test_initiator\n");
        let cache = IscsiInitiatorCache::new();

        assert_eq!(cache.get(api.as_ref()).await.unwrap(), "test_initiator");
        api.set_iscsi_initiator("other");
        assert_eq!(cache.get(api.as_ref()).await.unwrap(), "test_initiator");

        assert_eq!(api.count("get_mgmt_partition"), 1);
        assert_eq!(api.count("discover_iscsi_initiator"), 1);
    }

    #[tokio::test]
    async fn test_iscsi_initiator_failure_not_cached() {
        let api = FakeApi::new();
        api.fail_on("discover_iscsi_initiator");
        let cache = IscsiInitiatorCache::new();

        assert!(cache.get(api.as_ref()).await.is_err());
        assert!(cache.cached().is_none());
    }
}
