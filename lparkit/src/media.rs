//! Configuration drive media.
//!
//! The config drive is an ISO image carrying instance metadata. It is built
//! locally, uploaded into the host's virtual optical media repository and
//! mapped to the partition through a [`FeedTask`].

use crate::api::{LparWrapper, ScsiMapping, SharedApi, StorageElement, VOptMedia};
use crate::instance::Instance;
use crate::storage::{FeedTask, PostOp, SharedFeedTask, StorageOp};
use crate::vm::pvm_uuid;
use lparkit_shared::errors::{LparkitError, LparkitResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Longest virtual optical media name the host accepts.
pub const VOPT_NAME_MAX_LEN: usize = 37;

const ISO_SUFFIX: &str = ".iso";
const MGMT_VIF_ID: &str = "mgmt_vif";
const OVS_VIF_TYPE: &str = "ovs";
const GENERIC_VIF_TYPE: &str = "vif";

// ============================================================================
// NETWORK INFO
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedIp {
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subnet {
    pub version: u8,
    pub cidr: String,
    pub ips: Vec<FixedIp>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub subnets: Vec<Subnet>,
}

/// One virtual interface of the instance's network info.
///
/// Fields this crate does not interpret are carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vif {
    pub id: String,
    #[serde(rename = "type")]
    pub vif_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<Network>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Rewrite every VIF type except `ovs` to the generic `vif`.
///
/// The guest-side network configuration only understands those two.
pub fn sanitize_network_info(network_info: &[Vif]) -> Vec<Vif> {
    network_info
        .iter()
        .map(|vif| {
            let mut vif = vif.clone();
            if vif.vif_type != OVS_VIF_TYPE {
                vif.vif_type = GENERIC_VIF_TYPE.to_string();
            }
            vif
        })
        .collect()
}

fn parse_mac(mac: &str) -> LparkitResult<[u8; 6]> {
    let digits: String = mac.chars().filter(|c| *c != ':').collect();
    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LparkitError::InvalidArgument(format!(
            "invalid MAC address '{}'",
            mac
        )));
    }

    let mut octets = [0u8; 6];
    for (i, octet) in octets.iter_mut().enumerate() {
        *octet = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
            .map_err(|e| LparkitError::InvalidArgument(format!("invalid MAC '{}': {}", mac, e)))?;
    }
    Ok(octets)
}

fn format_mac(octets: &[u8; 6]) -> String {
    octets
        .iter()
        .map(|octet| format!("{:02x}", octet))
        .collect::<Vec<_>>()
        .join(":")
}

/// EUI-64 IPv6 link-local address for a MAC address.
///
/// Groups are always four hex digits, so `00:00:00:00:00:00` maps to
/// `fe80::0200:00ff:fe00:0000`.
pub fn mac_to_link_local(mac: &str) -> LparkitResult<String> {
    let m = parse_mac(mac)?;
    let eui = [m[0] ^ 0x02, m[1], m[2], 0xff, 0xfe, m[3], m[4], m[5]];
    let groups: Vec<String> = eui
        .chunks(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect();
    Ok(format!("fe80::{}", groups.join(":")))
}

/// VIF describing the management adapter, reachable over link-local IPv6.
pub fn mgmt_cna_to_vif(mac: &str) -> LparkitResult<Vif> {
    let octets = parse_mac(mac)?;
    let address = format_mac(&octets);
    let link_local = mac_to_link_local(&address)?;

    Ok(Vif {
        id: MGMT_VIF_ID.to_string(),
        vif_type: GENERIC_VIF_TYPE.to_string(),
        address: Some(address),
        network: Some(Network {
            subnets: vec![Subnet {
                version: 6,
                cidr: "fe80::/64".to_string(),
                ips: vec![FixedIp { address: link_local }],
            }],
        }),
        extra: serde_json::Map::new(),
    })
}

// ============================================================================
// CONFIG DRIVE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectedFile {
    pub path: String,
    pub contents: Vec<u8>,
}

/// Everything written into the config drive image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceMetadata {
    pub instance_uuid: Uuid,
    pub lpar_uuid: String,
    pub hostname: String,
    pub files: Vec<InjectedFile>,
    pub network_info: Vec<Vif>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_pass: Option<String>,
}

/// Writes an ISO image for the metadata to `iso_path`.
pub trait ConfigDriveBuilder: Send + Sync {
    fn make_drive(&self, metadata: &InstanceMetadata, iso_path: &Path) -> std::io::Result<()>;
}

/// Inputs to a config drive besides the instance itself.
#[derive(Debug, Clone, Default)]
pub struct ConfigDriveRequest {
    pub files: Vec<InjectedFile>,
    pub network_info: Vec<Vif>,
    pub admin_pass: Option<String>,
    /// MAC of the management client network adapter, if any.
    pub mgmt_cna_mac: Option<String>,
}

/// Media name for an instance's config drive.
pub fn cfg_drive_name(instance: &Instance) -> String {
    let mut name = format!("cfg_{}", instance.uuid.simple());
    name.truncate(VOPT_NAME_MAX_LEN - ISO_SUFFIX.len());
    name.push_str(ISO_SUFFIX);
    name
}

/// Builds, attaches and removes config drive media.
pub struct ConfigDrive {
    api: SharedApi,
    host_uuid: String,
    builder: Arc<dyn ConfigDriveBuilder>,
    /// VIOS hosting the media repository.
    vios_uuid: String,
}

impl ConfigDrive {
    /// Locate the media repository.
    ///
    /// # Errors
    ///
    /// Fails when the host has no virtual optical media repository.
    pub async fn new(
        api: SharedApi,
        host_uuid: impl Into<String>,
        builder: Arc<dyn ConfigDriveBuilder>,
    ) -> LparkitResult<Self> {
        let repo = api.find_vopt_repository().await?;
        tracing::debug!(vios = %repo.vios_uuid, volume_group = %repo.volume_group_uuid, "Found media repository");
        Ok(Self {
            api,
            host_uuid: host_uuid.into(),
            builder,
            vios_uuid: repo.vios_uuid,
        })
    }

    /// Build the ISO at `iso_path`, retrying once on a local I/O fault.
    pub fn create_cfg_dr_iso(
        &self,
        instance: &Instance,
        request: &ConfigDriveRequest,
        iso_path: &Path,
    ) -> LparkitResult<()> {
        let mut network_info = sanitize_network_info(&request.network_info);
        if let Some(mac) = &request.mgmt_cna_mac {
            network_info.push(mgmt_cna_to_vif(mac)?);
        }

        let metadata = InstanceMetadata {
            instance_uuid: instance.uuid,
            lpar_uuid: pvm_uuid(instance),
            hostname: instance.name.clone(),
            files: request.files.clone(),
            network_info,
            admin_pass: request.admin_pass.clone(),
        };

        tracing::info!(instance = %instance.uuid, path = %iso_path.display(), "Creating config drive");
        if let Err(e) = self.builder.make_drive(&metadata, iso_path) {
            tracing::warn!(instance = %instance.uuid, error = %e, "Config drive creation failed, retrying");
            self.builder.make_drive(&metadata, iso_path)?;
        }
        Ok(())
    }

    /// Build the config drive, upload it and map it to the partition.
    ///
    /// With `stg_ftsk` the mapping is only registered; otherwise a private
    /// coordinator is executed before returning.
    pub async fn create_cfg_drv_vopt(
        &self,
        instance: &Instance,
        request: &ConfigDriveRequest,
        lpar: &LparWrapper,
        stg_ftsk: Option<&SharedFeedTask>,
    ) -> LparkitResult<VOptMedia> {
        let iso = tempfile::Builder::new()
            .prefix("cfgdrv")
            .suffix(ISO_SUFFIX)
            .tempfile()?;
        self.create_cfg_dr_iso(instance, request, iso.path())?;

        let size_bytes = std::fs::metadata(iso.path())?.len();
        let name = cfg_drive_name(instance);
        let media = self
            .api
            .upload_vopt(&self.vios_uuid, iso.path(), &name, size_bytes)
            .await?;
        tracing::info!(instance = %instance.uuid, media = %media.name, size_bytes, "Uploaded config drive");

        self.attach_vopt(lpar, &media, stg_ftsk).await?;
        Ok(media)
    }

    async fn attach_vopt(
        &self,
        lpar: &LparWrapper,
        media: &VOptMedia,
        stg_ftsk: Option<&SharedFeedTask>,
    ) -> LparkitResult<()> {
        let op = StorageOp::AddScsiMapping(ScsiMapping::new(
            lpar.id,
            StorageElement::VOptMedia {
                name: media.name.clone(),
            },
        ));

        match stg_ftsk {
            Some(stg_ftsk) => stg_ftsk.add_vios_subtask(self.vios_uuid.clone(), op),
            None => {
                let local = self.local_feed_task("cfg_drive_attach");
                local.add_vios_subtask(self.vios_uuid.clone(), op)?;
                local.execute().await.map(|_| ())
            }
        }
    }

    /// Remove the partition's config drive media.
    ///
    /// With `remove_mappings` the mappings are removed before the media is
    /// deleted. Without it only the media behind existing mappings is
    /// queued for deletion.
    pub async fn dlt_vopt(
        &self,
        lpar_id: u32,
        stg_ftsk: Option<&SharedFeedTask>,
        remove_mappings: bool,
    ) -> LparkitResult<()> {
        let local;
        let ftsk: &FeedTask = match stg_ftsk {
            Some(shared) => shared,
            None => {
                local = self.local_feed_task("media_detach");
                &local
            }
        };

        if remove_mappings {
            self.add_dlt_vopt_tasks(lpar_id, ftsk).await?;
        } else {
            let names = self.vopt_names(lpar_id, ftsk).await?;
            if !names.is_empty() {
                ftsk.add_post_execute(PostOp::DeleteVoptMedia {
                    vios_uuid: self.vios_uuid.clone(),
                    names,
                })?;
            }
        }

        if stg_ftsk.is_none() {
            ftsk.execute().await?;
        }
        Ok(())
    }

    /// Register removal of the partition's media mappings and deletion of
    /// the media against `stg_ftsk`.
    pub async fn add_dlt_vopt_tasks(&self, lpar_id: u32, stg_ftsk: &FeedTask) -> LparkitResult<()> {
        let names = self.vopt_names(lpar_id, stg_ftsk).await?;

        stg_ftsk.add_vios_subtask(
            self.vios_uuid.clone(),
            StorageOp::RemoveVoptMappings { lpar_id },
        )?;
        if !names.is_empty() {
            stg_ftsk.add_post_execute(PostOp::DeleteVoptMedia {
                vios_uuid: self.vios_uuid.clone(),
                names,
            })?;
        }
        Ok(())
    }

    async fn vopt_names(&self, lpar_id: u32, stg_ftsk: &FeedTask) -> LparkitResult<Vec<String>> {
        let vios = stg_ftsk.wrapper(&self.vios_uuid).await?;
        Ok(vios
            .find_maps(lpar_id, true)
            .into_iter()
            .filter_map(|mapping| mapping.backing_storage.as_ref())
            .map(|storage| storage.name().to_string())
            .collect())
    }

    fn local_feed_task(&self, name: &str) -> FeedTask {
        FeedTask::single_vios(
            self.api.clone(),
            self.host_uuid.clone(),
            name,
            self.vios_uuid.clone(),
        )
    }
}
