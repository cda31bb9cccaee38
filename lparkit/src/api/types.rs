//! Wrapper types returned by the management API.
//!
//! These mirror the entities of the remote REST API closely enough for the
//! driver's decisions; the wire format is the client's business.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// SHARED STORAGE POOL
// ============================================================================

/// Shared storage pool entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SspWrapper {
    pub uuid: String,
    pub name: String,
    /// Total capacity in GB.
    pub capacity: f64,
    /// Free space in GB.
    pub free_space: f64,
    /// Names of the physical volumes backing the pool.
    #[serde(default)]
    pub physical_volumes: Vec<String>,
}

impl SspWrapper {
    /// Used space in GB, derived from the current attributes.
    pub fn capacity_used(&self) -> f64 {
        self.capacity - self.free_space
    }
}

// ============================================================================
// LOGICAL PARTITIONS
// ============================================================================

/// Partition power state as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LparState {
    NotActivated,
    Starting,
    Running,
    OpenFirmware,
    ShuttingDown,
    Error,
    Unknown,
}

impl LparState {
    /// States from which a power-on request is accepted.
    pub fn can_power_on(self) -> bool {
        matches!(self, Self::NotActivated | Self::Error)
    }

    /// States in which the partition is (or is becoming) active.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::OpenFirmware | Self::ShuttingDown
        )
    }
}

/// Partition operating environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LparEnv {
    AixLinux,
    Os400,
}

/// Partition entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LparWrapper {
    pub uuid: String,
    /// Short partition id, unique on the host (may be recycled).
    pub id: u32,
    pub name: String,
    pub state: LparState,
    pub env: LparEnv,
}

/// Desired partition attributes for create/update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LparSpec {
    /// Partition UUID to assign (derived from the instance UUID).
    pub uuid: String,
    pub name: String,
    pub env: LparEnv,
    pub memory_mb: u64,
    pub vcpus: u32,
    /// Entitled processing units; `None` for dedicated processors.
    pub proc_units: Option<f64>,
    pub dedicated_proc: bool,
    /// Opaque NVRAM blob restored into the new partition.
    pub nvram: Option<String>,
    pub max_virtual_slots: Option<u32>,
}

/// Extra parameters for the power-on job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerOpts {
    pub bootmode: Option<String>,
    pub keylock: Option<String>,
}

/// Boot connectivity used to pick the IBMi load source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootType {
    Vscsi,
    Npiv,
}

impl fmt::Display for BootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vscsi => write!(f, "vscsi"),
            Self::Npiv => write!(f, "npiv"),
        }
    }
}

// ============================================================================
// VIRTUAL I/O SERVERS
// ============================================================================

/// Virtual optical media in the media repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VOptMedia {
    pub name: String,
    pub size_bytes: u64,
}

/// Storage backing a SCSI mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageElement {
    VirtualDisk { name: String },
    VOptMedia { name: String },
    PhysicalVolume { name: String },
    LogicalUnit { name: String, udid: String },
}

impl StorageElement {
    pub fn is_vopt(&self) -> bool {
        matches!(self, Self::VOptMedia { .. })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::VirtualDisk { name }
            | Self::VOptMedia { name }
            | Self::PhysicalVolume { name }
            | Self::LogicalUnit { name, .. } => name,
        }
    }
}

/// Virtual SCSI mapping from a VIOS to a client partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScsiMapping {
    pub client_lpar_id: u32,
    pub backing_storage: Option<StorageElement>,
}

impl ScsiMapping {
    pub fn new(client_lpar_id: u32, backing_storage: StorageElement) -> Self {
        Self {
            client_lpar_id,
            backing_storage: Some(backing_storage),
        }
    }
}

/// Virtual I/O server entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViosWrapper {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub scsi_mappings: Vec<ScsiMapping>,
}

impl ViosWrapper {
    /// Mappings for `client_lpar_id`, optionally filtered by backing type.
    pub fn find_maps(&self, client_lpar_id: u32, vopt_only: bool) -> Vec<&ScsiMapping> {
        self.scsi_mappings
            .iter()
            .filter(|mapping| mapping.client_lpar_id == client_lpar_id)
            .filter(|mapping| {
                !vopt_only
                    || mapping
                        .backing_storage
                        .as_ref()
                        .is_some_and(StorageElement::is_vopt)
            })
            .collect()
    }
}

/// Management partition of the host (hosts the driver itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementPartition {
    pub uuid: String,
    pub id: u32,
    pub name: String,
}

/// Location of the virtual optical media repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VOptRepository {
    pub vios_uuid: String,
    pub volume_group_uuid: String,
}
