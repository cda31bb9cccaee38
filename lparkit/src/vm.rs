//! Partition helpers shared by the lifecycle tasks.

use crate::api::{BootType, LparEnv, LparSpec, LparWrapper, ManagementApi, PowerOpts};
use crate::config::LparkitOptions;
use crate::instance::{Flavor, Instance};
use lparkit_shared::errors::{LparkitError, LparkitResult};

pub const PROC_UNITS_SPEC: &str = "powervm:proc_units";
pub const DEDICATED_PROC_SPEC: &str = "powervm:dedicated_proc";

/// Managed system the partitions are placed on.
#[derive(Debug, Clone, PartialEq)]
pub struct HostDescriptor {
    pub uuid: String,
    pub proc_units_factor: f64,
}

impl HostDescriptor {
    pub fn new(uuid: impl Into<String>, proc_units_factor: f64) -> Self {
        Self {
            uuid: uuid.into(),
            proc_units_factor,
        }
    }

    pub fn from_options(options: &LparkitOptions) -> Self {
        Self::new(options.host_uuid.clone(), options.proc_units_factor)
    }
}

/// Tracks the maximum number of virtual slots a partition needs.
pub trait SlotManager: Send + Sync {
    fn max_virtual_slots(&self) -> Option<u32>;
}

/// Partition UUID for an instance.
///
/// The host requires the leading bit of a partition UUID to be clear, so the
/// first hex digit is masked with 7. The result is upper case.
pub fn pvm_uuid(instance: &Instance) -> String {
    let raw = instance.uuid.as_hyphenated().to_string();
    let mut chars = raw.chars();
    let first = chars.next().and_then(|c| c.to_digit(16)).unwrap_or(0) & 7;
    format!("{:x}{}", first, chars.as_str()).to_uppercase()
}

/// Attributes for a partition built from a flavor.
pub fn build_lpar_spec(
    host: &HostDescriptor,
    instance: &Instance,
    flavor: &Flavor,
    name: Option<&str>,
    nvram: Option<String>,
    slot_mgr: Option<&dyn SlotManager>,
) -> LparkitResult<LparSpec> {
    let dedicated_proc = match flavor.extra_specs.get(DEDICATED_PROC_SPEC) {
        Some(value) => parse_bool(DEDICATED_PROC_SPEC, value)?,
        None => false,
    };

    let proc_units = if dedicated_proc {
        None
    } else {
        match flavor.extra_specs.get(PROC_UNITS_SPEC) {
            Some(value) => Some(value.parse::<f64>().map_err(|_| {
                LparkitError::InvalidArgument(format!(
                    "flavor {}: {} is not a number: '{}'",
                    flavor.name, PROC_UNITS_SPEC, value
                ))
            })?),
            None => Some(round_proc_units(
                f64::from(flavor.vcpus) * host.proc_units_factor,
            )),
        }
    };

    Ok(LparSpec {
        uuid: pvm_uuid(instance),
        name: name.unwrap_or(&instance.name).to_string(),
        env: if instance.is_ibmi() {
            LparEnv::Os400
        } else {
            LparEnv::AixLinux
        },
        memory_mb: flavor.memory_mb,
        vcpus: flavor.vcpus,
        proc_units,
        dedicated_proc,
        nvram,
        max_virtual_slots: slot_mgr.and_then(|mgr| mgr.max_virtual_slots()),
    })
}

fn parse_bool(key: &str, value: &str) -> LparkitResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(LparkitError::InvalidArgument(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}

fn round_proc_units(units: f64) -> f64 {
    (units * 100.0).round() / 100.0
}

// ============================================================================
// REMOTE OPERATIONS
// ============================================================================

pub async fn get_instance_wrapper(
    api: &dyn ManagementApi,
    instance: &Instance,
) -> LparkitResult<LparWrapper> {
    api.get_lpar(&pvm_uuid(instance)).await
}

pub async fn crt_lpar(
    api: &dyn ManagementApi,
    host: &HostDescriptor,
    spec: &LparSpec,
) -> LparkitResult<LparWrapper> {
    let wrapper = api.create_lpar(&host.uuid, spec).await?;
    tracing::debug!(lpar = %wrapper.uuid, lpar_id = wrapper.id, "Created partition");
    Ok(wrapper)
}

pub async fn update(
    api: &dyn ManagementApi,
    instance: &Instance,
    spec: &LparSpec,
) -> LparkitResult<LparWrapper> {
    api.update_lpar(&pvm_uuid(instance), spec).await
}

pub async fn rename(
    api: &dyn ManagementApi,
    instance: &Instance,
    name: &str,
) -> LparkitResult<LparWrapper> {
    api.rename_lpar(&pvm_uuid(instance), name).await
}

/// Delete a partition. An already-absent partition counts as deleted.
pub async fn dlt_lpar(api: &dyn ManagementApi, lpar_uuid: &str) -> LparkitResult<()> {
    match api.delete_lpar(lpar_uuid).await {
        Ok(()) => Ok(()),
        Err(LparkitError::NotFound(_)) => {
            tracing::info!(lpar = %lpar_uuid, "Partition already deleted");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Power on unless the partition is already active.
pub async fn power_on(
    api: &dyn ManagementApi,
    instance: &Instance,
    opts: Option<&PowerOpts>,
) -> LparkitResult<bool> {
    let wrapper = get_instance_wrapper(api, instance).await?;
    if !wrapper.state.can_power_on() {
        tracing::debug!(instance = %instance.uuid, state = ?wrapper.state, "Partition not in a startable state, skipping power on");
        return Ok(false);
    }
    api.power_on(&wrapper.uuid, opts).await?;
    Ok(true)
}

/// Power off unless the partition is already inactive.
pub async fn power_off(
    api: &dyn ManagementApi,
    instance: &Instance,
    force_immediate: bool,
) -> LparkitResult<bool> {
    let wrapper = get_instance_wrapper(api, instance).await?;
    if !wrapper.state.is_active() {
        tracing::debug!(instance = %instance.uuid, state = ?wrapper.state, "Partition not active, skipping power off");
        return Ok(false);
    }
    api.power_off(&wrapper.uuid, force_immediate).await?;
    Ok(true)
}

pub async fn update_ibmi_settings(
    api: &dyn ManagementApi,
    instance: &Instance,
    boot_type: BootType,
) -> LparkitResult<()> {
    api.update_ibmi_settings(&pvm_uuid(instance), boot_type).await
}
