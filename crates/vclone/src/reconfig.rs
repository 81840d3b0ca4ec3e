//! Raw VM reconfiguration from `vmCustomization`.

use crate::error::{CloneError, CloneResult};
use crate::request::{DiskRequest, DiskType, VmCustomization};
use crate::types::{ConfigSpec, DeviceConfigSpec, DeviceOperation, OptionValue, VirtualDevice};

use serde_json::{json, Value};

/// Highest unit number on a SCSI bus.
pub const MAX_SCSI_UNIT: i32 = 15;
/// Unit a SCSI controller takes on its own bus unless it says otherwise.
pub const DEFAULT_CONTROLLER_UNIT: i32 = 7;

fn first_scsi_controller(devices: &[VirtualDevice]) -> Option<&VirtualDevice> {
    devices.iter().find(|d| d.is_scsi_controller())
}

/// Next free unit numbers on `controller` for `count` new disks.
pub fn allocate_units(
    devices: &[VirtualDevice],
    controller: &VirtualDevice,
    count: usize,
) -> CloneResult<Vec<i32>> {
    let reserved = controller
        .scsi_ctlr_unit_number()
        .unwrap_or(DEFAULT_CONTROLLER_UNIT);
    let highest = devices
        .iter()
        .filter(|d| d.is_disk() && d.controller_key == Some(controller.key))
        .filter_map(|d| d.unit_number)
        .max()
        .unwrap_or(0);

    let mut units = Vec::with_capacity(count);
    let mut next = highest + 1;
    for _ in 0..count {
        if next == reserved {
            next += 1;
        }
        if next > MAX_SCSI_UNIT {
            return Err(CloneError::exhausted(format!(
                "SCSI controller {} has no free unit number left (max {MAX_SCSI_UNIT})",
                controller.key
            )));
        }
        units.push(next);
        next += 1;
    }
    Ok(units)
}

fn disk_backing(disk_type: DiskType) -> Value {
    let (thin, eager) = match disk_type {
        DiskType::Thin => (true, false),
        DiskType::Flat | DiskType::FlatLazyZeroed => (false, false),
        DiskType::FlatEagerZeroed => (false, true),
    };
    json!({
        "_typeName": "VirtualDiskFlatVer2BackingInfo",
        "fileName": "",
        "diskMode": "persistent",
        "thinProvisioned": thin,
        "eagerlyScrub": eager,
    })
}

fn new_disk(key: i32, controller_key: i32, unit: i32, req: &DiskRequest) -> VirtualDevice {
    let mut dev = VirtualDevice::new("VirtualDisk", key);
    dev.controller_key = Some(controller_key);
    dev.unit_number = Some(unit);
    dev.backing = Some(disk_backing(req.disk_type));
    dev.extra
        .insert("capacityInKB".into(), Value::from(req.size_mb.saturating_mul(1024)));
    dev
}

fn option_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Build the reconfiguration for `vmc` against the clone's `devices`.
/// Unknown keys are skipped, so an all-unknown map yields an empty spec.
pub fn build_config_spec(
    vm_name: &str,
    vmc: &VmCustomization,
    devices: &[VirtualDevice],
) -> CloneResult<ConfigSpec> {
    let mut spec = ConfigSpec::default();
    spec.annotation = vmc.annotation.clone();
    spec.memory_mb = vmc.memory_mb;
    spec.num_cpus = vmc.num_cpus;

    for (key, value) in &vmc.extra {
        if !key.starts_with("guestinfo.") {
            log::warn!("[{vm_name}] Ignoring unsupported `vmCustomization` key `{key}`");
            continue;
        }
        spec.extra_config.push(OptionValue::string(key.clone(), option_string(value)));
    }

    if !vmc.add_disks.is_empty() {
        let controller = first_scsi_controller(devices)
            .ok_or_else(|| CloneError::not_found("No SCSI controller found to attach disks to"))?;
        let units = allocate_units(devices, controller, vmc.add_disks.len())?;
        for (i, (req, unit)) in vmc.add_disks.iter().zip(units).enumerate() {
            let disk = new_disk(-100 - i as i32, controller.key, unit, req);
            spec.device_change
                .push(DeviceConfigSpec::new(DeviceOperation::Add, disk).create_file());
        }
    }

    Ok(spec)
}
