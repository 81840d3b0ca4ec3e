//! Network change planning: attach adapters to named networks.
//!
//! An `edit` rewrites the backing of the VM's first adapter and rides along
//! in the clone task; `add` directives each produce a new `VirtualVmxnet3`
//! adapter, issued as one reconfiguration once the clone exists.

use crate::context::RunContext;
use crate::error::{CloneError, CloneResult};
use crate::platform::{DatacenterFacts, NetworkKind, NetworkRef, Platform};
use crate::request::{NetworkDirective, NetworkOperation};
use crate::types::{
    ConnectInfo, DeviceConfigSpec, DeviceOperation, DvsPortConnection, NicBacking, VirtualDevice,
};

/// Directives split by when they are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkChanges {
    /// Network for the first existing adapter.
    pub edit: Option<String>,
    /// Networks that each get a new adapter.
    pub adds: Vec<String>,
}

impl NetworkChanges {
    pub fn is_empty(&self) -> bool {
        self.edit.is_none() && self.adds.is_empty()
    }
}

/// Split directives into at most one edit and any number of adds.
pub fn classify(directives: &[NetworkDirective]) -> CloneResult<NetworkChanges> {
    let mut changes = NetworkChanges::default();
    for d in directives {
        match d.operation {
            NetworkOperation::Edit => {
                if let Some(ref first) = changes.edit {
                    return Err(CloneError::invalid(format!(
                        "Networks `{first}` and `{}` both edit the first adapter",
                        d.name
                    )));
                }
                changes.edit = Some(d.name.clone());
            }
            NetworkOperation::Add => changes.adds.push(d.name.clone()),
        }
    }
    Ok(changes)
}

/// Pick the network to use among same-named candidates.
pub fn select_network(
    ctx: &RunContext,
    name: &str,
    candidates: Vec<NetworkRef>,
) -> CloneResult<NetworkRef> {
    let count = candidates.len();
    let mut iter = candidates.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| CloneError::not_found(format!("Could not find network named {name}")))?;
    if count > 1 {
        log::warn!(
            "[{}] Found {count} networks named {name}, picking first one ({})",
            ctx.vm_name(),
            first.moref
        );
    }
    Ok(first)
}

/// Look up a network by name in the datacenter.
pub async fn resolve_network(
    platform: &dyn Platform,
    ctx: &RunContext,
    datacenter: &DatacenterFacts,
    name: &str,
) -> CloneResult<NetworkRef> {
    let candidates = platform.networks_named(datacenter, name).await?;
    select_network(ctx, name, candidates)
}

/// Backing that attaches an adapter to `network`.
pub fn backing_for(network: &NetworkRef) -> CloneResult<NicBacking> {
    match network.kind {
        NetworkKind::Standard => Ok(NicBacking::Network {
            device_name: network.name.clone(),
        }),
        NetworkKind::DistributedPortGroup {
            ref portgroup_key,
            ref switch_uuid,
        } => Ok(NicBacking::DistributedPort {
            port: DvsPortConnection::new(portgroup_key.clone(), switch_uuid.clone()),
        }),
        NetworkKind::Other { ref type_name } => Err(CloneError::unsupported_network(format!(
            "Unknown network type {type_name} for network name {}",
            network.name
        ))),
    }
}

/// Device change for one directive.
///
/// For `Edit`, `device` is the adapter to rewrite; for `Add` it is ignored
/// and `new_key` becomes the temporary key of the new adapter.
pub fn plan_change(
    device: Option<&VirtualDevice>,
    network: &NetworkRef,
    operation: NetworkOperation,
    new_key: i32,
) -> CloneResult<DeviceConfigSpec> {
    let backing = serde_json::to_value(backing_for(network)?)?;

    match operation {
        NetworkOperation::Edit => {
            let mut dev = device
                .cloned()
                .ok_or_else(|| CloneError::not_found("Source VM has no network adapter to edit"))?;
            dev.backing = Some(backing);
            Ok(DeviceConfigSpec::new(DeviceOperation::Edit, dev))
        }
        NetworkOperation::Add => {
            let mut dev = new_adapter(new_key);
            dev.backing = Some(backing);
            Ok(DeviceConfigSpec::new(DeviceOperation::Add, dev))
        }
    }
}

/// A fresh vmxnet3 adapter with a generated MAC, connected at power on.
pub fn new_adapter(key: i32) -> VirtualDevice {
    let mut dev = VirtualDevice::new("VirtualVmxnet3", key);
    dev.connectable = Some(ConnectInfo::new(true, true, true));
    dev.extra
        .insert("addressType".into(), serde_json::Value::String("generated".into()));
    dev
}

/// Build the add batch for all `adds`; keys count down from -1.
pub fn plan_adds(networks: &[NetworkRef]) -> CloneResult<Vec<DeviceConfigSpec>> {
    networks
        .iter()
        .enumerate()
        .map(|(i, net)| plan_change(None, net, NetworkOperation::Add, -(i as i32) - 1))
        .collect()
}

/// Keep the edited adapter off the wire while an instant clone shares the
/// source's identity.
pub fn disconnect_for_clone(spec: &mut DeviceConfigSpec) {
    let mut info = ConnectInfo::new(true, true, false);
    info.migrate_connect = Some("disconnect".into());
    spec.device.connectable = Some(info);
}

/// Edit that reconnects `device` after an instant clone.
pub fn reconnect(device: &VirtualDevice) -> DeviceConfigSpec {
    let mut dev = device.clone();
    let mut info = dev
        .connectable
        .take()
        .unwrap_or_else(|| ConnectInfo::new(true, true, true));
    info.connected = true;
    info.start_connected = true;
    info.migrate_connect = None;
    info.status = None;
    dev.connectable = Some(info);
    DeviceConfigSpec::new(DeviceOperation::Edit, dev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloneErrorKind;
    use crate::types::MoRef;

    fn std_net(name: &str, id: &str) -> NetworkRef {
        NetworkRef {
            moref: MoRef::new("Network", id),
            name: name.into(),
            kind: NetworkKind::Standard,
        }
    }

    fn dvpg(name: &str) -> NetworkRef {
        NetworkRef {
            moref: MoRef::new("DistributedVirtualPortgroup", "dvportgroup-21"),
            name: name.into(),
            kind: NetworkKind::DistributedPortGroup {
                portgroup_key: "dvportgroup-21".into(),
                switch_uuid: "50 1c 2a".into(),
            },
        }
    }

    #[test]
    fn classify_edit_and_adds() {
        let c = classify(&[
            NetworkDirective::add("A"),
            NetworkDirective::edit("E"),
            NetworkDirective::add("B"),
        ])
        .unwrap();
        assert_eq!(c.edit.as_deref(), Some("E"));
        assert_eq!(c.adds, vec!["A".to_string(), "B".to_string()]);
        assert!(classify(&[]).unwrap().is_empty());
    }

    #[test]
    fn second_edit_is_invalid() {
        let err = classify(&[NetworkDirective::edit("A"), NetworkDirective::edit("B")]).unwrap_err();
        assert!(err.is(CloneErrorKind::InvalidOptions));
    }

    #[test]
    fn edit_rewrites_backing_keeps_device() {
        let mut nic = VirtualDevice::new("VirtualE1000", 4000);
        nic.extra.insert("macAddress".into(), "00:50:56:01:02:03".into());
        let spec = plan_change(Some(&nic), &dvpg("Prod"), NetworkOperation::Edit, 0).unwrap();
        assert_eq!(spec.operation, DeviceOperation::Edit);
        assert_eq!(spec.device.key, 4000);
        assert_eq!(spec.device.type_name, "VirtualE1000");
        let backing = spec.device.backing.unwrap();
        assert_eq!(backing["_typeName"], "VirtualEthernetCardDistributedVirtualPortBackingInfo");
        assert_eq!(backing["port"]["switchUuid"], "50 1c 2a");
        assert_eq!(spec.device.extra["macAddress"], "00:50:56:01:02:03");
    }

    #[test]
    fn edit_without_adapter_fails() {
        let err = plan_change(None, &std_net("VM Network", "network-1"), NetworkOperation::Edit, 0)
            .unwrap_err();
        assert!(err.is(CloneErrorKind::NotFound));
    }

    #[test]
    fn unsupported_backing() {
        let net = NetworkRef {
            moref: MoRef::new("OpaqueNetwork", "network-o1"),
            name: "nsx".into(),
            kind: NetworkKind::Other { type_name: "OpaqueNetwork".into() },
        };
        let err = plan_change(None, &net, NetworkOperation::Add, -1).unwrap_err();
        assert!(err.is(CloneErrorKind::UnsupportedNetworkType));
    }

    #[test]
    fn adds_use_negative_keys() {
        let batch = plan_adds(&[std_net("A", "network-1"), std_net("B", "network-2")]).unwrap();
        let keys: Vec<i32> = batch.iter().map(|s| s.device.key).collect();
        assert_eq!(keys, vec![-1, -2]);
        for s in &batch {
            assert_eq!(s.operation, DeviceOperation::Add);
            assert_eq!(s.device.type_name, "VirtualVmxnet3");
            assert_eq!(s.device.extra["addressType"], "generated");
            assert!(s.device.connectable.as_ref().unwrap().start_connected);
        }
        assert_eq!(batch[1].device.backing.as_ref().unwrap()["deviceName"], "B");
    }

    #[test]
    fn first_candidate_wins() {
        let ctx = RunContext::new("vm");
        let picked = select_network(
            &ctx,
            "Dup",
            vec![std_net("Dup", "network-1"), std_net("Dup", "network-2")],
        )
        .unwrap();
        assert_eq!(picked.moref.value, "network-1");

        let err = select_network(&ctx, "None", vec![]).unwrap_err();
        assert!(err.is(CloneErrorKind::NotFound));
    }

    #[test]
    fn instant_disconnect_then_reconnect() {
        let nic = VirtualDevice::new("VirtualVmxnet3", 4000);
        let mut spec = plan_change(Some(&nic), &std_net("VM Network", "n"), NetworkOperation::Edit, 0)
            .unwrap();
        disconnect_for_clone(&mut spec);
        let info = spec.device.connectable.clone().unwrap();
        assert!(!info.connected);
        assert!(info.start_connected);
        assert_eq!(info.migrate_connect.as_deref(), Some("disconnect"));

        let again = reconnect(&spec.device);
        let info = again.device.connectable.unwrap();
        assert!(info.connected);
        assert!(info.migrate_connect.is_none());
    }
}
