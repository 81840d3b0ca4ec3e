//! Virtualization platform seam.
//!
//! Everything the engine needs from vCenter goes through [`Platform`]:
//! inventory lookups, task submission and waiting, guest tools state,
//! events and in-guest operations. [`VimPlatform`] speaks VI/JSON through
//! [`VsphereClient`]; `crate::sim::SimulatedPlatform` keeps state in memory.

use crate::error::{CloneError, CloneResult};
use crate::types::*;
use crate::vsphere::VsphereClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Facts about a VM read before and after cloning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmFacts {
    pub name: String,
    pub template: bool,
    pub has_snapshot: bool,
    pub power_state: VmPowerState,
    pub instant_clone_frozen: bool,
    pub guest_id: Option<String>,
    pub guest_full_name: Option<String>,
    pub host: Option<MoRef>,
    pub devices: Vec<VirtualDevice>,
}

impl VmFacts {
    /// First network adapter in device order.
    pub fn first_ethernet_card(&self) -> Option<&VirtualDevice> {
        self.devices.iter().find(|d| d.is_ethernet_card())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterFacts {
    pub moref: MoRef,
    pub name: String,
    pub vm_folder: MoRef,
}

/// Backing kind of a named network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum NetworkKind {
    Standard,
    #[serde(rename_all = "camelCase")]
    DistributedPortGroup {
        portgroup_key: String,
        switch_uuid: String,
    },
    /// Anything else (opaque / NSX networks, ...), carrying the managed type.
    Other { type_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRef {
    pub moref: MoRef,
    pub name: String,
    pub kind: NetworkKind,
}

/// Operations the clone engine performs against the platform.
///
/// Task-submitting methods return the task reference; callers pair them with
/// [`Platform::wait_for_task`].
#[async_trait]
pub trait Platform: Send + Sync {
    /// vCenter product information.
    async fn about(&self) -> CloneResult<ProductInfo>;

    /// `SearchIndex.FindByInventoryPath`; `None` when nothing lives there.
    async fn find_by_inventory_path(&self, path: &str) -> CloneResult<Option<MoRef>>;

    async fn vm_facts(&self, vm: &MoRef) -> CloneResult<VmFacts>;

    async fn datacenter(&self, name: &str) -> CloneResult<DatacenterFacts>;

    /// All networks of a datacenter carrying `name`, in inventory order.
    async fn networks_named(
        &self,
        datacenter: &DatacenterFacts,
        name: &str,
    ) -> CloneResult<Vec<NetworkRef>>;

    async fn host_product(&self, host: &MoRef) -> CloneResult<ProductInfo>;

    async fn clone_vm(
        &self,
        source: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> CloneResult<MoRef>;

    async fn instant_clone_vm(&self, source: &MoRef, spec: &InstantCloneSpec) -> CloneResult<MoRef>;

    async fn reconfigure_vm(&self, vm: &MoRef, spec: &ConfigSpec) -> CloneResult<MoRef>;

    async fn power_on_vm(&self, vm: &MoRef) -> CloneResult<MoRef>;

    async fn power_off_vm(&self, vm: &MoRef) -> CloneResult<MoRef>;

    async fn destroy_vm(&self, vm: &MoRef) -> CloneResult<MoRef>;

    /// Block until the task finishes; `TaskFailed` on error state.
    async fn wait_for_task(&self, task: &MoRef) -> CloneResult<Option<Value>>;

    async fn guest_info(&self, vm: &MoRef) -> CloneResult<GuestInfo>;

    /// Events of the given type names recorded against `vm`.
    async fn query_vm_events(&self, vm: &MoRef, type_names: &[&str]) -> CloneResult<Vec<VmEvent>>;

    async fn start_guest_program(
        &self,
        vm: &MoRef,
        auth: &GuestAuth,
        spec: &GuestProgramSpec,
    ) -> CloneResult<i64>;

    async fn list_guest_processes(
        &self,
        vm: &MoRef,
        auth: &GuestAuth,
        pids: &[i64],
    ) -> CloneResult<Vec<GuestProcessInfo>>;

    /// Prepare a download; the returned URL is directly fetchable.
    async fn file_transfer_from_guest(
        &self,
        vm: &MoRef,
        auth: &GuestAuth,
        path: &str,
    ) -> CloneResult<FileTransferInfo>;

    async fn fetch_transfer(&self, url: &str) -> CloneResult<Vec<u8>>;

    async fn delete_guest_file(&self, vm: &MoRef, auth: &GuestAuth, path: &str) -> CloneResult<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VI/JSON implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Config properties read from `VirtualMachine.config`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmConfigInfo {
    #[serde(default)]
    template: bool,
    #[serde(default)]
    guest_id: Option<String>,
    #[serde(default)]
    guest_full_name: Option<String>,
    #[serde(default)]
    hardware: VmHardware,
}

#[derive(Debug, Default, Deserialize)]
struct VmHardware {
    #[serde(default)]
    device: Vec<VirtualDevice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmRuntime {
    #[serde(default)]
    power_state: VmPowerState,
    #[serde(default)]
    host: Option<MoRef>,
    #[serde(default)]
    instant_clone_frozen: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostConfigSummary {
    #[serde(default)]
    product: ProductInfo,
}

/// [`Platform`] over a logged-in [`VsphereClient`].
pub struct VimPlatform {
    client: VsphereClient,
}

impl VimPlatform {
    pub fn new(client: VsphereClient) -> Self {
        Self { client }
    }

    /// Connect and log in.
    pub async fn connect(config: &VsphereConfig) -> CloneResult<Self> {
        let mut client = VsphereClient::new(config)?;
        client.login().await?;
        Ok(Self { client })
    }

    pub async fn disconnect(&mut self) -> CloneResult<()> {
        self.client.logout().await
    }

    pub fn client(&self) -> &VsphereClient {
        &self.client
    }

    async fn guest_manager(&self, property: &str) -> CloneResult<MoRef> {
        let gom = self
            .client
            .content()?
            .guest_operations_manager
            .clone()
            .ok_or_else(|| CloneError::precondition("vCenter exposes no guest operations manager"))?;
        let mgr: Option<MoRef> = self.client.get_property(&gom, property).await?;
        mgr.ok_or_else(|| CloneError::precondition(format!("Guest operations {property} unavailable")))
    }

    /// Replace the `*` host placeholder of a transfer URL with the vCenter host.
    fn rewrite_transfer_url(&self, raw: &str) -> CloneResult<String> {
        let host = &self.client.config().host;
        let replaced = raw.replacen("://*:", &format!("://{host}:"), 1);
        let replaced = replaced.replacen("://*/", &format!("://{host}/"), 1);
        let url = url::Url::parse(&replaced)
            .map_err(|e| CloneError::parse(format!("Bad transfer URL '{raw}': {e}")))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl Platform for VimPlatform {
    async fn about(&self) -> CloneResult<ProductInfo> {
        Ok(self.client.content()?.about.clone())
    }

    async fn find_by_inventory_path(&self, path: &str) -> CloneResult<Option<MoRef>> {
        let index = self.client.content()?.search_index.clone();
        self.client
            .invoke(&index, "FindByInventoryPath", &json!({ "inventoryPath": path }))
            .await
    }

    async fn vm_facts(&self, vm: &MoRef) -> CloneResult<VmFacts> {
        let name: String = self.client.get_property(vm, "name").await?;
        let config: Option<VmConfigInfo> = self.client.get_property(vm, "config").await?;
        let snapshot: Option<Value> = self.client.get_property(vm, "snapshot").await?;
        let runtime: VmRuntime = self.client.get_property(vm, "runtime").await?;
        let config = config.unwrap_or_default();

        Ok(VmFacts {
            name,
            template: config.template,
            has_snapshot: snapshot.is_some_and(|s| !s.is_null()),
            power_state: runtime.power_state,
            instant_clone_frozen: runtime.instant_clone_frozen.unwrap_or(false),
            guest_id: config.guest_id,
            guest_full_name: config.guest_full_name,
            host: runtime.host,
            devices: config.hardware.device,
        })
    }

    async fn datacenter(&self, name: &str) -> CloneResult<DatacenterFacts> {
        let moref = self
            .find_by_inventory_path(name)
            .await?
            .filter(|m| m.kind == "Datacenter")
            .ok_or_else(|| CloneError::not_found(format!("Datacenter '{name}' not found")))?;
        let vm_folder: MoRef = self.client.get_property(&moref, "vmFolder").await?;
        Ok(DatacenterFacts {
            moref,
            name: name.to_string(),
            vm_folder,
        })
    }

    async fn networks_named(
        &self,
        datacenter: &DatacenterFacts,
        name: &str,
    ) -> CloneResult<Vec<NetworkRef>> {
        let all: Vec<MoRef> = self.client.get_property(&datacenter.moref, "network").await?;
        let mut found = Vec::new();

        for moref in all {
            let net_name: String = self.client.get_property(&moref, "name").await?;
            if net_name != name {
                continue;
            }
            let kind = match moref.kind.as_str() {
                "Network" => NetworkKind::Standard,
                "DistributedVirtualPortgroup" => {
                    let key: String = self.client.get_property(&moref, "key").await?;
                    let switch: MoRef = self
                        .client
                        .get_property(&moref, "config/distributedVirtualSwitch")
                        .await?;
                    let uuid: String = self.client.get_property(&switch, "uuid").await?;
                    NetworkKind::DistributedPortGroup {
                        portgroup_key: key,
                        switch_uuid: uuid,
                    }
                }
                other => NetworkKind::Other {
                    type_name: other.to_string(),
                },
            };
            found.push(NetworkRef {
                moref,
                name: net_name,
                kind,
            });
        }
        Ok(found)
    }

    async fn host_product(&self, host: &MoRef) -> CloneResult<ProductInfo> {
        let summary: HostConfigSummary = self.client.get_property(host, "summary/config").await?;
        Ok(summary.product)
    }

    async fn clone_vm(
        &self,
        source: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> CloneResult<MoRef> {
        self.client
            .invoke(
                source,
                "CloneVM_Task",
                &json!({ "folder": folder, "name": name, "spec": spec }),
            )
            .await
    }

    async fn instant_clone_vm(&self, source: &MoRef, spec: &InstantCloneSpec) -> CloneResult<MoRef> {
        self.client
            .invoke(source, "InstantClone_Task", &json!({ "spec": spec }))
            .await
    }

    async fn reconfigure_vm(&self, vm: &MoRef, spec: &ConfigSpec) -> CloneResult<MoRef> {
        self.client
            .invoke(vm, "ReconfigVM_Task", &json!({ "spec": spec }))
            .await
    }

    async fn power_on_vm(&self, vm: &MoRef) -> CloneResult<MoRef> {
        self.client.invoke(vm, "PowerOnVM_Task", &json!({})).await
    }

    async fn power_off_vm(&self, vm: &MoRef) -> CloneResult<MoRef> {
        self.client.invoke(vm, "PowerOffVM_Task", &json!({})).await
    }

    async fn destroy_vm(&self, vm: &MoRef) -> CloneResult<MoRef> {
        self.client.invoke(vm, "Destroy_Task", &json!({})).await
    }

    async fn wait_for_task(&self, task: &MoRef) -> CloneResult<Option<Value>> {
        self.client.wait_for_task(task).await
    }

    async fn guest_info(&self, vm: &MoRef) -> CloneResult<GuestInfo> {
        let guest: Option<GuestInfo> = self.client.get_property(vm, "guest").await?;
        Ok(guest.unwrap_or_default())
    }

    async fn query_vm_events(&self, vm: &MoRef, type_names: &[&str]) -> CloneResult<Vec<VmEvent>> {
        let manager = self
            .client
            .content()?
            .event_manager
            .clone()
            .ok_or_else(|| CloneError::precondition("vCenter exposes no event manager"))?;
        let filter = json!({
            "filter": {
                "_typeName": "EventFilterSpec",
                "entity": {
                    "_typeName": "EventFilterSpecByEntity",
                    "entity": vm,
                    "recursion": "self"
                },
                "eventTypeId": type_names,
            }
        });
        let events: Option<Vec<VmEvent>> = self.client.invoke(&manager, "QueryEvents", &filter).await?;
        Ok(events.unwrap_or_default())
    }

    async fn start_guest_program(
        &self,
        vm: &MoRef,
        auth: &GuestAuth,
        spec: &GuestProgramSpec,
    ) -> CloneResult<i64> {
        let pm = self.guest_manager("processManager").await?;
        self.client
            .invoke(&pm, "StartProgramInGuest", &json!({ "vm": vm, "auth": auth, "spec": spec }))
            .await
    }

    async fn list_guest_processes(
        &self,
        vm: &MoRef,
        auth: &GuestAuth,
        pids: &[i64],
    ) -> CloneResult<Vec<GuestProcessInfo>> {
        let pm = self.guest_manager("processManager").await?;
        let procs: Option<Vec<GuestProcessInfo>> = self
            .client
            .invoke(&pm, "ListProcessesInGuest", &json!({ "vm": vm, "auth": auth, "pids": pids }))
            .await?;
        Ok(procs.unwrap_or_default())
    }

    async fn file_transfer_from_guest(
        &self,
        vm: &MoRef,
        auth: &GuestAuth,
        path: &str,
    ) -> CloneResult<FileTransferInfo> {
        let fm = self.guest_manager("fileManager").await?;
        let mut info: FileTransferInfo = self
            .client
            .invoke(
                &fm,
                "InitiateFileTransferFromGuest",
                &json!({ "vm": vm, "auth": auth, "guestFilePath": path }),
            )
            .await?;
        info.url = self.rewrite_transfer_url(&info.url)?;
        Ok(info)
    }

    async fn fetch_transfer(&self, url: &str) -> CloneResult<Vec<u8>> {
        self.client.download(url).await
    }

    async fn delete_guest_file(&self, vm: &MoRef, auth: &GuestAuth, path: &str) -> CloneResult<()> {
        let fm = self.guest_manager("fileManager").await?;
        let _: Value = self
            .client
            .invoke(&fm, "DeleteFileInGuest", &json!({ "vm": vm, "auth": auth, "filePath": path }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_url_placeholder_is_replaced() {
        let cfg = VsphereConfig {
            host: "vc.lab".into(),
            ..VsphereConfig::default()
        };
        let p = VimPlatform::new(VsphereClient::new(&cfg).unwrap());
        let url = p
            .rewrite_transfer_url("https://*:443/guestFile?id=7&token=abc")
            .unwrap();
        assert_eq!(url, "https://vc.lab/guestFile?id=7&token=abc");

        let kept = p.rewrite_transfer_url("https://esx1:443/guestFile?id=1").unwrap();
        assert!(kept.starts_with("https://esx1"));
    }

    #[test]
    fn network_kind_serialises_tagged() {
        let k = NetworkKind::DistributedPortGroup {
            portgroup_key: "dvportgroup-1".into(),
            switch_uuid: "u".into(),
        };
        let v = serde_json::to_value(k).unwrap();
        assert_eq!(v["kind"], "distributedPortGroup");
        assert_eq!(v["portgroupKey"], "dvportgroup-1");
    }

    #[test]
    fn first_ethernet_card_skips_other_devices() {
        let facts = VmFacts {
            devices: vec![
                VirtualDevice::new("VirtualDisk", 2000),
                VirtualDevice::new("VirtualE1000", 4000),
                VirtualDevice::new("VirtualVmxnet3", 4001),
            ],
            ..VmFacts::default()
        };
        assert_eq!(facts.first_ethernet_card().map(|d| d.key), Some(4000));
    }
}
