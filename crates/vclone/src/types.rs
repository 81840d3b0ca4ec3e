//! Shared types for the vSphere Web Services API (VI/JSON binding).
//!
//! Polymorphic VIM objects carry their concrete type in `_typeName`; the
//! structs here set it on serialisation so request bodies can be sent as-is.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection / Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for connecting to a vCenter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VsphereConfig {
    /// vCenter hostname / IP (e.g. "vcenter.lab.local")
    pub host: String,
    /// Port (default 443)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username (e.g. "administrator@vsphere.local")
    pub username: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Skip TLS certificate verification (self-signed labs)
    #[serde(default)]
    pub insecure: bool,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// VI/JSON API release segment of the endpoint path
    #[serde(default = "default_release")]
    pub release: String,
}

fn default_port() -> u16 { 443 }
fn default_timeout() -> u64 { 30 }
fn default_release() -> String { "8.0.1.0".into() }

impl Default for VsphereConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            username: String::new(),
            password: String::new(),
            port: 443,
            insecure: false,
            timeout_secs: 30,
            release: default_release(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Managed object references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn moref_type_name() -> String { "ManagedObjectReference".into() }

/// Reference to a server-side managed object (e.g. `VirtualMachine:vm-42`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MoRef {
    #[serde(rename = "_typeName", default = "moref_type_name")]
    type_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl MoRef {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_name: moref_type_name(),
            kind: kind.into(),
            value: value.into(),
        }
    }

    pub fn vm(value: impl Into<String>) -> Self { Self::new("VirtualMachine", value) }
    pub fn host(value: impl Into<String>) -> Self { Self::new("HostSystem", value) }
    pub fn folder(value: impl Into<String>) -> Self { Self::new("Folder", value) }
    pub fn pool(value: impl Into<String>) -> Self { Self::new("ResourcePool", value) }
    pub fn task(value: impl Into<String>) -> Self { Self::new("Task", value) }
}

impl std::fmt::Display for MoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Power state / guest OS
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum VmPowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Guest operating system family; the only two families customization and
/// guest scripting know how to handle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GuestOsFamily {
    Linux,
    Windows,
}

impl std::fmt::Display for GuestOsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => f.write_str("linux"),
            Self::Windows => f.write_str("windows"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Virtual devices
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Concrete type names of `VirtualEthernetCard` subclasses.
pub const ETHERNET_CARD_TYPES: &[&str] = &[
    "VirtualVmxnet",
    "VirtualVmxnet2",
    "VirtualVmxnet3",
    "VirtualVmxnet3Vrdma",
    "VirtualE1000",
    "VirtualE1000e",
    "VirtualPCNet32",
    "VirtualSriovEthernetCard",
];

/// Concrete type names of `VirtualSCSIController` subclasses.
pub const SCSI_CONTROLLER_TYPES: &[&str] = &[
    "ParaVirtualSCSIController",
    "VirtualLsiLogicController",
    "VirtualLsiLogicSASController",
    "VirtualBusLogicController",
];

/// A hardware device as found in `config.hardware.device`.
///
/// Only the fields the engine reads or rewrites are typed; everything else
/// is preserved in `extra` so an edited device round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDevice {
    #[serde(rename = "_typeName")]
    pub type_name: String,
    pub key: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectable: Option<ConnectInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_key: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<i32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl VirtualDevice {
    pub fn new(type_name: impl Into<String>, key: i32) -> Self {
        Self {
            type_name: type_name.into(),
            key,
            backing: None,
            connectable: None,
            controller_key: None,
            unit_number: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_ethernet_card(&self) -> bool {
        ETHERNET_CARD_TYPES.contains(&self.type_name.as_str())
    }

    pub fn is_disk(&self) -> bool {
        self.type_name == "VirtualDisk"
    }

    pub fn is_scsi_controller(&self) -> bool {
        SCSI_CONTROLLER_TYPES.contains(&self.type_name.as_str())
    }

    /// Unit number the SCSI controller occupies on its own bus.
    pub fn scsi_ctlr_unit_number(&self) -> Option<i32> {
        self.extra
            .get("scsiCtlrUnitNumber")
            .and_then(Value::as_i64)
            .map(|n| n as i32)
    }

    /// Backing file of a disk, if it is file-backed.
    pub fn backing_file_name(&self) -> Option<&str> {
        self.backing.as_ref()?.get("fileName")?.as_str()
    }
}

fn connect_info_type() -> String { "VirtualDeviceConnectInfo".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    #[serde(rename = "_typeName", default = "connect_info_type")]
    type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrate_connect: Option<String>,
    pub start_connected: bool,
    pub allow_guest_control: bool,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ConnectInfo {
    pub fn new(start_connected: bool, allow_guest_control: bool, connected: bool) -> Self {
        Self {
            type_name: connect_info_type(),
            migrate_connect: None,
            start_connected,
            allow_guest_control,
            connected,
            status: None,
        }
    }
}

/// Network backings the planner knows how to produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_typeName")]
pub enum NicBacking {
    #[serde(rename = "VirtualEthernetCardNetworkBackingInfo", rename_all = "camelCase")]
    Network { device_name: String },
    #[serde(rename = "VirtualEthernetCardDistributedVirtualPortBackingInfo")]
    DistributedPort { port: DvsPortConnection },
}

fn dvs_port_type() -> String { "DistributedVirtualSwitchPortConnection".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DvsPortConnection {
    #[serde(rename = "_typeName", default = "dvs_port_type")]
    type_name: String,
    pub portgroup_key: String,
    pub switch_uuid: String,
}

impl DvsPortConnection {
    pub fn new(portgroup_key: impl Into<String>, switch_uuid: impl Into<String>) -> Self {
        Self {
            type_name: dvs_port_type(),
            portgroup_key: portgroup_key.into(),
            switch_uuid: switch_uuid.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceOperation {
    Add,
    Edit,
    Remove,
}

fn device_spec_type() -> String { "VirtualDeviceConfigSpec".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigSpec {
    #[serde(rename = "_typeName", default = "device_spec_type")]
    type_name: String,
    pub operation: DeviceOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<String>,
    pub device: VirtualDevice,
}

impl DeviceConfigSpec {
    pub fn new(operation: DeviceOperation, device: VirtualDevice) -> Self {
        Self {
            type_name: device_spec_type(),
            operation,
            file_operation: None,
            device,
        }
    }

    pub fn create_file(mut self) -> Self {
        self.file_operation = Some("create".into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Clone / reconfigure specs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn relocate_spec_type() -> String { "VirtualMachineRelocateSpec".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelocateSpec {
    #[serde(rename = "_typeName", default = "relocate_spec_type")]
    type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<MoRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<MoRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<MoRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_move_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_change: Vec<DeviceConfigSpec>,
}

impl Default for RelocateSpec {
    fn default() -> Self {
        Self {
            type_name: relocate_spec_type(),
            host: None,
            pool: None,
            folder: None,
            disk_move_type: None,
            device_change: Vec::new(),
        }
    }
}

fn clone_spec_type() -> String { "VirtualMachineCloneSpec".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneSpec {
    #[serde(rename = "_typeName", default = "clone_spec_type")]
    type_name: String,
    pub location: RelocateSpec,
    pub template: bool,
    pub power_on: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customization: Option<Value>,
}

impl CloneSpec {
    pub fn new(location: RelocateSpec, power_on: bool) -> Self {
        Self {
            type_name: clone_spec_type(),
            location,
            template: false,
            power_on,
            customization: None,
        }
    }
}

fn instant_clone_spec_type() -> String { "VirtualMachineInstantCloneSpec".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantCloneSpec {
    #[serde(rename = "_typeName", default = "instant_clone_spec_type")]
    type_name: String,
    pub name: String,
    pub location: RelocateSpec,
}

impl InstantCloneSpec {
    pub fn new(name: impl Into<String>, location: RelocateSpec) -> Self {
        Self {
            type_name: instant_clone_spec_type(),
            name: name.into(),
            location,
        }
    }
}

fn config_spec_type() -> String { "VirtualMachineConfigSpec".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSpec {
    #[serde(rename = "_typeName", default = "config_spec_type")]
    type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<String>,
    #[serde(rename = "memoryMB", default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<i64>,
    #[serde(rename = "numCPUs", default, skip_serializing_if = "Option::is_none")]
    pub num_cpus: Option<i32>,
    #[serde(rename = "extraConfig", default, skip_serializing_if = "Vec::is_empty")]
    pub extra_config: Vec<OptionValue>,
    #[serde(rename = "deviceChange", default, skip_serializing_if = "Vec::is_empty")]
    pub device_change: Vec<DeviceConfigSpec>,
}

impl Default for ConfigSpec {
    fn default() -> Self {
        Self {
            type_name: config_spec_type(),
            annotation: None,
            memory_mb: None,
            num_cpus: None,
            extra_config: Vec::new(),
            device_change: Vec::new(),
        }
    }
}

impl ConfigSpec {
    pub fn with_devices(device_change: Vec<DeviceConfigSpec>) -> Self {
        Self {
            device_change,
            ..Self::default()
        }
    }
}

fn option_value_type() -> String { "OptionValue".into() }

/// `OptionValue` whose value is an `xsd:string`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionValue {
    #[serde(rename = "_typeName", default = "option_value_type")]
    type_name: String,
    pub key: String,
    pub value: AnyString,
}

impl OptionValue {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_name: option_value_type(),
            key: key.into(),
            value: AnyString::new(value),
        }
    }
}

fn xsd_string_type() -> String { "string".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyString {
    #[serde(rename = "_typeName", default = "xsd_string_type")]
    type_name: String,
    #[serde(rename = "_value")]
    pub value: String,
}

impl AnyString {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            type_name: xsd_string_type(),
            value: value.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Tasks / events / product info
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub state: TaskState,
    #[serde(default)]
    pub description_id: Option<String>,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub error: Option<TaskFault>,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFault {
    #[serde(default)]
    pub localized_message: Option<String>,
    #[serde(default)]
    pub fault: Option<Value>,
}

/// vCenter or ESXi product identification (`AboutInfo`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub build: String,
}

impl ProductInfo {
    /// `major.minor` of the version as a comparable pair.
    pub fn version_pair(&self) -> Option<(u32, u32)> {
        let mut parts = self.version.split('.');
        let major = parts.next()?.trim().parse().ok()?;
        let minor = parts.next().map(|m| m.trim().parse().unwrap_or(0)).unwrap_or(0);
        Some((major, minor))
    }

    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        self.version_pair().is_some_and(|v| v >= (major, minor))
    }
}

/// Event returned by `EventManager.QueryEvents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmEvent {
    #[serde(rename = "_typeName")]
    pub type_name: String,
    #[serde(default)]
    pub full_formatted_message: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Guest
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `guest` property of a VM as reported by VMware Tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestInfo {
    #[serde(default)]
    pub tools_running_status: Option<String>,
    #[serde(default)]
    pub guest_family: Option<String>,
    #[serde(default)]
    pub guest_full_name: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub net: Vec<GuestNicInfo>,
}

impl GuestInfo {
    pub fn tools_running(&self) -> bool {
        self.tools_running_status.as_deref() == Some("guestToolsRunning")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestNicInfo {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub ip_address: Vec<String>,
    #[serde(default)]
    pub ip_config: Option<GuestIpConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestIpConfig {
    #[serde(default)]
    pub ip_address: Vec<GuestIpAddress>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestIpAddress {
    pub ip_address: String,
    #[serde(default)]
    pub prefix_length: Option<i32>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

fn guest_auth_type() -> String { "NamePasswordAuthentication".into() }

/// Guest credentials for in-guest operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestAuth {
    #[serde(rename = "_typeName", default = "guest_auth_type")]
    type_name: String,
    pub interactive_session: bool,
    pub username: String,
    pub password: String,
}

impl GuestAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            type_name: guest_auth_type(),
            interactive_session: false,
            username: username.into(),
            password: password.into(),
        }
    }
}

fn program_spec_type() -> String { "GuestProgramSpec".into() }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestProgramSpec {
    #[serde(rename = "_typeName", default = "program_spec_type")]
    type_name: String,
    pub program_path: String,
    pub arguments: String,
}

impl GuestProgramSpec {
    pub fn new(program_path: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            type_name: program_spec_type(),
            program_path: program_path.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestProcessInfo {
    pub pid: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferInfo {
    pub size: i64,
    pub url: String,
}
