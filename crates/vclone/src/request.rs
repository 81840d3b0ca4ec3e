//! Declarative clone request and its option groups.
//!
//! Keys are camelCase; every optional group has the defaults of the
//! provisioning driver so a minimal request only names the VM, the source
//! and the placement identifiers.

use crate::error::{CloneError, CloneResult};
use crate::types::GuestOsFamily;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Clone strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CloneStrategy {
    #[default]
    Full,
    Linked,
    Instant,
}

impl std::fmt::Display for CloneStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Linked => f.write_str("linked"),
            Self::Instant => f.write_str("instant"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkOperation {
    #[default]
    Edit,
    Add,
}

/// Attach the VM to a named network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDirective {
    pub name: String,
    #[serde(default)]
    pub operation: NetworkOperation,
}

impl NetworkDirective {
    pub fn edit(name: impl Into<String>) -> Self {
        Self { name: name.into(), operation: NetworkOperation::Edit }
    }

    pub fn add(name: impl Into<String>) -> Self {
        Self { name: name.into(), operation: NetworkOperation::Add }
    }
}

/// Destination VM folder, already resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRef {
    /// Path of the folder below the datacenter's VM folder.
    pub name: String,
    /// Folder MoRef id (`group-v123`).
    pub id: String,
}

/// Windows time zone index or Linux `Area/Location`; YAML may carry either
/// a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timezone {
    Index(u64),
    Name(String),
}

impl std::fmt::Display for Timezone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(n) => write!(f, "{n}"),
            Self::Name(s) => f.write_str(s),
        }
    }
}

/// First-boot customization parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestCustomizationParams {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub subnet_mask: Option<String>,
    #[serde(default)]
    pub gateway: Option<Vec<String>>,
    #[serde(default)]
    pub dns_domain: Option<String>,
    #[serde(default)]
    pub dns_server_list: Option<Vec<String>>,
    #[serde(default)]
    pub dns_suffix_list: Option<Vec<String>>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub timezone: Option<Timezone>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub org_name: Option<String>,
    #[serde(default)]
    pub continue_on_ip_conflict: bool,
    /// Seconds to wait for the customization events.
    #[serde(default)]
    pub timeout_task: Option<u64>,
    /// Seconds to wait for tools to report the static IP.
    #[serde(default)]
    pub timeout_ip: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiskType {
    #[default]
    Thin,
    Flat,
    FlatLazyZeroed,
    FlatEagerZeroed,
}

fn default_disk_size() -> u64 { 10240 }

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskRequest {
    #[serde(default, rename = "type")]
    pub disk_type: DiskType,
    #[serde(default = "default_disk_size", rename = "sizeMB")]
    pub size_mb: u64,
}

impl Default for DiskRequest {
    fn default() -> Self {
        Self { disk_type: DiskType::Thin, size_mb: default_disk_size() }
    }
}

/// Raw VM reconfiguration applied after the clone exists.
///
/// `guestinfo.*` keys become `extraConfig` entries; other unknown keys are
/// ignored with a warning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmCustomization {
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default, rename = "memoryMB")]
    pub memory_mb: Option<i64>,
    #[serde(default, rename = "numCPUs")]
    pub num_cpus: Option<i32>,
    #[serde(default, rename = "addDisks")]
    pub add_disks: Vec<DiskRequest>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Rewrite of the discovered address, e.g. for NAT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformIp {
    /// Template with `{1}`..`{4}` octet placeholders, e.g. `"10.0.{3}.{4}"`.
    Template(String),
    /// Static lookup; addresses not listed are returned unchanged.
    Map(BTreeMap<String, String>),
}

/// Script run inside the guest after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostCreateScript {
    pub script: String,
    #[serde(default)]
    pub shell: ShellKind,
    #[serde(default = "default_script_timeout")]
    pub timeout: u64,
}

fn default_script_timeout() -> u64 { 60 }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    #[default]
    Auto,
    Linux,
    Cmd,
    #[serde(alias = "pwsh")]
    PowerShell,
}

fn default_true() -> bool { true }
fn default_wait_timeout() -> u64 { 90 }
fn default_wait_interval() -> f64 { 2.0 }
fn default_guest_user() -> String { "vagrant".into() }
fn default_benchmark_file() -> String { "kitchen-vcenter.csv".into() }
fn default_win_network() -> String { "Ethernet0".into() }

/// Upper bound for `vmWaitTimeout` and `vmWaitInterval`, in seconds.
pub const MAX_WAIT_SECS: u64 = 86_400;

/// One clone request. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    pub vm_name: String,
    /// Source path below `/<datacenter>/vm/`.
    pub template: String,
    pub datacenter: String,
    /// Host MoRef id (`host-123`).
    #[serde(default)]
    pub target_host: Option<String>,
    /// Resource pool MoRef id (`resgroup-8`).
    #[serde(default)]
    pub resource_pool: Option<String>,
    #[serde(default)]
    pub folder: Option<FolderRef>,
    #[serde(default)]
    pub clone_type: CloneStrategy,
    #[serde(default)]
    pub networks: Vec<NetworkDirective>,
    /// Single-network shorthand; used only when `networks` is empty.
    #[serde(default)]
    pub network_name: Option<String>,
    #[serde(default = "default_true")]
    pub poweron: bool,
    #[serde(default)]
    pub guest_customization: Option<GuestCustomizationParams>,
    #[serde(default, alias = "customize")]
    pub vm_customization: Option<VmCustomization>,
    #[serde(default = "default_guest_user", alias = "aggressiveUsername")]
    pub vm_username: String,
    #[serde(default = "default_guest_user", alias = "aggressivePassword")]
    pub vm_password: String,
    #[serde(default, alias = "aggressiveOs")]
    pub vm_os: Option<GuestOsFamily>,
    /// Windows adapter alias the active discovery script reads.
    #[serde(default = "default_win_network")]
    pub vm_win_network: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_wait_timeout")]
    pub vm_wait_timeout: u64,
    #[serde(default = "default_wait_interval")]
    pub vm_wait_interval: f64,
    #[serde(default, alias = "aggressiveMode")]
    pub active_discovery: bool,
    #[serde(default)]
    pub active_discovery_command: Option<String>,
    #[serde(default)]
    pub transform_ip: Option<TransformIp>,
    #[serde(default)]
    pub post_create: Vec<PostCreateScript>,
    #[serde(default)]
    pub benchmark: bool,
    #[serde(default = "default_benchmark_file")]
    pub benchmark_file: String,
}

impl CloneRequest {
    /// Minimal request with every option at its default.
    pub fn new(
        vm_name: impl Into<String>,
        template: impl Into<String>,
        datacenter: impl Into<String>,
    ) -> Self {
        Self {
            vm_name: vm_name.into(),
            template: template.into(),
            datacenter: datacenter.into(),
            target_host: None,
            resource_pool: None,
            folder: None,
            clone_type: CloneStrategy::Full,
            networks: Vec::new(),
            network_name: None,
            poweron: true,
            guest_customization: None,
            vm_customization: None,
            vm_username: default_guest_user(),
            vm_password: default_guest_user(),
            vm_os: None,
            vm_win_network: default_win_network(),
            interface: None,
            vm_wait_timeout: default_wait_timeout(),
            vm_wait_interval: default_wait_interval(),
            active_discovery: false,
            active_discovery_command: None,
            transform_ip: None,
            post_create: Vec::new(),
            benchmark: false,
            benchmark_file: default_benchmark_file(),
        }
    }

    /// Network directives after mapping the legacy `networkName`.
    pub fn effective_networks(&self) -> Vec<NetworkDirective> {
        if self.networks.is_empty() {
            if let Some(ref name) = self.network_name {
                return vec![NetworkDirective::edit(name.clone())];
            }
        }
        self.networks.clone()
    }

    /// Check option shapes that do not need the platform.
    pub fn validate(&self) -> CloneResult<()> {
        if self.vm_name.trim().is_empty() {
            return Err(CloneError::invalid("Parameter `vmName` must not be empty"));
        }
        if self.template.trim().is_empty() {
            return Err(CloneError::invalid("Parameter `template` must not be empty"));
        }
        if self.datacenter.trim().is_empty() {
            return Err(CloneError::invalid("Parameter `datacenter` must not be empty"));
        }
        if self.target_host.is_none() {
            return Err(CloneError::invalid("Parameter `targetHost` is required for placement"));
        }

        let edits = self
            .effective_networks()
            .iter()
            .filter(|n| n.operation == NetworkOperation::Edit)
            .count();
        if edits > 1 {
            return Err(CloneError::invalid(
                "Only one network with operation `edit` is allowed, it targets the first adapter",
            ));
        }

        if self.vm_wait_timeout == 0 || self.vm_wait_timeout > MAX_WAIT_SECS {
            return Err(CloneError::invalid(format!(
                "Parameter `vmWaitTimeout` must be between 1 and {MAX_WAIT_SECS} seconds"
            )));
        }
        if !(self.vm_wait_interval > 0.0 && self.vm_wait_interval <= MAX_WAIT_SECS as f64) {
            return Err(CloneError::invalid(format!(
                "Parameter `vmWaitInterval` must be positive and at most {MAX_WAIT_SECS} seconds"
            )));
        }
        Ok(())
    }

    /// VM folder path used to locate the clone after creation.
    pub fn vm_path(&self) -> String {
        match self.folder {
            Some(ref f) => format!("{}/{}", f.name.trim_matches('/'), self.vm_name),
            None => self.vm_name.clone(),
        }
    }
}
