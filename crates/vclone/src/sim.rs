//! In-memory [`Platform`] for tests.
//!
//! Keeps a small inventory (datacenters, folders, hosts, networks, VMs),
//! executes clone / reconfigure / power tasks against it, and records every
//! mutating call so tests can assert on what the engine asked for.

use crate::error::{CloneError, CloneResult};
use crate::platform::{DatacenterFacts, NetworkRef, Platform, VmFacts};
use crate::types::*;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// A call the engine made, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimCall {
    CloneVm {
        source: MoRef,
        folder: MoRef,
        name: String,
        spec: CloneSpec,
    },
    InstantClone {
        source: MoRef,
        spec: InstantCloneSpec,
    },
    Reconfigure {
        vm: MoRef,
        spec: ConfigSpec,
    },
    PowerOn(MoRef),
    PowerOff(MoRef),
    Destroy(MoRef),
    StartProgram {
        vm: MoRef,
        spec: GuestProgramSpec,
    },
}

impl SimCall {
    pub fn is_task_submission(&self) -> bool {
        !matches!(self, Self::StartProgram { .. })
    }
}

/// How guest programs behave.
#[derive(Debug, Clone, Default)]
pub struct GuestScript {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone)]
struct SimVm {
    moref: MoRef,
    path: String,
    facts: VmFacts,
    guest: GuestInfo,
    events: Vec<VmEvent>,
    extra_config: Vec<OptionValue>,
}

#[derive(Debug, Default)]
struct SimState {
    about: ProductInfo,
    datacenters: HashMap<String, DatacenterFacts>,
    folders: HashMap<String, String>,
    hosts: HashMap<String, ProductInfo>,
    networks: Vec<(String, NetworkRef)>,
    vms: Vec<SimVm>,
    tasks: HashMap<String, Result<Option<Value>, String>>,
    task_failures: HashMap<String, String>,
    guest_sequences: HashMap<String, VecDeque<GuestInfo>>,
    guest_script: GuestScript,
    scripts_by_content: Vec<(String, GuestScript)>,
    guest_auth_rejected: bool,
    customization_event: Option<String>,
    processes: HashMap<i64, i32>,
    transfers: HashMap<String, Vec<u8>>,
    guest_files: HashMap<String, Vec<u8>>,
    calls: Vec<SimCall>,
    guest_polls: usize,
    next_id: u64,
}

impl SimState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn vm(&self, moref: &MoRef) -> CloneResult<&SimVm> {
        self.vms
            .iter()
            .find(|v| &v.moref == moref)
            .ok_or_else(|| CloneError::not_found(format!("Managed object not found: {moref}")))
    }

    fn vm_mut(&mut self, moref: &MoRef) -> CloneResult<&mut SimVm> {
        self.vms
            .iter_mut()
            .find(|v| &v.moref == moref)
            .ok_or_else(|| CloneError::not_found(format!("Managed object not found: {moref}")))
    }

    /// Register a task; a queued failure for `method` makes it end in error.
    fn task(&mut self, method: &str, result: Option<Value>) -> (MoRef, bool) {
        let id = format!("task-{}", self.next());
        let failure = self.task_failures.remove(method);
        let failed = failure.is_some();
        self.tasks.insert(id.clone(), failure.map_or(Ok(result), Err));
        (MoRef::task(id), failed)
    }

    fn fresh_guest(&self, name: &str, facts: &VmFacts) -> GuestInfo {
        if let Some(front) = self.guest_sequences.get(name).and_then(|q| q.front()) {
            return front.clone();
        }
        let windows = facts.guest_id.as_deref().is_some_and(|g| g.starts_with("win"));
        GuestInfo {
            tools_running_status: Some("guestToolsRunning".into()),
            guest_family: Some(if windows { "windowsGuest" } else { "linuxGuest" }.into()),
            guest_full_name: facts.guest_full_name.clone(),
            ..GuestInfo::default()
        }
    }

    fn apply_device_changes(&mut self, devices: &mut Vec<VirtualDevice>, changes: &[DeviceConfigSpec]) {
        for change in changes {
            match change.operation {
                DeviceOperation::Edit => {
                    if let Some(d) = devices.iter_mut().find(|d| d.key == change.device.key) {
                        *d = change.device.clone();
                    }
                }
                DeviceOperation::Add => {
                    let mut dev = change.device.clone();
                    dev.key = 5000 + self.next() as i32;
                    devices.push(dev);
                }
                DeviceOperation::Remove => devices.retain(|d| d.key != change.device.key),
            }
        }
    }

    fn create_vm(&mut self, path: String, mut facts: VmFacts, customized: bool) -> MoRef {
        let moref = MoRef::vm(format!("vm-{}", self.next()));
        let guest = self.fresh_guest(&facts.name, &facts);
        let mut events = Vec::new();
        if customized {
            if let Some(ref type_name) = self.customization_event {
                let message = (type_name != "CustomizationSucceeded")
                    .then(|| format!("{type_name}: customization failed in guest"));
                events.push(VmEvent {
                    type_name: type_name.clone(),
                    full_formatted_message: message,
                });
            }
        }
        facts.template = false;
        facts.has_snapshot = false;
        facts.instant_clone_frozen = false;
        self.vms.push(SimVm {
            moref: moref.clone(),
            path,
            facts,
            guest,
            events,
            extra_config: Vec::new(),
        });
        moref
    }
}

/// A fully in-memory platform for unit and integration tests.
pub struct SimulatedPlatform {
    state: Mutex<SimState>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    /// Empty inventory behind a vCenter 8.0.2.
    pub fn new() -> Self {
        let state = SimState {
            about: ProductInfo {
                name: "VMware VirtualCenter Server".into(),
                full_name: "VMware vCenter Server 8.0.2 build-22385739".into(),
                version: "8.0.2".into(),
                build: "22385739".into(),
            },
            customization_event: Some("CustomizationSucceeded".into()),
            ..SimState::default()
        };
        Self { state: Mutex::new(state) }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Inventory setup ─────────────────────────────────────────────

    pub fn set_vcenter_version(&self, version: &str) {
        let mut s = self.state();
        s.about.version = version.to_string();
        s.about.full_name = format!("VMware vCenter Server {version}");
    }

    pub fn add_datacenter(&self, name: &str) -> DatacenterFacts {
        let mut s = self.state();
        let n = s.next();
        let dc = DatacenterFacts {
            moref: MoRef::new("Datacenter", format!("datacenter-{n}")),
            name: name.to_string(),
            vm_folder: MoRef::folder(format!("group-v{n}")),
        };
        s.folders.insert(dc.vm_folder.value.clone(), format!("/{name}/vm"));
        s.datacenters.insert(name.to_string(), dc.clone());
        dc
    }

    /// Folder `path` (relative to the VM folder) with MoRef id `id`.
    pub fn add_folder(&self, datacenter: &str, path: &str, id: &str) {
        self.state()
            .folders
            .insert(id.to_string(), format!("/{datacenter}/vm/{}", path.trim_matches('/')));
    }

    pub fn add_host(&self, id: &str, version: &str) {
        self.state().hosts.insert(
            id.to_string(),
            ProductInfo {
                name: "VMware ESXi".into(),
                full_name: format!("VMware ESXi {version}"),
                version: version.to_string(),
                build: String::new(),
            },
        );
    }

    pub fn add_network(&self, datacenter: &str, network: NetworkRef) {
        self.state().networks.push((datacenter.to_string(), network));
    }

    /// Add a VM at `/<datacenter>/vm/<path>`.
    pub fn add_vm(&self, datacenter: &str, path: &str, facts: VmFacts) -> MoRef {
        let mut s = self.state();
        let moref = MoRef::vm(format!("vm-{}", s.next()));
        let guest = s.fresh_guest(&facts.name, &facts);
        s.vms.push(SimVm {
            moref: moref.clone(),
            path: format!("/{datacenter}/vm/{}", path.trim_matches('/')),
            facts,
            guest,
            events: Vec::new(),
            extra_config: Vec::new(),
        });
        moref
    }

    // ── Behaviour knobs ─────────────────────────────────────────────

    /// Guest states reported, one per `guest_info` call, for the VM named
    /// `name` (also for clones created later). The last one sticks.
    pub fn set_guest_sequence(&self, name: &str, states: Vec<GuestInfo>) {
        let mut s = self.state();
        if let Some(first) = states.first().cloned() {
            for vm in s.vms.iter_mut().filter(|v| v.facts.name == name) {
                vm.guest = first.clone();
            }
        }
        s.guest_sequences.insert(name.to_string(), states.into());
    }

    pub fn set_guest_script(&self, script: GuestScript) {
        self.state().guest_script = script;
    }

    /// Outcome for programs whose arguments contain `needle`.
    pub fn set_guest_script_for(&self, needle: &str, script: GuestScript) {
        self.state().scripts_by_content.push((needle.to_string(), script));
    }

    pub fn reject_guest_auth(&self, rejected: bool) {
        self.state().guest_auth_rejected = rejected;
    }

    /// `Some(true)`: clones with customization report success; `Some(false)`:
    /// failure; `None`: no event ever shows up.
    pub fn set_customization_result(&self, result: Option<bool>) {
        let event = result.map(|ok| if ok { "CustomizationSucceeded" } else { "CustomizationFailed" });
        self.state().customization_event = event.map(String::from);
    }

    /// Event type posted on customized clones, e.g. `CustomizationNetworkSetupFailed`.
    pub fn set_customization_event(&self, type_name: &str) {
        self.state().customization_event = Some(type_name.to_string());
    }

    /// Make the next task of `method` (`CloneVM_Task`, `ReconfigVM_Task`, ...)
    /// end in error.
    pub fn fail_next_task(&self, method: &str, message: &str) {
        self.state()
            .task_failures
            .insert(method.to_string(), message.to_string());
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<SimCall> {
        self.state().calls.clone()
    }

    /// Number of `guest_info` reads so far.
    pub fn guest_polls(&self) -> usize {
        self.state().guest_polls
    }

    pub fn task_submissions(&self) -> usize {
        self.state().calls.iter().filter(|c| c.is_task_submission()).count()
    }

    /// MoRef and facts of the VM named `name`.
    pub fn vm_named(&self, name: &str) -> Option<(MoRef, VmFacts)> {
        self.state()
            .vms
            .iter()
            .find(|v| v.facts.name == name)
            .map(|v| (v.moref.clone(), v.facts.clone()))
    }

    pub fn vm_path(&self, vm: &MoRef) -> Option<String> {
        self.state().vm(vm).ok().map(|v| v.path.clone())
    }

    pub fn extra_config(&self, vm: &MoRef) -> Vec<OptionValue> {
        self.state()
            .vm(vm)
            .map(|v| v.extra_config.clone())
            .unwrap_or_default()
    }

    fn check_guest_auth(&self, auth: &GuestAuth) -> CloneResult<()> {
        if self.state().guest_auth_rejected {
            return Err(CloneError::guest_auth(format!(
                "InvalidGuestLogin: Failed to authenticate with the guest operating system as {}",
                auth.username
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for SimulatedPlatform {
    async fn about(&self) -> CloneResult<ProductInfo> {
        Ok(self.state().about.clone())
    }

    async fn find_by_inventory_path(&self, path: &str) -> CloneResult<Option<MoRef>> {
        let s = self.state();
        let trimmed = path.trim_matches('/');
        if let Some(dc) = s.datacenters.get(trimmed) {
            return Ok(Some(dc.moref.clone()));
        }
        let wanted = format!("/{trimmed}");
        Ok(s.vms.iter().find(|v| v.path == wanted).map(|v| v.moref.clone()))
    }

    async fn vm_facts(&self, vm: &MoRef) -> CloneResult<VmFacts> {
        Ok(self.state().vm(vm)?.facts.clone())
    }

    async fn datacenter(&self, name: &str) -> CloneResult<DatacenterFacts> {
        self.state()
            .datacenters
            .get(name)
            .cloned()
            .ok_or_else(|| CloneError::not_found(format!("Datacenter '{name}' not found")))
    }

    async fn networks_named(
        &self,
        datacenter: &DatacenterFacts,
        name: &str,
    ) -> CloneResult<Vec<NetworkRef>> {
        Ok(self
            .state()
            .networks
            .iter()
            .filter(|(dc, n)| *dc == datacenter.name && n.name == name)
            .map(|(_, n)| n.clone())
            .collect())
    }

    async fn host_product(&self, host: &MoRef) -> CloneResult<ProductInfo> {
        self.state()
            .hosts
            .get(&host.value)
            .cloned()
            .ok_or_else(|| CloneError::not_found(format!("Managed object not found: {host}")))
    }

    async fn clone_vm(
        &self,
        source: &MoRef,
        folder: &MoRef,
        name: &str,
        spec: &CloneSpec,
    ) -> CloneResult<MoRef> {
        let mut s = self.state();
        s.calls.push(SimCall::CloneVm {
            source: source.clone(),
            folder: folder.clone(),
            name: name.to_string(),
            spec: spec.clone(),
        });
        let src = s.vm(source)?.facts.clone();
        let folder_path = s
            .folders
            .get(&folder.value)
            .cloned()
            .ok_or_else(|| CloneError::not_found(format!("Managed object not found: {folder}")))?;

        let (task, failed) = s.task("CloneVM_Task", None);
        if failed {
            return Ok(task);
        }

        let mut facts = src;
        facts.name = name.to_string();
        facts.power_state = if spec.power_on {
            VmPowerState::PoweredOn
        } else {
            VmPowerState::PoweredOff
        };
        let mut devices = std::mem::take(&mut facts.devices);
        s.apply_device_changes(&mut devices, &spec.location.device_change);
        facts.devices = devices;

        let vm = s.create_vm(format!("{folder_path}/{name}"), facts, spec.customization.is_some());
        s.tasks
            .insert(task.value.clone(), Ok(Some(serde_json::to_value(&vm)?)));
        Ok(task)
    }

    async fn instant_clone_vm(&self, source: &MoRef, spec: &InstantCloneSpec) -> CloneResult<MoRef> {
        let mut s = self.state();
        s.calls.push(SimCall::InstantClone {
            source: source.clone(),
            spec: spec.clone(),
        });
        let src = s.vm(source)?;
        let src_facts = src.facts.clone();
        let parent = src
            .path
            .rsplit_once('/')
            .map(|(p, _)| p.to_string())
            .unwrap_or_default();
        let folder_path = match spec.location.folder {
            Some(ref f) => s
                .folders
                .get(&f.value)
                .cloned()
                .ok_or_else(|| CloneError::not_found(format!("Managed object not found: {f}")))?,
            None => parent,
        };

        let (task, failed) = s.task("InstantClone_Task", None);
        if failed {
            return Ok(task);
        }

        let mut facts = src_facts;
        facts.name = spec.name.clone();
        facts.power_state = VmPowerState::PoweredOn;
        let mut devices = std::mem::take(&mut facts.devices);
        s.apply_device_changes(&mut devices, &spec.location.device_change);
        facts.devices = devices;

        let vm = s.create_vm(format!("{folder_path}/{}", spec.name), facts, false);
        s.tasks
            .insert(task.value.clone(), Ok(Some(serde_json::to_value(&vm)?)));
        Ok(task)
    }

    async fn reconfigure_vm(&self, vm: &MoRef, spec: &ConfigSpec) -> CloneResult<MoRef> {
        let mut s = self.state();
        s.calls.push(SimCall::Reconfigure {
            vm: vm.clone(),
            spec: spec.clone(),
        });
        let mut devices = s.vm(vm)?.facts.devices.clone();
        let (task, failed) = s.task("ReconfigVM_Task", None);
        if failed {
            return Ok(task);
        }
        s.apply_device_changes(&mut devices, &spec.device_change);
        let target = s.vm_mut(vm)?;
        target.facts.devices = devices;
        target.extra_config.extend(spec.extra_config.iter().cloned());
        Ok(task)
    }

    async fn power_on_vm(&self, vm: &MoRef) -> CloneResult<MoRef> {
        let mut s = self.state();
        s.calls.push(SimCall::PowerOn(vm.clone()));
        if s.vm(vm)?.facts.power_state == VmPowerState::PoweredOn {
            s.task_failures
                .insert("PowerOnVM_Task".into(), "InvalidPowerState: already powered on".into());
        }
        let (task, failed) = s.task("PowerOnVM_Task", None);
        if !failed {
            s.vm_mut(vm)?.facts.power_state = VmPowerState::PoweredOn;
        }
        Ok(task)
    }

    async fn power_off_vm(&self, vm: &MoRef) -> CloneResult<MoRef> {
        let mut s = self.state();
        s.calls.push(SimCall::PowerOff(vm.clone()));
        s.vm(vm)?;
        let (task, failed) = s.task("PowerOffVM_Task", None);
        if !failed {
            s.vm_mut(vm)?.facts.power_state = VmPowerState::PoweredOff;
        }
        Ok(task)
    }

    async fn destroy_vm(&self, vm: &MoRef) -> CloneResult<MoRef> {
        let mut s = self.state();
        s.calls.push(SimCall::Destroy(vm.clone()));
        if s.vm(vm)?.facts.power_state == VmPowerState::PoweredOn {
            s.task_failures
                .insert("Destroy_Task".into(), "InvalidPowerState: VM is powered on".into());
        }
        let (task, failed) = s.task("Destroy_Task", None);
        if !failed {
            s.vms.retain(|v| &v.moref != vm);
        }
        Ok(task)
    }

    async fn wait_for_task(&self, task: &MoRef) -> CloneResult<Option<Value>> {
        match self.state().tasks.get(&task.value) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(msg)) => Err(CloneError::task(format!("Task {} failed: {msg}", task.value))),
            None => Err(CloneError::not_found(format!("Managed object not found: {task}"))),
        }
    }

    async fn guest_info(&self, vm: &MoRef) -> CloneResult<GuestInfo> {
        let mut s = self.state();
        s.guest_polls += 1;
        let name = s.vm(vm)?.facts.name.clone();
        if let Some(queue) = s.guest_sequences.get_mut(&name) {
            let current = if queue.len() > 1 { queue.pop_front() } else { queue.front().cloned() };
            if let Some(g) = current {
                s.vm_mut(vm)?.guest = g;
            }
        }
        Ok(s.vm(vm)?.guest.clone())
    }

    async fn query_vm_events(&self, vm: &MoRef, type_names: &[&str]) -> CloneResult<Vec<VmEvent>> {
        Ok(self
            .state()
            .vm(vm)?
            .events
            .iter()
            .filter(|e| type_names.contains(&e.type_name.as_str()))
            .cloned()
            .collect())
    }

    async fn start_guest_program(
        &self,
        vm: &MoRef,
        auth: &GuestAuth,
        spec: &GuestProgramSpec,
    ) -> CloneResult<i64> {
        self.check_guest_auth(auth)?;
        let mut s = self.state();
        s.calls.push(SimCall::StartProgram {
            vm: vm.clone(),
            spec: spec.clone(),
        });
        if !s.vm(vm)?.guest.tools_running() {
            return Err(CloneError::precondition("GuestOperationsUnavailable: tools not running"));
        }

        let script = s
            .scripts_by_content
            .iter()
            .find(|(needle, _)| spec.arguments.contains(needle.as_str()))
            .map(|(_, script)| script.clone())
            .unwrap_or_else(|| s.guest_script.clone());

        // redirect targets follow `> out 2> err`
        let mut words = spec.arguments.split_whitespace();
        let mut out_path = None;
        let mut err_path = None;
        while let Some(w) = words.next() {
            match w {
                ">" => out_path = words.next(),
                "2>" => err_path = words.next(),
                _ => {}
            }
        }
        let clean = |p: &str| p.trim_matches(|c: char| c == '\'' || c == '"').to_string();
        if let Some(p) = out_path.map(clean) {
            s.guest_files.insert(p, script.stdout.clone().into_bytes());
        }
        if let Some(p) = err_path.map(clean) {
            s.guest_files.insert(p, script.stderr.clone().into_bytes());
        }

        let pid = 1000 + s.next() as i64;
        s.processes.insert(pid, script.exit_code);
        Ok(pid)
    }

    async fn list_guest_processes(
        &self,
        _vm: &MoRef,
        auth: &GuestAuth,
        pids: &[i64],
    ) -> CloneResult<Vec<GuestProcessInfo>> {
        self.check_guest_auth(auth)?;
        let s = self.state();
        Ok(pids
            .iter()
            .filter_map(|pid| {
                s.processes.get(pid).map(|code| GuestProcessInfo {
                    pid: *pid,
                    name: None,
                    exit_code: Some(*code),
                })
            })
            .collect())
    }

    async fn file_transfer_from_guest(
        &self,
        _vm: &MoRef,
        auth: &GuestAuth,
        path: &str,
    ) -> CloneResult<FileTransferInfo> {
        self.check_guest_auth(auth)?;
        let mut s = self.state();
        let body = s
            .guest_files
            .get(path)
            .cloned()
            .ok_or_else(|| CloneError::not_found(format!("FileNotFound: {path}")))?;
        let url = format!("https://vcenter.sim/guestFile?id={}", s.next());
        let size = body.len() as i64;
        s.transfers.insert(url.clone(), body);
        Ok(FileTransferInfo { size, url })
    }

    async fn fetch_transfer(&self, url: &str) -> CloneResult<Vec<u8>> {
        self.state()
            .transfers
            .remove(url)
            .ok_or_else(|| CloneError::api(404, format!("No transfer at {url}")))
    }

    async fn delete_guest_file(&self, _vm: &MoRef, auth: &GuestAuth, path: &str) -> CloneResult<()> {
        self.check_guest_auth(auth)?;
        self.state().guest_files.remove(path);
        Ok(())
    }
}
