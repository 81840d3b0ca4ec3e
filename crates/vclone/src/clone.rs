//! Clone orchestrator.
//!
//! One [`CloneRun`] drives one request through
//! `Planned → Preflighted → TaskSubmitted → Cloned → NetworkReconciled →
//! Customized → PoweredOn → Discovered`. Nothing is retried apart from the
//! bounded polling inside the waits; a failure leaves whatever the platform
//! already created in place and reports it through [`CloneRun::created_vm`].

use crate::benchmark::{self, BenchmarkRun};
use crate::context::RunContext;
use crate::customization::{self, GuestCustomizationSpec, ReachabilityProbe};
use crate::discovery::{self, DiscoveryOptions, DiscoveryResult};
use crate::error::{CloneError, CloneResult};
use crate::guest_ops::{self, GuestExecutor};
use crate::network::{self, NetworkChanges};
use crate::platform::{DatacenterFacts, Platform, VmFacts};
use crate::reconfig;
use crate::request::{CloneRequest, CloneStrategy, NetworkOperation};
use crate::types::*;

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

const LINKED_DISK_MOVE: &str = "moveChildMostDiskBacking";
const INSTANT_MIN_VERSION: (u32, u32) = (6, 7);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CloneState {
    Planned,
    Preflighted,
    TaskSubmitted,
    Cloned,
    NetworkReconciled,
    Customized,
    PoweredOn,
    Discovered,
}

/// Placement and device changes for one run.
#[derive(Debug, Clone)]
pub struct ClonePlan {
    pub strategy: CloneStrategy,
    pub relocate: RelocateSpec,
    pub folder: MoRef,
    /// Adapter edit applied inside the clone task, if any.
    pub edit: Option<DeviceConfigSpec>,
    /// Adapters added after the VM exists.
    pub deferred_adds: Vec<DeviceConfigSpec>,
    pub warnings: Vec<String>,
}

/// Result of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneOutcome {
    pub vm_name: String,
    pub vm: MoRef,
    pub path: String,
    /// Address to connect to; `None` when the VM was left powered off.
    pub address: Option<String>,
    pub discovery: Option<DiscoveryResult>,
    pub strategy: CloneStrategy,
    pub warnings: Vec<String>,
}

pub struct CloneRun<'a> {
    platform: &'a dyn Platform,
    probe: &'a dyn ReachabilityProbe,
    request: &'a CloneRequest,
    ctx: RunContext,
    state: CloneState,
    strategy: CloneStrategy,
    started: Instant,
    created: Option<MoRef>,
}

impl<'a> CloneRun<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        probe: &'a dyn ReachabilityProbe,
        request: &'a CloneRequest,
    ) -> Self {
        Self {
            platform,
            probe,
            request,
            ctx: RunContext::new(request.vm_name.clone()),
            state: CloneState::Planned,
            strategy: request.clone_type,
            started: Instant::now(),
            created: None,
        }
    }

    /// Run under `ctx` (deadline / cancellation).
    pub fn with_context(mut self, ctx: RunContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn state(&self) -> CloneState {
        self.state
    }

    pub fn strategy(&self) -> CloneStrategy {
        self.strategy
    }

    /// The VM this run created, if the clone task got that far.
    pub fn created_vm(&self) -> Option<&MoRef> {
        self.created.as_ref()
    }

    pub async fn execute(&mut self) -> CloneResult<CloneOutcome> {
        self.started = Instant::now();
        match self.run().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let e = e.with_details(format!(
                    "vm={} strategy={} state={:?} elapsed={:.1}s",
                    self.request.vm_name,
                    self.strategy,
                    self.state,
                    self.started.elapsed().as_secs_f64()
                ));
                log::error!("[{}] Clone failed: {e}", self.ctx.vm_name());
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> CloneResult<CloneOutcome> {
        let req = self.request;
        req.validate()?;
        let changes = network::classify(&req.effective_networks())?;

        let mut bench = req
            .benchmark
            .then(|| BenchmarkRun::start(&req.template, req.clone_type, req.active_discovery));
        if let Some(b) = bench.as_mut() {
            b.checkpoint(benchmark::INITIALIZED);
        }

        let dc = self.platform.datacenter(&req.datacenter).await?;
        let inventory_path = format!("/{}/vm/{}", req.datacenter, req.template.trim_matches('/'));
        let source = self
            .platform
            .find_by_inventory_path(&inventory_path)
            .await?
            .ok_or_else(|| CloneError::not_found(format!("Unable to find template: {}", req.template)))?;
        let source_facts = self.platform.vm_facts(&source).await?;

        let mut warnings = self.downgrade(&source_facts);
        if let Some(b) = bench.as_mut() {
            b.set_strategy(self.strategy);
        }

        let mut plan = self.plan(&dc, &source_facts, &changes).await?;
        plan.warnings.append(&mut warnings);

        if self.strategy == CloneStrategy::Instant {
            self.preflight_instant(&source_facts).await?;
        }
        self.state = CloneState::Preflighted;

        let guest_spec = self.guest_customization_spec(&source, &source_facts).await?;

        self.submit(&source, &plan, guest_spec.as_ref()).await?;
        if let Some(b) = bench.as_mut() {
            b.checkpoint(benchmark::CLONED);
        }

        let path = format!("/{}/vm/{}", req.datacenter, req.vm_path());
        let vm = match self.platform.find_by_inventory_path(&path).await? {
            Some(found) => found,
            None => {
                return Err(CloneError::not_found(format!(
                    "Unable to find machine: {}",
                    req.vm_path()
                )))
            }
        };
        if self.created.is_none() {
            self.created = Some(vm.clone());
        }
        self.state = CloneState::Cloned;

        self.reconcile_network(&vm, &plan).await?;
        self.state = CloneState::NetworkReconciled;

        if let Some(ref vmc) = req.vm_customization {
            let facts = self.platform.vm_facts(&vm).await?;
            let spec = reconfig::build_config_spec(self.ctx.vm_name(), vmc, &facts.devices)?;
            log::info!("[{}] Waiting for reconfiguration to finish", self.ctx.vm_name());
            self.run_task(self.platform.reconfigure_vm(&vm, &spec).await?).await?;
            if let Some(b) = bench.as_mut() {
                b.checkpoint(benchmark::RECONFIGURED);
            }
        }
        self.state = CloneState::Customized;

        let powered_on = self.power_on_if_needed(&vm).await?;

        if let Some(ref spec) = guest_spec {
            if powered_on {
                let params = req.guest_customization.as_ref();
                let task_timeout = params
                    .and_then(|p| p.timeout_task)
                    .unwrap_or(customization::DEFAULT_TIMEOUT_TASK);
                let ip_timeout = params
                    .and_then(|p| p.timeout_ip)
                    .unwrap_or(customization::DEFAULT_TIMEOUT_IP);
                customization::wait_for_customization(
                    self.platform,
                    &self.ctx,
                    &vm,
                    Duration::from_secs(task_timeout),
                )
                .await?;
                customization::wait_for_customized_ip(
                    self.platform,
                    &self.ctx,
                    &vm,
                    spec,
                    Duration::from_secs(ip_timeout),
                )
                .await?;
                if let Some(b) = bench.as_mut() {
                    b.checkpoint(benchmark::CUSTOMIZED);
                }
            } else {
                log::info!(
                    "[{}] VM left powered off, guest customization runs on first boot",
                    self.ctx.vm_name()
                );
            }
        }
        self.state = CloneState::PoweredOn;

        if !req.post_create.is_empty() {
            self.run_post_create(&vm, source_facts.guest_id.as_deref()).await?;
        }

        let (address, discovery) = if powered_on {
            let result = self.discover(&vm, source_facts.guest_id.clone()).await;
            if let Some(mut b) = bench.take() {
                if result.is_ok() {
                    b.checkpoint(benchmark::IP_DETECTED);
                }
                if let Err(e) = b.persist(&req.benchmark_file) {
                    log::warn!("[{}] Could not write benchmark data: {e}", self.ctx.vm_name());
                }
            }
            let result = result?;
            log::info!(
                "[{}] Created machine {} with IP {}",
                self.ctx.vm_name(),
                req.vm_name,
                result.address
            );
            (Some(result.address.clone()), Some(result))
        } else {
            if let Some(mut b) = bench.take() {
                b.persist(&req.benchmark_file)?;
            }
            log::info!("[{}] Created machine {} (powered off)", self.ctx.vm_name(), req.vm_name);
            (None, None)
        };
        self.state = CloneState::Discovered;

        Ok(CloneOutcome {
            vm_name: req.vm_name.clone(),
            vm,
            path: req.vm_path(),
            address,
            discovery,
            strategy: self.strategy,
            warnings: plan.warnings,
        })
    }

    /// Linked and instant clones need a VM with a snapshot.
    fn downgrade(&mut self, source: &VmFacts) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.strategy == CloneStrategy::Full {
            return warnings;
        }
        let reason = if source.template {
            Some("source is a template")
        } else if !source.has_snapshot {
            Some("source has no snapshot")
        } else {
            None
        };
        if let Some(reason) = reason {
            let msg = format!(
                "Using full clone instead of {} clone: {reason}",
                self.strategy
            );
            log::warn!("[{}] {msg}", self.ctx.vm_name());
            warnings.push(msg);
            self.strategy = CloneStrategy::Full;
        }
        warnings
    }

    async fn plan(
        &self,
        dc: &DatacenterFacts,
        source: &VmFacts,
        changes: &NetworkChanges,
    ) -> CloneResult<ClonePlan> {
        let req = self.request;
        let folder = match req.folder {
            Some(ref f) => MoRef::folder(f.id.clone()),
            None => dc.vm_folder.clone(),
        };

        let mut relocate = RelocateSpec::default();
        relocate.pool = req.resource_pool.clone().map(MoRef::pool);
        match self.strategy {
            // shared memory pages pin the clone to the source's host
            CloneStrategy::Instant => relocate.folder = Some(folder.clone()),
            CloneStrategy::Linked => {
                relocate.host = req.target_host.clone().map(MoRef::host);
                relocate.disk_move_type = Some(LINKED_DISK_MOVE.into());
            }
            CloneStrategy::Full => relocate.host = req.target_host.clone().map(MoRef::host),
        }

        let mut edit = None;
        if let Some(ref name) = changes.edit {
            let net = network::resolve_network(self.platform, &self.ctx, dc, name).await?;
            log::info!("[{}] Assigning network {name}...", self.ctx.vm_name());
            let mut change =
                network::plan_change(source.first_ethernet_card(), &net, NetworkOperation::Edit, 0)?;
            if self.strategy == CloneStrategy::Instant {
                network::disconnect_for_clone(&mut change);
            }
            relocate.device_change.push(change.clone());
            edit = Some(change);
        }

        let mut nets = Vec::with_capacity(changes.adds.len());
        for name in &changes.adds {
            nets.push(network::resolve_network(self.platform, &self.ctx, dc, name).await?);
        }
        let deferred_adds = network::plan_adds(&nets)?;

        Ok(ClonePlan {
            strategy: self.strategy,
            relocate,
            folder,
            edit,
            deferred_adds,
            warnings: Vec::new(),
        })
    }

    async fn preflight_instant(&self, source: &VmFacts) -> CloneResult<()> {
        let (major, minor) = INSTANT_MIN_VERSION;
        if self.request.guest_customization.is_some() {
            return Err(CloneError::precondition(
                "Guest customization is not supported for instant clones",
            ));
        }

        let about = self.platform.about().await?;
        log::debug!("[{}] Detected {}", self.ctx.vm_name(), about.full_name);
        if !about.at_least(major, minor) {
            return Err(CloneError::precondition(format!(
                "Instant clones only supported with vCenter {major}.{minor} or higher (found {})",
                about.version
            )));
        }

        let host = self
            .request
            .target_host
            .clone()
            .map(MoRef::host)
            .or_else(|| source.host.clone())
            .ok_or_else(|| CloneError::precondition("No host known for the instant clone source"))?;
        let esx = self.platform.host_product(&host).await?;
        log::debug!("[{}] Detected {}", self.ctx.vm_name(), esx.full_name);
        if !esx.at_least(major, minor) {
            return Err(CloneError::precondition(format!(
                "Instant clones only supported with ESX {major}.{minor} or higher (found {})",
                esx.version
            )));
        }

        if source.power_state != VmPowerState::PoweredOn {
            return Err(CloneError::precondition("Need a running VM for instant clones"));
        }
        if !source.instant_clone_frozen {
            return Err(CloneError::precondition(
                "Need a frozen VM for instant clones, running source VM not supported yet",
            ));
        }
        Ok(())
    }

    async fn guest_customization_spec(
        &self,
        source: &MoRef,
        facts: &VmFacts,
    ) -> CloneResult<Option<GuestCustomizationSpec>> {
        let Some(ref params) = self.request.guest_customization else {
            return Ok(None);
        };
        let os = match self.request.vm_os {
            Some(os) => os,
            None => {
                let guest = self.platform.guest_info(source).await?;
                guest_ops::os_family(&guest, facts.guest_id.as_deref())?
            }
        };
        let spec = customization::build_spec(
            &self.ctx,
            params,
            os,
            facts.guest_full_name.as_deref(),
            self.probe,
        )
        .await?;
        Ok(Some(spec))
    }

    async fn submit(
        &mut self,
        source: &MoRef,
        plan: &ClonePlan,
        guest_spec: Option<&GuestCustomizationSpec>,
    ) -> CloneResult<Option<MoRef>> {
        let req = self.request;
        self.ctx.check()?;
        log::info!("[{}] Cloning '{}' to create the VM...", self.ctx.vm_name(), req.template);

        let task = match self.strategy {
            CloneStrategy::Instant => {
                let spec = InstantCloneSpec::new(req.vm_name.clone(), plan.relocate.clone());
                self.state = CloneState::TaskSubmitted;
                self.platform.instant_clone_vm(source, &spec).await?
            }
            CloneStrategy::Full | CloneStrategy::Linked => {
                let power_on = req.poweron && req.vm_customization.is_none();
                let mut spec = CloneSpec::new(plan.relocate.clone(), power_on);
                spec.customization = guest_spec.map(|s| s.to_value()).transpose()?;
                self.state = CloneState::TaskSubmitted;
                self.platform
                    .clone_vm(source, &plan.folder, &req.vm_name, &spec)
                    .await?
            }
        };

        let vm = self
            .run_task(task)
            .await?
            .and_then(|v| serde_json::from_value::<MoRef>(v).ok());
        if vm.is_some() {
            self.created = vm.clone();
        }
        Ok(vm)
    }

    async fn reconcile_network(&self, vm: &MoRef, plan: &ClonePlan) -> CloneResult<()> {
        let mut batch = Vec::new();

        if self.strategy == CloneStrategy::Instant {
            if let Some(ref edit) = plan.edit {
                let facts = self.platform.vm_facts(vm).await?;
                let adapter = facts
                    .devices
                    .iter()
                    .find(|d| d.key == edit.device.key && d.is_ethernet_card())
                    .or_else(|| facts.first_ethernet_card())
                    .ok_or_else(|| CloneError::not_found("Instant clone has no network adapter to reconnect"))?;
                batch.push(network::reconnect(adapter));
            }
        }
        batch.extend(plan.deferred_adds.iter().cloned());

        if batch.is_empty() {
            return Ok(());
        }
        log::info!(
            "[{}] Reconfiguring network adapters ({} change(s))",
            self.ctx.vm_name(),
            batch.len()
        );
        let spec = ConfigSpec::with_devices(batch);
        self.run_task(self.platform.reconfigure_vm(vm, &spec).await?).await?;
        Ok(())
    }

    /// Returns whether the VM ends up running.
    async fn power_on_if_needed(&self, vm: &MoRef) -> CloneResult<bool> {
        let facts = self.platform.vm_facts(vm).await?;
        if facts.power_state == VmPowerState::PoweredOn {
            return Ok(true);
        }
        let req = self.request;
        if req.poweron && req.vm_customization.is_some() && self.strategy != CloneStrategy::Instant {
            log::info!("[{}] Powering on VM", self.ctx.vm_name());
            self.run_task(self.platform.power_on_vm(vm).await?).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn run_post_create(&self, vm: &MoRef, guest_id: Option<&str>) -> CloneResult<()> {
        let req = self.request;
        let guest = guest_ops::wait_for_tools(
            self.platform,
            &self.ctx,
            vm,
            Duration::from_secs(req.vm_wait_timeout),
            Duration::from_secs_f64(req.vm_wait_interval),
        )
        .await?;
        let os = match req.vm_os {
            Some(os) => os,
            None => guest_ops::os_family(&guest, guest_id)?,
        };

        let auth = GuestAuth::new(req.vm_username.clone(), req.vm_password.clone());
        let exec = GuestExecutor::new(self.platform, &self.ctx, vm, auth, os);
        for (i, script) in req.post_create.iter().enumerate() {
            log::info!(
                "[{}] Running post-create script {}/{}",
                self.ctx.vm_name(),
                i + 1,
                req.post_create.len()
            );
            let output = exec
                .run_shell_capture_output(&script.script, script.shell, Duration::from_secs(script.timeout))
                .await?;
            log::debug!("[{}] Script output: {}", self.ctx.vm_name(), output.trim());
        }
        Ok(())
    }

    async fn discover(&self, vm: &MoRef, guest_id: Option<String>) -> CloneResult<DiscoveryResult> {
        let req = self.request;
        let mut opts = DiscoveryOptions::new(
            Duration::from_secs(req.vm_wait_timeout),
            Duration::from_secs_f64(req.vm_wait_interval),
            GuestAuth::new(req.vm_username.clone(), req.vm_password.clone()),
        );
        opts.active = req.active_discovery;
        opts.active_command = req.active_discovery_command.clone();
        opts.interface = req.interface.clone();
        opts.transform = req.transform_ip.clone();
        opts.os = req.vm_os;
        opts.guest_id = guest_id;
        opts.win_network = Some(req.vm_win_network.clone()).filter(|n| !n.is_empty());

        let force_active = self.strategy == CloneStrategy::Instant;
        discovery::discover(self.platform, &self.ctx, vm, &opts, force_active).await
    }

    async fn run_task(&self, task: MoRef) -> CloneResult<Option<serde_json::Value>> {
        self.ctx.check()?;
        self.platform.wait_for_task(&task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloneErrorKind;
    use crate::sim::{SimCall, SimulatedPlatform};
    use std::net::Ipv4Addr;

    struct Quiet;

    #[async_trait::async_trait]
    impl ReachabilityProbe for Quiet {
        async fn is_reachable(&self, _ip: Ipv4Addr) -> bool {
            false
        }
    }

    fn base_vm() -> (SimulatedPlatform, CloneRequest) {
        let sim = SimulatedPlatform::new();
        sim.add_datacenter("DC1");
        sim.add_vm(
            "DC1",
            "templates/ubuntu",
            VmFacts {
                name: "ubuntu".into(),
                has_snapshot: true,
                power_state: VmPowerState::PoweredOff,
                guest_id: Some("ubuntu64Guest".into()),
                devices: vec![VirtualDevice::new("VirtualVmxnet3", 4000)],
                ..VmFacts::default()
            },
        );
        let mut req = CloneRequest::new("web-1", "templates/ubuntu", "DC1");
        req.target_host = Some("host-1".into());
        (sim, req)
    }

    #[tokio::test]
    async fn linked_clone_moves_child_disks() {
        let (sim, mut req) = base_vm();
        req.clone_type = CloneStrategy::Linked;
        let mut run = CloneRun::new(&sim, &Quiet, &req);
        let dc = sim.datacenter("DC1").await.unwrap();
        let (_, facts) = sim.vm_named("ubuntu").unwrap();
        let plan = run.plan(&dc, &facts, &NetworkChanges::default()).await.unwrap();

        assert_eq!(plan.relocate.disk_move_type.as_deref(), Some(LINKED_DISK_MOVE));
        assert_eq!(plan.relocate.host, Some(MoRef::host("host-1")));
        assert!(run.downgrade(&facts).is_empty());
    }

    #[tokio::test]
    async fn instant_plan_omits_host() {
        let (sim, mut req) = base_vm();
        req.clone_type = CloneStrategy::Instant;
        let run = CloneRun::new(&sim, &Quiet, &req);
        let dc = sim.datacenter("DC1").await.unwrap();
        let (_, facts) = sim.vm_named("ubuntu").unwrap();
        let plan = run.plan(&dc, &facts, &NetworkChanges::default()).await.unwrap();
        assert!(plan.relocate.host.is_none());
        assert_eq!(plan.relocate.folder, Some(dc.vm_folder));
    }

    #[tokio::test]
    async fn template_source_downgrades() {
        let (sim, mut req) = base_vm();
        req.clone_type = CloneStrategy::Instant;
        let mut run = CloneRun::new(&sim, &Quiet, &req);
        let warnings = run.downgrade(&VmFacts {
            template: true,
            has_snapshot: true,
            ..VmFacts::default()
        });
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("template"));
        assert_eq!(run.strategy(), CloneStrategy::Full);
    }

    #[tokio::test]
    async fn missing_template_is_not_found() {
        let (sim, mut req) = base_vm();
        req.template = "templates/missing".into();
        let mut run = CloneRun::new(&sim, &Quiet, &req);
        let err = run.execute().await.unwrap_err();
        assert!(err.is(CloneErrorKind::NotFound));
        assert!(err.details.as_deref().unwrap().contains("state=Planned"));
        assert!(run.created_vm().is_none());
        assert!(sim.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_clone_task_leaves_nothing_created() {
        let (sim, req) = base_vm();
        sim.fail_next_task("CloneVM_Task", "InsufficientResourcesFault");
        let mut run = CloneRun::new(&sim, &Quiet, &req);
        let err = run.execute().await.unwrap_err();
        assert!(err.is(CloneErrorKind::TaskFailed));
        assert_eq!(run.state(), CloneState::TaskSubmitted);
        assert!(run.created_vm().is_none());
        assert!(matches!(sim.calls()[0], SimCall::CloneVm { .. }));
    }
}
