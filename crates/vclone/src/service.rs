//! Driver facade: create with optional rollback, destroy by inventory path.

use crate::clone::{CloneOutcome, CloneRun};
use crate::context::RunContext;
use crate::customization::{PingProbe, ReachabilityProbe};
use crate::error::CloneResult;
use crate::platform::{Platform, VimPlatform};
use crate::request::CloneRequest;
use crate::types::{MoRef, VmPowerState, VsphereConfig};

/// Create / destroy entry points over one platform connection.
pub struct CloneService<P: Platform = VimPlatform> {
    platform: P,
    probe: Box<dyn ReachabilityProbe>,
}

impl CloneService<VimPlatform> {
    /// Log in to vCenter.
    pub async fn connect(config: &VsphereConfig) -> CloneResult<Self> {
        log::info!("Connecting to vCenter {}:{}", config.host, config.port);
        let platform = VimPlatform::connect(config).await?;
        Ok(Self::new(platform))
    }

    pub async fn disconnect(&mut self) -> CloneResult<()> {
        self.platform.disconnect().await
    }
}

impl<P: Platform> CloneService<P> {
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            probe: Box::new(PingProbe),
        }
    }

    /// Replace the ICMP probe used for static address conflict checks.
    pub fn with_probe(mut self, probe: impl ReachabilityProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub async fn create(&self, request: &CloneRequest, rollback: bool) -> CloneResult<CloneOutcome> {
        self.create_with_context(request, rollback, RunContext::new(request.vm_name.clone()))
            .await
    }

    /// Clone under `ctx`. With `rollback`, a VM created by this run is
    /// destroyed again when a later step fails; a VM that existed before is
    /// never touched.
    pub async fn create_with_context(
        &self,
        request: &CloneRequest,
        rollback: bool,
        ctx: RunContext,
    ) -> CloneResult<CloneOutcome> {
        let mut run = CloneRun::new(&self.platform, self.probe.as_ref(), request).with_context(ctx);
        let err = match run.execute().await {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };

        match (rollback, run.created_vm()) {
            (true, Some(vm)) => {
                log::warn!("[{}] Rolling back, destroying {vm}", request.vm_name);
                if let Err(e) = self.destroy_vm(vm).await {
                    log::warn!("[{}] Rollback of {vm} failed: {e}", request.vm_name);
                }
            }
            (true, None) => {
                log::info!("[{}] Nothing to roll back, no VM was created", request.vm_name);
            }
            (false, _) => {}
        }
        Err(err)
    }

    /// Destroy `/<datacenter>/vm/<path>`. Returns `false` when there is
    /// no such VM.
    pub async fn destroy(&self, datacenter: &str, path: &str) -> CloneResult<bool> {
        let inventory_path = format!("/{datacenter}/vm/{}", path.trim_matches('/'));
        match self.platform.find_by_inventory_path(&inventory_path).await? {
            Some(vm) => {
                self.destroy_vm(&vm).await?;
                log::info!("Destroyed {inventory_path}");
                Ok(true)
            }
            None => {
                log::info!("Nothing to destroy at {inventory_path}");
                Ok(false)
            }
        }
    }

    async fn destroy_vm(&self, vm: &MoRef) -> CloneResult<()> {
        let facts = self.platform.vm_facts(vm).await?;
        if facts.power_state == VmPowerState::PoweredOn {
            log::info!("Powering off {} before destroying it", facts.name);
            let task = self.platform.power_off_vm(vm).await?;
            self.platform.wait_for_task(&task).await?;
        }
        let task = self.platform.destroy_vm(vm).await?;
        self.platform.wait_for_task(&task).await?;
        Ok(())
    }
}
