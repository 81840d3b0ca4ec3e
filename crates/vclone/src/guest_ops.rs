//! In-guest execution through VMware Tools guest operations.
//!
//! Scripts run through a shell with stdout and stderr redirected to temp
//! files inside the guest; the stdout file is pulled back through the file
//! transfer URL once the process has exited.

use crate::context::{Poller, RunContext};
use crate::error::{CloneError, CloneErrorKind, CloneResult};
use crate::platform::Platform;
use crate::request::ShellKind;
use crate::types::{GuestAuth, GuestInfo, GuestOsFamily, GuestProgramSpec, MoRef};

use std::time::Duration;

const PROCESS_POLL: Duration = Duration::from_secs(1);
const POWERSHELL: &str = r"C:\Windows\System32\WindowsPowershell\v1.0\powershell.exe";

/// OS family from tools, falling back to the configured guest id.
pub fn os_family(guest: &GuestInfo, guest_id: Option<&str>) -> CloneResult<GuestOsFamily> {
    match guest.guest_family.as_deref() {
        Some("windowsGuest") => Ok(GuestOsFamily::Windows),
        Some("linuxGuest") => Ok(GuestOsFamily::Linux),
        Some(other) if !other.is_empty() => Err(CloneError::precondition(format!(
            "Unsupported guest family `{other}`, only Linux and Windows guests are handled"
        ))),
        // tools not running yet
        _ => Ok(match guest_id {
            Some(id) if id.starts_with("win") => GuestOsFamily::Windows,
            _ => GuestOsFamily::Linux,
        }),
    }
}

/// Program invocation that runs `script` with redirected output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    pub program: String,
    pub arguments: String,
    pub stdout_path: String,
    pub stderr_path: String,
}

pub fn shell_invocation(os: GuestOsFamily, shell: ShellKind, script: &str, id: &str) -> ShellInvocation {
    let shell = match shell {
        ShellKind::Auto => match os {
            GuestOsFamily::Linux => ShellKind::Linux,
            GuestOsFamily::Windows => ShellKind::Cmd,
        },
        other => other,
    };

    match shell {
        ShellKind::Linux | ShellKind::Auto => {
            let out = format!("/tmp/vclone_run_out_{id}");
            let err = format!("/tmp/vclone_run_err_{id}");
            ShellInvocation {
                program: "/bin/sh".into(),
                arguments: format!("-c '({}) > {out} 2> {err}'", script.replace('\'', r"'\''")),
                stdout_path: out,
                stderr_path: err,
            }
        }
        ShellKind::Cmd => {
            let out = format!(r"C:\Windows\TEMP\vclone_run_out_{id}");
            let err = format!(r"C:\Windows\TEMP\vclone_run_err_{id}");
            ShellInvocation {
                program: "cmd.exe".into(),
                arguments: format!(r#"/c "{} > {out} 2> {err}""#, script.replace('"', r#"\""#)),
                stdout_path: out,
                stderr_path: err,
            }
        }
        ShellKind::PowerShell => {
            let out = format!(r"C:\Windows\TEMP\vclone_run_out_{id}");
            let err = format!(r"C:\Windows\TEMP\vclone_run_err_{id}");
            ShellInvocation {
                program: POWERSHELL.into(),
                arguments: format!(r#"-Command "{} > {out} 2> {err}""#, script.replace('"', r#"\""#)),
                stdout_path: out,
                stderr_path: err,
            }
        }
    }
}

/// Runs programs inside one guest with one set of credentials.
pub struct GuestExecutor<'a> {
    platform: &'a dyn Platform,
    ctx: &'a RunContext,
    vm: &'a MoRef,
    auth: GuestAuth,
    os: GuestOsFamily,
}

impl<'a> GuestExecutor<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        ctx: &'a RunContext,
        vm: &'a MoRef,
        auth: GuestAuth,
        os: GuestOsFamily,
    ) -> Self {
        Self { platform, ctx, vm, auth, os }
    }

    pub fn os_family(&self) -> GuestOsFamily {
        self.os
    }

    /// Run `script` and return what it printed on stdout.
    pub async fn run_shell_capture_output(
        &self,
        script: &str,
        shell: ShellKind,
        timeout: Duration,
    ) -> CloneResult<String> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let inv = shell_invocation(self.os, shell, script, &id);

        let result = self.run_captured(script, &inv, timeout).await;

        self.delete_quietly(&inv.stdout_path).await;
        self.delete_quietly(&inv.stderr_path).await;
        result
    }

    async fn run_captured(
        &self,
        script: &str,
        inv: &ShellInvocation,
        timeout: Duration,
    ) -> CloneResult<String> {
        let exit_code = self.run_program(&inv.program, &inv.arguments, timeout).await?;
        if exit_code != 0 {
            let stderr = self.read_file(&inv.stderr_path).await.unwrap_or_default();
            return Err(CloneError::guest_command(format!(
                "Error executing command {script}. Exit code: {exit_code}. StdErr: {}",
                stderr.trim()
            )));
        }
        self.read_file(&inv.stdout_path).await
    }

    /// Start a program and wait for it to exit; returns the exit code.
    pub async fn run_program(&self, path: &str, args: &str, timeout: Duration) -> CloneResult<i32> {
        log::debug!("[{}] Running {path} {args}", self.ctx.vm_name());
        let spec = GuestProgramSpec::new(path, args);
        let pid = self.platform.start_guest_program(self.vm, &self.auth, &spec).await?;
        self.wait_for_process_exit(pid, timeout).await
    }

    async fn wait_for_process_exit(&self, pid: i64, timeout: Duration) -> CloneResult<i32> {
        let mut poller = Poller::new(timeout, PROCESS_POLL);
        loop {
            let procs = self
                .platform
                .list_guest_processes(self.vm, &self.auth, &[pid])
                .await?;
            if let Some(code) = procs.first().and_then(|p| p.exit_code) {
                return Ok(code);
            }
            if !poller.next(self.ctx).await? {
                break;
            }
        }
        Err(CloneError::timeout(format!(
            "Timeout waiting for process {pid} to exit after {} seconds",
            timeout.as_secs()
        )))
    }

    /// Download a guest file as text.
    pub async fn read_file(&self, path: &str) -> CloneResult<String> {
        let info = self
            .platform
            .file_transfer_from_guest(self.vm, &self.auth, path)
            .await?;
        let body = self.platform.fetch_transfer(&info.url).await?;
        if body.len() as i64 != info.size {
            return Err(CloneError::guest_command(format!(
                "Downloaded file has different size than reported: {path} ({} bytes instead of {} bytes)",
                body.len(),
                info.size
            )));
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    async fn delete_quietly(&self, path: &str) {
        if let Err(e) = self.platform.delete_guest_file(self.vm, &self.auth, path).await {
            log::debug!("[{}] Could not delete {path}: {e}", self.ctx.vm_name());
        }
    }
}

/// Wait until VMware Tools runs in the guest.
pub async fn wait_for_tools(
    platform: &dyn Platform,
    ctx: &RunContext,
    vm: &MoRef,
    timeout: Duration,
    interval: Duration,
) -> CloneResult<GuestInfo> {
    let mut poller = Poller::new(timeout, interval);
    loop {
        let guest = platform.guest_info(vm).await?;
        if guest.tools_running() {
            return Ok(guest);
        }
        if !poller.next(ctx).await? {
            break;
        }
    }
    Err(CloneError::new(
        CloneErrorKind::Timeout,
        format!("VMware Tools did not start within {} seconds", timeout.as_secs()),
    ))
}
