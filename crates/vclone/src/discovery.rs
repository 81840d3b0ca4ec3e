//! IP discovery.
//!
//! Two stages: an optional active probe that runs a script in the guest, and
//! standard polling of tools-reported addresses. Only a fatal active error
//! skips the standard stage. Link-local addresses are never a result.

use crate::context::{deadline_after, Poller, RunContext};
use crate::error::{CloneError, CloneErrorKind, CloneResult};
use crate::guest_ops::{self, GuestExecutor};
use crate::platform::Platform;
use crate::request::{ShellKind, TransformIp};
use crate::types::{GuestAuth, GuestInfo, GuestOsFamily, MoRef};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;

pub const LINUX_DISCOVERY_SCRIPT: &str =
    "ip address show scope global | grep global | cut -b10- | cut -d/ -f1";
pub const WINDOWS_DISCOVERY_SCRIPT: &str =
    "(Test-Connection -ComputerName $env:COMPUTERNAME -Count 1).IPV4Address.IPAddressToString";

/// Windows script reading the IPv4 address of `adapter`, falling back to
/// [`WINDOWS_DISCOVERY_SCRIPT`] when the adapter has none.
pub fn windows_discovery_script(adapter: &str) -> String {
    let alias = adapter.replace('\'', "''");
    format!(
        "$ip = (Get-NetIPAddress -InterfaceAlias '{alias}' -AddressFamily IPv4 -ErrorAction SilentlyContinue).IPAddress; \
         if (-not $ip) {{ $ip = {fallback} }}; $ip",
        fallback = WINDOWS_DISCOVERY_SCRIPT
    )
}

lazy_static! {
    static ref IPV4_TOKEN: Regex = Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    Active,
    Standard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    /// Address found in the guest.
    pub ip: Ipv4Addr,
    /// Address to hand to the caller, after `transformIp`.
    pub address: String,
    pub method: DiscoveryMethod,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub timeout: Duration,
    pub interval: Duration,
    pub active: bool,
    pub active_command: Option<String>,
    pub interface: Option<String>,
    pub transform: Option<TransformIp>,
    pub auth: GuestAuth,
    /// Forced OS family; detected from tools otherwise.
    pub os: Option<GuestOsFamily>,
    pub guest_id: Option<String>,
    /// Windows adapter alias read by the active script.
    pub win_network: Option<String>,
}

impl DiscoveryOptions {
    pub fn new(timeout: Duration, interval: Duration, auth: GuestAuth) -> Self {
        Self {
            timeout,
            interval,
            active: false,
            active_command: None,
            interface: None,
            transform: None,
            auth,
            os: None,
            guest_id: None,
            win_network: None,
        }
    }
}

/// Outcome of the active stage when it did not produce an address.
#[derive(Debug)]
pub enum ActiveError {
    /// Logged, standard discovery runs next.
    Recoverable(CloneError),
    /// Aborts discovery.
    Fatal(CloneError),
}

impl From<CloneError> for ActiveError {
    fn from(e: CloneError) -> Self {
        match e.kind {
            CloneErrorKind::AddressConflict | CloneErrorKind::Cancelled => Self::Fatal(e),
            _ => Self::Recoverable(e),
        }
    }
}

pub fn is_link_local(ip: &Ipv4Addr) -> bool {
    ip.is_link_local()
}

/// First dotted quad in script output that parses as IPv4.
pub fn first_ipv4_token(output: &str) -> Option<Ipv4Addr> {
    IPV4_TOKEN
        .captures_iter(output)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .next()
}

/// What one look at the tools-reported addresses showed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSighting {
    Found(Ipv4Addr),
    LinkLocalOnly,
    Nothing,
}

/// Pick a routable IPv4 from tools data, restricted to `interface` if given.
pub fn select_address(guest: &GuestInfo, interface: Option<&str>) -> CloneResult<AddressSighting> {
    let nics: Vec<_> = guest
        .net
        .iter()
        .filter(|nic| interface.map_or(true, |want| nic.network.as_deref() == Some(want)))
        .collect();

    if let Some(want) = interface {
        if !guest.net.is_empty() && nics.is_empty() {
            return Err(CloneError::not_found(format!(
                "No interfaces found on VM which are attached to network '{want}'"
            )));
        }
    }

    let mut link_local = false;
    for nic in &nics {
        let from_config = nic
            .ip_config
            .iter()
            .flat_map(|c| c.ip_address.iter())
            .map(|a| (a.ip_address.as_str(), a.origin.as_deref() == Some("linklayer")));
        let from_list = nic.ip_address.iter().map(|a| (a.as_str(), false));

        for (raw, linklayer) in from_config.chain(from_list) {
            let Ok(ip) = raw.parse::<Ipv4Addr>() else {
                continue;
            };
            if is_link_local(&ip) {
                link_local = true;
            } else if !linklayer {
                return Ok(AddressSighting::Found(ip));
            }
        }
    }

    if nics.is_empty() && interface.is_none() {
        if let Some(ip) = guest.ip_address.as_deref().and_then(|s| s.parse::<Ipv4Addr>().ok()) {
            if is_link_local(&ip) {
                link_local = true;
            } else {
                return Ok(AddressSighting::Found(ip));
            }
        }
    }

    Ok(if link_local {
        AddressSighting::LinkLocalOnly
    } else {
        AddressSighting::Nothing
    })
}

/// Rewrite an address with `transformIp`.
pub fn apply_transform(ip: Ipv4Addr, transform: Option<&TransformIp>) -> String {
    match transform {
        None => ip.to_string(),
        Some(TransformIp::Template(template)) => {
            let octets = ip.octets();
            (1..=4).fold(template.clone(), |acc, n| {
                acc.replace(&format!("{{{n}}}"), &octets[n - 1].to_string())
            })
        }
        Some(TransformIp::Map(map)) => map
            .get(&ip.to_string())
            .cloned()
            .unwrap_or_else(|| ip.to_string()),
    }
}

/// Run the discovery script in the guest. The tools wait and the script
/// share `opts.timeout`.
pub async fn try_active(
    platform: &dyn Platform,
    ctx: &RunContext,
    vm: &MoRef,
    opts: &DiscoveryOptions,
) -> Result<Ipv4Addr, ActiveError> {
    log::info!("[{}] Attempting active IP discovery", ctx.vm_name());
    let deadline = deadline_after(opts.timeout);
    let guest = guest_ops::wait_for_tools(platform, ctx, vm, opts.timeout, opts.interval).await?;

    let os = match opts.os {
        Some(os) => os,
        None => guest_ops::os_family(&guest, opts.guest_id.as_deref())?,
    };
    let (script, shell) = match (opts.active_command.as_deref(), os) {
        (Some(cmd), _) => (cmd.to_string(), ShellKind::Auto),
        (None, GuestOsFamily::Linux) => (LINUX_DISCOVERY_SCRIPT.to_string(), ShellKind::Linux),
        (None, GuestOsFamily::Windows) => match opts.win_network.as_deref() {
            Some(adapter) => (windows_discovery_script(adapter), ShellKind::PowerShell),
            None => (WINDOWS_DISCOVERY_SCRIPT.to_string(), ShellKind::PowerShell),
        },
    };

    let exec = GuestExecutor::new(platform, ctx, vm, opts.auth.clone(), os);
    let remaining = deadline.saturating_duration_since(Instant::now());
    let output = match exec.run_shell_capture_output(&script, shell, remaining).await {
        Ok(out) => out,
        Err(e) if e.is(CloneErrorKind::GuestAuthFailed) => {
            return Err(ActiveError::Recoverable(CloneError::guest_auth(format!(
                "Guest login as `{}` was rejected, check `vmUsername` / `vmPassword`: {}",
                opts.auth.username, e.message
            ))));
        }
        Err(e) => return Err(e.into()),
    };

    let ip = first_ipv4_token(&output).ok_or_else(|| {
        ActiveError::Recoverable(CloneError::parse(format!(
            "Discovery script printed no IPv4 address: {}",
            output.trim()
        )))
    })?;
    if is_link_local(&ip) {
        return Err(ActiveError::Recoverable(CloneError::dhcp_exhausted(format!(
            "Active discovery got link-local address {ip}"
        ))));
    }
    Ok(ip)
}

/// Poll tools-reported addresses until a routable IPv4 shows up.
pub async fn standard(
    platform: &dyn Platform,
    ctx: &RunContext,
    vm: &MoRef,
    opts: &DiscoveryOptions,
) -> CloneResult<Ipv4Addr> {
    log::info!(
        "[{}] Waiting for VMware tools/network interfaces to become available (timeout: {} seconds)...",
        ctx.vm_name(),
        opts.timeout.as_secs()
    );
    let mut poller = Poller::new(opts.timeout, opts.interval);
    let mut link_local = false;
    loop {
        let guest = platform.guest_info(vm).await?;
        match select_address(&guest, opts.interface.as_deref())? {
            AddressSighting::Found(ip) => return Ok(ip),
            AddressSighting::LinkLocalOnly => link_local = true,
            AddressSighting::Nothing => {}
        }
        if !poller.next(ctx).await? {
            break;
        }
    }

    if link_local {
        Err(CloneError::dhcp_exhausted(
            "Only link-local (169.254.x.x) addresses were reported, check DHCP server and scope exhaustion",
        ))
    } else {
        Err(CloneError::timeout(
            "Timeout waiting for IP address or no VMware Tools installed on guest",
        ))
    }
}

/// Resolve the guest's address. `force_active` is set for instant clones.
///
/// `opts.timeout` bounds the whole call: standard polling after a failed
/// active attempt only gets what is left of it.
pub async fn discover(
    platform: &dyn Platform,
    ctx: &RunContext,
    vm: &MoRef,
    opts: &DiscoveryOptions,
    force_active: bool,
) -> CloneResult<DiscoveryResult> {
    let started = Instant::now();
    let deadline = deadline_after(opts.timeout);
    let mut found = None;

    if opts.active || force_active {
        match try_active(platform, ctx, vm, opts).await {
            Ok(ip) => found = Some((ip, DiscoveryMethod::Active)),
            Err(ActiveError::Fatal(e)) => return Err(e),
            Err(ActiveError::Recoverable(e)) => {
                log::warn!(
                    "[{}] Active IP discovery failed, falling back to standard discovery: {e}",
                    ctx.vm_name()
                );
            }
        }
    }

    let (ip, method) = match found {
        Some(hit) => hit,
        None => {
            let mut rest = opts.clone();
            rest.timeout = deadline.saturating_duration_since(Instant::now());
            (standard(platform, ctx, vm, &rest).await?, DiscoveryMethod::Standard)
        }
    };

    let address = apply_transform(ip, opts.transform.as_ref());
    if address != ip.to_string() {
        log::info!("[{}] Transformed discovered IP {ip} to {address}", ctx.vm_name());
    }

    Ok(DiscoveryResult {
        ip,
        address,
        method,
        elapsed: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GuestIpAddress, GuestIpConfig, GuestNicInfo};
    use std::collections::BTreeMap;

    fn nic(network: &str, addrs: &[(&str, &str)]) -> GuestNicInfo {
        GuestNicInfo {
            network: Some(network.into()),
            mac_address: None,
            ip_address: addrs.iter().map(|(a, _)| a.to_string()).collect(),
            ip_config: Some(GuestIpConfig {
                ip_address: addrs
                    .iter()
                    .map(|(a, origin)| GuestIpAddress {
                        ip_address: a.to_string(),
                        prefix_length: Some(24),
                        origin: Some(origin.to_string()),
                        state: Some("preferred".into()),
                    })
                    .collect(),
            }),
        }
    }

    #[test]
    fn token_parsing() {
        assert_eq!(first_ipv4_token("inet 10.1.2.3\n"), Some(Ipv4Addr::new(10, 1, 2, 3)));
        assert_eq!(
            first_ipv4_token("999.1.1.1 192.168.0.4"),
            Some(Ipv4Addr::new(192, 168, 0, 4))
        );
        assert_eq!(first_ipv4_token("fe80::1"), None);
    }

    #[test]
    fn select_skips_ipv6_and_linklayer() {
        let guest = GuestInfo {
            net: vec![nic("VM Network", &[("fe80::250:56ff", "linklayer"), ("10.0.0.7", "dhcp")])],
            ..Default::default()
        };
        assert_eq!(
            select_address(&guest, None).unwrap(),
            AddressSighting::Found(Ipv4Addr::new(10, 0, 0, 7))
        );
    }

    #[test]
    fn select_link_local_only() {
        let guest = GuestInfo {
            ip_address: Some("169.254.10.1".into()),
            net: vec![nic("VM Network", &[("169.254.10.1", "linklayer")])],
            ..Default::default()
        };
        assert_eq!(select_address(&guest, None).unwrap(), AddressSighting::LinkLocalOnly);
    }

    #[test]
    fn select_interface_filter() {
        let guest = GuestInfo {
            net: vec![
                nic("Mgmt", &[("10.0.0.7", "dhcp")]),
                nic("Backend", &[("172.16.0.9", "dhcp")]),
            ],
            ..Default::default()
        };
        assert_eq!(
            select_address(&guest, Some("Backend")).unwrap(),
            AddressSighting::Found(Ipv4Addr::new(172, 16, 0, 9))
        );
        assert!(select_address(&guest, Some("Nope"))
            .unwrap_err()
            .is(CloneErrorKind::NotFound));
        // no NICs reported yet: keep waiting
        assert_eq!(
            select_address(&GuestInfo::default(), Some("Nope")).unwrap(),
            AddressSighting::Nothing
        );
    }

    #[test]
    fn select_falls_back_to_primary_address() {
        let guest = GuestInfo {
            ip_address: Some("10.9.9.9".into()),
            ..Default::default()
        };
        assert_eq!(
            select_address(&guest, None).unwrap(),
            AddressSighting::Found(Ipv4Addr::new(10, 9, 9, 9))
        );
    }

    #[test]
    fn transforms() {
        let ip = Ipv4Addr::new(192, 168, 1, 5);
        assert_eq!(apply_transform(ip, None), "192.168.1.5");
        assert_eq!(
            apply_transform(ip, Some(&TransformIp::Template("10.0.{3}.{4}".into()))),
            "10.0.1.5"
        );
        let mut map = BTreeMap::new();
        map.insert("192.168.1.5".to_string(), "203.0.113.5".to_string());
        let t = TransformIp::Map(map);
        assert_eq!(apply_transform(ip, Some(&t)), "203.0.113.5");
        assert_eq!(apply_transform(Ipv4Addr::new(1, 2, 3, 4), Some(&t)), "1.2.3.4");
    }

    #[test]
    fn windows_script_targets_adapter() {
        let script = windows_discovery_script("Ethernet0");
        assert!(script.contains("-InterfaceAlias 'Ethernet0'"));
        assert!(script.contains(WINDOWS_DISCOVERY_SCRIPT));
        assert!(windows_discovery_script("Bob's NIC").contains("'Bob''s NIC'"));
    }

    #[test]
    fn active_error_classes() {
        assert!(matches!(
            ActiveError::from(CloneError::address_conflict("x")),
            ActiveError::Fatal(_)
        ));
        assert!(matches!(
            ActiveError::from(CloneError::guest_command("x")),
            ActiveError::Recoverable(_)
        ));
        assert!(matches!(
            ActiveError::from(CloneError::timeout("x")),
            ActiveError::Recoverable(_)
        ));
    }
}
