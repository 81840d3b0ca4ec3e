//! Guest customization: validated first-boot identity and network settings.
//!
//! [`build_spec`] turns [`GuestCustomizationParams`] into a VIM
//! `CustomizationSpec` (LinuxPrep or Sysprep identity, one adapter mapping,
//! global DNS settings). [`wait_for_customization`] and
//! [`wait_for_customized_ip`] follow the guest through its first boot.

use crate::context::{Poller, RunContext};
use crate::error::{CloneError, CloneResult};
use crate::platform::Platform;
use crate::request::{GuestCustomizationParams, Timezone};
use crate::types::{GuestInfo, GuestOsFamily, MoRef};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_LINUX_TIMEZONE: &str = "Etc/UTC";
pub const DEFAULT_WINDOWS_ORG: &str = "TestKitchen";
/// Windows time zone index for UTC.
pub const DEFAULT_WINDOWS_TIMEZONE: i64 = 0x8000_0050;
pub const DEFAULT_TIMEOUT_TASK: u64 = 600;
pub const DEFAULT_TIMEOUT_IP: u64 = 60;
const EVENT_POLL: Duration = Duration::from_secs(10);
const IP_POLL: Duration = Duration::from_secs(1);

/// Public KMS client keys for temporary Windows Server setups.
pub const WINDOWS_KMS_KEYS: &[(&str, &str)] = &[
    ("Microsoft Windows Server 2019 (64-bit)", "N69G4-B89J2-4G8F4-WWYCC-J464C"),
    ("Microsoft Windows Server 2016 (64-bit)", "WC2BQ-8NRM3-FDDYY-2BFGV-KHKQY"),
    ("Microsoft Windows Server 2012R2 (64-bit)", "D2N9P-3P6X9-2R39C-7RTCD-MDVJX"),
    ("Microsoft Windows Server 2012 (64-bit)", "BN3D2-R7TKB-3YPBD-8DRP2-27GG4"),
];

lazy_static! {
    static ref HOSTNAME_RE: Regex = Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?$").unwrap();
    // VMware KB 2145518
    static ref LINUX_TZ_RE: Regex = Regex::new(r"^[A-Z][A-Za-z]+/[A-Z][-_+A-Za-z0-9]+$").unwrap();
    static ref WINDOWS_TZ_RE: Regex = Regex::new(r"^([0-9]+|0x[0-9a-fA-F]+)$").unwrap();
    static ref PRODUCT_KEY_RE: Regex = Regex::new(r"^[A-Z0-9]{5}(-[A-Z0-9]{5}){4}$").unwrap();
}

pub fn windows_kms_for_guest(full_name: &str) -> Option<&'static str> {
    WINDOWS_KMS_KEYS
        .iter()
        .find(|(name, _)| *name == full_name)
        .map(|(_, key)| *key)
}

/// Answers whether an address is already live on the network.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, ip: Ipv4Addr) -> bool;
}

/// One ICMP echo through the system `ping` binary.
pub struct PingProbe;

#[async_trait]
impl ReachabilityProbe for PingProbe {
    async fn is_reachable(&self, ip: Ipv4Addr) -> bool {
        let mut cmd = tokio::process::Command::new("ping");
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w", "1000"]);
        } else {
            cmd.args(["-c", "1", "-W", "1"]);
        }
        cmd.arg(ip.to_string())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        match cmd.status().await {
            Ok(status) => status.success(),
            Err(e) => {
                log::warn!("Cannot run ping to probe {ip}: {e}");
                false
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  VIM customization objects
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize)]
struct FixedName {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    name: String,
}

impl FixedName {
    fn new(name: String) -> Self {
        Self { type_name: "CustomizationFixedName", name }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "_typeName")]
enum IpGenerator {
    #[serde(rename = "CustomizationFixedIp", rename_all = "camelCase")]
    Fixed { ip_address: String },
    #[serde(rename = "CustomizationDhcpIpGenerator")]
    Dhcp {},
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct IpSettings {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    ip: IpGenerator,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subnet_mask: Option<String>,
    dns_domain: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct AdapterMapping {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    adapter: IpSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct GlobalIpSettings {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    dns_server_list: Vec<String>,
    dns_suffix_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct GuiUnattended {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    time_zone: i64,
    auto_logon: bool,
    auto_logon_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Identification {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct UserData {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    computer_name: FixedName,
    full_name: String,
    org_name: String,
    product_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "_typeName")]
enum Identity {
    #[serde(rename = "CustomizationLinuxPrep", rename_all = "camelCase")]
    LinuxPrep {
        domain: String,
        host_name: FixedName,
        #[serde(rename = "hwClockUTC")]
        hw_clock_utc: bool,
        time_zone: String,
    },
    #[serde(rename = "CustomizationSysprep", rename_all = "camelCase")]
    Sysprep {
        gui_unattended: GuiUnattended,
        identification: Identification,
        user_data: UserData,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct CustomizationSpecBody {
    #[serde(rename = "_typeName")]
    type_name: &'static str,
    identity: Identity,
    #[serde(rename = "globalIPSettings")]
    global_ip_settings: GlobalIpSettings,
    nic_setting_map: Vec<AdapterMapping>,
}

/// OS-tagged customization spec, ready to attach to a clone.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestCustomizationSpec {
    os: GuestOsFamily,
    static_ip: Option<Ipv4Addr>,
    body: CustomizationSpecBody,
}

impl GuestCustomizationSpec {
    pub fn os_family(&self) -> GuestOsFamily {
        self.os
    }

    /// Address the guest will carry after customization, if static.
    pub fn static_ip(&self) -> Option<Ipv4Addr> {
        self.static_ip
    }

    pub fn to_value(&self) -> CloneResult<serde_json::Value> {
        Ok(serde_json::to_value(&self.body)?)
    }

    /// Canonical JSON text; identical inputs give identical bytes.
    pub fn to_json(&self) -> CloneResult<String> {
        Ok(serde_json::to_string(&self.body)?)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_ipv4(value: &str, param: &str) -> CloneResult<Ipv4Addr> {
    value.trim().parse::<Ipv4Addr>().map_err(|_| {
        CloneError::invalid(format!("Parameter `{param}` is required to be formatted as an IPv4 address"))
    })
}

fn required<'a, T>(value: &'a Option<T>, param: &str) -> CloneResult<&'a T> {
    value
        .as_ref()
        .ok_or_else(|| CloneError::invalid(format!("Parameter `{param}` is required to support guest customization")))
}

/// Hostname to assign: explicit `hostname` or the VM name.
pub fn guest_hostname(params: &GuestCustomizationParams, vm_name: &str) -> CloneResult<String> {
    let hostname = params.hostname.as_deref().unwrap_or(vm_name);
    if !HOSTNAME_RE.is_match(hostname) {
        return Err(CloneError::invalid(format!(
            "Hostname `{hostname}` may only contain letters, numbers or hyphens"
        )));
    }
    Ok(hostname.to_string())
}

fn linux_timezone(ctx: &RunContext, tz: Option<&Timezone>) -> CloneResult<String> {
    match tz {
        None => {
            log::warn!("[{}] Linux guest customization: no timezone passed, assuming UTC", ctx.vm_name());
            Ok(DEFAULT_LINUX_TIMEZONE.to_string())
        }
        Some(tz) => {
            let tz = tz.to_string();
            if LINUX_TZ_RE.is_match(&tz) {
                Ok(tz)
            } else {
                Err(CloneError::invalid(format!(
                    "Linux customization requires `timezone` in `Area/Location` format, got `{tz}`"
                )))
            }
        }
    }
}

fn windows_timezone(ctx: &RunContext, tz: Option<&Timezone>) -> CloneResult<i64> {
    let invalid = |tz: &str| {
        CloneError::invalid(format!(
            "Windows customization requires `timezone` as decimal or hex number (0x55), got `{tz}`"
        ))
    };
    match tz {
        None => {
            log::warn!("[{}] Windows guest customization: no timezone passed, assuming UTC", ctx.vm_name());
            Ok(DEFAULT_WINDOWS_TIMEZONE)
        }
        Some(Timezone::Index(n)) => i64::try_from(*n).map_err(|_| invalid(&n.to_string())),
        Some(Timezone::Name(s)) => {
            if !WINDOWS_TZ_RE.is_match(s) {
                return Err(invalid(s));
            }
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => i64::from_str_radix(hex, 16),
                None => s.parse::<i64>(),
            };
            parsed.map_err(|_| invalid(s))
        }
    }
}

fn windows_product_key(
    ctx: &RunContext,
    params: &GuestCustomizationParams,
    guest_full_name: Option<&str>,
) -> CloneResult<String> {
    if let Some(ref key) = params.product_id {
        if !PRODUCT_KEY_RE.is_match(key) {
            return Err(CloneError::invalid(
                "Parameter `productId` must be formatted as XXXXX-XXXXX-XXXXX-XXXXX-XXXXX",
            ));
        }
        return Ok(key.clone());
    }

    let os = guest_full_name.unwrap_or_default();
    match windows_kms_for_guest(os) {
        Some(key) => {
            log::warn!(
                "[{}] Windows guest customization: using KMS key `{key}` for {os}",
                ctx.vm_name()
            );
            Ok(key.to_string())
        }
        None => Err(CloneError::missing_product_key(format!(
            "Windows customization requires `productId`; no public KMS key is known for `{os}`"
        ))),
    }
}

/// Validate `params` and build the customization spec for `os`.
///
/// A static address is probed before anything else is built; a live
/// address fails with `AddressConflict` unless `continueOnIpConflict`.
pub async fn build_spec(
    ctx: &RunContext,
    params: &GuestCustomizationParams,
    os: GuestOsFamily,
    guest_full_name: Option<&str>,
    probe: &dyn ReachabilityProbe,
) -> CloneResult<GuestCustomizationSpec> {
    let mut static_ip = None;
    if let Some(ref ip) = params.ip_address {
        let addr = parse_ipv4(ip, "ipAddress")?;
        let mask = params.subnet_mask.as_deref().ok_or_else(|| {
            CloneError::invalid("Parameter `subnetMask` is required if assigning a fixed IPv4 address")
        })?;
        parse_ipv4(mask, "subnetMask")?;

        if probe.is_reachable(addr).await {
            if !params.continue_on_ip_conflict {
                return Err(CloneError::address_conflict(format!(
                    "Parameter `ipAddress` {addr} points to a host reachable via ICMP"
                )));
            }
            log::warn!(
                "[{}] Continuing customization although {addr} answers on the network",
                ctx.vm_name()
            );
        }
        static_ip = Some(addr);
    }

    if let Some(ref gateways) = params.gateway {
        for gw in gateways {
            parse_ipv4(gw, "gateway")?;
        }
    }

    let dns_domain = required(&params.dns_domain, "dnsDomain")?;
    let dns_servers = required(&params.dns_server_list, "dnsServerList")?;
    let dns_suffixes = required(&params.dns_suffix_list, "dnsSuffixList")?;
    for server in dns_servers {
        parse_ipv4(server, "dnsServerList")?;
    }

    let hostname = guest_hostname(params, ctx.vm_name())?;

    let identity = match os {
        GuestOsFamily::Linux => Identity::LinuxPrep {
            domain: dns_domain.clone(),
            host_name: FixedName::new(hostname),
            hw_clock_utc: true,
            time_zone: linux_timezone(ctx, params.timezone.as_ref())?,
        },
        GuestOsFamily::Windows => {
            let time_zone = windows_timezone(ctx, params.timezone.as_ref())?;
            let product_id = windows_product_key(ctx, params, guest_full_name)?;
            let org = params
                .org_name
                .clone()
                .unwrap_or_else(|| DEFAULT_WINDOWS_ORG.to_string());
            Identity::Sysprep {
                gui_unattended: GuiUnattended {
                    type_name: "CustomizationGuiUnattended",
                    time_zone,
                    auto_logon: false,
                    auto_logon_count: 1,
                },
                identification: Identification {
                    type_name: "CustomizationIdentification",
                },
                user_data: UserData {
                    type_name: "CustomizationUserData",
                    computer_name: FixedName::new(hostname),
                    full_name: org.clone(),
                    org_name: org,
                    product_id,
                },
            }
        }
    };

    let adapter = match static_ip {
        Some(addr) => IpSettings {
            type_name: "CustomizationIPSettings",
            ip: IpGenerator::Fixed {
                ip_address: addr.to_string(),
            },
            gateway: params.gateway.clone(),
            subnet_mask: params.subnet_mask.clone(),
            dns_domain: dns_domain.clone(),
        },
        None => IpSettings {
            type_name: "CustomizationIPSettings",
            ip: IpGenerator::Dhcp {},
            gateway: None,
            subnet_mask: None,
            dns_domain: dns_domain.clone(),
        },
    };

    Ok(GuestCustomizationSpec {
        os,
        static_ip,
        body: CustomizationSpecBody {
            type_name: "CustomizationSpec",
            identity,
            global_ip_settings: GlobalIpSettings {
                type_name: "CustomizationGlobalIPSettings",
                dns_server_list: dns_servers.clone(),
                dns_suffix_list: dns_suffixes.clone(),
            },
            nic_setting_map: vec![AdapterMapping {
                type_name: "CustomizationAdapterMapping",
                adapter,
            }],
        },
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  First-boot waits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `CustomizationFailed` and the subtypes vCenter actually posts.
pub const CUSTOMIZATION_FAILURES: &[&str] = &[
    "CustomizationFailed",
    "CustomizationLinuxIdentityFailed",
    "CustomizationNetworkSetupFailed",
    "CustomizationSysprepFailed",
    "CustomizationUnknownFailure",
];

pub const CUSTOMIZATION_EVENTS: &[&str] = &[
    "CustomizationSucceeded",
    "CustomizationFailed",
    "CustomizationLinuxIdentityFailed",
    "CustomizationNetworkSetupFailed",
    "CustomizationSysprepFailed",
    "CustomizationUnknownFailure",
    "CustomizationStartedEvent",
];

pub fn is_customization_failure(type_name: &str) -> bool {
    CUSTOMIZATION_FAILURES.contains(&type_name)
}

/// Wait until the guest reports `CustomizationSucceeded`.
pub async fn wait_for_customization(
    platform: &dyn Platform,
    ctx: &RunContext,
    vm: &MoRef,
    timeout: Duration,
) -> CloneResult<()> {
    log::info!(
        "[{}] Waiting for guest customization (timeout: {} seconds)...",
        ctx.vm_name(),
        timeout.as_secs()
    );
    let mut poller = Poller::new(timeout, EVENT_POLL);
    loop {
        let events = platform.query_vm_events(vm, CUSTOMIZATION_EVENTS).await?;
        if events.iter().any(|e| e.type_name == "CustomizationSucceeded") {
            return Ok(());
        }
        if let Some(failed) = events.iter().find(|e| is_customization_failure(&e.type_name)) {
            return Err(CloneError::task(format!(
                "Customization of VM failed ({}): {}",
                failed.type_name,
                failed.full_formatted_message.as_deref().unwrap_or("no details")
            )));
        }
        if !poller.next(ctx).await? {
            break;
        }
    }
    Err(CloneError::timeout(format!(
        "Customization of VM did not complete within {} seconds",
        timeout.as_secs()
    )))
}

fn reports_address(guest: &GuestInfo, ip: &str) -> bool {
    guest.ip_address.as_deref() == Some(ip)
        || guest.net.iter().any(|nic| {
            nic.ip_address.iter().any(|a| a == ip)
                || nic
                    .ip_config
                    .as_ref()
                    .is_some_and(|c| c.ip_address.iter().any(|a| a.ip_address == ip))
        })
}

/// Wait until tools report the static address of `spec`; no-op for DHCP.
pub async fn wait_for_customized_ip(
    platform: &dyn Platform,
    ctx: &RunContext,
    vm: &MoRef,
    spec: &GuestCustomizationSpec,
    timeout: Duration,
) -> CloneResult<()> {
    let Some(ip) = spec.static_ip() else {
        return Ok(());
    };
    let ip = ip.to_string();
    log::info!("[{}] Waiting for guest customization IP update...", ctx.vm_name());

    let mut poller = Poller::new(timeout, IP_POLL);
    loop {
        let guest = platform.guest_info(vm).await?;
        if reports_address(&guest, &ip) {
            return Ok(());
        }
        if !poller.next(ctx).await? {
            break;
        }
    }
    Err(CloneError::timeout(format!(
        "Customized IP {ip} was not reported within {} seconds",
        timeout.as_secs()
    )))
}
