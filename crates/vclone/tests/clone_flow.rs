use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use vclone::context::RunContext;
use vclone::customization::ReachabilityProbe;
use vclone::discovery::DiscoveryMethod;
use vclone::platform::{NetworkKind, NetworkRef, VmFacts};
use vclone::request::{
    FolderRef, GuestCustomizationParams, NetworkDirective, PostCreateScript, ShellKind,
    VmCustomization,
};
use vclone::sim::{GuestScript, SimCall, SimulatedPlatform};
use vclone::types::*;
use vclone::{CloneErrorKind, CloneRequest, CloneService, CloneStrategy};

struct Probe(bool);

#[async_trait]
impl ReachabilityProbe for Probe {
    async fn is_reachable(&self, _ip: Ipv4Addr) -> bool {
        self.0
    }
}

fn nic() -> VirtualDevice {
    let mut d = VirtualDevice::new("VirtualVmxnet3", 4000);
    d.connectable = Some(ConnectInfo::new(true, true, true));
    d.backing = Some(serde_json::json!({
        "_typeName": "VirtualEthernetCardNetworkBackingInfo",
        "deviceName": "Template Network"
    }));
    d
}

fn devices() -> Vec<VirtualDevice> {
    let mut ctrl = VirtualDevice::new("ParaVirtualSCSIController", 1000);
    ctrl.extra.insert("scsiCtlrUnitNumber".into(), 7.into());
    let mut disk = VirtualDevice::new("VirtualDisk", 2000);
    disk.controller_key = Some(1000);
    disk.unit_number = Some(0);
    vec![ctrl, disk, nic()]
}

fn template_facts() -> VmFacts {
    VmFacts {
        name: "ubuntu".into(),
        template: true,
        power_state: VmPowerState::PoweredOff,
        guest_id: Some("ubuntu64Guest".into()),
        guest_full_name: Some("Ubuntu Linux (64-bit)".into()),
        devices: devices(),
        ..VmFacts::default()
    }
}

fn frozen_base_facts() -> VmFacts {
    VmFacts {
        name: "frozen-base".into(),
        has_snapshot: true,
        power_state: VmPowerState::PoweredOn,
        instant_clone_frozen: true,
        guest_id: Some("ubuntu64Guest".into()),
        host: Some(MoRef::host("host-1")),
        devices: devices(),
        ..VmFacts::default()
    }
}

fn lab() -> SimulatedPlatform {
    let sim = SimulatedPlatform::new();
    sim.add_datacenter("DC1");
    sim.add_folder("DC1", "ci", "group-v9");
    sim.add_host("host-1", "7.0.3");
    sim.add_network(
        "DC1",
        NetworkRef {
            moref: MoRef::new("Network", "network-11"),
            name: "VM Network".into(),
            kind: NetworkKind::Standard,
        },
    );
    sim.add_network(
        "DC1",
        NetworkRef {
            moref: MoRef::new("DistributedVirtualPortgroup", "dvportgroup-21"),
            name: "Backend".into(),
            kind: NetworkKind::DistributedPortGroup {
                portgroup_key: "dvportgroup-21".into(),
                switch_uuid: "50 1d 2a 8c".into(),
            },
        },
    );
    sim.add_vm("DC1", "templates/ubuntu", template_facts());
    sim.add_vm("DC1", "vms/frozen-base", frozen_base_facts());
    sim
}

fn request(template: &str) -> CloneRequest {
    let mut req = CloneRequest::new("web-1", template, "DC1");
    req.target_host = Some("host-1".into());
    req.resource_pool = Some("resgroup-8".into());
    req.folder = Some(FolderRef {
        name: "ci".into(),
        id: "group-v9".into(),
    });
    req.vm_wait_timeout = 10;
    req.vm_wait_interval = 2.0;
    req
}

fn reporting(ip: &str) -> GuestInfo {
    GuestInfo {
        tools_running_status: Some("guestToolsRunning".into()),
        guest_family: Some("linuxGuest".into()),
        ip_address: Some(ip.into()),
        ..GuestInfo::default()
    }
}

fn customization_params() -> GuestCustomizationParams {
    GuestCustomizationParams {
        ip_address: Some("10.0.0.50".into()),
        subnet_mask: Some("255.255.255.0".into()),
        gateway: Some(vec!["10.0.0.1".into()]),
        dns_domain: Some("lab.local".into()),
        dns_server_list: Some(vec!["10.0.0.2".into()]),
        dns_suffix_list: Some(vec!["lab.local".into()]),
        ..GuestCustomizationParams::default()
    }
}

fn service(sim: SimulatedPlatform) -> CloneService<SimulatedPlatform> {
    CloneService::new(sim).with_probe(Probe(false))
}

fn reconfigurations(calls: &[SimCall]) -> Vec<&ConfigSpec> {
    calls
        .iter()
        .filter_map(|c| match c {
            SimCall::Reconfigure { spec, .. } => Some(spec),
            _ => None,
        })
        .collect()
}

fn clone_spec(calls: &[SimCall]) -> &CloneSpec {
    calls
        .iter()
        .find_map(|c| match c {
            SimCall::CloneVm { spec, .. } => Some(spec),
            _ => None,
        })
        .expect("no CloneVM_Task issued")
}

#[tokio::test(start_paused = true)]
async fn test_full_clone_from_template() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("10.0.0.15")]);
    let svc = service(sim);

    let outcome = svc.create(&request("templates/ubuntu"), false).await.unwrap();

    assert_eq!(outcome.vm_name, "web-1");
    assert_eq!(outcome.path, "ci/web-1");
    assert_eq!(outcome.strategy, CloneStrategy::Full);
    assert_eq!(outcome.address.as_deref(), Some("10.0.0.15"));
    let discovery = outcome.discovery.unwrap();
    assert_eq!(discovery.method, DiscoveryMethod::Standard);
    assert!(!discovery.ip.is_link_local());

    let calls = svc.platform().calls();
    let spec = clone_spec(&calls);
    assert!(spec.location.device_change.is_empty());
    assert!(spec.power_on);
    assert!(!spec.template);
    assert_eq!(spec.location.host, Some(MoRef::host("host-1")));
    assert_eq!(spec.location.pool, Some(MoRef::pool("resgroup-8")));
    assert!(spec.location.disk_move_type.is_none());
    assert!(matches!(
        calls[0],
        SimCall::CloneVm { ref folder, ref name, .. } if folder.value == "group-v9" && name == "web-1"
    ));
    // already running after the clone task
    assert!(!calls.iter().any(|c| matches!(c, SimCall::PowerOn(_))));
    assert_eq!(
        svc.platform().vm_path(&outcome.vm).as_deref(),
        Some("/DC1/vm/ci/web-1")
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_snapshot_downgrades_to_full() {
    for strategy in [CloneStrategy::Linked, CloneStrategy::Instant] {
        let sim = lab();
        sim.add_vm(
            "DC1",
            "vms/plain",
            VmFacts {
                name: "plain".into(),
                has_snapshot: false,
                power_state: VmPowerState::PoweredOn,
                instant_clone_frozen: true,
                devices: devices(),
                ..VmFacts::default()
            },
        );
        sim.set_guest_sequence("web-1", vec![reporting("10.0.0.16")]);
        let svc = service(sim);

        let mut req = request("vms/plain");
        req.clone_type = strategy;
        let outcome = svc.create(&req, false).await.unwrap();

        assert_eq!(outcome.strategy, CloneStrategy::Full);
        assert_eq!(outcome.warnings.len(), 1);
        let calls = svc.platform().calls();
        assert!(!calls.iter().any(|c| matches!(c, SimCall::InstantClone { .. })));
        assert!(clone_spec(&calls).location.disk_move_type.is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn test_zero_directives_issue_no_network_reconfiguration() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("10.0.0.15")]);
    let svc = service(sim);

    svc.create(&request("templates/ubuntu"), false).await.unwrap();

    let calls = svc.platform().calls();
    assert!(clone_spec(&calls).location.device_change.is_empty());
    assert!(reconfigurations(&calls).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_edit_and_add_use_two_batches() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("10.0.0.15")]);
    let svc = service(sim);

    let mut req = request("templates/ubuntu");
    req.networks = vec![NetworkDirective::edit("VM Network"), NetworkDirective::add("Backend")];
    svc.create(&req, false).await.unwrap();

    let calls = svc.platform().calls();
    let in_clone = &clone_spec(&calls).location.device_change;
    assert_eq!(in_clone.len(), 1);
    assert_eq!(in_clone[0].operation, DeviceOperation::Edit);
    assert_eq!(in_clone[0].device.key, 4000);
    assert_eq!(
        in_clone[0].device.backing.as_ref().unwrap()["deviceName"],
        "VM Network"
    );

    let post = reconfigurations(&calls);
    assert_eq!(post.len(), 1);
    assert_eq!(post[0].device_change.len(), 1);
    let added = &post[0].device_change[0];
    assert_eq!(added.operation, DeviceOperation::Add);
    assert_eq!(added.device.key, -1);
    assert_eq!(
        added.device.backing.as_ref().unwrap()["port"]["portgroupKey"],
        "dvportgroup-21"
    );
}

#[tokio::test(start_paused = true)]
async fn test_instant_from_powered_off_source_fails_before_any_task() {
    let sim = lab();
    sim.add_vm(
        "DC1",
        "vms/stopped-base",
        VmFacts {
            name: "stopped-base".into(),
            power_state: VmPowerState::PoweredOff,
            ..frozen_base_facts()
        },
    );
    let svc = service(sim);

    let mut req = request("vms/stopped-base");
    req.clone_type = CloneStrategy::Instant;
    let err = svc.create(&req, true).await.unwrap_err();

    assert!(err.is(CloneErrorKind::PreconditionFailed));
    assert!(err.message.contains("running VM"));
    assert_eq!(svc.platform().task_submissions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_instant_requires_recent_vcenter() {
    let sim = lab();
    sim.set_vcenter_version("6.5.0");
    let svc = service(sim);

    let mut req = request("vms/frozen-base");
    req.clone_type = CloneStrategy::Instant;
    let err = svc.create(&req, false).await.unwrap_err();

    assert!(err.is(CloneErrorKind::PreconditionFailed));
    assert!(err.details.unwrap().contains("strategy=instant"));
    assert_eq!(svc.platform().task_submissions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_instant_rejects_guest_customization() {
    let svc = service(lab());
    let mut req = request("vms/frozen-base");
    req.clone_type = CloneStrategy::Instant;
    req.guest_customization = Some(customization_params());

    let err = svc.create(&req, false).await.unwrap_err();
    assert!(err.is(CloneErrorKind::PreconditionFailed));
    assert_eq!(svc.platform().task_submissions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_instant_clone_reconnects_and_discovers_actively() {
    let sim = lab();
    sim.set_guest_script(GuestScript {
        stdout: "10.1.1.20\n".into(),
        ..GuestScript::default()
    });
    let svc = service(sim);

    let mut req = request("vms/frozen-base");
    req.clone_type = CloneStrategy::Instant;
    req.networks = vec![NetworkDirective::edit("VM Network")];
    let outcome = svc.create(&req, false).await.unwrap();

    assert_eq!(outcome.strategy, CloneStrategy::Instant);
    assert_eq!(outcome.address.as_deref(), Some("10.1.1.20"));
    assert_eq!(outcome.discovery.unwrap().method, DiscoveryMethod::Active);

    let calls = svc.platform().calls();
    let spec = calls
        .iter()
        .find_map(|c| match c {
            SimCall::InstantClone { spec, .. } => Some(spec),
            _ => None,
        })
        .unwrap();
    assert_eq!(spec.name, "web-1");
    assert!(spec.location.host.is_none());
    let during = spec.location.device_change[0].device.connectable.as_ref().unwrap();
    assert!(!during.connected);
    assert_eq!(during.migrate_connect.as_deref(), Some("disconnect"));

    let post = reconfigurations(&calls);
    assert_eq!(post.len(), 1);
    let after = post[0].device_change[0].device.connectable.as_ref().unwrap();
    assert_eq!(post[0].device_change[0].operation, DeviceOperation::Edit);
    assert!(after.connected);

    assert!(!calls.iter().any(|c| matches!(c, SimCall::CloneVm { .. } | SimCall::PowerOn(_))));
    // discovery script ran in the guest
    assert!(calls.iter().any(|c| matches!(
        c,
        SimCall::StartProgram { spec, .. } if spec.program_path == "/bin/sh" && spec.arguments.contains("ip address show")
    )));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_times_out_after_full_window() {
    let sim = lab();
    sim.set_guest_sequence(
        "web-1",
        vec![GuestInfo {
            tools_running_status: Some("guestToolsNotRunning".into()),
            ..GuestInfo::default()
        }],
    );
    let svc = service(sim);
    let req = request("templates/ubuntu");

    let started = Instant::now();
    let err = svc.create(&req, false).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is(CloneErrorKind::Timeout));
    assert_eq!(svc.platform().guest_polls(), 5);
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(11));
}

#[tokio::test(start_paused = true)]
async fn test_failed_active_discovery_shares_one_window() {
    let sim = lab();
    sim.set_guest_sequence(
        "web-1",
        vec![GuestInfo {
            tools_running_status: Some("guestToolsNotRunning".into()),
            ..GuestInfo::default()
        }],
    );
    let svc = service(sim);
    let mut req = request("vms/frozen-base");
    req.clone_type = CloneStrategy::Instant;

    let started = Instant::now();
    let err = svc.create(&req, false).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is(CloneErrorKind::Timeout));
    assert!(elapsed >= Duration::from_secs(10));
    assert!(elapsed < Duration::from_secs(11), "took {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_windows_active_discovery_reads_configured_adapter() {
    let sim = lab();
    sim.add_vm(
        "DC1",
        "templates/win2019",
        VmFacts {
            name: "win2019".into(),
            guest_id: Some("windows2019srv_64Guest".into()),
            guest_full_name: Some("Microsoft Windows Server 2019 (64-bit)".into()),
            ..template_facts()
        },
    );
    sim.set_guest_script_for(
        "-InterfaceAlias 'Ethernet1'",
        GuestScript {
            stdout: "10.2.0.30\r\n".into(),
            ..GuestScript::default()
        },
    );
    let svc = service(sim);

    let mut req = request("templates/win2019");
    req.active_discovery = true;
    req.vm_win_network = "Ethernet1".into();
    let outcome = svc.create(&req, false).await.unwrap();

    assert_eq!(outcome.address.as_deref(), Some("10.2.0.30"));
    assert_eq!(outcome.discovery.unwrap().method, DiscoveryMethod::Active);
    assert!(svc.platform().calls().iter().any(|c| matches!(
        c,
        SimCall::StartProgram { spec, .. } if spec.program_path.ends_with("powershell.exe")
    )));
}

#[tokio::test(start_paused = true)]
async fn test_link_local_only_is_dhcp_exhaustion() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("169.254.7.8")]);
    let svc = service(sim);

    let err = svc.create(&request("templates/ubuntu"), false).await.unwrap_err();
    assert!(err.is(CloneErrorKind::DhcpExhausted));
}

#[tokio::test(start_paused = true)]
async fn test_live_static_address_conflicts_before_clone() {
    let svc = CloneService::new(lab()).with_probe(Probe(true));
    let mut req = request("templates/ubuntu");
    req.guest_customization = Some(customization_params());

    let err = svc.create(&req, false).await.unwrap_err();
    assert!(err.is(CloneErrorKind::AddressConflict));
    assert_eq!(svc.platform().task_submissions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_guest_customization_attached_and_awaited() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("10.0.0.50")]);
    let svc = service(sim);
    let mut req = request("templates/ubuntu");
    req.guest_customization = Some(customization_params());

    let outcome = svc.create(&req, false).await.unwrap();
    assert_eq!(outcome.address.as_deref(), Some("10.0.0.50"));

    let calls = svc.platform().calls();
    let custom = clone_spec(&calls).customization.as_ref().unwrap();
    assert_eq!(custom["identity"]["_typeName"], "CustomizationLinuxPrep");
    assert_eq!(custom["identity"]["hostName"]["name"], "web-1");
}

#[tokio::test(start_paused = true)]
async fn test_customization_failure_event_fails_run() {
    let sim = lab();
    sim.set_customization_result(Some(false));
    let svc = service(sim);
    let mut req = request("templates/ubuntu");
    req.guest_customization = Some(customization_params());

    let err = svc.create(&req, false).await.unwrap_err();
    assert!(err.is(CloneErrorKind::TaskFailed));
    assert!(err.details.unwrap().contains("state=Customized"));
}

#[tokio::test(start_paused = true)]
async fn test_network_setup_failure_event_fails_run_at_once() {
    let sim = lab();
    sim.set_customization_event("CustomizationNetworkSetupFailed");
    let svc = service(sim);
    let mut req = request("templates/ubuntu");
    req.guest_customization = Some(customization_params());

    let t0 = Instant::now();
    let err = svc.create(&req, false).await.unwrap_err();
    assert!(err.is(CloneErrorKind::TaskFailed), "{err}");
    assert!(err.message.contains("CustomizationNetworkSetupFailed"));
    assert!(t0.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_vm_customization_reconfigures_then_powers_on() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("10.0.0.15")]);
    let svc = service(sim);

    let mut req = request("templates/ubuntu");
    req.vm_customization = Some(
        serde_json::from_value::<VmCustomization>(serde_json::json!({
            "annotation": "kitchen run",
            "numCPUs": 2,
            "addDisks": [{"type": "thin", "sizeMB": 1024}],
            "guestinfo.role": "web"
        }))
        .unwrap(),
    );
    let outcome = svc.create(&req, false).await.unwrap();

    let calls = svc.platform().calls();
    assert!(!clone_spec(&calls).power_on);
    let post = reconfigurations(&calls);
    assert_eq!(post.len(), 1);
    assert_eq!(post[0].num_cpus, Some(2));
    assert_eq!(post[0].device_change[0].device.unit_number, Some(1));
    assert_eq!(post[0].device_change[0].file_operation.as_deref(), Some("create"));

    let reconfig_at = calls.iter().position(|c| matches!(c, SimCall::Reconfigure { .. })).unwrap();
    let power_at = calls.iter().position(|c| matches!(c, SimCall::PowerOn(_))).unwrap();
    assert!(reconfig_at < power_at);

    let extra = svc.platform().extra_config(&outcome.vm);
    assert_eq!(extra.len(), 1);
    assert_eq!(extra[0].key, "guestinfo.role");
    assert_eq!(extra[0].value.value, "web");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_vm_customization_keys_still_reconfigure() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("10.0.0.15")]);
    let svc = service(sim);

    let mut req = request("templates/ubuntu");
    req.vm_customization = Some(
        serde_json::from_value::<VmCustomization>(serde_json::json!({"someconfig": "yeehaw"}))
            .unwrap(),
    );
    let outcome = svc.create(&req, false).await.unwrap();
    assert_eq!(outcome.address.as_deref(), Some("10.0.0.15"));

    let calls = svc.platform().calls();
    let post = reconfigurations(&calls);
    assert_eq!(post.len(), 1);
    assert_eq!(*post[0], ConfigSpec::default());
}

#[tokio::test(start_paused = true)]
async fn test_poweron_false_skips_discovery() {
    let svc = service(lab());
    let mut req = request("templates/ubuntu");
    req.poweron = false;

    let outcome = svc.create(&req, false).await.unwrap();
    assert!(outcome.address.is_none());
    assert!(!clone_spec(&svc.platform().calls()).power_on);
    assert_eq!(svc.platform().guest_polls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_post_create_failure_aborts_remaining_scripts() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("10.0.0.15")]);
    sim.set_guest_script_for(
        "first-step",
        GuestScript {
            stderr: "first-step: not found\n".into(),
            exit_code: 127,
            ..GuestScript::default()
        },
    );
    let svc = service(sim);

    let mut req = request("templates/ubuntu");
    req.post_create = vec![
        PostCreateScript {
            script: "first-step".into(),
            shell: ShellKind::Auto,
            timeout: 30,
        },
        PostCreateScript {
            script: "second-step".into(),
            shell: ShellKind::Linux,
            timeout: 30,
        },
    ];
    let err = svc.create(&req, false).await.unwrap_err();

    assert!(err.is(CloneErrorKind::GuestCommandFailed));
    assert!(err.message.contains("not found"));
    let started = svc
        .platform()
        .calls()
        .iter()
        .filter(|c| matches!(c, SimCall::StartProgram { .. }))
        .count();
    assert_eq!(started, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rollback_destroys_vm_created_by_run() {
    let sim = lab();
    sim.set_guest_sequence("web-1", vec![reporting("169.254.1.1")]);
    let svc = service(sim);
    let mut req = request("templates/ubuntu");
    req.vm_wait_timeout = 4;

    let err = svc.create(&req, true).await.unwrap_err();
    assert!(err.is(CloneErrorKind::DhcpExhausted));

    let calls = svc.platform().calls();
    let off = calls.iter().position(|c| matches!(c, SimCall::PowerOff(_))).unwrap();
    let gone = calls.iter().position(|c| matches!(c, SimCall::Destroy(_))).unwrap();
    assert!(off < gone);
    assert!(svc.platform().vm_named("web-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_rollback_leaves_preexisting_vm_alone() {
    let sim = lab();
    sim.add_vm(
        "DC1",
        "ci/web-1",
        VmFacts {
            name: "web-1".into(),
            power_state: VmPowerState::PoweredOn,
            ..VmFacts::default()
        },
    );
    sim.fail_next_task("CloneVM_Task", "DuplicateName: web-1 already exists");
    let svc = service(sim);

    let err = svc.create(&request("templates/ubuntu"), true).await.unwrap_err();
    assert!(err.is(CloneErrorKind::TaskFailed));

    let calls = svc.platform().calls();
    assert!(!calls.iter().any(|c| matches!(c, SimCall::Destroy(_) | SimCall::PowerOff(_))));
    assert!(svc.platform().vm_named("web-1").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_oversized_wait_interval_is_rejected() {
    let svc = service(lab());
    let mut req = request("templates/ubuntu");
    req.vm_wait_interval = 1e20;

    let err = svc.create(&req, false).await.unwrap_err();
    assert!(err.is(CloneErrorKind::InvalidOptions));
    assert_eq!(svc.platform().task_submissions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_submits_nothing() {
    let svc = service(lab());
    let req = request("templates/ubuntu");
    let token = CancellationToken::new();
    token.cancel();
    let ctx = RunContext::new("web-1").with_cancel(token);

    let err = svc.create_with_context(&req, true, ctx).await.unwrap_err();
    assert!(err.is(CloneErrorKind::Cancelled));
    assert_eq!(svc.platform().task_submissions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_benchmark_persisted_when_discovery_fails() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("bench.csv");
    let svc = service(lab());

    let mut req = request("templates/ubuntu");
    req.benchmark = true;
    req.benchmark_file = file.to_string_lossy().into_owned();
    req.vm_wait_timeout = 4;

    let err = svc.create(&req, false).await.unwrap_err();
    assert!(err.is(CloneErrorKind::Timeout));

    let text = std::fs::read_to_string(&file).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0],
        "template,clonetype,active_discovery,initialized,cloned,reconfigured,customized,ip_detected,total"
    );
    assert_eq!(lines[1], "templates/ubuntu,full,false,0.000,0.000,,,,4.000");
}
