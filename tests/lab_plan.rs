//! Lab file to launch plan, end to end.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use labvm::ident::TapIndex;
use labvm::lab::load_lab;
use labvm::plan::plan_lab;
use labvm::preflight;
use labvm::profile::VmClass;
use labvm::registry::{Registry, ResourceKey};
use labvm::switch::{self, PortState, SwitchQuery, VlanMode};
use labvm::{Error, Result, Settings};

const LAB: &str = r#"
kvm:
  vms:
    - vm_name: vm1
      os: linux
      master_image: debian-testing-amd64.qcow2
      force_copy: false
      memory: 2048
      tapnum: 1
      uefi: true
    - vm_name: win1
      os: windows
      master_image: win11.raw
      force_copy: false
      memory: 8192
      tapnum: 20
    - vm_name: rtr1
      os: iosxe
      master_image: c8000v.qcow2
      force_copy: false
      tapnumlist: [2, 3, 4]
    - vm_name: sw1
      os: nxos
      master_image: nexus9300v.qcow2
      force_copy: false
      tapnumlist: [5, 6]
"#;

fn settings(masters: &Path) -> Settings {
    Settings {
        master_dir: masters.to_path_buf(),
        ovmf_vars: masters.join("OVMF_VARS_4M.ms.fd"),
        ..Settings::default()
    }
}

fn write_lab(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("lab.yaml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn plan_covers_every_vm() {
    let dir = tempfile::tempdir().unwrap();
    let lab = load_lab(&write_lab(dir.path(), LAB)).unwrap();
    let plans = plan_lab(&lab, &settings(Path::new("/srv/masters")), dir.path()).unwrap();

    let summary: Vec<(&str, VmClass, Option<u32>, Option<u32>, usize)> = plans
        .iter()
        .map(|p| (p.name.as_str(), p.class, p.spice_port(), p.telnet_port(), p.nics.len()))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("vm1", VmClass::UefiLinux, Some(5901), Some(2301), 1),
            ("win1", VmClass::Windows, Some(5920), Some(2320), 1),
            ("rtr1", VmClass::Iosxe, Some(7902), Some(7002), 3),
            ("sw1", VmClass::Nxos, Some(9905), Some(9005), 2),
        ]
    );

    assert_eq!(plans[0].image, "vm1.qcow2");
    assert_eq!(plans[0].uefi_vars.as_deref(), Some("vm1_OVMF_VARS.fd"));
    assert_eq!(
        plans[0].tpm_socket.as_deref(),
        Some(dir.path().join("vm1-tpm/swtpm-sock").as_path())
    );
    assert_eq!(plans[1].image, "win1.raw");
    assert_eq!(plans[1].uefi_vars.as_deref(), Some("win1_OVMF_VARS.fd"));
    assert_eq!(
        plans[1].uefi_vars_template.as_deref(),
        Some(Path::new("/srv/masters/OVMF_VARS_4M.ms.fd"))
    );

    let rtr_macs: Vec<String> = plans[2].nics.iter().map(|n| n.mac.to_string()).collect();
    assert_eq!(
        rtr_macs,
        vec!["b8:ad:ca:fe:00:02", "b8:ad:ca:fe:00:03", "b8:ad:ca:fe:00:04"]
    );
    assert_eq!(plans[3].nics[1].interface, "tap6");
}

#[test]
fn plan_serializes_to_json() {
    let dir = tempfile::tempdir().unwrap();
    let lab = load_lab(&write_lab(dir.path(), LAB)).unwrap();
    let plans = plan_lab(&lab, &settings(Path::new("/srv/masters")), dir.path()).unwrap();

    let value = serde_json::to_value(&plans).unwrap();
    assert_eq!(value[0]["class"], "uefi-linux");
    assert_eq!(value[2]["class"], "iosxe");
    assert_eq!(value[2]["master_image"], "/srv/masters/c8000v.qcow2");
    assert!(value[2].get("uefi_vars").is_none());
    assert_eq!(value[3]["nics"][0]["link_local"], "fe80::baad:caff:fefe:5");
}

#[test]
fn duplicate_tap_across_vms_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_lab(dir.path(), &LAB.replace("[5, 6]", "[5, 20]"));
    let err = load_lab(&path).unwrap_err();
    assert_eq!(err.to_string(), "tap20 declared for sw1 is already in use by win1");
}

#[test]
fn missing_lab_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        load_lab(&dir.path().join("absent.yaml")),
        Err(Error::Config(_))
    ));
}

#[test]
fn preflight_reports_claimed_tap() {
    let masters = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(masters.path().join("c8000v.qcow2"), b"qcow").unwrap();

    let lab = load_lab(&write_lab(work.path(), LAB)).unwrap();
    let rtr = &lab.kvm.vms[2];

    let registry = Registry::in_state_dir(state.path()).with_liveness(|_| true);
    let keys = preflight::resource_keys(rtr, work.path()).unwrap();
    preflight::require_unclaimed(&registry, &keys, "rtr1").unwrap();
    preflight::check_images(rtr, masters.path(), work.path()).unwrap();

    registry
        .reserve("other-lab", &[ResourceKey::Tap(TapIndex::new(3))], 4242)
        .unwrap();
    match preflight::check_vm(rtr, &settings(masters.path()), work.path(), &registry) {
        Err(Error::ResourceInUse { resource, holder }) => {
            assert_eq!(resource, "tap3");
            assert_eq!(holder.as_deref(), Some("other-lab (pid 4242)"));
        }
        other => panic!("expected ResourceInUse, got {other:?}"),
    }
}

#[test]
fn preflight_sees_image_reserved_by_path() {
    let masters = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();

    let lab = load_lab(&write_lab(work.path(), LAB)).unwrap();
    let vm1 = &lab.kvm.vms[0];

    let registry = Registry::in_state_dir(state.path()).with_liveness(|_| true);
    let spelled = work.path().join(".").join("vm1.qcow2");
    registry
        .reserve("other-lab", &[ResourceKey::image(&spelled)], 4242)
        .unwrap();

    let err = preflight::check_vm(vm1, &settings(masters.path()), work.path(), &registry)
        .unwrap_err();
    assert!(
        matches!(&err, Error::ResourceInUse { resource, .. } if resource.ends_with("/vm1.qcow2")),
        "{err}"
    );
}

#[test]
fn preflight_requires_ovmf_template_for_uefi() {
    let masters = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let state = tempfile::tempdir().unwrap();
    std::fs::write(masters.path().join("debian-testing-amd64.qcow2"), b"qcow").unwrap();

    let lab = load_lab(&write_lab(work.path(), LAB)).unwrap();
    let registry = Registry::in_state_dir(state.path()).with_liveness(|_| true);
    let settings = settings(masters.path());

    match preflight::check_vm(&lab.kvm.vms[0], &settings, work.path(), &registry) {
        Err(Error::ImageNotFound(path)) => assert_eq!(path, settings.ovmf_vars),
        other => panic!("expected ImageNotFound, got {other:?}"),
    }
}

struct StaticSwitch(HashMap<String, (String, PortState)>);

#[async_trait]
impl SwitchQuery for StaticSwitch {
    async fn bridge_exists(&self, bridge: &str) -> Result<bool> {
        Ok(self.0.values().any(|(b, _)| b == bridge))
    }

    async fn port_bridge(&self, port: &str) -> Result<Option<String>> {
        Ok(self.0.get(port).map(|(b, _)| b.clone()))
    }

    async fn port_state(&self, port: &str) -> Result<PortState> {
        self.0
            .get(port)
            .map(|(_, s)| s.clone())
            .ok_or_else(|| Error::Command(format!("no port {port}")))
    }
}

#[tokio::test]
async fn zone_follows_port_mode() {
    let mut ports = HashMap::new();
    ports.insert(
        "tap1".to_string(),
        (
            "dsw-host".to_string(),
            PortState {
                vlan_mode: Some(VlanMode::Access),
                tag: Some(40),
                trunks: vec![],
            },
        ),
    );
    ports.insert(
        "tap2".to_string(),
        (
            "dsw-host".to_string(),
            PortState {
                vlan_mode: Some(VlanMode::Trunk),
                tag: None,
                trunks: vec![40, 50],
            },
        ),
    );
    let sw = StaticSwitch(ports);

    assert_eq!(switch::zone_for_tap(&sw, TapIndex::new(1)).await.unwrap(), "vlan40");
    assert_eq!(switch::zone_for_tap(&sw, TapIndex::new(2)).await.unwrap(), "dsw-host");
    assert!(switch::zone_for_tap(&sw, TapIndex::new(9)).await.is_err());
}
