//! Launch plan for a whole lab
//!
//! Resolves every declaration to the file names and network identities its
//! launch will use, without touching the host.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::ident::{self, DerivedIdentifiers};
use crate::lab::{LabFile, VmDecl};
use crate::profile::VmClass;
use crate::readiness;
use crate::settings::Settings;
use crate::Result;

/// Per-guest OVMF variables file, `<vm>_OVMF_VARS.fd`.
pub fn uefi_vars_file(vm_name: &str) -> String {
    format!("{vm_name}_OVMF_VARS.fd")
}

/// What launching one guest involves.
#[derive(Debug, Clone, Serialize)]
pub struct VmPlan {
    pub name: String,
    pub class: VmClass,
    pub memory_mib: Option<u32>,
    /// Working copy `<name>.<format>`
    pub image: String,
    pub master_image: PathBuf,
    pub force_copy: bool,
    /// Per-guest OVMF variables file for UEFI classes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uefi_vars: Option<String>,
    /// Template the variables file is first copied from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uefi_vars_template: Option<PathBuf>,
    /// Control socket the launcher waits for before starting QEMU
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpm_socket: Option<PathBuf>,
    /// One entry per NIC, in interface order
    pub nics: Vec<DerivedIdentifiers>,
}

impl VmPlan {
    /// SPICE port of the guest, taken from its first NIC.
    pub fn spice_port(&self) -> Option<u32> {
        self.nics.first().map(|n| n.spice_port)
    }

    pub fn telnet_port(&self) -> Option<u32> {
        self.nics.first().map(|n| n.telnet_port)
    }
}

impl fmt::Display for VmPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.class)?;
        if let Some(mem) = self.memory_mib {
            write!(f, " {mem}MiB")?;
        }
        writeln!(f, " image={}", self.image)?;
        if let (Some(spice), Some(telnet)) = (self.spice_port(), self.telnet_port()) {
            writeln!(f, "  spice={spice} telnet={telnet}")?;
        }
        if let (Some(vars), Some(template)) = (&self.uefi_vars, &self.uefi_vars_template) {
            writeln!(f, "  uefi_vars={vars} (from {})", template.display())?;
        }
        if let Some(sock) = &self.tpm_socket {
            writeln!(f, "  tpm={}", sock.display())?;
        }
        for nic in &self.nics {
            writeln!(f, "  {} mac={} ll={}", nic.interface, nic.mac, nic.link_local)?;
        }
        Ok(())
    }
}

/// Plan one declaration. `work_dir` is where per-guest files are created.
pub fn plan_vm(vm: &VmDecl, settings: &Settings, work_dir: &Path) -> Result<VmPlan> {
    let class = vm.class();
    let ports = class.port_bases();
    let nics = vm
        .taps()
        .into_iter()
        .map(|tap| ident::derive(tap, &settings.mac_prefix, ports))
        .collect();

    let tpm_socket = class.uses_tpm().then(|| {
        readiness::tpm_socket_path(&work_dir.join(format!("{}-tpm", vm.name())))
    });

    Ok(VmPlan {
        name: vm.name().to_string(),
        class,
        memory_mib: vm.memory(),
        image: vm.image_file()?,
        master_image: settings.master_dir.join(vm.master_image()),
        force_copy: vm.force_copy(),
        uefi_vars: class.uses_uefi().then(|| uefi_vars_file(vm.name())),
        uefi_vars_template: class.uses_uefi().then(|| settings.ovmf_vars.clone()),
        tpm_socket,
        nics,
    })
}

/// Plan every declaration of a validated lab, in file order.
pub fn plan_lab(lab: &LabFile, settings: &Settings, work_dir: &Path) -> Result<Vec<VmPlan>> {
    lab.kvm
        .vms
        .iter()
        .map(|vm| plan_vm(vm, settings, work_dir))
        .collect()
}
