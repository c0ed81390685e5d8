//! Lab declaration files
//!
//! A lab file lists the guests to start in one batch:
//!
//! ```yaml
//! kvm:
//!   vms:
//!     - vm_name: vm1
//!       os: linux
//!       master_image: debian-testing-amd64.qcow2
//!       force_copy: false
//!       memory: 2048
//!       tapnum: 1
//!     - vm_name: rtr1
//!       os: iosxe
//!       master_image: c8000v.qcow2
//!       force_copy: false
//!       tapnumlist: [2, 3, 4]
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ident::TapIndex;
use crate::preflight;
use crate::profile::VmClass;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabFile {
    pub kvm: KvmSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvmSection {
    #[serde(default)]
    pub vms: Vec<VmDecl>,
}

/// One guest, tagged by its `os` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "os", rename_all = "lowercase")]
pub enum VmDecl {
    Linux(HostDecl),
    Windows(HostDecl),
    Iosxe(NetworkDeviceDecl),
    Nxos(NetworkDeviceDecl),
}

/// Linux and Windows guests: one NIC on one tap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostDecl {
    pub vm_name: String,
    pub master_image: String,
    #[serde(default)]
    pub force_copy: bool,
    /// MiB
    pub memory: u32,
    pub tapnum: TapIndex,
    /// Boot OVMF with a software TPM (Linux only; Windows always does)
    #[serde(default)]
    pub uefi: bool,
    /// Seed image contents (Linux only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init: Option<CloudInit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Devices>,
}

/// Routers and switches: one tap per interface, in interface order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDeviceDecl {
    pub vm_name: String,
    pub master_image: String,
    #[serde(default)]
    pub force_copy: bool,
    pub tapnumlist: Vec<TapIndex>,
}

/// cloud-init user data accepted in a lab file.
///
/// Only the keys the seed builder knows are allowed; anything else is a typo.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudInit {
    /// Rebuild the seed image even if one exists
    #[serde(default)]
    pub force_seed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<CloudUser>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
    /// Netplan document, copied as is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netplan: Option<serde_yaml::Mapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write_files: Vec<WriteFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runcmd: Vec<RunCmd>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudUser {
    pub name: String,
    /// sudoers rule, e.g. `ALL=(ALL) NOPASSWD:ALL`
    pub sudo: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub append: bool,
}

/// A `runcmd` entry: shell line or argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunCmd {
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Devices {
    #[serde(default)]
    pub storage: Vec<StorageDecl>,
}

/// Supplemental disk created next to the VM image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDecl {
    pub dev_name: String,
    /// qemu-img size string, e.g. `32G`
    pub size: String,
    pub bus: StorageBus,
    /// SCSI LUN
    #[serde(default)]
    pub addr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBus {
    Virtio,
    Scsi,
    Nvme,
}

/// Disk image format, taken from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Qcow2,
    Raw,
}

impl ImageFormat {
    pub fn from_file_name(name: &str) -> Result<Self> {
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some("qcow2") => Ok(ImageFormat::Qcow2),
            Some("raw") => Ok(ImageFormat::Raw),
            _ => Err(Error::Config(format!(
                "{name}: image format not supported, expected .qcow2 or .raw"
            ))),
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl VmDecl {
    pub fn name(&self) -> &str {
        match self {
            VmDecl::Linux(h) | VmDecl::Windows(h) => &h.vm_name,
            VmDecl::Iosxe(d) | VmDecl::Nxos(d) => &d.vm_name,
        }
    }

    pub fn class(&self) -> VmClass {
        match self {
            VmDecl::Linux(h) if h.uefi => VmClass::UefiLinux,
            VmDecl::Linux(_) => VmClass::Linux,
            VmDecl::Windows(_) => VmClass::Windows,
            VmDecl::Iosxe(_) => VmClass::Iosxe,
            VmDecl::Nxos(_) => VmClass::Nxos,
        }
    }

    pub fn master_image(&self) -> &str {
        match self {
            VmDecl::Linux(h) | VmDecl::Windows(h) => &h.master_image,
            VmDecl::Iosxe(d) | VmDecl::Nxos(d) => &d.master_image,
        }
    }

    pub fn force_copy(&self) -> bool {
        match self {
            VmDecl::Linux(h) | VmDecl::Windows(h) => h.force_copy,
            VmDecl::Iosxe(d) | VmDecl::Nxos(d) => d.force_copy,
        }
    }

    /// Taps in interface order.
    pub fn taps(&self) -> Vec<TapIndex> {
        match self {
            VmDecl::Linux(h) | VmDecl::Windows(h) => vec![h.tapnum],
            VmDecl::Iosxe(d) | VmDecl::Nxos(d) => d.tapnumlist.clone(),
        }
    }

    pub fn memory(&self) -> Option<u32> {
        match self {
            VmDecl::Linux(h) | VmDecl::Windows(h) => Some(h.memory),
            VmDecl::Iosxe(_) | VmDecl::Nxos(_) => None,
        }
    }

    pub fn storage(&self) -> &[StorageDecl] {
        match self {
            VmDecl::Linux(h) | VmDecl::Windows(h) => h
                .devices
                .as_ref()
                .map(|d| d.storage.as_slice())
                .unwrap_or_default(),
            VmDecl::Iosxe(_) | VmDecl::Nxos(_) => &[],
        }
    }

    pub fn cloud_init(&self) -> Option<&CloudInit> {
        match self {
            VmDecl::Linux(h) | VmDecl::Windows(h) => h.cloud_init.as_ref(),
            VmDecl::Iosxe(_) | VmDecl::Nxos(_) => None,
        }
    }

    pub fn image_format(&self) -> Result<ImageFormat> {
        ImageFormat::from_file_name(self.master_image())
    }

    /// Working copy of the master image, `<vm_name>.<format>`.
    pub fn image_file(&self) -> Result<String> {
        Ok(format!("{}.{}", self.name(), self.image_format()?))
    }

    /// Check one declaration on its own.
    pub fn validate(&self) -> Result<()> {
        let name = self.name();
        if name.trim().is_empty() {
            return Err(Error::MissingParameter("vm_name".into()));
        }
        if self.master_image().trim().is_empty() {
            return Err(Error::MissingParameter(format!("{name}: master_image")));
        }
        self.image_format()?;

        if let Some(memory) = self.memory() {
            preflight::require_memory(name, memory)?;
        }

        if let VmDecl::Windows(host) = self {
            if host.cloud_init.is_some() {
                return Err(Error::Config(format!(
                    "{name}: cloud_init is only supported on linux"
                )));
            }
        }
        if let Some(seed) = self.cloud_init() {
            if seed.users.iter().any(|u| u.name.trim().is_empty()) {
                return Err(Error::MissingParameter(format!("{name}: cloud_init user name")));
            }
            if seed.write_files.iter().any(|f| f.path.trim().is_empty()) {
                return Err(Error::MissingParameter(format!("{name}: write_files path")));
            }
        }

        if self.class().is_network_device() && self.taps().is_empty() {
            return Err(Error::MissingParameter(format!("{name}: tapnumlist")));
        }

        for store in self.storage() {
            if store.dev_name.trim().is_empty() {
                return Err(Error::MissingParameter(format!("{name}: storage dev_name")));
            }
            if store.size.trim().is_empty() {
                return Err(Error::MissingParameter(format!(
                    "{name}: size of {}",
                    store.dev_name
                )));
            }
            ImageFormat::from_file_name(&store.dev_name)?;
        }
        Ok(())
    }
}

/// Parse a lab document without validating it.
pub fn parse_lab(raw: &str) -> Result<LabFile> {
    serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("invalid lab declaration: {e}")))
}

/// Read, parse and validate a lab file.
pub fn load_lab(path: &Path) -> Result<LabFile> {
    if !path.exists() {
        return Err(Error::Config(format!("{} not found", path.display())));
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    let lab = serde_yaml::from_str(&raw)
        .map_err(|e| Error::Config(format!("invalid YAML lab {}: {}", path.display(), e)))?;
    validate_lab(&lab)?;
    Ok(lab)
}

/// Validate every declaration, then cross-VM uniqueness of names and taps.
pub fn validate_lab(lab: &LabFile) -> Result<()> {
    if lab.kvm.vms.is_empty() {
        return Err(Error::MissingParameter("kvm.vms".into()));
    }

    let mut names: HashSet<&str> = HashSet::new();
    let mut taps: HashMap<TapIndex, &str> = HashMap::new();

    for vm in &lab.kvm.vms {
        vm.validate()?;

        if !names.insert(vm.name()) {
            return Err(Error::in_use(
                format!("VM name {}", vm.name()),
                Some("an earlier declaration".into()),
            ));
        }

        for tap in vm.taps() {
            if let Some(first) = taps.insert(tap, vm.name()) {
                let holder = if first == vm.name() {
                    format!("{first} (declared twice)")
                } else {
                    first.to_string()
                };
                return Err(Error::in_use(
                    format!("{} declared for {}", tap.interface_name(), vm.name()),
                    Some(holder),
                ));
            }
        }
    }
    Ok(())
}
