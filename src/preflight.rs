//! Start-up checks run once before a launch
//!
//! Each check maps to one fatal error kind. Nothing here retries or cleans
//! up: the first failure aborts the launch.

use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::lab::VmDecl;
use crate::plan;
use crate::registry::{Registry, ResourceKey};
use crate::settings::Settings;
use crate::{Error, Result};

/// Smallest memory allocation a Linux or Windows guest is started with.
pub const MIN_MEMORY_MIB: u32 = 512;

pub fn require_memory(vm: &str, mib: u32) -> Result<()> {
    if mib < MIN_MEMORY_MIB {
        return Err(Error::InsufficientMemory {
            vm: vm.to_string(),
            requested: mib,
            minimum: MIN_MEMORY_MIB,
        });
    }
    Ok(())
}

pub fn require_image(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(Error::ImageNotFound(path.to_path_buf()));
    }
    Ok(())
}

/// First executable named `name` on `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|p| is_executable(p))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub fn require_dependency(name: &str) -> Result<PathBuf> {
    let path = find_in_path(name).ok_or_else(|| Error::MissingDependency(name.to_string()))?;
    debug!("{} found at: {}", name, path.display());
    Ok(path)
}

/// Fail if any key is held by a live process of another owner.
pub fn require_unclaimed(registry: &Registry, keys: &[ResourceKey], owner: &str) -> Result<()> {
    for key in keys {
        if let Some(held) = registry.holder(key)? {
            if held.owner != owner {
                return Err(Error::in_use(
                    key.describe(),
                    Some(format!("{} (pid {})", held.owner, held.pid)),
                ));
            }
        }
    }
    Ok(())
}

/// External tools a guest of this declaration needs on the host.
pub fn required_tools(vm: &VmDecl) -> Vec<&'static str> {
    let mut tools = vec!["qemu-system-x86_64"];
    if vm.class().uses_tpm() {
        tools.push("swtpm");
    }
    if !vm.storage().is_empty() {
        tools.push("qemu-img");
    }
    if vm.cloud_init().is_some() {
        tools.push("cloud-localds");
    }
    tools
}

/// Resources a guest claims while it runs. The image key is the absolute
/// path of the working copy inside `work_dir`.
pub fn resource_keys(vm: &VmDecl, work_dir: &Path) -> Result<Vec<ResourceKey>> {
    let mut keys = vec![ResourceKey::Vm(vm.name().to_string())];
    keys.extend(vm.taps().into_iter().map(ResourceKey::Tap));
    keys.push(ResourceKey::image(&work_dir.join(vm.image_file()?)));
    Ok(keys)
}

/// Master image backing the declaration.
///
/// An existing working copy is enough unless `force_copy` asks for a fresh one.
pub fn check_images(vm: &VmDecl, master_dir: &Path, work_dir: &Path) -> Result<()> {
    let working_copy = work_dir.join(vm.image_file()?);
    if working_copy.is_file() && !vm.force_copy() {
        debug!("{} already exists", working_copy.display());
        return Ok(());
    }
    require_image(&master_dir.join(vm.master_image()))
}

/// OVMF variables template for UEFI guests without their own copy yet.
pub fn check_uefi_vars(vm: &VmDecl, template: &Path, work_dir: &Path) -> Result<()> {
    if !vm.class().uses_uefi() {
        return Ok(());
    }
    let own = work_dir.join(plan::uefi_vars_file(vm.name()));
    if own.is_file() {
        debug!("{} already exists", own.display());
        return Ok(());
    }
    require_image(template)
}

/// All checks for one guest, in launch order.
pub fn check_vm(
    vm: &VmDecl,
    settings: &Settings,
    work_dir: &Path,
    registry: &Registry,
) -> Result<()> {
    vm.validate()?;
    require_unclaimed(registry, &resource_keys(vm, work_dir)?, vm.name())?;
    check_images(vm, &settings.master_dir, work_dir)?;
    check_uefi_vars(vm, &settings.ovmf_vars, work_dir)?;
    for tool in required_tools(vm) {
        require_dependency(tool)?;
    }
    Ok(())
}
