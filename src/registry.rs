//! File-locked reservation table
//!
//! Claims on tap interfaces, disk images and VM names are recorded in a JSON
//! file. Every read-modify-write holds an exclusive `flock` on a sibling
//! `.lock` file, so concurrent launchers on the same host serialize. A claim
//! whose process is gone is stale and is reclaimed by the next writer.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rustix::fs::{flock, FlockOperation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ident::TapIndex;
use crate::{Error, Result};

const REGISTRY_FILE: &str = "reservations.json";

/// Something a running guest holds exclusively.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceKey {
    Tap(TapIndex),
    Image(PathBuf),
    Vm(String),
}

impl ResourceKey {
    /// Image key for `path`, resolved to an absolute path so that every
    /// spelling of the same file maps to one claim. The file itself need
    /// not exist yet.
    pub fn image(path: &Path) -> ResourceKey {
        ResourceKey::Image(resolve_image_path(path))
    }

    /// Human readable name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            ResourceKey::Tap(tap) => tap.interface_name(),
            ResourceKey::Image(path) => format!("image {}", path.display()),
            ResourceKey::Vm(name) => format!("VM {name}"),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Tap(tap) => write!(f, "tap:{tap}"),
            ResourceKey::Image(path) => write!(f, "image:{}", path.display()),
            ResourceKey::Vm(name) => write!(f, "vm:{name}"),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some(("tap", n)) => Ok(ResourceKey::Tap(n.parse()?)),
            Some(("image", p)) if !p.is_empty() => Ok(ResourceKey::Image(PathBuf::from(p))),
            Some(("vm", n)) if !n.is_empty() => Ok(ResourceKey::Vm(n.to_string())),
            _ => Err(Error::Config(format!(
                "invalid resource key '{s}', expected tap:<n>, image:<path> or vm:<name>"
            ))),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

/// One claim recorded in the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub key: ResourceKey,
    pub owner: String,
    pub pid: u32,
    pub created_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Table {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

impl Table {
    fn position(&self, key: &ResourceKey) -> Option<usize> {
        self.reservations.iter().position(|r| &r.key == key)
    }
}

fn resolve_image_path(path: &Path) -> PathBuf {
    if let Ok(full) = fs::canonicalize(path) {
        return full;
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    match (fs::canonicalize(parent), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}

type PidProbe = Box<dyn Fn(u32) -> bool + Send + Sync>;

/// Liveness check backed by procfs.
pub fn pid_alive(pid: u32) -> bool {
    pid != 0 && Path::new("/proc").join(pid.to_string()).exists()
}

/// Directory holding labvm runtime state.
///
/// `LABVM_STATE_DIR`, then `$XDG_STATE_HOME/labvm`, then
/// `$HOME/.local/state/labvm`, then `/tmp/labvm-state`.
pub fn default_state_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("LABVM_STATE_DIR") {
        return PathBuf::from(dir);
    }

    if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("labvm");
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/state/labvm");
    }

    PathBuf::from("/tmp/labvm-state")
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Exclusive lock held for the lifetime of the value; closing the fd releases it.
struct RegistryLock {
    _file: File,
}

pub struct Registry {
    path: PathBuf,
    alive: PidProbe,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Registry {
    /// Registry stored at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            alive: Box::new(pid_alive),
        }
    }

    /// Registry stored as `reservations.json` inside `dir`.
    pub fn in_state_dir(dir: &Path) -> Self {
        Self::open(dir.join(REGISTRY_FILE))
    }

    /// Replace the pid liveness check.
    pub fn with_liveness<F>(mut self, alive: F) -> Self
    where
        F: Fn(u32) -> bool + Send + Sync + 'static,
    {
        self.alive = Box::new(alive);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn lock(&self) -> Result<RegistryLock> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::Config(format!("failed opening {}: {e}", lock_path.display())))?;
        flock(&file, FlockOperation::LockExclusive).map_err(std::io::Error::from)?;
        debug!("registry lock acquired: {}", lock_path.display());
        Ok(RegistryLock { _file: file })
    }

    fn load(&self) -> Result<Table> {
        if !self.path.exists() {
            return Ok(Table::default());
        }
        let data = fs::read_to_string(&self.path)
            .map_err(|e| Error::Config(format!("failed reading {}: {e}", self.path.display())))?;
        if data.trim().is_empty() {
            return Ok(Table::default());
        }
        serde_json::from_str(&data).map_err(|e| {
            Error::Config(format!("invalid registry file {}: {e}", self.path.display()))
        })
    }

    fn store(&self, table: &mut Table) -> Result<()> {
        table.reservations.sort_by(|a, b| a.key.cmp(&b.key));
        let data = serde_json::to_vec_pretty(table)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, data)
            .map_err(|e| Error::Config(format!("failed writing {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Config(format!("failed replacing {}: {e}", self.path.display())))?;
        Ok(())
    }

    /// Claim `keys` for `owner`, all or nothing.
    ///
    /// Keys already held by `owner` are refreshed with the new pid. Keys held
    /// by a live process of another owner fail the whole call with
    /// [`Error::ResourceInUse`]; keys held by a dead process are reclaimed.
    pub fn reserve(&self, owner: &str, keys: &[ResourceKey], pid: u32) -> Result<Vec<Reservation>> {
        self.reserve_with(owner, keys, pid, true)
    }

    /// Like [`Registry::reserve`], but a live claim by `owner` itself is
    /// also a conflict. Used where every request must get a fresh resource.
    pub fn claim_new(
        &self,
        owner: &str,
        keys: &[ResourceKey],
        pid: u32,
    ) -> Result<Vec<Reservation>> {
        self.reserve_with(owner, keys, pid, false)
    }

    fn reserve_with(
        &self,
        owner: &str,
        keys: &[ResourceKey],
        pid: u32,
        refresh_own: bool,
    ) -> Result<Vec<Reservation>> {
        if owner.trim().is_empty() {
            return Err(Error::MissingParameter("reservation owner".into()));
        }

        let _lock = self.lock()?;
        let mut table = self.load()?;

        for key in keys {
            if let Some(idx) = table.position(key) {
                let held = &table.reservations[idx];
                let shared = refresh_own && held.owner == owner;
                if !shared && (self.alive)(held.pid) {
                    return Err(Error::in_use(
                        key.describe(),
                        Some(format!("{} (pid {})", held.owner, held.pid)),
                    ));
                }
            }
        }

        let created_ms = now_ms();
        let mut claimed = Vec::with_capacity(keys.len());
        for key in keys {
            let reservation = Reservation {
                key: key.clone(),
                owner: owner.to_string(),
                pid,
                created_ms,
            };
            match table.position(key) {
                Some(idx) => {
                    let previous = &table.reservations[idx];
                    if previous.owner != owner {
                        warn!(
                            "reclaiming stale {} from {} (pid {} is gone)",
                            key.describe(),
                            previous.owner,
                            previous.pid
                        );
                    }
                    table.reservations[idx] = reservation.clone();
                }
                None => table.reservations.push(reservation.clone()),
            }
            if !claimed.iter().any(|r: &Reservation| &r.key == key) {
                claimed.push(reservation);
            }
        }

        self.store(&mut table)?;
        info!("{} reserved {} resource(s)", owner, claimed.len());
        Ok(claimed)
    }

    /// Drop every claim of `owner`. Returns how many were removed.
    pub fn release(&self, owner: &str) -> Result<usize> {
        let _lock = self.lock()?;
        let mut table = self.load()?;
        let before = table.reservations.len();
        table.reservations.retain(|r| r.owner != owner);
        let removed = before - table.reservations.len();
        if removed > 0 {
            self.store(&mut table)?;
            info!("{} released {} resource(s)", owner, removed);
        }
        Ok(removed)
    }

    /// All recorded claims, stale ones included.
    pub fn list(&self) -> Result<Vec<Reservation>> {
        let _lock = self.lock()?;
        let mut reservations = self.load()?.reservations;
        reservations.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(reservations)
    }

    /// Live claim on `key`, if any.
    pub fn holder(&self, key: &ResourceKey) -> Result<Option<Reservation>> {
        let _lock = self.lock()?;
        let table = self.load()?;
        Ok(table
            .reservations
            .into_iter()
            .find(|r| &r.key == key && (self.alive)(r.pid)))
    }

    /// Remove claims whose process is gone and return them.
    pub fn prune(&self) -> Result<Vec<Reservation>> {
        let _lock = self.lock()?;
        let mut table = self.load()?;
        let (live, stale): (Vec<_>, Vec<_>) = table
            .reservations
            .into_iter()
            .partition(|r| (self.alive)(r.pid));
        table.reservations = live;
        if !stale.is_empty() {
            self.store(&mut table)?;
            for r in &stale {
                info!("pruned stale {} held by {} (pid {})", r.key.describe(), r.owner, r.pid);
            }
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_key_round_trip() {
        for raw in ["tap:7", "image:/srv/vm1.qcow2", "vm:rtr1"] {
            let key: ResourceKey = raw.parse().unwrap();
            assert_eq!(key.to_string(), raw);
        }
        assert!("tap:70000".parse::<ResourceKey>().is_err());
        assert!("vm:".parse::<ResourceKey>().is_err());
        assert!("disk:x".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn test_describe() {
        assert_eq!(ResourceKey::Tap(TapIndex::new(3)).describe(), "tap3");
        assert_eq!(ResourceKey::Vm("vm1".into()).describe(), "VM vm1");
    }

    #[test]
    fn test_lock_path() {
        let reg = Registry::open("/tmp/x/reservations.json");
        assert_eq!(reg.lock_path(), PathBuf::from("/tmp/x/reservations.json.lock"));
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id()));
        assert!(!pid_alive(0));
    }

    #[test]
    fn test_image_key_resolves_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let real = fs::canonicalize(dir.path()).unwrap();

        let missing = ResourceKey::image(&dir.path().join("./vm1.qcow2"));
        assert_eq!(missing, ResourceKey::Image(real.join("vm1.qcow2")));

        fs::write(dir.path().join("vm1.qcow2"), b"qcow").unwrap();
        let existing = ResourceKey::image(&dir.path().join("vm1.qcow2"));
        assert_eq!(existing, missing);
    }
}
