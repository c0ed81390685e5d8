//! Launcher settings
//!
//! Defaults, optionally overridden by a YAML file, then by `LABVM_*`
//! environment variables:
//!
//! ```yaml
//! mac_prefix: "b8:ad:ca:fe"
//! master_dir: /home/etu/masters
//! state_dir: /home/etu/.local/state/labvm
//! readiness:
//!   attempts: 20
//!   interval: 1s
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ident::MacPrefix;
use crate::readiness::{self, ReadinessWaiter};
use crate::registry::{self, Registry};
use crate::{Error, Result};

/// Variable naming the settings file when `--config` is not given.
pub const CONFIG_ENV: &str = "LABVM_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mac_prefix: MacPrefix,
    /// Directory holding master images
    pub master_dir: PathBuf,
    /// Directory holding the reservation registry
    pub state_dir: PathBuf,
    /// OVMF variables template copied per UEFI guest
    pub ovmf_vars: PathBuf,
    pub readiness: ReadinessSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub attempts: u32,
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            attempts: readiness::DEFAULT_ATTEMPTS,
            interval: readiness::DEFAULT_INTERVAL,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mac_prefix: MacPrefix::DEFAULT,
            master_dir: default_master_dir(),
            state_dir: registry::default_state_dir(),
            ovmf_vars: PathBuf::from("/usr/share/OVMF/OVMF_VARS_4M.ms.fd"),
            readiness: ReadinessSettings::default(),
        }
    }
}

fn default_master_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join("masters"),
        Err(_) => PathBuf::from("masters"),
    }
}

impl Settings {
    /// Defaults, then `path` (or `$LABVM_CONFIG`) if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut settings = match path.map(Path::to_path_buf).or(from_env) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid settings {}: {}", path.display(), e)))
    }

    /// Apply `LABVM_MAC_PREFIX`, `LABVM_MASTER_DIR` and `LABVM_STATE_DIR`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup("LABVM_MAC_PREFIX") {
            self.mac_prefix = prefix.parse()?;
        }
        if let Some(dir) = lookup("LABVM_MASTER_DIR") {
            self.master_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("LABVM_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn registry(&self) -> Registry {
        Registry::in_state_dir(&self.state_dir)
    }

    pub fn waiter(&self, path: impl Into<PathBuf>) -> ReadinessWaiter {
        ReadinessWaiter::new(path, self.readiness.attempts, self.readiness.interval)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.mac_prefix, MacPrefix::DEFAULT);
        assert_eq!(s.readiness.attempts, 20);
        assert_eq!(s.readiness.interval, Duration::from_secs(1));
        assert!(s.master_dir.ends_with("masters"));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            b"mac_prefix: \"02:42:ac:11\"\nreadiness:\n  interval: 250ms\n",
        )
        .unwrap();

        let s = Settings::from_file(file.path()).unwrap();
        assert_eq!(s.mac_prefix.to_string(), "02:42:ac:11");
        assert_eq!(s.readiness.interval, Duration::from_millis(250));
        assert_eq!(s.readiness.attempts, 20);
    }

    #[test]
    fn test_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"readiness:\n  interval: soon\n").unwrap();
        assert!(matches!(Settings::from_file(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut s = Settings::default();
        s.apply_env(|key| match key {
            "LABVM_MAC_PREFIX" => Some("02:00:00:01".into()),
            "LABVM_STATE_DIR" => Some("/run/labvm".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(s.mac_prefix.to_string(), "02:00:00:01");
        assert_eq!(s.state_dir, PathBuf::from("/run/labvm"));
        assert_eq!(
            s.registry().path(),
            Path::new("/run/labvm/reservations.json")
        );

        assert!(s.apply_env(|_| Some("bogus".into())).is_err());
    }

    #[test]
    fn test_waiter_uses_readiness_settings() {
        let s = Settings::default();
        let w = s.waiter("/tmp/tpm/swtpm-sock");
        assert_eq!(w.max_attempts(), 20);
        assert_eq!(w.interval(), Duration::from_secs(1));
    }
}
