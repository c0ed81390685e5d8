//! Open vSwitch port declarations and reconciliation
//!
//! The switch file declares the VLAN configuration every tap port should
//! have. [`plan_switch`] compares it with what the switch reports and returns
//! only the settings that differ, so applying the plan twice is a no-op.
//!
//! The switch itself is reached through [`SwitchQuery`]; [`OvsVsctl`] is the
//! read-only `ovs-vsctl` implementation.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Output;

use tokio::process::Command;
use tracing::debug;

use crate::ident::TapIndex;
use crate::preflight;
use crate::{Error, Result};

pub const MIN_VLAN: u16 = 1;
pub const MAX_VLAN: u16 = 4094;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchFile {
    pub ovs: OvsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OvsSection {
    pub switches: Vec<SwitchDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchDecl {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<PortDecl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortKind {
    #[serde(rename = "OVSPort")]
    OvsPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VlanMode {
    Access,
    Trunk,
}

impl VlanMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            VlanMode::Access => "access",
            VlanMode::Trunk => "trunk",
        }
    }
}

impl fmt::Display for VlanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired configuration of one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: PortKind,
    pub vlan_mode: VlanMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trunks: Option<Vec<u16>>,
}

impl PortDecl {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::MissingParameter("port name".into()));
        }
        let check = |vlan: u16| {
            if (MIN_VLAN..=MAX_VLAN).contains(&vlan) {
                Ok(())
            } else {
                Err(Error::Config(format!(
                    "port {}: VLAN {vlan} outside {MIN_VLAN}-{MAX_VLAN}",
                    self.name
                )))
            }
        };
        match self.vlan_mode {
            VlanMode::Access => {
                let tag = self
                    .tag
                    .ok_or_else(|| Error::MissingParameter(format!("{}: tag", self.name)))?;
                check(tag)?;
            }
            VlanMode::Trunk => {
                let trunks = self
                    .trunks
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| Error::MissingParameter(format!("{}: trunks", self.name)))?;
                trunks.iter().copied().try_for_each(check)?;
            }
        }
        Ok(())
    }

    fn sorted_trunks(&self) -> Vec<u16> {
        let mut t = self.trunks.clone().unwrap_or_default();
        t.sort_unstable();
        t.dedup();
        t
    }
}

/// Configuration a port currently has on the switch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortState {
    /// `None` when the column is unset (`[]`)
    pub vlan_mode: Option<VlanMode>,
    pub tag: Option<u16>,
    pub trunks: Vec<u16>,
}

/// One setting to change on the switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum PortChange {
    /// Declared port is not attached to the declared switch
    Missing { port: String, switch: String },
    VlanMode { port: String, mode: VlanMode },
    Tag { port: String, tag: u16 },
    Trunks { port: String, trunks: Vec<u16> },
}

impl PortChange {
    /// Arguments of the `ovs-vsctl` call that applies the change.
    pub fn ovs_args(&self) -> Option<Vec<String>> {
        let set = |port: &str, value: String| {
            Some(vec!["set".into(), "port".into(), port.to_string(), value])
        };
        match self {
            PortChange::Missing { .. } => None,
            PortChange::VlanMode { port, mode } => set(port, format!("vlan_mode={mode}")),
            PortChange::Tag { port, tag } => set(port, format!("tag={tag}")),
            PortChange::Trunks { port, trunks } => {
                set(port, format!("trunks={}", format_trunks(trunks)))
            }
        }
    }

    /// Shell line that applies the change, if one can.
    pub fn command_line(&self) -> Option<String> {
        self.ovs_args()
            .map(|args| format!("ovs-vsctl {}", args.join(" ")))
    }
}

impl fmt::Display for PortChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortChange::Missing { port, switch } => {
                write!(f, "port {port} does not exist on switch {switch}")
            }
            PortChange::VlanMode { port, mode } => write!(f, "port {port} vlan_mode -> {mode}"),
            PortChange::Tag { port, tag } => write!(f, "port {port} tag -> {tag}"),
            PortChange::Trunks { port, trunks } => {
                write!(f, "port {port} trunks -> {}", format_trunks(trunks))
            }
        }
    }
}

fn format_trunks(trunks: &[u16]) -> String {
    let list = trunks.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
    format!("[{list}]")
}

/// Settings of `desired` that differ from `current`. Empty when in sync.
pub fn reconcile(desired: &PortDecl, current: &PortState) -> Vec<PortChange> {
    let port = desired.name.clone();
    let mut changes = Vec::new();

    if current.vlan_mode != Some(desired.vlan_mode) {
        changes.push(PortChange::VlanMode {
            port: port.clone(),
            mode: desired.vlan_mode,
        });
    }

    match desired.vlan_mode {
        VlanMode::Access => {
            if let Some(tag) = desired.tag {
                if current.tag != Some(tag) {
                    changes.push(PortChange::Tag { port, tag });
                }
            }
        }
        VlanMode::Trunk => {
            let wanted = desired.sorted_trunks();
            let mut have = current.trunks.clone();
            have.sort_unstable();
            have.dedup();
            if have != wanted {
                changes.push(PortChange::Trunks {
                    port,
                    trunks: wanted,
                });
            }
        }
    }
    changes
}

/// Host interface a guest on this port is reachable through: `vlan<tag>`
/// for access ports, the bridge itself otherwise.
pub fn svi_name(state: &PortState, bridge: &str) -> String {
    match (state.vlan_mode, state.tag) {
        (Some(VlanMode::Access), Some(tag)) => format!("vlan{tag}"),
        _ => bridge.to_string(),
    }
}

/// Read access to the virtual switch.
#[async_trait]
pub trait SwitchQuery: Send + Sync {
    async fn bridge_exists(&self, bridge: &str) -> Result<bool>;
    /// Bridge the port is attached to, `None` if the port does not exist.
    async fn port_bridge(&self, port: &str) -> Result<Option<String>>;
    async fn port_state(&self, port: &str) -> Result<PortState>;
}

/// Changes needed to bring `decl` in line with the switch.
pub async fn plan_switch(query: &dyn SwitchQuery, decl: &SwitchDecl) -> Result<Vec<PortChange>> {
    if !query.bridge_exists(&decl.name).await? {
        return Err(Error::Config(format!("switch {} does not exist", decl.name)));
    }

    let mut changes = Vec::new();
    for port in &decl.ports {
        match query.port_bridge(&port.name).await? {
            Some(bridge) if bridge == decl.name => {
                let state = query.port_state(&port.name).await?;
                debug!("port {} on {}: {:?}", port.name, bridge, state);
                changes.extend(reconcile(port, &state));
            }
            _ => changes.push(PortChange::Missing {
                port: port.name.clone(),
                switch: decl.name.clone(),
            }),
        }
    }
    Ok(changes)
}

/// Link-local zone for the guest on `tap`.
pub async fn zone_for_tap(query: &dyn SwitchQuery, tap: TapIndex) -> Result<String> {
    let port = tap.interface_name();
    let bridge = query
        .port_bridge(&port)
        .await?
        .ok_or_else(|| Error::Config(format!("{port} is not attached to any switch")))?;
    let state = query.port_state(&port).await?;
    Ok(svi_name(&state, &bridge))
}

pub fn parse_switches(raw: &str) -> Result<SwitchFile> {
    serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("invalid switch declaration: {e}")))
}

pub fn validate_switches(file: &SwitchFile) -> Result<()> {
    if file.ovs.switches.is_empty() {
        return Err(Error::MissingParameter("ovs.switches".into()));
    }
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for switch in &file.ovs.switches {
        if switch.name.trim().is_empty() {
            return Err(Error::MissingParameter("switch name".into()));
        }
        for port in &switch.ports {
            port.validate()?;
            if let Some(other) = seen.insert(&port.name, &switch.name) {
                return Err(Error::Config(format!(
                    "port {} declared on both {other} and {}",
                    port.name, switch.name
                )));
            }
        }
    }
    Ok(())
}

/// Read, parse and validate a switch file.
pub fn load_switches(path: &Path) -> Result<SwitchFile> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
    let file = parse_switches(&raw)?;
    validate_switches(&file)?;
    Ok(file)
}

fn parse_vlan_mode(raw: &str) -> Result<Option<VlanMode>> {
    match raw.trim().trim_matches('"') {
        "[]" | "" => Ok(None),
        "access" => Ok(Some(VlanMode::Access)),
        "trunk" => Ok(Some(VlanMode::Trunk)),
        other => Err(Error::Command(format!("unsupported vlan_mode '{other}'"))),
    }
}

fn parse_tag(raw: &str) -> Result<Option<u16>> {
    match raw.trim() {
        "[]" | "" => Ok(None),
        n => n
            .parse()
            .map(Some)
            .map_err(|_| Error::Command(format!("invalid tag '{n}'"))),
    }
}

fn parse_trunks(raw: &str) -> Result<Vec<u16>> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| {
            v.parse()
                .map_err(|_| Error::Command(format!("invalid trunk VLAN '{v}'")))
        })
        .collect()
}

const SUDO_SBIN_DIRS: [&str; 3] = ["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// [`SwitchQuery`] backed by the `ovs-vsctl` command.
#[derive(Debug, Clone)]
pub struct OvsVsctl {
    program: PathBuf,
    sudo: bool,
}

impl Default for OvsVsctl {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ovs-vsctl"),
            sudo: true,
        }
    }
}

impl OvsVsctl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.program = program.into();
        self
    }

    /// Run through `sudo` (default on the lab hypervisors)
    pub fn sudo(mut self, enable: bool) -> Self {
        self.sudo = enable;
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg(&self.program);
            c
        } else {
            Command::new(&self.program)
        };
        cmd.args(args);
        cmd
    }

    /// Fail early with the name of whichever executable is absent.
    fn ensure_installed(&self) -> Result<()> {
        let program = self.program.display().to_string();
        // sudo searches its own secure_path, which usually adds the sbin dirs
        let under_sudo = || {
            self.sudo
                && SUDO_SBIN_DIRS
                    .iter()
                    .any(|dir| preflight::find_in_path(&format!("{dir}/{program}")).is_some())
        };
        if preflight::find_in_path(&program).is_none() && !under_sudo() {
            return Err(Error::MissingDependency(program));
        }
        if self.sudo && preflight::find_in_path("sudo").is_none() {
            return Err(Error::MissingDependency("sudo".into()));
        }
        Ok(())
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        self.ensure_installed()?;
        self.command(args).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                let launcher = if self.sudo {
                    "sudo".to_string()
                } else {
                    self.program.display().to_string()
                };
                Error::MissingDependency(launcher)
            } else {
                Error::Io(e)
            }
        })
    }

    /// Run and return trimmed stdout, `None` on non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<Option<String>> {
        let output = self.output(args).await?;
        if !output.status.success() {
            debug!("ovs-vsctl {:?} failed: {}", args, stderr_of(&output));
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    }

    async fn get(&self, port: &str, column: &str) -> Result<String> {
        self.run(&["get", "port", port, column])
            .await?
            .ok_or_else(|| Error::Command(format!("ovs-vsctl get port {port} {column} failed")))
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl SwitchQuery for OvsVsctl {
    /// `br-exists` exits 2 for an unknown bridge; any other failure is an error.
    async fn bridge_exists(&self, bridge: &str) -> Result<bool> {
        let output = self.output(&["br-exists", bridge]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(2) => Ok(false),
            _ => Err(Error::Command(format!(
                "ovs-vsctl br-exists {bridge} failed ({}): {}",
                output.status,
                stderr_of(&output)
            ))),
        }
    }

    async fn port_bridge(&self, port: &str) -> Result<Option<String>> {
        self.run(&["port-to-br", port]).await
    }

    async fn port_state(&self, port: &str) -> Result<PortState> {
        Ok(PortState {
            vlan_mode: parse_vlan_mode(&self.get(port, "vlan_mode").await?)?,
            tag: parse_tag(&self.get(port, "tag").await?)?,
            trunks: parse_trunks(&self.get(port, "trunks").await?)?,
        })
    }
}
