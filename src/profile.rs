//! VM classes and the base ports each one owns

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ident::PortBases;
use crate::{Error, Result};

/// Kind of guest being launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmClass {
    /// Generic Linux guest, legacy firmware
    Linux,
    /// Linux guest with OVMF secure boot firmware and a software TPM
    UefiLinux,
    Windows,
    /// Cisco IOS-XE virtual router (one tap per interface)
    Iosxe,
    /// Cisco NX-OS virtual switch (one tap per interface)
    Nxos,
}

impl VmClass {
    pub const ALL: [VmClass; 5] = [
        VmClass::Linux,
        VmClass::UefiLinux,
        VmClass::Windows,
        VmClass::Iosxe,
        VmClass::Nxos,
    ];

    /// Fixed SPICE/telnet base ports of the class.
    pub const fn port_bases(self) -> PortBases {
        match self {
            VmClass::Linux | VmClass::UefiLinux | VmClass::Windows => PortBases::new(5900, 2300),
            VmClass::Iosxe => PortBases::new(7900, 7000),
            VmClass::Nxos => PortBases::new(9900, 9000),
        }
    }

    /// Whether the class boots OVMF and needs a per-VM variables file.
    pub const fn uses_uefi(self) -> bool {
        matches!(self, VmClass::UefiLinux | VmClass::Windows)
    }

    pub const fn uses_tpm(self) -> bool {
        matches!(self, VmClass::UefiLinux | VmClass::Windows)
    }

    /// Routers and switches take a list of taps instead of a single one.
    pub const fn is_network_device(self) -> bool {
        matches!(self, VmClass::Iosxe | VmClass::Nxos)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            VmClass::Linux => "linux",
            VmClass::UefiLinux => "uefi-linux",
            VmClass::Windows => "windows",
            VmClass::Iosxe => "iosxe",
            VmClass::Nxos => "nxos",
        }
    }
}

impl fmt::Display for VmClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        VmClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                Error::Config(format!(
                    "unknown VM class '{s}', expected one of \
                     linux, uefi-linux, windows, iosxe, nxos"
                ))
            })
    }
}
