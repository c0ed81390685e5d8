//! Deterministic guest identities
//!
//! Every guest NIC is plugged into a pre-provisioned tap interface `tap<N>`.
//! Its MAC address, IPv6 link-local address and console ports are all derived
//! from `N`, so two guests never collide as long as tap numbers are unique:
//!
//! - MAC: fixed 4-byte prefix followed by `N` as two big-endian bytes
//! - link-local: `fe80::` followed by the EUI-64 identifier of that MAC
//! - ports: `base + N` for each of the class's base ports

use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of a pre-existing tap interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TapIndex(u16);

impl TapIndex {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    /// High byte then low byte.
    pub const fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Kernel interface name, e.g. `tap7`.
    pub fn interface_name(self) -> String {
        format!("tap{}", self.0)
    }
}

impl From<u16> for TapIndex {
    fn from(index: u16) -> Self {
        Self(index)
    }
}

impl fmt::Display for TapIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TapIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim();
        let digits = digits.strip_prefix("tap").unwrap_or(digits);
        digits
            .parse::<u16>()
            .map(Self)
            .map_err(|_| Error::Config(format!("invalid tap index '{s}', expected 0-65535")))
    }
}

/// MAC prefix placed in front of the two tap bytes.
///
/// An OUI followed by one fixed byte. The default `b8:ad:ca:fe` yields link-local
/// addresses of the form `fe80::baad:caff:fefe:<tap>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacPrefix {
    oui: [u8; 3],
    fixed: u8,
}

impl MacPrefix {
    pub const DEFAULT: MacPrefix = MacPrefix::new([0xb8, 0xad, 0xca], 0xfe);

    pub const fn new(oui: [u8; 3], fixed: u8) -> Self {
        Self { oui, fixed }
    }

    pub const fn oui(&self) -> [u8; 3] {
        self.oui
    }

    pub const fn bytes(&self) -> [u8; 4] {
        [self.oui[0], self.oui[1], self.oui[2], self.fixed]
    }

    /// Full MAC address of the NIC on `tap`.
    pub const fn mac_for(&self, tap: TapIndex) -> MacAddress {
        let [hi, lo] = tap.to_be_bytes();
        MacAddress([self.oui[0], self.oui[1], self.oui[2], self.fixed, hi, lo])
    }
}

impl Default for MacPrefix {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.bytes();
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}")
    }
}

impl FromStr for MacPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid MAC prefix '{s}', expected xx:xx:xx:xx"));
        let octets = s
            .trim()
            .split(':')
            .map(|part| {
                if part.len() != 2 {
                    return Err(invalid());
                }
                u8::from_str_radix(part, 16).map_err(|_| invalid())
            })
            .collect::<Result<Vec<u8>>>()?;
        match octets.as_slice() {
            [a, b, c, d] => {
                if a & 0x01 != 0 {
                    return Err(Error::Config(format!(
                        "MAC prefix '{s}' has the multicast bit set"
                    )));
                }
                Ok(Self::new([*a, *b, *c], *d))
            }
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for MacPrefix {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacPrefix> for String {
    fn from(prefix: MacPrefix) -> Self {
        prefix.to_string()
    }
}

/// 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Modified EUI-64 interface identifier (RFC 4291 appendix A).
    pub const fn eui64(&self) -> [u8; 8] {
        let m = self.0;
        [m[0] ^ 0x02, m[1], m[2], 0xff, 0xfe, m[3], m[4], m[5]]
    }

    /// `fe80::/64` address built from [`MacAddress::eui64`].
    pub fn link_local(&self) -> Ipv6Addr {
        let id = self.eui64();
        let group = |i: usize| u16::from_be_bytes([id[i], id[i + 1]]);
        Ipv6Addr::new(0xfe80, 0, 0, 0, group(0), group(2), group(4), group(6))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// IPv6 link-local address with an optional zone (`%vlan10`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkLocal {
    addr: Ipv6Addr,
    zone: Option<String>,
}

impl LinkLocal {
    pub fn new(addr: Ipv6Addr) -> Self {
        Self { addr, zone: None }
    }

    /// Attach the host interface the address is reachable through.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }
}

impl fmt::Display for LinkLocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.zone {
            Some(zone) => write!(f, "{}%{}", self.addr, zone),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl Serialize for LinkLocal {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Base port pair owned by one VM class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBases {
    pub spice: u16,
    pub telnet: u16,
}

impl PortBases {
    pub const fn new(spice: u16, telnet: u16) -> Self {
        Self { spice, telnet }
    }
}

/// Everything derived from one tap index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedIdentifiers {
    pub tap: TapIndex,
    pub interface: String,
    pub mac: MacAddress,
    pub link_local: LinkLocal,
    /// SPICE display port. `u32` because `base + tap` can exceed `u16::MAX`
    pub spice_port: u32,
    pub telnet_port: u32,
}

/// Derive the identity of the NIC plugged into `tap`.
pub fn derive(tap: TapIndex, prefix: &MacPrefix, ports: PortBases) -> DerivedIdentifiers {
    let mac = prefix.mac_for(tap);
    DerivedIdentifiers {
        tap,
        interface: tap.interface_name(),
        mac,
        link_local: LinkLocal::new(mac.link_local()),
        spice_port: u32::from(ports.spice) + u32::from(tap.get()),
        telnet_port: u32::from(ports.telnet) + u32::from(tap.get()),
    }
}
