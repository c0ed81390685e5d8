//! labvm: launch-side plumbing for QEMU/KVM teaching labs
//!
//! Every guest NIC is plugged into a numbered tap interface. The tap number
//! alone determines the NIC's MAC address, its IPv6 link-local address and
//! the SPICE/telnet console ports of the guest, so a student can reach any
//! VM without reading launcher output.
//!
//! # Key Features
//!
//! - **Deterministic identities**: [`ident::derive`] maps a tap index to MAC,
//!   link-local and console ports
//! - **Readiness polling**: [`readiness::ReadinessWaiter`] waits a bounded
//!   time for a companion socket (software TPM) before QEMU starts
//! - **Reservations**: [`registry::Registry`] keeps concurrent launchers from
//!   claiming the same tap, image or VM name
//! - **Declarations**: YAML lab and switch files, validated and planned
//! - **Resource API**: [`daemon::serve`] claims taps over HTTP
//!
//! # Example
//!
//! ```no_run
//! use labvm::ident::{derive, MacPrefix, TapIndex};
//! use labvm::profile::VmClass;
//!
//! let ids = derive(TapIndex::new(12), &MacPrefix::DEFAULT, VmClass::Linux.port_bases());
//! assert_eq!(ids.mac.to_string(), "b8:ad:ca:fe:00:0c");
//! assert_eq!(ids.spice_port, 5912);
//! ```

// Identities
pub mod error;
pub mod ident;
pub mod profile;

// Launch support
pub mod preflight;
pub mod readiness;
pub mod registry;

// Declarations
pub mod lab;
pub mod plan;
pub mod settings;
pub mod switch;

// HTTP resource API
pub mod daemon;

// Re-exports for convenience
pub use error::{Error, Result};
pub use settings::Settings;

// Prelude for common imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::ident::{derive, DerivedIdentifiers, MacAddress, MacPrefix, TapIndex};
    pub use crate::lab::{load_lab, LabFile, VmDecl};
    pub use crate::plan::{plan_lab, VmPlan};
    pub use crate::profile::VmClass;
    pub use crate::readiness::{ReadinessWaiter, WaitOutcome};
    pub use crate::registry::{Registry, Reservation, ResourceKey};
    pub use crate::settings::Settings;
}
