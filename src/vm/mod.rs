//! VM orchestration for vmsmith.
//!
//! Turns a [`VmDescriptor`] into a validated platform configuration, owns the
//! on-disk resources it depends on, and drives the VM through its run states.
//!
//! ```text
//! VmHandle::build(descriptor)
//!     ├─► disk::ensure_disk          <vm>/<name>.img      (fatal)
//!     ├─► firmware::ensure_variable_store  <vm>/efi_vars.fd (fatal)
//!     ├─► network::MacAddress        derived from name
//!     ├─► cloud_init::build_payload  <vm>/cidata.iso      (best-effort)
//!     ├─► machine::MachineSpec       device graph
//!     └─► Hypervisor::realize        platform validation  (fatal, verbatim)
//!             └─► state = created
//! ```

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{SizingDefaults, SizingLimits};
use crate::error::{Result, VmError};

pub mod cloud_init;
pub mod disk;
pub mod firmware;
pub mod lifecycle;
pub mod machine;
pub mod metadata;
pub mod network;
pub mod registry;
pub mod ssh;
pub mod tools;

// ---------------------------------------------------------------------------
// Shared types used across submodules
// ---------------------------------------------------------------------------

/// Identity and sizing of one VM.
///
/// The name is the primary key for every on-disk resource. Once a VM has
/// been created its descriptor is fixed; resizing means delete + recreate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDescriptor {
    pub name: String,
    pub cpus: u32,
    pub memory_gb: u64,
    pub disk_gb: u64,
    /// Installation image attached read-only after the primary disk.
    pub iso_path: Option<PathBuf>,
    /// Public key text for the guest account. A key pair is generated in the
    /// working directory when this is `None`.
    pub ssh_public_key: Option<String>,
    /// Build and attach a first-boot payload.
    pub auto_install: bool,
}

/// Longest accepted VM name.
pub const MAX_NAME_LEN: usize = 64;

impl VmDescriptor {
    /// A descriptor for `name` with the configured default sizing.
    pub fn with_defaults(name: &str, defaults: &SizingDefaults) -> Self {
        Self {
            name: name.to_string(),
            cpus: defaults.cpus,
            memory_gb: defaults.memory_gb,
            disk_gb: defaults.disk_gb,
            iso_path: None,
            ssh_public_key: None,
            auto_install: false,
        }
    }

    /// Check name and sizing against `limits` and that the install image exists.
    pub fn validate(&self, limits: &SizingLimits) -> Result<()> {
        validate_name(&self.name)?;

        let bounded = |what: &str, value: u64, max: u64| {
            if value == 0 || value > max {
                Err(VmError::InvalidDescriptor {
                    reason: format!("{what} must be between 1 and {max}, got {value}"),
                })
            } else {
                Ok(())
            }
        };
        bounded("cpu count", u64::from(self.cpus), u64::from(limits.max_cpus))?;
        bounded("memory (GB)", self.memory_gb, limits.max_memory_gb)?;
        bounded("disk size (GB)", self.disk_gb, limits.max_disk_gb)?;
        for (what, gb) in [("memory", self.memory_gb), ("disk size", self.disk_gb)] {
            if gb.checked_mul(disk::GIB).is_none() {
                return Err(VmError::InvalidDescriptor { reason: format!("{what} of {gb} GB is not addressable in bytes") });
            }
        }

        if let Some(iso) = &self.iso_path {
            if !iso.is_file() {
                return Err(VmError::InvalidDescriptor {
                    reason: format!("ISO file not found: {}", iso.display()),
                });
            }
        }
        Ok(())
    }

    /// `true` when both descriptors ask for the same machine.
    pub fn same_sizing(&self, other: &VmDescriptor) -> bool {
        self.cpus == other.cpus && self.memory_gb == other.memory_gb && self.disk_gb == other.disk_gb
    }
}

/// Reject names that are empty, too long, or not filesystem-safe.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: String| Err(VmError::InvalidDescriptor { reason });

    if name.is_empty() {
        return invalid("VM name must not be empty".into());
    }
    if name.len() > MAX_NAME_LEN {
        return invalid(format!("VM name is longer than {MAX_NAME_LEN} characters"));
    }
    if name.starts_with('.') {
        return invalid(format!("VM name must not start with '.': {name}"));
    }
    if let Some(c) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))) {
        return invalid(format!("VM name contains invalid character {c:?}: {name}"));
    }
    Ok(())
}

/// Run state of a VM as seen by the lifecycle controller.
///
/// `NotConfigured` and `Created` belong to the controller; every other value
/// is read live from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotConfigured,
    Created,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::NotConfigured => "not_configured",
            RunState::Created => "created",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Pausing => "pausing",
            RunState::Paused => "paused",
            RunState::Resuming => "resuming",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
            RunState::Error => "error",
            RunState::Unknown => "unknown",
        }
    }

    /// States in which the working directory is in use and must not be removed.
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Starting)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a successful configuration build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VmInfo {
    pub name: String,
    pub cpus: u32,
    pub memory_gb: u64,
    pub disk_gb: u64,
    pub disk_path: PathBuf,
    pub vm_dir: PathBuf,
    pub mac_address: String,
    pub install_image: Option<PathBuf>,
    /// First-boot payload image, when one was built and attached.
    pub payload_image: Option<PathBuf>,
    pub state: RunState,
}

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use lifecycle::{Transition, VmHandle};
pub use network::MacAddress;
