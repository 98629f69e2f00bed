//! User settings for vmsmith.
//!
//! Loaded from `~/.config/vmsmith/config.toml`. Every field has a default, so
//! a missing file or a partial one is valid:
//!
//! ```toml
//! vm_root = "/Volumes/Fast/VMs"
//!
//! [defaults]
//! cpus = 4
//!
//! [tools]
//! payload_packer = "mkisofs"
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, VmError};
use crate::paths::VmsmithPaths;

/// Environment variable that overrides [`Settings::vm_root`].
pub const VM_ROOT_ENV: &str = "VMSMITH_VM_ROOT";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Root settings container.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding one working directory per VM. `~/VMs` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_root: Option<PathBuf>,
    pub defaults: SizingDefaults,
    pub limits: SizingLimits,
    pub tools: ToolSettings,
    pub guest: GuestSettings,
    pub display: DisplaySettings,
}

// --- Sub-structs ---

/// Sizing used when `create` is given no explicit value.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SizingDefaults {
    pub cpus: u32,
    pub memory_gb: u64,
    pub disk_gb: u64,
}

/// Upper bounds accepted for a VM descriptor.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SizingLimits {
    pub max_cpus: u32,
    pub max_memory_gb: u64,
    pub max_disk_gb: u64,
}

/// External programs the provisioners shell out to.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ToolSettings {
    /// Raw-image writer.
    pub dd: String,
    /// Hybrid ISO packer for the first-boot payload. `hdiutil` gets
    /// `makehybrid` arguments; anything else gets genisoimage/mkisofs ones.
    pub payload_packer: String,
    pub ssh_keygen: String,
    /// Neighbor-table inspector used for address discovery.
    pub arp: String,
    pub ssh: String,
}

/// Guest account written into the first-boot payload.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct GuestSettings {
    pub user: String,
    /// Fallback console password for `user`.
    pub password: String,
    /// Packages installed on first boot.
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Settings {
    fn default() -> Self {
        Self {
            vm_root: None,
            defaults: SizingDefaults::default(),
            limits: SizingLimits::default(),
            tools: ToolSettings::default(),
            guest: GuestSettings::default(),
            display: DisplaySettings::default(),
        }
    }
}

impl Default for SizingDefaults {
    fn default() -> Self {
        Self { cpus: 2, memory_gb: 4, disk_gb: 20 }
    }
}

impl Default for SizingLimits {
    fn default() -> Self {
        Self { max_cpus: 32, max_memory_gb: 128, max_disk_gb: 1000 }
    }
}

impl Default for ToolSettings {
    fn default() -> Self {
        let payload_packer = if cfg!(target_os = "macos") { "hdiutil" } else { "genisoimage" };
        Self {
            dd: "dd".into(),
            payload_packer: payload_packer.into(),
            ssh_keygen: "ssh-keygen".into(),
            arp: "arp".into(),
            ssh: "ssh".into(),
        }
    }
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            user: "ubuntu".into(),
            password: "vmsmith".into(),
            packages: ["openssh-server", "curl", "wget", "vim", "htop", "net-tools"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self { width: 1280, height: 800 }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Settings {
    /// Load settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(VmError::io(path, e)),
        };

        Self::from_toml(&text).map_err(|e| VmError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load from the standard location, or defaults when `HOME` is unset.
    pub fn load_default() -> Result<Self> {
        match VmsmithPaths::resolve() {
            Some(paths) => Self::load(&paths.config_file()),
            None => Ok(Self::default()),
        }
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Resolve the VM root: `VMSMITH_VM_ROOT`, then `vm_root`, then `~/VMs`.
    pub fn vm_root(&self) -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(VM_ROOT_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(dir));
        }
        if let Some(dir) = &self.vm_root {
            return Ok(dir.clone());
        }
        VmsmithPaths::resolve().map(|p| p.vms).ok_or_else(|| VmError::Unsupported {
            reason: "HOME is not set; cannot locate the VM root".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
