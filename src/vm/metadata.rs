//! Per-VM descriptor persistence (`<workdir>/vm.toml`).
//!
//! Written on the first successful build and read back by later builds and
//! by `load`, so a VM is always rebuilt with the sizing it was created with.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};
use crate::vm::VmDescriptor;

pub const METADATA_FILE: &str = "vm.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredVm {
    pub name: String,
    pub cpus: u32,
    pub memory_gb: u64,
    pub disk_gb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_path: Option<PathBuf>,
    #[serde(default)]
    pub auto_install: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StoredVm {
    pub fn from_descriptor(descriptor: &VmDescriptor) -> Self {
        Self {
            name: descriptor.name.clone(),
            cpus: descriptor.cpus,
            memory_gb: descriptor.memory_gb,
            disk_gb: descriptor.disk_gb,
            iso_path: descriptor.iso_path.clone(),
            auto_install: descriptor.auto_install,
            ssh_public_key: descriptor.ssh_public_key.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn descriptor(&self) -> VmDescriptor {
        VmDescriptor {
            name: self.name.clone(),
            cpus: self.cpus,
            memory_gb: self.memory_gb,
            disk_gb: self.disk_gb,
            iso_path: self.iso_path.clone(),
            ssh_public_key: self.ssh_public_key.clone(),
            auto_install: self.auto_install,
        }
    }
}

pub fn metadata_path(workdir: &Path) -> PathBuf {
    workdir.join(METADATA_FILE)
}

/// Read the stored descriptor, `None` if the VM predates metadata or was
/// never built.
pub fn load(workdir: &Path) -> Result<Option<StoredVm>> {
    let path = metadata_path(workdir);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VmError::io(&path, e)),
    };
    toml::from_str(&text)
        .map(Some)
        .map_err(|e| VmError::Metadata { path, reason: e.to_string() })
}

pub fn save(workdir: &Path, stored: &StoredVm) -> Result<()> {
    let path = metadata_path(workdir);
    let text = toml::to_string_pretty(stored).map_err(|e| VmError::Metadata {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    std::fs::write(&path, text).map_err(|e| VmError::io(&path, e))
}
