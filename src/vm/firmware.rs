//! EFI variable store provisioning.
//!
//! The store is created once per VM and loaded on every later build, so boot
//! order and other firmware variables survive restarts.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{Result, VmError};
use crate::hypervisor::Hypervisor;

pub const VARIABLE_STORE_FILE: &str = "efi_vars.fd";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableStore {
    pub path: PathBuf,
    pub created: bool,
}

pub fn variable_store_path(workdir: &Path) -> PathBuf {
    workdir.join(VARIABLE_STORE_FILE)
}

/// Open the store in `workdir`, creating it through the platform if absent.
pub fn ensure_variable_store<H: Hypervisor>(hypervisor: &H, workdir: &Path) -> Result<VariableStore> {
    let path = variable_store_path(workdir);

    if path.exists() {
        std::fs::File::open(&path).map_err(|e| VmError::provisioning("firmware store", &path, e))?;
        info!(path = %path.display(), "loading existing EFI variable store");
        return Ok(VariableStore { path, created: false });
    }

    hypervisor
        .create_variable_store(&path)
        .map_err(|e| VmError::provisioning("firmware store", &path, e))?;
    info!(path = %path.display(), "created EFI variable store");
    Ok(VariableStore { path, created: true })
}
