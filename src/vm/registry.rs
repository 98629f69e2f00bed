//! VM working directories under the VM root.
//!
//! A VM exists when its directory exists; nothing else is consulted.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, VmError};
use crate::vm::{RunState, validate_name};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmListItem {
    pub name: String,
    pub path: PathBuf,
    /// Total size of the regular files directly in the working directory.
    pub size_bytes: u64,
}

pub fn working_dir(root: &Path, name: &str) -> PathBuf {
    root.join(name)
}

/// Immediate subdirectories of `root` with valid VM names, sorted by name.
/// A missing root is an empty registry.
pub fn list(root: &Path) -> Result<Vec<VmListItem>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(VmError::io(root, e)),
    };

    let mut items = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| VmError::io(root, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        // Only names a VM can have; anything else could never be deleted here.
        if validate_name(&name).is_err() {
            debug!(path = %path.display(), "skipping directory that is not a VM name");
            continue;
        }
        let size_bytes = dir_size(&path);
        items.push(VmListItem { name, path, size_bytes });
    }
    items.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(items)
}

/// Remove the working directory of `name`.
///
/// `state` is the controller's live view of the VM; `running` or `starting`
/// refuses and leaves every file in place.
pub fn delete(root: &Path, name: &str, state: RunState) -> Result<()> {
    validate_name(name)?;
    if state.is_active() {
        return Err(VmError::Refused { name: name.to_string(), state });
    }

    let dir = working_dir(root, name);
    if !dir.is_dir() {
        return Err(VmError::NotFound { name: name.to_string() });
    }
    std::fs::remove_dir_all(&dir).map_err(|e| VmError::io(&dir, e))?;
    info!(vm = name, path = %dir.display(), "deleted VM working directory");
    Ok(())
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}
