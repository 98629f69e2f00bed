//! Raw disk image provisioning.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Result, VmError};
use crate::vm::tools;

/// Bytes per GB as the disk and memory sizes are specified.
pub const GIB: u64 = 1 << 30;

const BLOCK_SIZE: u64 = 1 << 20;

/// `<workdir>/<name>.img`
pub fn disk_image_path(workdir: &Path, name: &str) -> PathBuf {
    workdir.join(format!("{name}.img"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskImage {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// `false` when an existing image was reused.
    pub created: bool,
}

/// Create a zero-filled image of exactly `size_gb` GiB at `path`, or reuse the
/// file already there untouched.
///
/// `dd` is driven with `seek` and `count=0`, which yields a sparse file of the
/// exact length. Any failure removes the partial file.
pub fn ensure_disk(dd: &str, path: &Path, size_gb: u64) -> Result<DiskImage> {
    if let Ok(meta) = std::fs::metadata(path) {
        if !meta.is_file() {
            return Err(VmError::provisioning("disk image", path, "path exists and is not a file"));
        }
        info!(path = %path.display(), size_bytes = meta.len(), "reusing existing disk image");
        return Ok(DiskImage { path: path.to_path_buf(), size_bytes: meta.len(), created: false });
    }

    let size_bytes = size_gb.checked_mul(GIB).ok_or_else(|| VmError::InvalidDescriptor {
        reason: format!("disk size of {size_gb} GB is not addressable in bytes"),
    })?;
    let of = format!("of={}", path.display());
    let seek = format!("seek={}", size_bytes / BLOCK_SIZE);
    let bs = format!("bs={BLOCK_SIZE}");

    let written = tools::run(dd, ["if=/dev/zero", of.as_str(), bs.as_str(), "count=0", seek.as_str()], "create disk image")
        .and_then(|_| std::fs::metadata(path).map_err(|e| VmError::io(path, e)))
        .and_then(|meta| {
            if meta.len() == size_bytes {
                Ok(())
            } else {
                Err(VmError::Tool {
                    program: dd.to_string(),
                    reason: format!("wrote {} bytes, expected {size_bytes}", meta.len()),
                })
            }
        });

    if let Err(e) = written {
        if path.exists() {
            if let Err(rm) = std::fs::remove_file(path) {
                warn!(path = %path.display(), "could not remove partial disk image: {rm}");
            }
        }
        return Err(VmError::provisioning("disk image", path, e));
    }

    info!(path = %path.display(), size_gb, "created disk image");
    Ok(DiskImage { path: path.to_path_buf(), size_bytes, created: true })
}
