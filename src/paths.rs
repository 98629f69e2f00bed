//! Host directory layout for vmsmith.
//!
//! - Config:  `~/.config/vmsmith/`  (human-editable, XDG-style)
//! - VMs:     `~/VMs/`  (one working directory per VM, named after it)
//! - Logs:    `~/Library/Logs/vmsmith/` on macOS, XDG data dir elsewhere
//!
//! The VM root can be moved with `vm_root` in `config.toml` or the
//! `VMSMITH_VM_ROOT` environment variable (see [`crate::config::Settings`]).

use std::path::{Path, PathBuf};
use tracing::info;

const APP_NAME: &str = "vmsmith";

/// Directory under `$HOME` that holds one working directory per VM.
pub const VM_ROOT_DIR: &str = "VMs";

/// All resolved host directory paths.
#[derive(Debug, Clone)]
pub struct VmsmithPaths {
    /// Human-editable config: `~/.config/vmsmith/`
    pub config: PathBuf,
    /// Default VM root: `~/VMs/`
    pub vms: PathBuf,
    /// Application logs
    pub logs: PathBuf,
}

impl VmsmithPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories; call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        Some(Self::under_home(&home))
    }

    /// Resolve the layout relative to an explicit home directory.
    pub fn under_home(home: &Path) -> Self {
        Self {
            config: resolve_config_dir(home),
            vms: home.join(VM_ROOT_DIR),
            logs: resolve_log_dir(home),
        }
    }

    /// Path of the settings file inside the config directory.
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }

    /// Create all directories that don't already exist.
    /// Excludes the VM root from Time Machine on macOS: disk images are large.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.vms, &self.logs] {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }

        #[cfg(target_os = "macos")]
        exclude_from_time_machine(&self.vms);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

// ---------------------------------------------------------------------------
// Time Machine exclusion (macOS only)
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
fn exclude_from_time_machine(path: &Path) {
    use std::process::Command;
    use tracing::warn;

    match Command::new("tmutil")
        .args(["addexclusion", &path.to_string_lossy()])
        .output()
    {
        Ok(output) if output.status.success() => {
            info!("TM-excluded: {}", path.display());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("tmutil addexclusion failed for {}: {}", path.display(), stderr.trim());
        }
        Err(e) => {
            warn!("failed to run tmutil for {}: {e}", path.display());
        }
    }
}
