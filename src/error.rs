//! Error types for vmsmith.
//!
//! Fatal failures (provisioning, platform validation) unwind to the caller of
//! the configuration build. Non-fatal outcomes never become a `VmError`: a
//! first-boot payload that cannot be built is logged and dropped, a start/stop
//! the platform declines is a [`crate::vm::Transition::Refused`], and an
//! address lookup that finds nothing is `None`.

use std::path::PathBuf;

use thiserror::Error;

use crate::vm::RunState;

/// Result type alias for vmsmith operations.
pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Error, Debug)]
pub enum VmError {
    // Provisioning errors
    #[error("Failed to provision {resource} at {path:?}: {reason}")]
    Provisioning {
        resource: &'static str,
        path: PathBuf,
        reason: String,
    },

    #[error("`{program}` failed: {reason}")]
    Tool { program: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The platform rejected an assembled configuration. The payload is the
    /// platform's own failure text.
    #[error("{0}")]
    Validation(String),

    #[error("Invalid VM descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    // Lifecycle errors
    #[error("Cannot delete VM '{name}' while it is {state}")]
    Refused { name: String, state: RunState },

    #[error("VM '{name}' is {state}; stop it before configuring another VM")]
    Busy { name: String, state: RunState },

    #[error("VM not found: {name}")]
    NotFound { name: String },

    // Configuration errors
    #[error("Invalid settings at {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Invalid VM metadata at {path:?}: {reason}")]
    Metadata { path: PathBuf, reason: String },

    // Platform errors
    #[error("Unsupported: {reason}")]
    Unsupported { reason: String },
}

impl VmError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Re-tag a lower-level failure as a provisioning failure of `resource`.
    pub fn provisioning(resource: &'static str, path: impl Into<PathBuf>, err: impl ToString) -> Self {
        Self::Provisioning { resource, path: path.into(), reason: err.to_string() }
    }
}
