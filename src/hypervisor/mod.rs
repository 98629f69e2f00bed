//! Host virtualization capability.
//!
//! The orchestrator talks to the platform through two traits:
//!
//! - [`Hypervisor`]: variable-store creation, configuration realization
//!   (construct + validate) and instantiation.
//! - [`PlatformMachine`]: one instantiated VM. Start and stop are requests the
//!   platform executes asynchronously; completion is delivered through a
//!   one-shot [`Completion`] callback on the platform's own queue.
//!
//! macOS implements both with Virtualization.framework (see [`vz`]). On other
//! hosts [`vz::VzHypervisor`] reports itself unsupported.

use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::vm::RunState;
use crate::vm::machine::MachineSpec;

pub mod vz;

pub use vz::VzHypervisor;

/// Callback invoked once when an asynchronous start/stop finishes.
/// `Err` carries the platform's failure text.
pub type Completion = Box<dyn FnOnce(std::result::Result<(), String>) + 'static>;

/// Result of the platform's support probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Support {
    pub supported: bool,
    pub message: String,
}

pub trait Hypervisor {
    /// Validated, platform-native configuration.
    type Config;
    /// Live platform VM object.
    type Machine: PlatformMachine;

    /// Probe whether VMs can run on this host.
    fn support(&self) -> Support;

    /// Create a fresh firmware variable store file at `path`.
    fn create_variable_store(&self, path: &Path) -> Result<()>;

    /// Translate `spec` into a platform configuration and validate it.
    ///
    /// A rejection is returned as [`crate::VmError::Validation`] carrying the
    /// platform's reason unchanged.
    fn realize(&self, spec: &MachineSpec) -> Result<Self::Config>;

    /// Instantiate a VM from a realized configuration.
    fn instantiate(&self, config: &Self::Config) -> Result<Self::Machine>;
}

pub trait PlatformMachine {
    /// Current platform state value.
    fn state(&self) -> PlatformState;

    /// Ask the platform to start the VM. Returns immediately; `Err` means the
    /// request was declined synchronously and `done` will not be called.
    fn request_start(&self, done: Completion) -> std::result::Result<(), String>;

    /// Ask the platform to stop the VM. Same contract as [`Self::request_start`].
    fn request_stop(&self, done: Completion) -> std::result::Result<(), String>;

    /// Let the platform deliver queued callbacks and state changes for up to
    /// `timeout`. Only callers that keep the VM alive in the foreground need it.
    fn pump(&self, timeout: Duration);
}

// ---------------------------------------------------------------------------
// Platform state mapping
// ---------------------------------------------------------------------------

/// Raw platform run-state value, numbered like `VZVirtualMachineState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformState(pub i64);

impl PlatformState {
    pub const STOPPED: Self = Self(0);
    pub const RUNNING: Self = Self(1);
    pub const PAUSED: Self = Self(2);
    pub const ERROR: Self = Self(3);
    pub const STARTING: Self = Self(4);
    pub const PAUSING: Self = Self(5);
    pub const RESUMING: Self = Self(6);
    pub const STOPPING: Self = Self(7);
    pub const SAVING: Self = Self(8);
    pub const RESTORING: Self = Self(9);
}

impl From<PlatformState> for RunState {
    /// Total mapping: any value outside the known set is `Unknown`.
    fn from(state: PlatformState) -> Self {
        match state {
            PlatformState::STOPPED => RunState::Stopped,
            PlatformState::RUNNING => RunState::Running,
            PlatformState::PAUSED => RunState::Paused,
            PlatformState::ERROR => RunState::Error,
            PlatformState::STARTING => RunState::Starting,
            PlatformState::PAUSING => RunState::Pausing,
            PlatformState::RESUMING => RunState::Resuming,
            PlatformState::STOPPING => RunState::Stopping,
            _ => RunState::Unknown,
        }
    }
}
