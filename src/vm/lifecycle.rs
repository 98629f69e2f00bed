//! VM lifecycle controller.
//!
//! ```text
//! not_configured ──build──► created ──start──► starting ──► running
//!                                                              │
//!                  stopped ◄── stopping ◄──────stop────────────┘
//! ```
//!
//! `created` is asserted by the controller after a successful build and held
//! until the first start/stop the platform accepts; from then on every state
//! is read live from the platform. Start and stop never block: they return a
//! [`Transition`] as soon as the platform accepts or declines the request.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{Result, VmError};
use crate::hypervisor::{Completion, Hypervisor, PlatformMachine, Support};
use crate::vm::cloud_init;
use crate::vm::disk;
use crate::vm::firmware;
use crate::vm::machine::{MachineInputs, MachineSpec};
use crate::vm::metadata::{self, StoredVm};
use crate::vm::network::{self, MacAddress};
use crate::vm::registry::{self, VmListItem};
use crate::vm::{RunState, VmDescriptor, VmInfo, validate_name};

/// Outcome of a start or stop request.
#[derive(Debug)]
pub enum Transition {
    /// The platform took the request. The receiver yields the platform's
    /// completion result once; nothing in the controller waits on it.
    Accepted(mpsc::Receiver<std::result::Result<(), String>>),
    /// Declined synchronously: no VM configured, or the platform refused
    /// in the current state.
    Refused(String),
}

impl Transition {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Transition::Accepted(_))
    }
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Start,
    Stop,
}

impl Request {
    fn verb(self) -> &'static str {
        match self {
            Request::Start => "start",
            Request::Stop => "stop",
        }
    }
}

struct Runtime<H: Hypervisor> {
    // The platform object refers to its configuration for its whole life.
    _config: H::Config,
    machine: H::Machine,
    info: VmInfo,
    /// Set once the platform has accepted a start or stop.
    live: bool,
}

/// In-process handle on at most one configured VM.
///
/// Not persisted: each process rebuilds the configuration from the VM's
/// working directory before it can start or stop it.
pub struct VmHandle<H: Hypervisor> {
    hypervisor: H,
    settings: Settings,
    root: PathBuf,
    runtime: Option<Runtime<H>>,
}

impl<H: Hypervisor> VmHandle<H> {
    /// Handle over the VM root resolved from `settings`.
    pub fn new(hypervisor: H, settings: Settings) -> Result<Self> {
        let root = settings.vm_root()?;
        Ok(Self::with_root(hypervisor, settings, root))
    }

    pub fn with_root(hypervisor: H, settings: Settings, root: PathBuf) -> Self {
        Self { hypervisor, settings, root, runtime: None }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn working_dir(&self, name: &str) -> PathBuf {
        registry::working_dir(&self.root, name)
    }

    pub fn support(&self) -> Support {
        self.hypervisor.support()
    }

    // -----------------------------------------------------------------------
    // Configuration build
    // -----------------------------------------------------------------------

    /// Materialize every resource `descriptor` needs and realize a validated
    /// platform configuration for it.
    ///
    /// Rebuilding an existing VM reuses its disk image, variable store and
    /// key pair untouched. A build that asks for different sizing than the VM
    /// was created with is rejected.
    ///
    /// While this handle's machine is in use (anything but `stopped` or
    /// `error` once started) it is kept: a build for the same name returns
    /// its configuration with the live state, any other name is
    /// [`VmError::Busy`].
    pub fn build(&mut self, descriptor: &VmDescriptor) -> Result<VmInfo> {
        let name = descriptor.name.as_str();
        if let Some(info) = self.in_use() {
            if info.name == name {
                let state = self.state();
                info!(vm = name, %state, "VM already configured and in use, keeping live configuration");
                return Ok(VmInfo { state, ..info.clone() });
            }
            return Err(VmError::Busy { name: info.name.clone(), state: self.state() });
        }

        self.build_configuration(descriptor).inspect_err(|e| {
            error!(vm = name, "VM configuration build failed: {e}");
        })
    }

    /// Configuration of a machine the platform is still running, if any.
    fn in_use(&self) -> Option<&VmInfo> {
        let rt = self.runtime.as_ref().filter(|rt| rt.live)?;
        match self.state() {
            RunState::Stopped | RunState::Error => None,
            _ => Some(&rt.info),
        }
    }

    fn build_configuration(&mut self, descriptor: &VmDescriptor) -> Result<VmInfo> {
        let name = descriptor.name.as_str();
        validate_name(name)?;
        let workdir = self.working_dir(name);

        let stored = if workdir.is_dir() { metadata::load(&workdir)? } else { None };
        let effective = match &stored {
            Some(stored) => resolve_stored(stored, descriptor)?,
            None => descriptor.clone(),
        };
        effective.validate(&self.settings.limits)?;

        std::fs::create_dir_all(&workdir)
            .map_err(|e| VmError::provisioning("working directory", &workdir, e))?;
        info!(vm = name, path = %workdir.display(), cpus = effective.cpus, memory_gb = effective.memory_gb, disk_gb = effective.disk_gb, "building VM configuration");

        let disk = disk::ensure_disk(&self.settings.tools.dd, &disk::disk_image_path(&workdir, name), effective.disk_gb)?;
        // Without vm.toml nothing records the size a leftover image was made with.
        if stored.is_none() && !disk.created && Some(disk.size_bytes) != effective.disk_gb.checked_mul(disk::GIB) {
            return Err(VmError::InvalidDescriptor {
                reason: format!(
                    "existing disk image {} is {} bytes, not {} GB; delete the VM to resize",
                    disk.path.display(),
                    disk.size_bytes,
                    effective.disk_gb
                ),
            });
        }
        let store = firmware::ensure_variable_store(&self.hypervisor, &workdir)?;
        let mac = MacAddress::for_vm(name);

        let payload = if effective.auto_install {
            match cloud_init::build_payload(
                &self.settings.tools,
                &self.settings.guest,
                name,
                &workdir,
                effective.ssh_public_key.as_deref(),
            ) {
                Ok(payload) => Some(payload.image),
                Err(e) => {
                    warn!(vm = name, "first-boot payload unavailable, continuing without automatic bootstrap: {e}");
                    None
                }
            }
        } else {
            None
        };

        let spec = MachineSpec::assemble(&MachineInputs {
            descriptor: &effective,
            disk: &disk.path,
            variable_store: &store.path,
            payload: payload.as_deref(),
            mac,
            display: &self.settings.display,
        });
        let (config, payload) = self.realize(name, &spec, payload)?;
        let machine = self.hypervisor.instantiate(&config)?;

        if stored.is_none() {
            metadata::save(&workdir, &StoredVm::from_descriptor(&effective))?;
        }

        let info = VmInfo {
            name: name.to_string(),
            cpus: effective.cpus,
            memory_gb: effective.memory_gb,
            disk_gb: effective.disk_gb,
            disk_path: disk.path,
            vm_dir: workdir,
            mac_address: mac.to_string(),
            install_image: effective.iso_path.clone(),
            payload_image: payload,
            state: RunState::Created,
        };
        info!(vm = name, mac = %mac, "VM configuration created");

        self.runtime = Some(Runtime { _config: config, machine, info: info.clone(), live: false });
        Ok(info)
    }

    /// Rebuild the configuration of an existing VM from its working directory.
    pub fn load(&mut self, name: &str) -> Result<VmInfo> {
        validate_name(name)?;
        let workdir = self.working_dir(name);
        if !workdir.is_dir() {
            return Err(VmError::NotFound { name: name.to_string() });
        }
        let descriptor = match metadata::load(&workdir)? {
            Some(stored) => stored.descriptor(),
            None => VmDescriptor::with_defaults(name, &self.settings.defaults),
        };
        self.build(&descriptor)
    }

    /// Validate `spec`; a rejection with the payload attached is retried once
    /// without it.
    fn realize(
        &self,
        name: &str,
        spec: &MachineSpec,
        payload: Option<PathBuf>,
    ) -> Result<(H::Config, Option<PathBuf>)> {
        match self.hypervisor.realize(spec) {
            Ok(config) => Ok((config, payload)),
            Err(e) if spec.payload().is_some() => {
                warn!(vm = name, "configuration rejected with first-boot payload attached, retrying without it: {e}");
                let config = self.hypervisor.realize(&spec.without_payload())?;
                Ok((config, None))
            }
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Run state
    // -----------------------------------------------------------------------

    pub fn state(&self) -> RunState {
        match &self.runtime {
            None => RunState::NotConfigured,
            Some(rt) if !rt.live => RunState::Created,
            Some(rt) => rt.machine.state().into(),
        }
    }

    pub fn info(&self) -> Option<&VmInfo> {
        self.runtime.as_ref().map(|rt| &rt.info)
    }

    pub fn start(&mut self) -> Transition {
        self.request(Request::Start)
    }

    pub fn stop(&mut self) -> Transition {
        self.request(Request::Stop)
    }

    fn request(&mut self, request: Request) -> Transition {
        let verb = request.verb();
        let Some(rt) = self.runtime.as_mut() else {
            warn!("No VM configured; cannot {verb}");
            return Transition::Refused("No VM configured".into());
        };

        let name = rt.info.name.clone();
        let (tx, rx) = mpsc::channel();
        let done: Completion = Box::new(move |result| {
            match &result {
                Ok(()) => info!(vm = %name, "VM {verb} completed"),
                Err(reason) => error!(vm = %name, "VM {verb} failed: {reason}"),
            }
            // The receiver may already be gone; the log line above is the record.
            let _ = tx.send(result);
        });

        let requested = match request {
            Request::Start => rt.machine.request_start(done),
            Request::Stop => rt.machine.request_stop(done),
        };
        match requested {
            Ok(()) => {
                rt.live = true;
                info!(vm = %rt.info.name, "{verb} requested");
                Transition::Accepted(rx)
            }
            Err(reason) => {
                warn!(vm = %rt.info.name, "{verb} declined by platform: {reason}");
                Transition::Refused(reason)
            }
        }
    }

    /// Give the platform `timeout` to deliver completions and state changes.
    pub fn pump(&self, timeout: Duration) {
        if let Some(rt) = &self.runtime {
            rt.machine.pump(timeout);
        }
    }

    // -----------------------------------------------------------------------
    // Registry and discovery
    // -----------------------------------------------------------------------

    pub fn list(&self) -> Result<Vec<VmListItem>> {
        registry::list(&self.root)
    }

    /// Remove the working directory of `name`, refusing while this handle
    /// observes it running or starting.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let configured = self.runtime.as_ref().is_some_and(|rt| rt.info.name == name);
        let state = if configured { self.state() } else { RunState::NotConfigured };

        registry::delete(&self.root, name, state)?;
        if configured {
            self.runtime = None;
        }
        Ok(())
    }

    /// Best-effort IPv4 address of `name`. `None` means try again later.
    pub fn discover_address(&self, name: &str) -> Option<Ipv4Addr> {
        network::discover_address(&self.settings.tools.arp, name)
    }
}

/// The descriptor a rebuild uses: the stored one, provided the request does
/// not ask for different sizing.
fn resolve_stored(stored: &StoredVm, requested: &VmDescriptor) -> Result<VmDescriptor> {
    let mut effective = stored.descriptor();
    if !effective.same_sizing(requested) {
        return Err(VmError::InvalidDescriptor {
            reason: format!(
                "VM '{}' already exists with {} CPUs, {} GB memory, {} GB disk; delete it to resize",
                stored.name, stored.cpus, stored.memory_gb, stored.disk_gb
            ),
        });
    }
    if let Some(iso) = &effective.iso_path {
        if !iso.is_file() {
            warn!(vm = %stored.name, iso = %iso.display(), "install image no longer present, attaching without it");
            effective.iso_path = None;
        }
    }
    Ok(effective)
}
