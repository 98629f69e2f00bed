//! Shared fixtures for the integration tests.
//!
//! - [`FakeHypervisor`]: in-process platform that records every realized
//!   [`MachineSpec`] and completes start/stop requests on [`PlatformMachine::pump`].
//! - Fake host tools: small shell scripts standing in for the payload packer,
//!   `ssh-keygen` and `arp`, written into a per-test temp directory.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vmsmith::config::Settings;
use vmsmith::hypervisor::{Completion, Hypervisor, PlatformMachine, PlatformState, Support};
use vmsmith::vm::machine::MachineSpec;
use vmsmith::{Result, VmError};

// ---------------------------------------------------------------------------
// Fake platform
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeState {
    /// Variable stores created through the platform.
    pub stores_created: usize,
    /// Every spec passed to `realize`, accepted or not.
    pub realized: Vec<MachineSpec>,
    /// Reject any spec that carries a first-boot payload.
    pub reject_payload: bool,
    /// Reject every spec with this reason.
    pub reject_all: Option<String>,
    pub fail_store: bool,
    /// Run state of the most recently instantiated machine.
    pub machine_state: Option<Rc<Cell<PlatformState>>>,
}

#[derive(Clone, Default)]
pub struct FakeHypervisor {
    pub state: Rc<RefCell<FakeState>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_spec(&self) -> Option<MachineSpec> {
        self.state.borrow().realized.last().cloned()
    }

    /// Force the live platform state, as the platform would on its own.
    pub fn set_machine_state(&self, state: PlatformState) {
        if let Some(cell) = &self.state.borrow().machine_state {
            cell.set(state);
        }
    }
}

pub const PAYLOAD_REJECTION: &str = "The storage device attachment is invalid.";

pub struct FakeConfig {
    pub spec: MachineSpec,
}

impl Hypervisor for FakeHypervisor {
    type Config = FakeConfig;
    type Machine = FakeMachine;

    fn support(&self) -> Support {
        Support { supported: true, message: "fake platform".into() }
    }

    fn create_variable_store(&self, path: &Path) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_store {
            return Err(VmError::Validation("variable store creation failed".into()));
        }
        std::fs::write(path, b"EFI VARIABLE STORE").map_err(|e| VmError::io(path, e))?;
        state.stores_created += 1;
        Ok(())
    }

    fn realize(&self, spec: &MachineSpec) -> Result<FakeConfig> {
        let mut state = self.state.borrow_mut();
        state.realized.push(spec.clone());
        if let Some(reason) = &state.reject_all {
            return Err(VmError::Validation(reason.clone()));
        }
        if state.reject_payload && spec.payload().is_some() {
            return Err(VmError::Validation(PAYLOAD_REJECTION.into()));
        }
        Ok(FakeConfig { spec: spec.clone() })
    }

    fn instantiate(&self, _config: &FakeConfig) -> Result<FakeMachine> {
        let machine = FakeMachine::new();
        self.state.borrow_mut().machine_state = Some(machine.state.clone());
        Ok(machine)
    }
}

/// Starts in `stopped`. A request moves it to the transient state at once;
/// `pump` settles it and fires the completion.
pub struct FakeMachine {
    state: Rc<Cell<PlatformState>>,
    pending: RefCell<VecDeque<(PlatformState, Completion)>>,
}

impl FakeMachine {
    fn new() -> Self {
        Self { state: Rc::new(Cell::new(PlatformState::STOPPED)), pending: RefCell::new(VecDeque::new()) }
    }
}

impl PlatformMachine for FakeMachine {
    fn state(&self) -> PlatformState {
        self.state.get()
    }

    fn request_start(&self, done: Completion) -> std::result::Result<(), String> {
        if self.state.get() != PlatformState::STOPPED {
            return Err("Invalid virtual machine state transition.".into());
        }
        self.state.set(PlatformState::STARTING);
        self.pending.borrow_mut().push_back((PlatformState::RUNNING, done));
        Ok(())
    }

    fn request_stop(&self, done: Completion) -> std::result::Result<(), String> {
        let current = self.state.get();
        if current != PlatformState::RUNNING && current != PlatformState::STARTING {
            return Err("Invalid virtual machine state transition.".into());
        }
        self.state.set(PlatformState::STOPPING);
        self.pending.borrow_mut().push_back((PlatformState::STOPPED, done));
        Ok(())
    }

    fn pump(&self, _timeout: Duration) {
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some((target, done)) = next else { break };
            self.state.set(target);
            done(Ok(()));
        }
    }
}

// ---------------------------------------------------------------------------
// Log capture
// ---------------------------------------------------------------------------

/// Layer recording the level and message of every event.
#[derive(Clone, Default)]
pub struct CapturedEvents(Arc<Mutex<Vec<(tracing::Level, String)>>>);

impl CapturedEvents {
    pub fn messages_at(&self, level: tracing::Level) -> Vec<String> {
        let events = self.0.lock().expect("capture lock");
        events.iter().filter(|(l, _)| *l == level).map(|(_, m)| m.clone()).collect()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedEvents {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        struct Message<'a>(&'a mut String);

        impl tracing::field::Visit for Message<'_> {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0.push_str(&format!("{value:?}"));
                }
            }
        }

        let mut message = String::new();
        event.record(&mut Message(&mut message));
        self.0.lock().expect("capture lock").push((*event.metadata().level(), message));
    }
}

/// Run `f` with every event on this thread recorded.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, CapturedEvents) {
    use tracing_subscriber::layer::SubscriberExt;

    let captured = CapturedEvents::default();
    let subscriber = tracing_subscriber::registry().with(captured.clone());
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, captured)
}

// ---------------------------------------------------------------------------
// Fake host tools
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// genisoimage stand-in: writes a small file at the `-output` path.
#[cfg(unix)]
pub fn fake_packer(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-packer",
        r#"out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -output) shift; out="$1" ;;
  esac
  shift
done
[ -n "$out" ] || { echo "no output path" >&2; exit 2; }
printf 'CD001' > "$out"
"#,
    )
}

/// ssh-keygen stand-in: writes a pair at the `-f` path and appends one line
/// per invocation to `keygen.calls` next to the script.
#[cfg(unix)]
pub fn fake_keygen(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-ssh-keygen",
        r#"key=""
comment=""
while [ $# -gt 0 ]; do
  case "$1" in
    -f) shift; key="$1" ;;
    -C) shift; comment="$1" ;;
  esac
  shift
done
echo call >> "$(dirname "$0")/keygen.calls"
printf 'PRIVATE KEY\n' > "$key"
printf 'ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFake %s\n' "$comment" > "$key.pub"
"#,
    )
}

pub fn keygen_calls(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("keygen.calls")).map(|s| s.lines().count()).unwrap_or(0)
}

/// `arp -an` stand-in printing `entries` as `(ip) at mac` lines.
#[cfg(unix)]
pub fn fake_arp(dir: &Path, entries: &[(&str, &str)]) -> PathBuf {
    let mut body = String::from("cat <<'EOF'\n");
    body.push_str("? (192.168.64.1) at 3e:22:fb:b1:9e:64 on bridge100 ifscope permanent [bridge]\n");
    for (ip, mac) in entries {
        body.push_str(&format!("? ({ip}) at {mac} on bridge100 ifscope [bridge]\n"));
    }
    body.push_str("EOF\n");
    write_script(dir, "fake-arp", &body)
}

/// Settings whose external tools are the fakes in `tools_dir`; `dd` is real.
#[cfg(unix)]
pub fn test_settings(tools_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.tools.payload_packer = fake_packer(tools_dir).to_string_lossy().into_owned();
    settings.tools.ssh_keygen = fake_keygen(tools_dir).to_string_lossy().into_owned();
    settings.tools.arp = fake_arp(tools_dir, &[]).to_string_lossy().into_owned();
    settings
}
