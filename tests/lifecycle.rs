//! Orchestration scenarios against the in-process fake platform.
//!
//! Every test gets its own temporary VM root. The raw-image writer is the
//! host's real `dd` (images are sparse); the packer, key generator and
//! neighbor-table tool are shell-script fakes from `common`.

#![cfg(unix)]

mod common;

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use common::{FakeHypervisor, PAYLOAD_REJECTION, capture_logs, keygen_calls, test_settings};
use tempfile::TempDir;
use vmsmith::config::Settings;
use vmsmith::hypervisor::PlatformState;
use vmsmith::vm::disk::GIB;
use vmsmith::vm::firmware::VARIABLE_STORE_FILE;
use vmsmith::vm::machine::StorageRole;
use vmsmith::vm::metadata::METADATA_FILE;
use vmsmith::vm::{RunState, Transition, VmDescriptor, VmHandle, cloud_init};
use vmsmith::VmError;

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    tools: PathBuf,
    settings: Settings,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().join("VMs");
        let tools = tmp.path().join("bin");
        std::fs::create_dir_all(&tools).expect("mkdir tools");
        let settings = test_settings(&tools);
        Self { _tmp: tmp, root, tools, settings }
    }

    fn handle(&self, hv: &FakeHypervisor) -> VmHandle<FakeHypervisor> {
        VmHandle::with_root(hv.clone(), self.settings.clone(), self.root.clone())
    }

    fn descriptor(&self, name: &str, cpus: u32, memory_gb: u64, disk_gb: u64) -> VmDescriptor {
        let mut d = VmDescriptor::with_defaults(name, &self.settings.defaults);
        d.cpus = cpus;
        d.memory_gb = memory_gb;
        d.disk_gb = disk_gb;
        d
    }
}

#[test]
fn end_to_end_create_start_stop_delete() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut vm = fx.handle(&hv);
    assert_eq!(vm.state(), RunState::NotConfigured);

    let info = vm.build(&fx.descriptor("test1", 2, 4, 20)).expect("build");
    assert_eq!(info.state, RunState::Created);
    assert_eq!(vm.state(), RunState::Created);

    let workdir = fx.root.join("test1");
    assert_eq!(info.vm_dir, workdir);
    assert_eq!(std::fs::metadata(&info.disk_path).expect("disk").len(), 20 * GIB);
    assert!(workdir.join(VARIABLE_STORE_FILE).is_file());
    assert!(workdir.join(METADATA_FILE).is_file());

    let Transition::Accepted(started) = vm.start() else {
        panic!("start should be accepted");
    };
    assert!(matches!(vm.state(), RunState::Starting | RunState::Running));
    vm.pump(std::time::Duration::ZERO);
    assert_eq!(vm.state(), RunState::Running);
    assert_eq!(started.try_recv(), Ok(Ok(())));

    assert!(vm.stop().is_accepted());
    assert!(matches!(vm.state(), RunState::Stopping | RunState::Stopped));
    vm.pump(std::time::Duration::ZERO);
    assert_eq!(vm.state(), RunState::Stopped);

    vm.delete("test1").expect("delete");
    assert!(!workdir.exists());
    assert!(vm.list().expect("list").iter().all(|item| item.name != "test1"));
    assert_eq!(vm.state(), RunState::NotConfigured);
}

#[test]
fn device_graph_matches_descriptor() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let iso = fx.tools.join("ubuntu.iso");
    std::fs::write(&iso, b"iso").expect("write iso");

    let mut d = fx.descriptor("web", 4, 8, 1);
    d.iso_path = Some(iso.clone());
    let info = fx.handle(&hv).build(&d).expect("build");

    let spec = hv.last_spec().expect("realized");
    assert_eq!(spec.cpu_count, 4);
    assert_eq!(spec.memory_bytes, 8 * GIB);
    assert_eq!(spec.storage[0].role, StorageRole::PrimaryDisk);
    assert!(!spec.storage[0].read_only);
    assert_eq!(spec.storage[1].path, iso);
    assert!(spec.storage[1].read_only);
    assert_eq!(spec.network[0].mac.to_string(), info.mac_address);
    assert_eq!(info.install_image, Some(iso));
}

#[test]
fn rebuild_reuses_disk_store_and_identity() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let first = fx.handle(&hv).build(&fx.descriptor("db", 2, 4, 1)).expect("first build");

    // Simulate guest writes between runs.
    let mut disk = std::fs::OpenOptions::new().write(true).open(&first.disk_path).expect("open disk");
    disk.seek(SeekFrom::Start(4096)).expect("seek");
    disk.write_all(b"guest filesystem").expect("write");
    drop(disk);
    let store = std::fs::read(first.vm_dir.join(VARIABLE_STORE_FILE)).expect("read store");

    // A second process rebuilds from the same working directory.
    let second = fx.handle(&hv).build(&fx.descriptor("db", 2, 4, 1)).expect("second build");

    assert_eq!(second.mac_address, first.mac_address);
    assert_eq!(hv.state.borrow().stores_created, 1);
    assert_eq!(std::fs::read(second.vm_dir.join(VARIABLE_STORE_FILE)).expect("read"), store);

    let mut disk = std::fs::File::open(&second.disk_path).expect("open disk");
    assert_eq!(disk.metadata().expect("stat").len(), GIB);
    let mut buf = [0u8; 16];
    disk.seek(SeekFrom::Start(4096)).expect("seek");
    disk.read_exact(&mut buf).expect("read");
    assert_eq!(&buf, b"guest filesystem");
}

#[test]
fn resizing_an_existing_vm_is_rejected() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    fx.handle(&hv).build(&fx.descriptor("db", 2, 4, 1)).expect("build");

    let err = fx.handle(&hv).build(&fx.descriptor("db", 4, 4, 1)).unwrap_err();
    assert!(matches!(err, VmError::InvalidDescriptor { .. }), "got {err:?}");
}

#[test]
fn load_rebuilds_with_stored_sizing() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    fx.handle(&hv).build(&fx.descriptor("db", 3, 6, 1)).expect("build");

    let info = fx.handle(&hv).load("db").expect("load");
    assert_eq!((info.cpus, info.memory_gb, info.disk_gb), (3, 6, 1));

    let err = fx.handle(&hv).load("ghost").unwrap_err();
    assert!(matches!(err, VmError::NotFound { .. }), "got {err:?}");
}

#[test]
fn platform_rejection_is_passed_through_verbatim() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    hv.state.borrow_mut().reject_all = Some("The memory size must be a multiple of a megabyte.".into());
    let mut vm = fx.handle(&hv);

    let err = vm.build(&fx.descriptor("bad", 2, 4, 1)).unwrap_err();

    assert_eq!(err.to_string(), "The memory size must be a multiple of a megabyte.");
    assert_eq!(vm.state(), RunState::NotConfigured);
}

#[test]
fn fatal_build_failure_is_logged_as_an_error() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    hv.state.borrow_mut().reject_all = Some("The number of CPUs is too large.".into());
    let mut vm = fx.handle(&hv);

    let (result, logs) = capture_logs(|| vm.build(&fx.descriptor("bad", 2, 4, 1)));

    assert!(result.is_err());
    let errors = logs.messages_at(tracing::Level::ERROR);
    assert!(errors.iter().any(|m| m.contains("The number of CPUs is too large.")), "got {errors:?}");
}

#[test]
fn raised_limits_reject_unaddressable_sizes_without_panicking() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut settings = fx.settings.clone();
    settings.limits.max_disk_gb = u64::MAX;
    settings.limits.max_memory_gb = u64::MAX;
    let mut vm = VmHandle::with_root(hv.clone(), settings, fx.root.clone());

    let err = vm.build(&fx.descriptor("huge", 2, 4, 1 << 40)).unwrap_err();

    assert!(matches!(err, VmError::InvalidDescriptor { .. }), "got {err:?}");
    assert!(hv.state.borrow().realized.is_empty());
}

#[test]
fn leftover_image_of_another_size_is_not_adopted() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    hv.state.borrow_mut().reject_all = Some("The storage device attachment is invalid.".into());
    let mut vm = fx.handle(&hv);
    vm.build(&fx.descriptor("half", 2, 4, 1)).unwrap_err();
    assert!(!fx.root.join("half").join(METADATA_FILE).exists());

    hv.state.borrow_mut().reject_all = None;
    let err = vm.build(&fx.descriptor("half", 2, 4, 2)).unwrap_err();
    assert!(matches!(err, VmError::InvalidDescriptor { .. }), "got {err:?}");
    assert!(!fx.root.join("half").join(METADATA_FILE).exists());

    let info = vm.build(&fx.descriptor("half", 2, 4, 1)).expect("same size adopts the image");
    assert_eq!(std::fs::metadata(&info.disk_path).expect("stat").len(), GIB);
}

#[test]
fn variable_store_failure_aborts_build() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    hv.state.borrow_mut().fail_store = true;

    let err = fx.handle(&hv).build(&fx.descriptor("nofw", 2, 4, 1)).unwrap_err();

    assert!(matches!(err, VmError::Provisioning { resource: "firmware store", .. }), "got {err:?}");
    assert!(hv.state.borrow().realized.is_empty());
}

// ---------------------------------------------------------------------------
// First-boot payload
// ---------------------------------------------------------------------------

#[test]
fn auto_install_attaches_payload_last_with_generated_key() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut d = fx.descriptor("seeded", 2, 4, 1);
    d.auto_install = true;

    let info = fx.handle(&hv).build(&d).expect("build");

    let image = info.payload_image.expect("payload attached");
    assert_eq!(image, info.vm_dir.join(cloud_init::PAYLOAD_IMAGE));
    let spec = hv.last_spec().expect("realized");
    assert_eq!(spec.storage.last().map(|s| s.role), Some(StorageRole::FirstBootPayload));
    assert!(spec.storage.last().is_some_and(|s| s.read_only));

    let key = cloud_init::key_path(&info.vm_dir);
    assert!(key.is_file());
    let public = std::fs::read_to_string(key.with_extension("pub")).expect("public key");
    let user_data = std::fs::read_to_string(info.vm_dir.join(cloud_init::STAGING_DIR).join("user-data"))
        .expect("user-data");
    assert!(user_data.contains(public.trim()));
    assert_eq!(keygen_calls(&fx.tools), 1);

    fx.handle(&hv).build(&d).expect("rebuild");
    assert_eq!(keygen_calls(&fx.tools), 1, "key pair must be reused");
}

#[test]
fn supplied_key_skips_generation() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut d = fx.descriptor("keyed", 2, 4, 1);
    d.auto_install = true;
    d.ssh_public_key = Some("ssh-ed25519 AAAAC3Nza supplied@host".into());

    let info = fx.handle(&hv).build(&d).expect("build");

    assert!(info.payload_image.is_some());
    assert_eq!(keygen_calls(&fx.tools), 0);
    assert!(!cloud_init::key_path(&info.vm_dir).exists());
}

#[test]
fn payload_build_failure_still_reaches_created() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut settings = fx.settings.clone();
    settings.tools.payload_packer = "vmsmith-missing-packer".into();
    let mut vm = VmHandle::with_root(hv.clone(), settings, fx.root.clone());
    let mut d = fx.descriptor("manual", 2, 4, 1);
    d.auto_install = true;

    let info = vm.build(&d).expect("build");

    assert_eq!(vm.state(), RunState::Created);
    assert_eq!(info.payload_image, None);
    let spec = hv.last_spec().expect("realized");
    assert_eq!(spec.storage.len(), 1);
    assert_eq!(spec.storage[0].role, StorageRole::PrimaryDisk);
}

#[test]
fn payload_rejected_by_platform_is_detached() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    hv.state.borrow_mut().reject_payload = true;
    let mut d = fx.descriptor("strict", 2, 4, 1);
    d.auto_install = true;

    let info = fx.handle(&hv).build(&d).expect("build");

    assert_eq!(info.payload_image, None);
    let state = hv.state.borrow();
    assert_eq!(state.realized.len(), 2);
    assert!(state.realized[0].payload().is_some());
    assert!(state.realized[1].payload().is_none());
}

#[test]
fn rejection_without_payload_is_not_retried() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    hv.state.borrow_mut().reject_payload = true;
    hv.state.borrow_mut().reject_all = Some(PAYLOAD_REJECTION.into());

    let err = fx.handle(&hv).build(&fx.descriptor("plain", 2, 4, 1)).unwrap_err();

    assert_eq!(err.to_string(), PAYLOAD_REJECTION);
    assert_eq!(hv.state.borrow().realized.len(), 1);
}

// ---------------------------------------------------------------------------
// Lifecycle refusals and platform states
// ---------------------------------------------------------------------------

#[test]
fn start_and_stop_without_configuration_are_refused() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut vm = fx.handle(&hv);

    match vm.start() {
        Transition::Refused(reason) => assert_eq!(reason, "No VM configured"),
        Transition::Accepted(_) => panic!("start without a configuration must be refused"),
    }
    assert!(!vm.stop().is_accepted());
    assert_eq!(vm.state(), RunState::NotConfigured);
}

#[test]
fn platform_decline_keeps_created_state() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut vm = fx.handle(&hv);
    vm.build(&fx.descriptor("idle", 2, 4, 1)).expect("build");

    // Stopping a VM that never ran is declined by the platform.
    assert!(!vm.stop().is_accepted());
    assert_eq!(vm.state(), RunState::Created);
}

#[test]
fn delete_is_refused_while_running_or_starting() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut vm = fx.handle(&hv);
    let info = vm.build(&fx.descriptor("busy", 2, 4, 1)).expect("build");

    assert!(vm.start().is_accepted());
    assert_eq!(vm.state(), RunState::Starting);
    let err = vm.delete("busy").unwrap_err();
    assert!(matches!(err, VmError::Refused { state: RunState::Starting, .. }), "got {err:?}");

    vm.pump(std::time::Duration::ZERO);
    let err = vm.delete("busy").unwrap_err();
    assert!(matches!(err, VmError::Refused { state: RunState::Running, .. }), "got {err:?}");
    assert!(info.vm_dir.is_dir());
    assert!(info.disk_path.is_file());
}

#[test]
fn rebuild_keeps_a_running_machine() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut vm = fx.handle(&hv);
    let d = fx.descriptor("live", 2, 4, 1);
    vm.build(&d).expect("build");
    assert!(vm.start().is_accepted());
    vm.pump(std::time::Duration::ZERO);

    let again = vm.build(&d).expect("rebuild");

    assert_eq!(again.state, RunState::Running);
    assert_eq!(vm.state(), RunState::Running);
    assert_eq!(hv.state.borrow().realized.len(), 1);
    let err = vm.delete("live").unwrap_err();
    assert!(matches!(err, VmError::Refused { state: RunState::Running, .. }), "got {err:?}");
    assert!(again.vm_dir.is_dir());

    let err = vm.build(&fx.descriptor("other", 2, 4, 1)).unwrap_err();
    assert!(matches!(err, VmError::Busy { state: RunState::Running, .. }), "got {err:?}");
    assert_eq!(vm.state(), RunState::Running);
}

#[test]
fn rebuild_after_stop_replaces_the_machine() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut vm = fx.handle(&hv);
    let d = fx.descriptor("cycle", 2, 4, 1);
    vm.build(&d).expect("build");
    assert!(vm.start().is_accepted());
    vm.pump(std::time::Duration::ZERO);
    assert!(vm.stop().is_accepted());
    vm.pump(std::time::Duration::ZERO);
    assert_eq!(vm.state(), RunState::Stopped);

    let again = vm.build(&d).expect("rebuild");

    assert_eq!(again.state, RunState::Created);
    assert_eq!(hv.state.borrow().realized.len(), 2);
}

#[test]
fn delete_from_a_fresh_handle_removes_everything() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let info = fx.handle(&hv).build(&fx.descriptor("old", 2, 4, 1)).expect("build");

    let mut other = fx.handle(&hv);
    other.delete("old").expect("delete");

    assert!(!info.vm_dir.exists());
    assert!(other.list().expect("list").is_empty());
}

#[test]
fn platform_error_and_unknown_states_are_informational() {
    let fx = Fixture::new();
    let hv = FakeHypervisor::new();
    let mut vm = fx.handle(&hv);
    vm.build(&fx.descriptor("flaky", 2, 4, 1)).expect("build");
    assert!(vm.start().is_accepted());

    hv.set_machine_state(PlatformState::ERROR);
    assert_eq!(vm.state(), RunState::Error);

    hv.set_machine_state(PlatformState(42));
    assert_eq!(vm.state(), RunState::Unknown);
}
