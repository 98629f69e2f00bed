//! Virtualization.framework backend.
//!
//! Compiled for real only on macOS. Elsewhere [`VzHypervisor`] reports the
//! host as unsupported and every platform operation fails with
//! [`VmError::Unsupported`](crate::VmError::Unsupported), so the rest of the
//! crate builds and tests unconditionally.
//!
//! Start/stop completion handlers and state changes are delivered on the main
//! dispatch queue; [`PlatformMachine::pump`] runs the current run loop so a
//! foreground caller on the main thread sees them.

// ---------------------------------------------------------------------------
// macOS implementation
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
mod imp {
    use std::cell::Cell;
    use std::path::Path;
    use std::time::Duration;

    use block2::RcBlock;
    use objc2::AllocAnyThread;
    use objc2::rc::Retained;
    use objc2_foundation::{NSArray, NSDate, NSError, NSRunLoop, NSString, NSURL};
    use objc2_virtualization::{
        VZDiskImageStorageDeviceAttachment, VZEFIBootLoader, VZEFIVariableStore,
        VZEFIVariableStoreInitializationOptions, VZGenericPlatformConfiguration, VZMACAddress,
        VZNATNetworkDeviceAttachment, VZUSBKeyboardConfiguration,
        VZUSBScreenCoordinatePointingDeviceConfiguration, VZVirtioBlockDeviceConfiguration,
        VZVirtioEntropyDeviceConfiguration, VZVirtioGraphicsDeviceConfiguration,
        VZVirtioGraphicsScanoutConfiguration, VZVirtioNetworkDeviceConfiguration,
        VZVirtioSoundDeviceConfiguration, VZVirtualMachine, VZVirtualMachineConfiguration,
    };
    use tracing::debug;

    use crate::error::{Result, VmError};
    use crate::hypervisor::{Completion, Hypervisor, PlatformMachine, PlatformState, Support};
    use crate::vm::machine::{BootLoader, MachineSpec, StorageAttachment};

    #[derive(Debug, Default, Clone, Copy)]
    pub struct VzHypervisor;

    impl VzHypervisor {
        pub fn new() -> Self {
            Self
        }
    }

    pub struct VzMachine {
        vm: Retained<VZVirtualMachine>,
    }

    impl Hypervisor for VzHypervisor {
        type Config = Retained<VZVirtualMachineConfiguration>;
        type Machine = VzMachine;

        fn support(&self) -> Support {
            let supported = unsafe { VZVirtualMachine::isSupported() };
            let message = if supported {
                "Virtualization.framework is available".to_string()
            } else {
                "Virtualization.framework is not supported on this Mac".to_string()
            };
            Support { supported, message }
        }

        fn create_variable_store(&self, path: &Path) -> Result<()> {
            let url = path_to_nsurl(path)?;
            unsafe {
                VZEFIVariableStore::initCreatingVariableStoreAtURL_options_error(
                    VZEFIVariableStore::alloc(),
                    &url,
                    VZEFIVariableStoreInitializationOptions(0),
                )
            }
            .map(|_| ())
            .map_err(|e| VmError::Validation(describe(&e)))
        }

        fn realize(&self, spec: &MachineSpec) -> Result<Self::Config> {
            unsafe {
                let config = VZVirtualMachineConfiguration::new();
                config.setCPUCount(spec.cpu_count);
                config.setMemorySize(spec.memory_bytes);

                let platform = VZGenericPlatformConfiguration::new();
                config.setPlatform(&platform);

                let BootLoader::Efi { variable_store } = &spec.boot;
                let store = VZEFIVariableStore::initWithURL(
                    VZEFIVariableStore::alloc(),
                    &path_to_nsurl(variable_store)?,
                );
                let boot_loader = VZEFIBootLoader::new();
                boot_loader.setVariableStore(Some(&store));
                config.setBootLoader(Some(&boot_loader));

                let storage = spec
                    .storage
                    .iter()
                    .map(|s| storage_device(s).map(Retained::into_super))
                    .collect::<Result<Vec<_>>>()?;
                config.setStorageDevices(&NSArray::from_retained_slice(&storage));

                let mut network = Vec::with_capacity(spec.network.len());
                for nic in &spec.network {
                    let device = VZVirtioNetworkDeviceConfiguration::new();
                    let mac_text = NSString::from_str(&nic.mac.to_string());
                    let mac = VZMACAddress::initWithString(VZMACAddress::alloc(), &mac_text)
                        .ok_or_else(|| VmError::Validation(format!("invalid MAC address {}", nic.mac)))?;
                    device.setMACAddress(&mac);
                    let nat = VZNATNetworkDeviceAttachment::new();
                    device.setAttachment(Some(&nat));
                    network.push(Retained::into_super(device));
                }
                config.setNetworkDevices(&NSArray::from_retained_slice(&network));

                let entropy: Vec<_> = spec
                    .entropy
                    .iter()
                    .map(|_| Retained::into_super(VZVirtioEntropyDeviceConfiguration::new()))
                    .collect();
                config.setEntropyDevices(&NSArray::from_retained_slice(&entropy));

                let keyboards: Vec<_> = spec
                    .keyboards
                    .iter()
                    .map(|_| Retained::into_super(VZUSBKeyboardConfiguration::new()))
                    .collect();
                config.setKeyboards(&NSArray::from_retained_slice(&keyboards));

                let pointing: Vec<_> = spec
                    .pointing
                    .iter()
                    .map(|_| Retained::into_super(VZUSBScreenCoordinatePointingDeviceConfiguration::new()))
                    .collect();
                config.setPointingDevices(&NSArray::from_retained_slice(&pointing));

                let mut graphics = Vec::with_capacity(spec.graphics.len());
                for adapter in &spec.graphics {
                    let device = VZVirtioGraphicsDeviceConfiguration::new();
                    let scanouts: Vec<_> = adapter
                        .scanouts
                        .iter()
                        .map(|s| {
                            VZVirtioGraphicsScanoutConfiguration::initWithWidthInPixels_heightInPixels(
                                VZVirtioGraphicsScanoutConfiguration::alloc(),
                                s.width as isize,
                                s.height as isize,
                            )
                        })
                        .collect();
                    device.setScanouts(&NSArray::from_retained_slice(&scanouts));
                    graphics.push(Retained::into_super(device));
                }
                config.setGraphicsDevices(&NSArray::from_retained_slice(&graphics));

                let audio: Vec<_> = spec
                    .audio
                    .iter()
                    .map(|_| Retained::into_super(VZVirtioSoundDeviceConfiguration::new()))
                    .collect();
                config.setAudioDevices(&NSArray::from_retained_slice(&audio));

                config.validateWithError().map_err(|e| VmError::Validation(describe(&e)))?;
                debug!(cpus = spec.cpu_count, memory_bytes = spec.memory_bytes, disks = spec.storage.len(), "configuration validated");
                Ok(config)
            }
        }

        fn instantiate(&self, config: &Self::Config) -> Result<Self::Machine> {
            let vm = unsafe { VZVirtualMachine::initWithConfiguration(VZVirtualMachine::alloc(), config) };
            Ok(VzMachine { vm })
        }
    }

    impl PlatformMachine for VzMachine {
        fn state(&self) -> PlatformState {
            PlatformState(unsafe { self.vm.state() }.0 as i64)
        }

        fn request_start(&self, done: Completion) -> std::result::Result<(), String> {
            if !unsafe { self.vm.canStart() } {
                return Err(format!("VM cannot start while {}", crate::vm::RunState::from(self.state())));
            }
            let block = completion_block(done);
            unsafe { self.vm.startWithCompletionHandler(&block) };
            Ok(())
        }

        fn request_stop(&self, done: Completion) -> std::result::Result<(), String> {
            if !unsafe { self.vm.canStop() } {
                return Err(format!("VM cannot stop while {}", crate::vm::RunState::from(self.state())));
            }
            let block = completion_block(done);
            unsafe { self.vm.stopWithCompletionHandler(&block) };
            Ok(())
        }

        fn pump(&self, timeout: Duration) {
            let until = NSDate::dateWithTimeIntervalSinceNow(timeout.as_secs_f64());
            unsafe { NSRunLoop::currentRunLoop().runUntilDate(&until) };
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn storage_device(attachment: &StorageAttachment) -> Result<Retained<VZVirtioBlockDeviceConfiguration>> {
        let url = path_to_nsurl(&attachment.path)?;
        unsafe {
            let disk = VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
                VZDiskImageStorageDeviceAttachment::alloc(),
                &url,
                attachment.read_only,
            )
            .map_err(|e| VmError::Validation(describe(&e)))?;
            Ok(VZVirtioBlockDeviceConfiguration::initWithAttachment(
                VZVirtioBlockDeviceConfiguration::alloc(),
                &disk,
            ))
        }
    }

    /// Wrap a one-shot completion for a `void (^)(NSError *)` handler.
    fn completion_block(done: Completion) -> RcBlock<dyn Fn(*mut NSError)> {
        let slot = Cell::new(Some(done));
        RcBlock::new(move |error: *mut NSError| {
            let Some(done) = slot.take() else { return };
            let result = if error.is_null() {
                Ok(())
            } else {
                Err(describe(unsafe { &*error }))
            };
            done(result);
        })
    }

    fn describe(error: &NSError) -> String {
        error.localizedDescription().to_string()
    }

    fn path_to_nsurl(path: &Path) -> Result<Retained<NSURL>> {
        let path_str = path.to_str().ok_or_else(|| VmError::InvalidDescriptor {
            reason: format!("path contains invalid UTF-8: {}", path.display()),
        })?;
        Ok(NSURL::fileURLWithPath(&NSString::from_str(path_str)))
    }
}

// ---------------------------------------------------------------------------
// Non-macOS stub: keeps the crate compilable on CI / Linux dev machines
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "macos"))]
mod imp {
    use std::path::Path;
    use std::time::Duration;

    use crate::error::{Result, VmError};
    use crate::hypervisor::{Completion, Hypervisor, PlatformMachine, PlatformState, Support};
    use crate::vm::machine::MachineSpec;

    const UNSUPPORTED: &str = "VMs require macOS Virtualization.framework";

    #[derive(Debug, Default, Clone, Copy)]
    pub struct VzHypervisor;

    impl VzHypervisor {
        pub fn new() -> Self {
            Self
        }
    }

    /// Uninhabited: no machine can be instantiated off macOS.
    pub enum VzMachine {}

    fn unsupported<T>() -> Result<T> {
        Err(VmError::Unsupported { reason: UNSUPPORTED.to_string() })
    }

    impl Hypervisor for VzHypervisor {
        type Config = ();
        type Machine = VzMachine;

        fn support(&self) -> Support {
            Support { supported: false, message: UNSUPPORTED.to_string() }
        }

        fn create_variable_store(&self, _path: &Path) -> Result<()> {
            unsupported()
        }

        fn realize(&self, _spec: &MachineSpec) -> Result<Self::Config> {
            unsupported()
        }

        fn instantiate(&self, _config: &Self::Config) -> Result<Self::Machine> {
            unsupported()
        }
    }

    impl PlatformMachine for VzMachine {
        fn state(&self) -> PlatformState {
            match *self {}
        }

        fn request_start(&self, _done: Completion) -> std::result::Result<(), String> {
            match *self {}
        }

        fn request_stop(&self, _done: Completion) -> std::result::Result<(), String> {
            match *self {}
        }

        fn pump(&self, _timeout: Duration) {
            match *self {}
        }
    }

}

pub use imp::{VzHypervisor, VzMachine};
