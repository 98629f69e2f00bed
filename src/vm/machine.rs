//! Device graph for one VM.
//!
//! [`MachineSpec`] is the platform-neutral description the hypervisor
//! realizes. It is assembled here from the descriptor and the resources the
//! provisioners produced; validation is left to the platform, which owns the
//! structural rules (device limits, memory bounds, exclusive settings).

use std::path::{Path, PathBuf};

use crate::config::DisplaySettings;
use crate::vm::VmDescriptor;
use crate::vm::disk::GIB;
use crate::vm::network::MacAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSpec {
    pub cpu_count: usize,
    pub memory_bytes: u64,
    pub platform: Platform,
    pub boot: BootLoader,
    /// Primary disk first, then install media, then the first-boot payload.
    pub storage: Vec<StorageAttachment>,
    pub network: Vec<NetworkDevice>,
    pub entropy: Vec<EntropyDevice>,
    pub keyboards: Vec<Keyboard>,
    pub pointing: Vec<PointingDevice>,
    pub graphics: Vec<GraphicsDevice>,
    pub audio: Vec<AudioDevice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootLoader {
    Efi { variable_store: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRole {
    PrimaryDisk,
    InstallMedia,
    FirstBootPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAttachment {
    pub role: StorageRole,
    pub path: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkAttachment {
    /// Outbound NAT through the host.
    Nat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    pub mac: MacAddress,
    pub attachment: NetworkAttachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyDevice {
    Virtio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyboard {
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointingDevice {
    UsbScreenCoordinate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsDevice {
    pub scanouts: Vec<Scanout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scanout {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDevice {
    VirtioSound,
}

/// Resources a [`MachineSpec`] is assembled from.
#[derive(Debug, Clone)]
pub struct MachineInputs<'a> {
    pub descriptor: &'a VmDescriptor,
    pub disk: &'a Path,
    pub variable_store: &'a Path,
    pub payload: Option<&'a Path>,
    pub mac: MacAddress,
    pub display: &'a DisplaySettings,
}

impl MachineSpec {
    pub fn assemble(inputs: &MachineInputs<'_>) -> Self {
        let d = inputs.descriptor;

        let mut storage = vec![StorageAttachment {
            role: StorageRole::PrimaryDisk,
            path: inputs.disk.to_path_buf(),
            read_only: false,
        }];
        if let Some(iso) = &d.iso_path {
            storage.push(StorageAttachment {
                role: StorageRole::InstallMedia,
                path: iso.clone(),
                read_only: true,
            });
        }
        if let Some(payload) = inputs.payload {
            storage.push(StorageAttachment {
                role: StorageRole::FirstBootPayload,
                path: payload.to_path_buf(),
                read_only: true,
            });
        }

        Self {
            cpu_count: d.cpus as usize,
            // Bounded by VmDescriptor::validate.
            memory_bytes: d.memory_gb.saturating_mul(GIB),
            platform: Platform::Generic,
            boot: BootLoader::Efi { variable_store: inputs.variable_store.to_path_buf() },
            storage,
            network: vec![NetworkDevice { mac: inputs.mac, attachment: NetworkAttachment::Nat }],
            entropy: vec![EntropyDevice::Virtio],
            keyboards: vec![Keyboard::Usb],
            pointing: vec![PointingDevice::UsbScreenCoordinate],
            graphics: vec![GraphicsDevice {
                scanouts: vec![Scanout {
                    width: inputs.display.width,
                    height: inputs.display.height,
                }],
            }],
            audio: vec![AudioDevice::VirtioSound],
        }
    }

    /// The same machine with the first-boot payload detached.
    pub fn without_payload(&self) -> Self {
        let mut spec = self.clone();
        spec.storage.retain(|s| s.role != StorageRole::FirstBootPayload);
        spec
    }

    pub fn payload(&self) -> Option<&StorageAttachment> {
        self.storage.iter().find(|s| s.role == StorageRole::FirstBootPayload)
    }
}
