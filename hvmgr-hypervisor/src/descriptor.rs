//! Domain descriptor model and builder.
//!
//! [`DescriptorBuilder`] turns a validated [`ResourceSpec`] into a
//! [`DomainDescriptor`], a typed description of the domain's hardware. The
//! descriptor is encoded to libvirt domain XML exactly once, by
//! [`DomainDescriptor::to_xml`].

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::types::{DiskFormat, ResourceSpec};
use crate::xml;

/// Boot device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Cdrom,
    Disk,
}

impl BootDevice {
    /// Get the libvirt boot device name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Cdrom => "cdrom",
            BootDevice::Disk => "hd",
        }
    }
}

/// Disk bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Sata,
}

impl DiskBus {
    /// Get the libvirt bus name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Sata => "sata",
        }
    }

    /// Get the device prefix.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Sata => "sd",
        }
    }
}

/// Kind of file-backed block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Disk,
    Cdrom,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Disk => "disk",
            BlockKind::Cdrom => "cdrom",
        }
    }
}

/// A file-backed disk or optical drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockDevice {
    pub kind: BlockKind,
    pub source: PathBuf,
    pub format: DiskFormat,
    pub target: String,
    pub bus: DiskBus,
    pub readonly: bool,
}

/// A NIC attached to a libvirt virtual network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub network: String,
    pub model: &'static str,
}

/// Graphical console settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphicsConfig {
    pub listen: String,
}

/// Input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InputDevice {
    pub kind: &'static str,
    pub bus: &'static str,
}

/// Device controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControllerDevice {
    pub kind: &'static str,
    pub index: u32,
    pub model: Option<&'static str>,
}

/// Fully resolved definition of one domain.
///
/// Constructed only through [`DescriptorBuilder`]; read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainDescriptor {
    name: String,
    memory_mib: u64,
    vcpus: u32,
    boot_order: Vec<BootDevice>,
    disks: Vec<BlockDevice>,
    interfaces: Vec<NetworkInterface>,
    graphics: GraphicsConfig,
    video_model: &'static str,
    inputs: Vec<InputDevice>,
    controllers: Vec<ControllerDevice>,
}

impl DomainDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_mib
    }

    pub fn vcpus(&self) -> u32 {
        self.vcpus
    }

    pub fn boot_order(&self) -> &[BootDevice] {
        &self.boot_order
    }

    /// All block devices, hard disk first.
    pub fn disks(&self) -> &[BlockDevice] {
        &self.disks
    }

    /// Source path of the writable system disk.
    pub fn disk_path(&self) -> Option<&Path> {
        self.disks
            .iter()
            .find(|d| d.kind == BlockKind::Disk)
            .map(|d| d.source.as_path())
    }

    pub fn interfaces(&self) -> &[NetworkInterface] {
        &self.interfaces
    }

    pub fn graphics(&self) -> &GraphicsConfig {
        &self.graphics
    }

    pub fn video_model(&self) -> &'static str {
        self.video_model
    }

    pub fn inputs(&self) -> &[InputDevice] {
        &self.inputs
    }

    pub fn controllers(&self) -> &[ControllerDevice] {
        &self.controllers
    }

    /// Encode as libvirt domain XML.
    pub fn to_xml(&self) -> Result<String> {
        xml::encode(self)
    }
}

/// Default listen address for the VNC console.
pub const DEFAULT_VNC_LISTEN: &str = "0.0.0.0";

/// Builder for [`DomainDescriptor`].
///
/// Every descriptor gets the same fixed topology: host CPU passthrough,
/// ACPI/APIC, optical-then-disk boot, VirtIO disk/NIC/video, a VNC console
/// on an auto-assigned port, and tablet/keyboard/mouse input.
pub struct DescriptorBuilder<'a> {
    spec: &'a ResourceSpec,
    disk_path: &'a Path,
    format: DiskFormat,
    vnc_listen: String,
}

impl<'a> DescriptorBuilder<'a> {
    pub fn new(spec: &'a ResourceSpec, disk_path: &'a Path) -> Self {
        Self {
            spec,
            disk_path,
            format: DiskFormat::Qcow2,
            vnc_listen: DEFAULT_VNC_LISTEN.to_string(),
        }
    }

    /// Set the format of the system disk image.
    pub fn with_format(mut self, format: DiskFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the VNC listen address.
    pub fn with_vnc_listen(mut self, listen: impl Into<String>) -> Self {
        self.vnc_listen = listen.into();
        self
    }

    pub fn build(&self) -> DomainDescriptor {
        DomainDescriptor {
            name: self.spec.name.clone(),
            memory_mib: self.spec.memory_mib,
            vcpus: self.spec.vcpus,
            // Install media boots first so the OS installer runs on first start.
            boot_order: vec![BootDevice::Cdrom, BootDevice::Disk],
            disks: self.build_disks(),
            interfaces: vec![NetworkInterface {
                network: self.spec.network.clone(),
                model: "virtio",
            }],
            graphics: GraphicsConfig {
                listen: self.vnc_listen.clone(),
            },
            video_model: "virtio",
            inputs: vec![
                InputDevice { kind: "tablet", bus: "usb" },
                InputDevice { kind: "keyboard", bus: "ps2" },
                InputDevice { kind: "mouse", bus: "ps2" },
            ],
            controllers: vec![
                ControllerDevice { kind: "sata", index: 0, model: None },
                ControllerDevice { kind: "usb", index: 0, model: Some("ich9-ehci1") },
                ControllerDevice { kind: "pci", index: 0, model: Some("pci-root") },
            ],
        }
    }

    fn build_disks(&self) -> Vec<BlockDevice> {
        let system = BlockDevice {
            kind: BlockKind::Disk,
            source: self.disk_path.to_path_buf(),
            format: self.format,
            target: format!("{}a", DiskBus::Virtio.device_prefix()),
            bus: DiskBus::Virtio,
            readonly: false,
        };

        let media = [&self.spec.install_media, &self.spec.driver_media]
            .into_iter()
            .enumerate()
            .map(|(i, path)| BlockDevice {
                kind: BlockKind::Cdrom,
                source: path.clone(),
                format: DiskFormat::Raw,
                target: format!("{}{}", DiskBus::Sata.device_prefix(), (b'a' + i as u8) as char),
                bus: DiskBus::Sata,
                readonly: true,
            });

        std::iter::once(system).chain(media).collect()
    }
}
