//! Libvirt domain XML encoding and introspection.
//!
//! The wire structs below mirror libvirt's domain schema one element per
//! struct. Attributes are `@`-prefixed fields, text content is `$text`.

use std::borrow::Cow;
use std::path::PathBuf;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use crate::descriptor::DomainDescriptor;
use crate::error::{HypervisorError, Result};

// =============================================================================
// ENCODING
// =============================================================================

#[derive(Serialize)]
#[serde(rename = "domain")]
struct DomainXml<'a> {
    #[serde(rename = "@type")]
    kind: &'static str,
    name: &'a str,
    memory: Memory,
    vcpu: u32,
    os: Os,
    features: Features,
    cpu: Cpu,
    clock: Clock,
    devices: Devices<'a>,
}

#[derive(Serialize)]
struct Memory {
    #[serde(rename = "@unit")]
    unit: &'static str,
    #[serde(rename = "$text")]
    value: u64,
}

#[derive(Serialize)]
struct Os {
    #[serde(rename = "type")]
    os_type: OsType,
    boot: Vec<Boot>,
}

#[derive(Serialize)]
struct OsType {
    #[serde(rename = "@arch")]
    arch: &'static str,
    #[serde(rename = "$text")]
    value: &'static str,
}

#[derive(Serialize)]
struct Boot {
    #[serde(rename = "@dev")]
    dev: &'static str,
}

#[derive(Serialize)]
struct Empty {}

#[derive(Serialize)]
struct Features {
    acpi: Empty,
    apic: Empty,
    vmport: State,
}

#[derive(Serialize)]
struct State {
    #[serde(rename = "@state")]
    state: &'static str,
}

#[derive(Serialize)]
struct Cpu {
    #[serde(rename = "@mode")]
    mode: &'static str,
}

#[derive(Serialize)]
struct Clock {
    #[serde(rename = "@offset")]
    offset: &'static str,
}

#[derive(Serialize)]
struct Devices<'a> {
    disk: Vec<Disk<'a>>,
    controller: Vec<Controller>,
    interface: Vec<Interface<'a>>,
    graphics: Graphics<'a>,
    video: Video,
    input: Vec<Input>,
}

#[derive(Serialize)]
struct Disk<'a> {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@device")]
    device: &'static str,
    driver: Driver,
    source: FileSource<'a>,
    target: Target<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    readonly: Option<Empty>,
}

#[derive(Serialize)]
struct Driver {
    #[serde(rename = "@name")]
    name: &'static str,
    #[serde(rename = "@type")]
    format: &'static str,
}

#[derive(Serialize)]
struct FileSource<'a> {
    #[serde(rename = "@file")]
    file: Cow<'a, str>,
}

#[derive(Serialize)]
struct Target<'a> {
    #[serde(rename = "@dev")]
    dev: &'a str,
    #[serde(rename = "@bus")]
    bus: &'static str,
}

#[derive(Serialize)]
struct Controller {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@index")]
    index: u32,
    #[serde(rename = "@model", skip_serializing_if = "Option::is_none")]
    model: Option<&'static str>,
}

#[derive(Serialize)]
struct Interface<'a> {
    #[serde(rename = "@type")]
    kind: &'static str,
    source: NetworkSource<'a>,
    model: Model,
}

#[derive(Serialize)]
struct NetworkSource<'a> {
    #[serde(rename = "@network")]
    network: &'a str,
}

#[derive(Serialize)]
struct Model {
    #[serde(rename = "@type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct Graphics<'a> {
    #[serde(rename = "@type")]
    kind: &'static str,
    /// -1 asks libvirt to pick a free port.
    #[serde(rename = "@port")]
    port: i32,
    #[serde(rename = "@autoport")]
    autoport: &'static str,
    #[serde(rename = "@listen")]
    listen: &'a str,
}

#[derive(Serialize)]
struct Video {
    model: Model,
}

#[derive(Serialize)]
struct Input {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@bus")]
    bus: &'static str,
}

/// Encode a descriptor as libvirt domain XML.
pub(crate) fn encode(descriptor: &DomainDescriptor) -> Result<String> {
    let disks = descriptor
        .disks()
        .iter()
        .map(|disk| Disk {
            kind: "file",
            device: disk.kind.as_str(),
            driver: Driver {
                name: "qemu",
                format: disk.format.as_str(),
            },
            source: FileSource {
                file: disk.source.to_string_lossy(),
            },
            target: Target {
                dev: &disk.target,
                bus: disk.bus.as_str(),
            },
            readonly: disk.readonly.then_some(Empty {}),
        })
        .collect();

    let memory_kib = descriptor.memory_mib().checked_mul(1024).ok_or_else(|| {
        HypervisorError::Xml(format!("memory of {} MiB does not fit in KiB", descriptor.memory_mib()))
    })?;

    let domain = DomainXml {
        kind: "kvm",
        name: descriptor.name(),
        memory: Memory {
            unit: "KiB",
            value: memory_kib,
        },
        vcpu: descriptor.vcpus(),
        os: Os {
            os_type: OsType {
                arch: "x86_64",
                value: "hvm",
            },
            boot: descriptor
                .boot_order()
                .iter()
                .map(|dev| Boot { dev: dev.as_str() })
                .collect(),
        },
        features: Features {
            acpi: Empty {},
            apic: Empty {},
            vmport: State { state: "off" },
        },
        cpu: Cpu {
            mode: "host-passthrough",
        },
        clock: Clock {
            offset: "localtime",
        },
        devices: Devices {
            disk: disks,
            controller: descriptor
                .controllers()
                .iter()
                .map(|c| Controller {
                    kind: c.kind,
                    index: c.index,
                    model: c.model,
                })
                .collect(),
            interface: descriptor
                .interfaces()
                .iter()
                .map(|nic| Interface {
                    kind: "network",
                    source: NetworkSource {
                        network: &nic.network,
                    },
                    model: Model { kind: nic.model },
                })
                .collect(),
            graphics: Graphics {
                kind: "vnc",
                port: -1,
                autoport: "yes",
                listen: &descriptor.graphics().listen,
            },
            video: Video {
                model: Model {
                    kind: descriptor.video_model(),
                },
            },
            input: descriptor
                .inputs()
                .iter()
                .map(|i| Input {
                    kind: i.kind,
                    bus: i.bus,
                })
                .collect(),
        },
    };

    quick_xml::se::to_string(&domain).map_err(|e| HypervisorError::Xml(e.to_string()))
}

// =============================================================================
// INTROSPECTION
// =============================================================================

/// VNC console settings read back from a domain descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VncInfo {
    /// Assigned port, `None` while libvirt has not picked one yet.
    pub port: Option<u16>,
    pub autoport: bool,
    pub listen: Option<String>,
}

/// Facts extracted from a domain XML document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub arch: Option<String>,
    pub memory_kib: Option<u64>,
    pub vcpus: Option<u32>,
    pub boot_devices: Vec<String>,
    /// Sources of `device='disk'` entries.
    pub disk_paths: Vec<PathBuf>,
    /// Sources of `device='cdrom'` entries.
    pub media_paths: Vec<PathBuf>,
    pub networks: Vec<String>,
    pub vnc: Option<VncInfo>,
}

impl DescriptorInfo {
    /// Parse a domain XML document as produced by libvirt's `XMLDesc`.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut info = DescriptorInfo::default();
        let mut path: Vec<String> = Vec::new();
        let mut disk_device: Option<String> = None;
        let mut memory_unit: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = element_name(&e);
                    match name.as_str() {
                        "disk" => disk_device = attr(&e, "device")?,
                        "memory" if path.len() == 1 => memory_unit = attr(&e, "unit")?,
                        _ => {}
                    }
                    info.visit(&name, &e, &path, disk_device.as_deref())?;
                    path.push(name);
                }
                Ok(Event::Empty(e)) => {
                    let name = element_name(&e);
                    info.visit(&name, &e, &path, disk_device.as_deref())?;
                }
                Ok(Event::Text(t)) => {
                    let text = t.unescape().map_err(|e| HypervisorError::Xml(e.to_string()))?;
                    info.visit_text(&path, text.trim(), memory_unit.as_deref())?;
                }
                Ok(Event::End(_)) => {
                    if path.pop().as_deref() == Some("disk") {
                        disk_device = None;
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(HypervisorError::Xml(format!(
                        "at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        Ok(info)
    }

    fn visit(&mut self, name: &str, e: &BytesStart<'_>, path: &[String], disk_device: Option<&str>) -> Result<()> {
        let parent = path.last().map(String::as_str);

        match (parent, name) {
            (Some("os"), "type") => self.arch = attr(e, "arch")?,
            (Some("os"), "boot") => {
                if let Some(dev) = attr(e, "dev")? {
                    self.boot_devices.push(dev);
                }
            }
            (Some("disk"), "source") => {
                if let Some(file) = attr(e, "file")? {
                    match disk_device {
                        Some("cdrom") => self.media_paths.push(PathBuf::from(file)),
                        Some("disk") | None => self.disk_paths.push(PathBuf::from(file)),
                        Some(_) => {}
                    }
                }
            }
            (Some("interface"), "source") => {
                if let Some(network) = attr(e, "network")? {
                    self.networks.push(network);
                }
            }
            (Some("devices"), "graphics") => {
                if attr(e, "type")?.as_deref() == Some("vnc") && self.vnc.is_none() {
                    let port = attr(e, "port")?
                        .and_then(|p| p.parse::<i32>().ok())
                        .filter(|p| *p > 0)
                        .and_then(|p| u16::try_from(p).ok());
                    self.vnc = Some(VncInfo {
                        port,
                        autoport: attr(e, "autoport")?.as_deref() == Some("yes"),
                        listen: attr(e, "listen")?,
                    });
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn visit_text(&mut self, path: &[String], text: &str, memory_unit: Option<&str>) -> Result<()> {
        let depth = path.len();
        if depth != 2 || path[0] != "domain" {
            return Ok(());
        }

        match path[1].as_str() {
            "name" => self.name = Some(text.to_string()),
            "uuid" => self.uuid = Some(text.to_string()),
            "vcpu" => self.vcpus = text.parse().ok(),
            "memory" => {
                let value: u64 = text
                    .parse()
                    .map_err(|_| HypervisorError::Xml(format!("invalid memory value '{}'", text)))?;
                self.memory_kib = Some(to_kib(value, memory_unit)?);
            }
            _ => {}
        }

        Ok(())
    }
}

fn to_kib(value: u64, unit: Option<&str>) -> Result<u64> {
    let factor: u64 = match unit.unwrap_or("KiB") {
        "b" | "bytes" => return Ok(value / 1024),
        "k" | "KiB" => 1,
        "M" | "MiB" => 1024,
        "G" | "GiB" => 1024 * 1024,
        other => return Err(HypervisorError::Xml(format!("unsupported memory unit '{}'", other))),
    };

    value
        .checked_mul(factor)
        .ok_or_else(|| HypervisorError::Xml(format!("memory value {} overflows KiB", value)))
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn attr(e: &BytesStart<'_>, key: &str) -> Result<Option<String>> {
    let attribute = e
        .try_get_attribute(key)
        .map_err(|err| HypervisorError::Xml(err.to_string()))?;

    match attribute {
        Some(a) => {
            let value = a.unescape_value().map_err(|err| HypervisorError::Xml(err.to_string()))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE_XML: &str = r#"<domain type='kvm' id='3'>
  <name>win11</name>
  <uuid>5c1d6f2e-3a4b-4c5d-8e9f-0a1b2c3d4e5f</uuid>
  <memory unit='KiB'>4194304</memory>
  <vcpu placement='static'>4</vcpu>
  <os>
    <type arch='x86_64' machine='pc-q35-8.2'>hvm</type>
    <boot dev='cdrom'/>
    <boot dev='hd'/>
  </os>
  <devices>
    <emulator>/usr/bin/qemu-system-x86_64</emulator>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='/var/lib/libvirt/images/win11.qcow2'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='/var/lib/libvirt/images/Windows.iso'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    <controller type='usb' index='0' model='ich9-ehci1'/>
    <interface type='network'>
      <source network='default'/>
      <model type='virtio'/>
    </interface>
    <graphics type='vnc' port='5901' autoport='yes' listen='0.0.0.0'>
      <listen type='address' address='0.0.0.0'/>
    </graphics>
  </devices>
</domain>"#;

    #[test]
    fn test_parse_live_descriptor() {
        let info = DescriptorInfo::parse(LIVE_XML).unwrap();

        assert_eq!(info.name.as_deref(), Some("win11"));
        assert_eq!(info.uuid.as_deref(), Some("5c1d6f2e-3a4b-4c5d-8e9f-0a1b2c3d4e5f"));
        assert_eq!(info.arch.as_deref(), Some("x86_64"));
        assert_eq!(info.memory_kib, Some(4194304));
        assert_eq!(info.vcpus, Some(4));
        assert_eq!(info.boot_devices, vec!["cdrom", "hd"]);
        assert_eq!(info.disk_paths, vec![PathBuf::from("/var/lib/libvirt/images/win11.qcow2")]);
        assert_eq!(info.media_paths, vec![PathBuf::from("/var/lib/libvirt/images/Windows.iso")]);
        assert_eq!(info.networks, vec!["default"]);
        assert_eq!(info.vnc.unwrap().port, Some(5901));
    }

    #[test]
    fn test_unassigned_port_is_none() {
        let xml = "<domain><devices><graphics type='vnc' port='-1' autoport='yes'/></devices></domain>";
        let info = DescriptorInfo::parse(xml).unwrap();
        let vnc = info.vnc.unwrap();
        assert_eq!(vnc.port, None);
        assert!(vnc.autoport);
    }

    #[test]
    fn test_memory_units() {
        let xml = "<domain><memory unit='MiB'>2048</memory></domain>";
        assert_eq!(DescriptorInfo::parse(xml).unwrap().memory_kib, Some(2048 * 1024));

        let xml = "<domain><memory unit='parsec'>1</memory></domain>";
        assert!(DescriptorInfo::parse(xml).is_err());
    }

    #[test]
    fn test_memory_overflow_is_error() {
        let xml = format!("<domain><memory unit='GiB'>{}</memory></domain>", u64::MAX);
        let err = DescriptorInfo::parse(&xml).unwrap_err();
        assert!(matches!(err, HypervisorError::Xml(_)));
    }

    #[test]
    fn test_malformed_xml_is_error() {
        let err = DescriptorInfo::parse("<domain><name>x</domain>").unwrap_err();
        assert!(matches!(err, HypervisorError::Xml(_)));
    }
}
