//! Configuration management for the CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use hvmgr_hypervisor::{DiskFormat, ResourceInput, DEFAULT_IMAGE_DIR, DEFAULT_URI};

use crate::cli::{Args, CreateArgs};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hvmgr/hvmgr.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub storage: StorageConfig,
    /// Defaults for `create` parameters the operator leaves out
    pub defaults: DefaultsConfig,
    pub console: ConsoleConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref uri) = args.uri {
            self.connection.uri = uri.clone();
        }

        if let Some(ref image_dir) = args.image_dir {
            self.storage.image_dir = image_dir.clone();
        }

        if let Some(ref qemu_img) = args.qemu_img {
            self.storage.qemu_img = qemu_img.clone();
        }

        if args.dev {
            self.connection.backend = Backend::Mock;
        }

        self
    }

    /// Raw create input, filling omitted values from `defaults`.
    pub fn resource_input(&self, args: &CreateArgs) -> ResourceInput {
        let d = &self.defaults;
        ResourceInput {
            name: args.name.clone(),
            memory_mib: args.memory.clone().unwrap_or_else(|| d.memory_mib.to_string()),
            vcpus: args.vcpus.clone().unwrap_or_else(|| d.vcpus.to_string()),
            disk_gib: args.disk.clone().unwrap_or_else(|| d.disk_gib.to_string()),
            install_media: args
                .install_media
                .clone()
                .unwrap_or_else(|| d.install_media.display().to_string()),
            driver_media: args
                .driver_media
                .clone()
                .unwrap_or_else(|| d.driver_media.display().to_string()),
            network: args.network.clone().unwrap_or_else(|| d.network.clone()),
        }
    }
}

/// Control-plane backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-memory mock for development
    Mock,
    /// Libvirt/QEMU
    #[default]
    Libvirt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub backend: Backend,
    pub uri: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            uri: DEFAULT_URI.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub image_dir: PathBuf,
    pub qemu_img: String,
    pub format: DiskFormat,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from(DEFAULT_IMAGE_DIR),
            qemu_img: "qemu-img".to_string(),
            format: DiskFormat::Qcow2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disk_gib: u64,
    pub network: String,
    pub install_media: PathBuf,
    pub driver_media: PathBuf,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            memory_mib: 2048,
            vcpus: 2,
            disk_gib: 20,
            network: "default".to_string(),
            install_media: PathBuf::from(DEFAULT_IMAGE_DIR).join("Windows.iso"),
            driver_media: PathBuf::from(DEFAULT_IMAGE_DIR).join("virtio-win.iso"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Host handed to VNC viewers
    pub host: String,
    /// Address the VNC server listens on inside the hypervisor
    pub vnc_listen: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            vnc_listen: "0.0.0.0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connection.uri, "qemu:///system");
        assert_eq!(config.storage.image_dir, PathBuf::from("/var/lib/libvirt/images"));
        assert_eq!(config.storage.format, DiskFormat::Qcow2);
        assert_eq!(config.defaults.memory_mib, 2048);
        assert_eq!(config.console.host, "localhost");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "connection:\n  uri: qemu+ssh://root@hv/system\nstorage:\n  format: raw\ndefaults:\n  vcpus: 8"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.connection.uri, "qemu+ssh://root@hv/system");
        assert_eq!(config.connection.backend, Backend::Libvirt);
        assert_eq!(config.storage.format, DiskFormat::Raw);
        assert_eq!(config.storage.qemu_img, "qemu-img");
        assert_eq!(config.defaults.vcpus, 8);
        assert_eq!(config.defaults.memory_mib, 2048);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(Config::load("/nonexistent/hvmgr.yaml").is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "hvmgr",
            "--dev",
            "--uri",
            "test:///default",
            "--image-dir",
            "/srv/images",
            "list",
        ]);
        let config = Config::default().with_cli_overrides(&args);

        assert_eq!(config.connection.backend, Backend::Mock);
        assert_eq!(config.connection.uri, "test:///default");
        assert_eq!(config.storage.image_dir, PathBuf::from("/srv/images"));
    }

    #[test]
    fn test_resource_input_uses_defaults() {
        let args = CreateArgs {
            name: "test-vm".to_string(),
            memory: Some("4096".to_string()),
            vcpus: None,
            disk: None,
            install_media: None,
            driver_media: None,
            network: None,
        };
        let input = Config::default().resource_input(&args);

        assert_eq!(input.memory_mib, "4096");
        assert_eq!(input.vcpus, "2");
        assert_eq!(input.disk_gib, "20");
        assert_eq!(input.network, "default");
        assert_eq!(input.install_media, "/var/lib/libvirt/images/Windows.iso");
    }
}
