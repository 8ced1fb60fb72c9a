//! Disk image provisioning.
//!
//! Images are created with an external image tool (`qemu-img` by default)
//! under a single base directory.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::types::{DiskFormat, ProvisionedDisk};

/// Default base directory for disk images.
pub const DEFAULT_IMAGE_DIR: &str = "/var/lib/libvirt/images";

/// Command line of the disk image tool.
///
/// `args` are passed before the `create` subcommand, which lets the tool be
/// a wrapper such as `sh -c '<script>' qemu-img`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTool {
    program: String,
    args: Vec<String>,
}

impl ImageTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for ImageTool {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

/// Allocates and removes disk image files.
pub struct DiskProvisioner {
    base_dir: PathBuf,
    tool: ImageTool,
    format: DiskFormat,
}

impl DiskProvisioner {
    /// Create a provisioner for `base_dir` using `qemu-img` and qcow2.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            tool: ImageTool::default(),
            format: DiskFormat::Qcow2,
        }
    }

    /// Set the image tool.
    pub fn with_tool(mut self, tool: ImageTool) -> Self {
        self.tool = tool;
        self
    }

    /// Set the format used for new images.
    pub fn with_format(mut self, format: DiskFormat) -> Self {
        self.format = format;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn format(&self) -> DiskFormat {
        self.format
    }

    /// Path of the system disk for a domain called `name`.
    pub fn disk_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(format!("{}.{}", name, self.format.extension()))
    }

    /// Whether `path` lives inside the base directory.
    pub fn owns(&self, path: &Path) -> bool {
        // Lexical check plus canonical check, so `..` cannot escape.
        if !path.starts_with(&self.base_dir) {
            return false;
        }
        match (path.canonicalize(), self.base_dir.canonicalize()) {
            (Ok(path), Ok(base)) => path.starts_with(base),
            _ => !path.components().any(|c| matches!(c, std::path::Component::ParentDir)),
        }
    }

    /// Create a new image at `path`.
    ///
    /// Refuses to touch an existing file. On failure no file is left at
    /// `path`, and the error carries the tool's stderr.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn create(&self, path: &Path, format: DiskFormat, size_gib: u64) -> Result<ProvisionedDisk> {
        info!("Creating disk image");

        if path.exists() {
            return Err(HypervisorError::Provisioning {
                path: path.display().to_string(),
                diagnostic: "disk image already exists".to_string(),
            });
        }

        let size = format!("{}G", size_gib);
        let output = Command::new(&self.tool.program)
            .args(&self.tool.args)
            .arg("create")
            .arg("-f")
            .arg(format.as_str())
            .arg(path)
            .arg(&size)
            .output()
            .await
            .map_err(|e| HypervisorError::Provisioning {
                path: path.display().to_string(),
                diagnostic: format!("failed to execute {}: {}", self.tool.program, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let diagnostic = if stderr.is_empty() {
                format!("{} exited with {}", self.tool.program, output.status)
            } else {
                stderr
            };

            // The tool may have written a partial file before failing.
            if path.exists() {
                self.remove(path).await;
            }

            return Err(HypervisorError::Provisioning {
                path: path.display().to_string(),
                diagnostic,
            });
        }

        info!(size = %size, "Disk image created");

        Ok(ProvisionedDisk {
            path: path.to_path_buf(),
            format,
            size_gib,
        })
    }

    /// Delete the image at `path`. Failures are logged, never returned.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn remove(&self, path: &Path) -> bool {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!("Disk image removed");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to remove disk image");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch_tool() -> ImageTool {
        ImageTool::new("sh").with_args(["-c", r#": > "$4""#, "qemu-img"])
    }

    fn failing_tool() -> ImageTool {
        ImageTool::new("sh").with_args(["-c", r#"echo 'Could not create image' >&2; exit 1"#, "qemu-img"])
    }

    #[test]
    fn test_disk_path_uses_format_extension() {
        let provisioner = DiskProvisioner::new("/images");
        assert_eq!(provisioner.disk_path("test-vm"), PathBuf::from("/images/test-vm.qcow2"));

        let provisioner = provisioner.with_format(DiskFormat::Raw);
        assert_eq!(provisioner.disk_path("test-vm"), PathBuf::from("/images/test-vm.img"));
    }

    #[tokio::test]
    async fn test_create_success() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = DiskProvisioner::new(dir.path()).with_tool(touch_tool());
        let path = provisioner.disk_path("vm1");

        let disk = provisioner.create(&path, DiskFormat::Qcow2, 20).await.unwrap();
        assert_eq!(disk.path, path);
        assert_eq!(disk.size_gib, 20);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_create_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = DiskProvisioner::new(dir.path()).with_tool(failing_tool());
        let path = provisioner.disk_path("vm1");

        let err = provisioner.create(&path, DiskFormat::Qcow2, 20).await.unwrap_err();
        match err {
            HypervisorError::Provisioning { diagnostic, .. } => {
                assert_eq!(diagnostic, "Could not create image");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_partial_file_removed_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ImageTool::new("sh").with_args(["-c", r#"echo partial > "$4"; exit 3"#, "qemu-img"]);
        let provisioner = DiskProvisioner::new(dir.path()).with_tool(tool);
        let path = provisioner.disk_path("vm1");

        let err = provisioner.create(&path, DiskFormat::Qcow2, 1).await.unwrap_err();
        assert!(matches!(err, HypervisorError::Provisioning { .. }));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_existing_file_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = DiskProvisioner::new(dir.path()).with_tool(touch_tool());
        let path = provisioner.disk_path("vm1");
        std::fs::write(&path, b"precious").unwrap();

        assert!(provisioner.create(&path, DiskFormat::Qcow2, 1).await.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn test_missing_tool_is_provisioning_error() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = DiskProvisioner::new(dir.path()).with_tool(ImageTool::new("/nonexistent/qemu-img"));
        let path = provisioner.disk_path("vm1");

        let err = provisioner.create(&path, DiskFormat::Qcow2, 1).await.unwrap_err();
        assert!(matches!(err, HypervisorError::Provisioning { .. }));
    }

    #[tokio::test]
    async fn test_remove_is_best_effort() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = DiskProvisioner::new(dir.path());

        assert!(!provisioner.remove(&dir.path().join("missing.qcow2")).await);
    }

    #[test]
    fn test_owns_only_paths_under_base() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = DiskProvisioner::new(dir.path());

        assert!(provisioner.owns(&dir.path().join("vm.qcow2")));
        assert!(!provisioner.owns(Path::new("/etc/passwd")));
        assert!(!provisioner.owns(&dir.path().join("../escape.qcow2")));
    }
}
