//! Resource spec validation.
//!
//! Validation is all-or-nothing and runs before any side effect: either a
//! complete [`ResourceSpec`] comes out or a single validation error does.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::{HypervisorError, Result};
use crate::types::{ResourceInput, ResourceSpec};

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\w-]+$").expect("domain name pattern is a valid regex")
});

/// Validates operator input against the host it will land on.
pub struct SpecValidator {
    image_dir: PathBuf,
}

impl SpecValidator {
    /// Create a validator that checks `image_dir` for writability.
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Validate `input` against the names of the domains that already exist.
    pub fn validate(&self, input: &ResourceInput, existing: &HashSet<String>) -> Result<ResourceSpec> {
        let name = validate_name(&input.name, existing)?;

        // Re-checked on every call: media can vanish between form fill and submit.
        let install_media = existing_file("install_media", &input.install_media)?;
        let driver_media = existing_file("driver_media", &input.driver_media)?;

        let (memory_mib, vcpus, disk_gib) = parse_resources(input)?;

        let network = input.network.trim();
        if network.is_empty() {
            return Err(HypervisorError::validation("network", "a target network is required"));
        }

        self.check_image_dir()?;

        debug!(vm_name = %name, memory_mib, vcpus, disk_gib, "Resource spec validated");

        Ok(ResourceSpec {
            name,
            memory_mib,
            vcpus,
            disk_gib,
            install_media,
            driver_media,
            network: network.to_string(),
        })
    }

    /// Precondition check only: nothing is left behind in the directory.
    fn check_image_dir(&self) -> Result<()> {
        if !self.image_dir.is_dir() {
            return Err(HypervisorError::validation(
                "image_dir",
                format!("{} does not exist or is not a directory", self.image_dir.display()),
            ));
        }

        tempfile::Builder::new()
            .prefix(".hvmgr-probe")
            .tempfile_in(&self.image_dir)
            .map(drop)
            .map_err(|e| {
                HypervisorError::validation(
                    "image_dir",
                    format!("no write permission for {}: {}", self.image_dir.display(), e),
                )
            })
    }
}

fn validate_name(raw: &str, existing: &HashSet<String>) -> Result<String> {
    let name = raw.trim();

    if name.is_empty() {
        return Err(HypervisorError::validation("name", "VM name is required"));
    }

    if !NAME_PATTERN.is_match(name) {
        return Err(HypervisorError::validation(
            "name",
            "VM name can only contain letters, numbers, underscores, and hyphens",
        ));
    }

    if existing.contains(name) {
        return Err(HypervisorError::validation(
            "name",
            format!("a domain named '{}' already exists", name),
        ));
    }

    Ok(name.to_string())
}

fn existing_file(field: &'static str, raw: &str) -> Result<PathBuf> {
    let path = PathBuf::from(raw.trim());

    if raw.trim().is_empty() || !path.exists() {
        return Err(HypervisorError::validation(
            field,
            format!("file '{}' does not exist", path.display()),
        ));
    }

    Ok(path)
}

/// One error for all three numbers, whichever of them is wrong.
///
/// Memory must also fit in KiB, the unit the descriptor carries.
fn parse_resources(input: &ResourceInput) -> Result<(u64, u32, u64)> {
    let memory = input
        .memory_mib
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|v| *v > 0 && v.checked_mul(1024).is_some());
    let vcpus = input.vcpus.trim().parse::<u32>().ok().filter(|v| *v > 0);
    let disk = input.disk_gib.trim().parse::<u64>().ok().filter(|v| *v > 0);

    match (memory, vcpus, disk) {
        (Some(memory), Some(vcpus), Some(disk)) => Ok((memory, vcpus, disk)),
        _ => Err(HypervisorError::validation(
            "resources",
            "Memory, vCPUs, and Disk size must be positive integers",
        )),
    }
}
