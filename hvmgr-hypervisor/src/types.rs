//! Type definitions for domain specs, listings and lifecycle state.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// =============================================================================
// CONTROL-PLANE REFERENCES
// =============================================================================

/// Reference to a domain as returned by a control-plane lookup.
///
/// Domains are always addressed by name; `id` is only present while the
/// domain is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRef {
    pub name: String,
    pub id: Option<u32>,
}

impl DomainRef {
    pub fn new(name: impl Into<String>, id: Option<u32>) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// Reference to a virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRef {
    pub name: String,
}

// =============================================================================
// RESOURCE SPEC
// =============================================================================

/// Unvalidated operator input, exactly as typed into a form or CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceInput {
    pub name: String,
    pub memory_mib: String,
    pub vcpus: String,
    pub disk_gib: String,
    pub install_media: String,
    pub driver_media: String,
    pub network: String,
}

/// Validated operator intent for a new VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub disk_gib: u64,
    pub install_media: PathBuf,
    pub driver_media: PathBuf,
    pub network: String,
}

// =============================================================================
// DISKS
// =============================================================================

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
}

impl DiskFormat {
    /// Get the format string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }

    /// File extension used for images of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "img",
        }
    }
}

impl fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A disk image file allocated for a new domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedDisk {
    pub path: PathBuf,
    pub format: DiskFormat,
    pub size_gib: u64,
}

// =============================================================================
// LISTING
// =============================================================================

/// First identifier handed to inactive domains in a listing.
pub const SYNTHETIC_ID_BASE: u32 = 1000;

/// Identifier column of a listing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum DisplayId {
    /// Control-plane ID of a running domain.
    Active(u32),
    /// Locally generated label for an inactive domain, display only.
    Synthetic(u32),
}

impl DisplayId {
    pub fn value(&self) -> u32 {
        match self {
            DisplayId::Active(id) | DisplayId::Synthetic(id) => *id,
        }
    }
}

/// One row of the domain listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainRecord {
    pub name: String,
    pub running: bool,
    pub id: DisplayId,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub autostart: bool,
}

// =============================================================================
// LIFECYCLE STATE
// =============================================================================

/// Lifecycle state of a domain name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainState {
    Undefined,
    Defining,
    DefinedStopped,
    Starting,
    Running,
    Stopping,
    Destroying,
}

impl DomainState {
    /// Whether this state only exists while an operation is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DomainState::Defining
                | DomainState::Starting
                | DomainState::Stopping
                | DomainState::Destroying
        )
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainState::Undefined => "undefined",
            DomainState::Defining => "defining",
            DomainState::DefinedStopped => "stopped",
            DomainState::Starting => "starting",
            DomainState::Running => "running",
            DomainState::Stopping => "stopping",
            DomainState::Destroying => "destroying",
        };
        f.write_str(s)
    }
}

/// Caller-side answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Granted,
    Denied,
}

impl Confirmation {
    pub fn from_flag(granted: bool) -> Self {
        if granted {
            Confirmation::Granted
        } else {
            Confirmation::Denied
        }
    }
}

// =============================================================================
// DETAILS
// =============================================================================

/// Detailed view of one domain.
#[derive(Debug, Clone, Serialize)]
pub struct DomainSummary {
    pub name: String,
    pub state: DomainState,
    pub uuid: Option<String>,
    pub arch: Option<String>,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub autostart: bool,
    pub disk_paths: Vec<PathBuf>,
    pub vnc_port: Option<u16>,
}

/// Where a graphical console viewer should connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleEndpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ConsoleEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
