//! # hvmgr Hypervisor
//!
//! Lifecycle management for virtual machines on a single hypervisor host.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │               LifecycleController                │
//! │  (create, start, restart, stop, delete, ...)     │
//! └───┬──────────────┬──────────────┬────────────────┘
//!     ▼              ▼              ▼
//! SpecValidator  NetworkValidator  DiskProvisioner ── qemu-img
//!     │              │
//!     │       DescriptorBuilder ── domain XML
//!     ▼              ▼
//! ┌──────────────────────────────────────────────────┐
//! │     ConnectionManager (one swappable slot)       │
//! └─────────────────────┬────────────────────────────┘
//!                       ▼
//!          ControlPlane trait (libvirt / mock)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hvmgr_hypervisor::{ConnectionManager, LifecycleController, MockHost, ResourceInput};
//!
//! #[tokio::main]
//! async fn main() {
//!     let host = MockHost::new("localhost").with_network("default", true);
//!     let connections = Arc::new(ConnectionManager::new(Arc::new(host.connector())));
//!     connections.connect("test:///default").await.unwrap();
//!
//!     let controller = LifecycleController::new(connections, "/var/lib/libvirt/images");
//!     let report = controller.create(ResourceInput { /* ... */ ..Default::default() }).await;
//! }
//! ```

pub mod connection;
pub mod descriptor;
pub mod error;
pub mod inventory;
pub mod libvirt;
pub mod lifecycle;
pub mod mock;
pub mod network;
pub mod storage;
pub mod tasks;
pub mod traits;
pub mod types;
pub mod validate;
mod xml;

pub use connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, DEFAULT_URI};
pub use descriptor::{DescriptorBuilder, DomainDescriptor};
pub use error::{HypervisorError, Result};
pub use inventory::Inventory;
pub use lifecycle::{
    CreateReport, DeleteReport, LifecycleController, RestartOutcome, StartOutcome, StopOutcome,
};
pub use mock::{Fault, MockHost};
pub use network::NetworkValidator;
pub use storage::{DiskProvisioner, ImageTool, DEFAULT_IMAGE_DIR};
pub use tasks::TaskHandle;
pub use traits::{Connector, ControlPlane};
pub use types::*;
pub use validate::SpecValidator;
pub use xml::{DescriptorInfo, VncInfo};

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::{LibvirtConnector, LibvirtSession};
