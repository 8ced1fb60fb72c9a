//! Control-plane client abstraction.
//!
//! The core never talks to a hypervisor daemon directly. Every component
//! goes through [`ControlPlane`], which one open session implements, and
//! sessions are produced by a [`Connector`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{DomainRef, NetworkRef};

/// Opens control-plane sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new session to the given URI.
    async fn open(&self, uri: &str) -> Result<Arc<dyn ControlPlane>>;
}

/// One open session to the hypervisor control plane.
///
/// Implementations report a dead session through `Connection` errors; the
/// core re-validates liveness before every operation.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    // =========================================================================
    // Session
    // =========================================================================

    /// Host identity reported by the daemon.
    async fn hostname(&self) -> Result<String>;

    /// Liveness probe. Never errors; a failed probe is a dead session.
    async fn is_alive(&self) -> bool;

    /// Close the session. Further calls fail with a connection error.
    async fn close(&self) -> Result<()>;

    // =========================================================================
    // Domain enumeration
    // =========================================================================

    /// IDs of running domains.
    async fn list_active_ids(&self) -> Result<Vec<u32>>;

    /// Names of defined but inactive domains.
    async fn list_defined_names(&self) -> Result<Vec<String>>;

    async fn lookup_by_id(&self, id: u32) -> Result<DomainRef>;

    async fn lookup_by_name(&self, name: &str) -> Result<DomainRef>;

    // =========================================================================
    // Domain lifecycle
    // =========================================================================

    /// Define a persistent domain from its XML descriptor.
    async fn define_xml(&self, xml: &str) -> Result<DomainRef>;

    async fn start(&self, domain: &DomainRef) -> Result<()>;

    /// Request a graceful reboot. Returns once the request is accepted.
    async fn reboot(&self, domain: &DomainRef) -> Result<()>;

    /// Request an ACPI shutdown. Returns once the request is accepted.
    async fn shutdown(&self, domain: &DomainRef) -> Result<()>;

    /// Power the domain off immediately.
    async fn destroy(&self, domain: &DomainRef) -> Result<()>;

    async fn undefine(&self, domain: &DomainRef) -> Result<()>;

    // =========================================================================
    // Domain details
    // =========================================================================

    async fn is_active(&self, domain: &DomainRef) -> Result<bool>;

    /// Memory ceiling in KiB.
    async fn max_memory_kib(&self, domain: &DomainRef) -> Result<u64>;

    async fn max_vcpus(&self, domain: &DomainRef) -> Result<u32>;

    async fn autostart(&self, domain: &DomainRef) -> Result<bool>;

    /// Live XML descriptor, including assigned console port.
    async fn xml_desc(&self, domain: &DomainRef) -> Result<String>;

    // =========================================================================
    // Networks
    // =========================================================================

    async fn lookup_network(&self, name: &str) -> Result<NetworkRef>;

    async fn network_is_active(&self, network: &NetworkRef) -> Result<bool>;

    /// Start a defined network.
    async fn start_network(&self, network: &NetworkRef) -> Result<()>;

    /// Names of active networks.
    async fn list_networks(&self) -> Result<Vec<String>>;

    /// Names of defined but inactive networks.
    async fn list_defined_networks(&self) -> Result<Vec<String>>;
}
