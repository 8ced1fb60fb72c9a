//! Libvirt control-plane implementation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::network::Network;

use crate::error::{HypervisorError, Result};
use crate::traits::{Connector, ControlPlane};
use crate::types::{DomainRef, NetworkRef};

/// Opens libvirt connections.
///
/// Common URIs:
/// - `qemu:///system` - System-wide QEMU/KVM
/// - `qemu:///session` - User session QEMU
/// - `qemu+ssh://user@host/system` - Remote via SSH
#[derive(Debug, Default, Clone, Copy)]
pub struct LibvirtConnector;

impl LibvirtConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LibvirtConnector {
    async fn open(&self, uri: &str) -> Result<Arc<dyn ControlPlane>> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::Connection(format!("{}: {}", uri, e)))?;

        Ok(Arc::new(LibvirtSession {
            uri: uri.to_string(),
            connection: Mutex::new(Some(connection)),
        }))
    }
}

/// One open libvirt connection.
pub struct LibvirtSession {
    uri: String,
    connection: Mutex<Option<Connect>>,
}

impl LibvirtSession {
    fn with_conn<T>(&self, f: impl FnOnce(&Connect) -> Result<T>) -> Result<T> {
        let guard = self
            .connection
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| HypervisorError::Connection(format!("connection to {} is closed", self.uri)))?;
        f(conn)
    }
}

/// Map a libvirt error, telling a dead connection apart from a failed call.
fn failed(conn: &Connect, context: &str, e: virt::error::Error) -> HypervisorError {
    if matches!(conn.is_alive(), Ok(true)) {
        HypervisorError::OperationFailed(format!("{}: {}", context, e))
    } else {
        HypervisorError::Connection(format!("{}: {}", context, e))
    }
}

fn missing(conn: &Connect, what: String, e: virt::error::Error) -> HypervisorError {
    if matches!(conn.is_alive(), Ok(true)) {
        HypervisorError::NotFound(format!("{}: {}", what, e))
    } else {
        HypervisorError::Connection(format!("{}: {}", what, e))
    }
}

fn domain(conn: &Connect, domain: &DomainRef) -> Result<Domain> {
    Domain::lookup_by_name(conn, &domain.name)
        .map_err(|e| missing(conn, format!("domain '{}'", domain.name), e))
}

fn network(conn: &Connect, network: &NetworkRef) -> Result<Network> {
    Network::lookup_by_name(conn, &network.name)
        .map_err(|e| missing(conn, format!("network '{}'", network.name), e))
}

fn domain_ref(conn: &Connect, dom: &Domain) -> Result<DomainRef> {
    let name = dom.get_name().map_err(|e| failed(conn, "reading domain name", e))?;
    Ok(DomainRef::new(name, dom.get_id()))
}

#[async_trait]
impl ControlPlane for LibvirtSession {
    async fn hostname(&self) -> Result<String> {
        self.with_conn(|conn| conn.get_hostname().map_err(|e| failed(conn, "reading hostname", e)))
    }

    async fn is_alive(&self) -> bool {
        self.with_conn(|conn| Ok(matches!(conn.is_alive(), Ok(true))))
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;

        if let Some(mut conn) = guard.take() {
            if let Err(e) = conn.close() {
                warn!(uri = %self.uri, error = %e, "Error closing libvirt connection");
            }
        }
        Ok(())
    }

    async fn list_active_ids(&self) -> Result<Vec<u32>> {
        self.with_conn(|conn| conn.list_domains().map_err(|e| failed(conn, "listing active domains", e)))
    }

    async fn list_defined_names(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            conn.list_defined_domains()
                .map_err(|e| failed(conn, "listing defined domains", e))
        })
    }

    async fn lookup_by_id(&self, id: u32) -> Result<DomainRef> {
        self.with_conn(|conn| {
            let dom = Domain::lookup_by_id(conn, id).map_err(|e| missing(conn, format!("domain id {}", id), e))?;
            domain_ref(conn, &dom)
        })
    }

    async fn lookup_by_name(&self, name: &str) -> Result<DomainRef> {
        self.with_conn(|conn| {
            let dom = Domain::lookup_by_name(conn, name)
                .map_err(|e| missing(conn, format!("domain '{}'", name), e))?;
            domain_ref(conn, &dom)
        })
    }

    #[instrument(skip(self, xml))]
    async fn define_xml(&self, xml: &str) -> Result<DomainRef> {
        self.with_conn(|conn| {
            let dom = Domain::define_xml(conn, xml).map_err(|e| match failed(conn, "defining domain", e) {
                HypervisorError::OperationFailed(msg) => HypervisorError::Definition(msg),
                other => other,
            })?;
            let domain = domain_ref(conn, &dom)?;
            debug!(vm_name = %domain.name, "Domain defined in libvirt");
            Ok(domain)
        })
    }

    async fn start(&self, target: &DomainRef) -> Result<()> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .create()
                .map(|_| ())
                .map_err(|e| failed(conn, "starting domain", e))
        })
    }

    async fn reboot(&self, target: &DomainRef) -> Result<()> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .reboot(0)
                .map_err(|e| failed(conn, "rebooting domain", e))
        })
    }

    async fn shutdown(&self, target: &DomainRef) -> Result<()> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .shutdown()
                .map(|_| ())
                .map_err(|e| failed(conn, "shutting down domain", e))
        })
    }

    async fn destroy(&self, target: &DomainRef) -> Result<()> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .destroy()
                .map_err(|e| failed(conn, "destroying domain", e))
        })
    }

    async fn undefine(&self, target: &DomainRef) -> Result<()> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .undefine()
                .map_err(|e| failed(conn, "undefining domain", e))
        })
    }

    async fn is_active(&self, target: &DomainRef) -> Result<bool> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .is_active()
                .map_err(|e| failed(conn, "reading domain state", e))
        })
    }

    async fn max_memory_kib(&self, target: &DomainRef) -> Result<u64> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .get_max_memory()
                .map_err(|e| failed(conn, "reading max memory", e))
        })
    }

    async fn max_vcpus(&self, target: &DomainRef) -> Result<u32> {
        self.with_conn(|conn| {
            let vcpus = domain(conn, target)?
                .get_max_vcpus()
                .map_err(|e| failed(conn, "reading max vcpus", e))?;
            u32::try_from(vcpus).map_err(|_| HypervisorError::Internal(format!("vcpu count {} out of range", vcpus)))
        })
    }

    async fn autostart(&self, target: &DomainRef) -> Result<bool> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .get_autostart()
                .map_err(|e| failed(conn, "reading autostart flag", e))
        })
    }

    async fn xml_desc(&self, target: &DomainRef) -> Result<String> {
        self.with_conn(|conn| {
            domain(conn, target)?
                .get_xml_desc(0)
                .map_err(|e| failed(conn, "reading domain XML", e))
        })
    }

    async fn lookup_network(&self, name: &str) -> Result<NetworkRef> {
        self.with_conn(|conn| {
            Network::lookup_by_name(conn, name)
                .map(|_| NetworkRef { name: name.to_string() })
                .map_err(|e| missing(conn, format!("network '{}'", name), e))
        })
    }

    async fn network_is_active(&self, target: &NetworkRef) -> Result<bool> {
        self.with_conn(|conn| {
            network(conn, target)?
                .is_active()
                .map_err(|e| failed(conn, "reading network state", e))
        })
    }

    async fn start_network(&self, target: &NetworkRef) -> Result<()> {
        self.with_conn(|conn| {
            network(conn, target)?
                .create()
                .map(|_| ())
                .map_err(|e| failed(conn, "starting network", e))
        })
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| conn.list_networks().map_err(|e| failed(conn, "listing networks", e)))
    }

    async fn list_defined_networks(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            conn.list_defined_networks()
                .map_err(|e| failed(conn, "listing defined networks", e))
        })
    }
}
