//! In-memory control plane for testing and development.
//!
//! [`MockHost`] simulates one hypervisor daemon: persistent domain
//! definitions, virtual networks, and the sessions opened against it.
//! Restarting the daemon or making it unreachable invalidates every open
//! session, which is how tests exercise the reconnect paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::traits::{Connector, ControlPlane};
use crate::types::{DomainRef, NetworkRef};
use crate::xml::DescriptorInfo;

const FIRST_DOMAIN_ID: u32 = 1;
const FIRST_VNC_PORT: u16 = 5900;

/// Control-plane calls the mock can be told to fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fault {
    Define,
    Start,
    ListActive,
    ListDefined,
    NetworkLookup,
    NetworkStart,
    /// Detail lookups for the named domain fail.
    Details(String),
    /// The first descriptor read after a start reports no console port yet.
    ConsolePending,
}

struct MockDomain {
    xml: String,
    uuid: String,
    memory_kib: u64,
    vcpus: u32,
    autostart: bool,
    id: Option<u32>,
    vnc_port: Option<u16>,
    console_pending: bool,
}

#[derive(Default)]
struct HostState {
    domains: BTreeMap<String, MockDomain>,
    networks: BTreeMap<String, bool>,
    faults: HashSet<Fault>,
    next_id: u32,
    next_port: u16,
    start_delay: Option<Duration>,
}

/// Simulated hypervisor daemon.
pub struct MockHost {
    hostname: String,
    reachable: AtomicBool,
    epoch: AtomicU64,
    opens: AtomicUsize,
    state: RwLock<HostState>,
}

impl MockHost {
    /// Create a reachable host with no domains or networks.
    pub fn new(hostname: impl Into<String>) -> Arc<Self> {
        let hostname = hostname.into();
        info!(hostname = %hostname, "Creating mock control plane");
        Arc::new(Self {
            hostname,
            reachable: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            opens: AtomicUsize::new(0),
            state: RwLock::new(HostState {
                next_id: FIRST_DOMAIN_ID,
                next_port: FIRST_VNC_PORT,
                ..HostState::default()
            }),
        })
    }

    /// Connector that opens sessions against this host.
    pub fn connector(self: &Arc<Self>) -> MockConnector {
        MockConnector {
            host: Arc::clone(self),
        }
    }

    /// Builder-style [`add_network`](Self::add_network).
    pub fn with_network(self: Arc<Self>, name: &str, active: bool) -> Arc<Self> {
        self.add_network(name, active);
        self
    }

    pub fn add_network(&self, name: &str, active: bool) {
        if let Ok(mut state) = self.state.write() {
            state.networks.insert(name.to_string(), active);
        }
    }

    /// Define a domain directly, bypassing descriptor parsing.
    pub fn add_domain(&self, name: &str, memory_mib: u64, vcpus: u32, active: bool) {
        if let Ok(mut state) = self.state.write() {
            let id = active.then(|| state.take_id());
            let vnc_port = active.then(|| state.take_port());
            state.domains.insert(
                name.to_string(),
                MockDomain {
                    xml: format!(
                        "<domain type='kvm'><name>{}</name><memory unit='KiB'>{}</memory>\
                         <vcpu>{}</vcpu><devices><graphics type='vnc' port='-1' autoport='yes'/>\
                         </devices></domain>",
                        name,
                        memory_mib * 1024,
                        vcpus
                    ),
                    uuid: uuid::Uuid::new_v4().to_string(),
                    memory_kib: memory_mib * 1024,
                    vcpus,
                    autostart: false,
                    id,
                    vnc_port,
                    console_pending: false,
                },
            );
        }
    }

    pub fn set_fault(&self, fault: Fault, enabled: bool) {
        if let Ok(mut state) = self.state.write() {
            if enabled {
                state.faults.insert(fault);
            } else {
                state.faults.remove(&fault);
            }
        }
    }

    /// Make every `start` call wait before touching the domain.
    pub fn set_start_delay(&self, delay: Option<Duration>) {
        if let Ok(mut state) = self.state.write() {
            state.start_delay = delay;
        }
    }

    /// Simulate the daemon becoming (un)reachable. Unreachable kills open sessions.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Simulate a daemon restart: every open session goes stale.
    pub fn restart_daemon(&self) {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(hostname = %self.hostname, epoch, "Mock daemon restarted");
    }

    /// Number of session opens attempted, successful or not.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.state
            .read()
            .map(|s| s.domains.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_domain_active(&self, name: &str) -> bool {
        self.state
            .read()
            .map(|s| s.domains.get(name).is_some_and(|d| d.id.is_some()))
            .unwrap_or(false)
    }

    pub fn network_active(&self, name: &str) -> Option<bool> {
        self.state.read().ok().and_then(|s| s.networks.get(name).copied())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HostState>> {
        self.state
            .read()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HostState>> {
        self.state
            .write()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))
    }
}

impl HostState {
    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn take_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port += 1;
        port
    }

    fn domain(&self, name: &str) -> Result<&MockDomain> {
        self.domains
            .get(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("domain '{}'", name)))
    }

    fn domain_mut(&mut self, name: &str) -> Result<&mut MockDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::NotFound(format!("domain '{}'", name)))
    }

    fn fail_if(&self, fault: &Fault, message: &str) -> Result<()> {
        if self.faults.contains(fault) {
            return Err(HypervisorError::OperationFailed(message.to_string()));
        }
        Ok(())
    }
}

/// Opens [`MockSession`]s.
pub struct MockConnector {
    host: Arc<MockHost>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, uri: &str) -> Result<Arc<dyn ControlPlane>> {
        self.host.opens.fetch_add(1, Ordering::SeqCst);

        if !self.host.reachable.load(Ordering::SeqCst) {
            return Err(HypervisorError::Connection(format!(
                "failed to connect to {}: host unreachable",
                uri
            )));
        }

        debug!(uri = %uri, "Mock session opened");
        Ok(Arc::new(MockSession {
            host: Arc::clone(&self.host),
            epoch: self.host.epoch.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One session against a [`MockHost`].
pub struct MockSession {
    host: Arc<MockHost>,
    epoch: u64,
    closed: AtomicBool,
}

impl MockSession {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HypervisorError::Connection("session is closed".to_string()));
        }
        if self.host.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(HypervisorError::Connection("daemon restarted, session is stale".to_string()));
        }
        if !self.host.reachable.load(Ordering::SeqCst) {
            return Err(HypervisorError::Connection("host unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for MockSession {
    async fn hostname(&self) -> Result<String> {
        self.check()?;
        Ok(self.host.hostname.clone())
    }

    async fn is_alive(&self) -> bool {
        self.check().is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_active_ids(&self) -> Result<Vec<u32>> {
        self.check()?;
        let state = self.host.read()?;
        state.fail_if(&Fault::ListActive, "listing active domains failed")?;
        Ok(state.domains.values().filter_map(|d| d.id).collect())
    }

    async fn list_defined_names(&self) -> Result<Vec<String>> {
        self.check()?;
        let state = self.host.read()?;
        state.fail_if(&Fault::ListDefined, "listing defined domains failed")?;
        Ok(state
            .domains
            .iter()
            .filter(|(_, d)| d.id.is_none())
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn lookup_by_id(&self, id: u32) -> Result<DomainRef> {
        self.check()?;
        let state = self.host.read()?;
        state
            .domains
            .iter()
            .find(|(_, d)| d.id == Some(id))
            .map(|(name, d)| DomainRef::new(name.clone(), d.id))
            .ok_or_else(|| HypervisorError::NotFound(format!("domain with id {}", id)))
    }

    async fn lookup_by_name(&self, name: &str) -> Result<DomainRef> {
        self.check()?;
        let state = self.host.read()?;
        let domain = state.domain(name)?;
        Ok(DomainRef::new(name, domain.id))
    }

    #[instrument(skip(self, xml))]
    async fn define_xml(&self, xml: &str) -> Result<DomainRef> {
        self.check()?;
        let info = DescriptorInfo::parse(xml).map_err(|e| HypervisorError::Definition(e.to_string()))?;
        let name = info
            .name
            .ok_or_else(|| HypervisorError::Definition("descriptor has no name".to_string()))?;

        let mut state = self.host.write()?;
        if state.faults.contains(&Fault::Define) {
            return Err(HypervisorError::Definition(format!("daemon rejected descriptor for '{}'", name)));
        }
        if state.domains.contains_key(&name) {
            return Err(HypervisorError::Definition(format!("domain '{}' already exists", name)));
        }

        state.domains.insert(
            name.clone(),
            MockDomain {
                xml: xml.to_string(),
                uuid: uuid::Uuid::new_v4().to_string(),
                memory_kib: info.memory_kib.unwrap_or(0),
                vcpus: info.vcpus.unwrap_or(1),
                autostart: false,
                id: None,
                vnc_port: None,
                console_pending: false,
            },
        );

        info!(vm_name = %name, "Mock domain defined");
        Ok(DomainRef::new(name, None))
    }

    async fn start(&self, domain: &DomainRef) -> Result<()> {
        self.check()?;

        let delay = self.host.read()?.start_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            self.check()?;
        }

        let mut state = self.host.write()?;
        state.fail_if(&Fault::Start, "domain failed to start")?;
        let console_pending = state.faults.contains(&Fault::ConsolePending);

        if state.domain(&domain.name)?.id.is_some() {
            return Err(HypervisorError::InvalidState("domain is already running".to_string()));
        }

        let id = state.take_id();
        let port = state.take_port();
        let entry = state.domain_mut(&domain.name)?;
        entry.id = Some(id);
        entry.vnc_port = Some(port);
        entry.console_pending = console_pending;

        info!(vm_name = %domain.name, id, "Mock domain started");
        Ok(())
    }

    async fn reboot(&self, domain: &DomainRef) -> Result<()> {
        self.check()?;
        let state = self.host.read()?;
        if state.domain(&domain.name)?.id.is_none() {
            return Err(HypervisorError::InvalidState("domain is not running".to_string()));
        }
        Ok(())
    }

    async fn shutdown(&self, domain: &DomainRef) -> Result<()> {
        // The mock guest honours ACPI immediately.
        self.destroy(domain).await
    }

    async fn destroy(&self, domain: &DomainRef) -> Result<()> {
        self.check()?;
        let mut state = self.host.write()?;
        let entry = state.domain_mut(&domain.name)?;
        if entry.id.is_none() {
            return Err(HypervisorError::InvalidState("domain is not running".to_string()));
        }
        entry.id = None;
        entry.vnc_port = None;
        Ok(())
    }

    async fn undefine(&self, domain: &DomainRef) -> Result<()> {
        self.check()?;
        let mut state = self.host.write()?;
        state.domain(&domain.name)?;
        state.domains.remove(&domain.name);
        info!(vm_name = %domain.name, "Mock domain undefined");
        Ok(())
    }

    async fn is_active(&self, domain: &DomainRef) -> Result<bool> {
        self.check()?;
        Ok(self.host.read()?.domain(&domain.name)?.id.is_some())
    }

    async fn max_memory_kib(&self, domain: &DomainRef) -> Result<u64> {
        self.check()?;
        let state = self.host.read()?;
        state.fail_if(&Fault::Details(domain.name.clone()), "memory lookup failed")?;
        Ok(state.domain(&domain.name)?.memory_kib)
    }

    async fn max_vcpus(&self, domain: &DomainRef) -> Result<u32> {
        self.check()?;
        let state = self.host.read()?;
        state.fail_if(&Fault::Details(domain.name.clone()), "vcpu lookup failed")?;
        Ok(state.domain(&domain.name)?.vcpus)
    }

    async fn autostart(&self, domain: &DomainRef) -> Result<bool> {
        self.check()?;
        let state = self.host.read()?;
        state.fail_if(&Fault::Details(domain.name.clone()), "autostart lookup failed")?;
        Ok(state.domain(&domain.name)?.autostart)
    }

    async fn xml_desc(&self, domain: &DomainRef) -> Result<String> {
        self.check()?;
        let mut state = self.host.write()?;
        let entry = state.domain_mut(&domain.name)?;

        // Live descriptors carry the uuid and, once assigned, the real port.
        let mut xml = entry
            .xml
            .replacen("</name>", &format!("</name><uuid>{}</uuid>", entry.uuid), 1);
        if entry.console_pending {
            entry.console_pending = false;
        } else if let Some(port) = entry.vnc_port {
            xml = xml
                .replace("port=\"-1\"", &format!("port=\"{}\"", port))
                .replace("port='-1'", &format!("port='{}'", port));
        }
        Ok(xml)
    }

    async fn lookup_network(&self, name: &str) -> Result<NetworkRef> {
        self.check()?;
        let state = self.host.read()?;
        state.fail_if(&Fault::NetworkLookup, "network lookup failed")?;
        if !state.networks.contains_key(name) {
            return Err(HypervisorError::NotFound(format!("network '{}'", name)));
        }
        Ok(NetworkRef { name: name.to_string() })
    }

    async fn network_is_active(&self, network: &NetworkRef) -> Result<bool> {
        self.check()?;
        self.host
            .read()?
            .networks
            .get(&network.name)
            .copied()
            .ok_or_else(|| HypervisorError::NotFound(format!("network '{}'", network.name)))
    }

    async fn start_network(&self, network: &NetworkRef) -> Result<()> {
        self.check()?;
        let mut state = self.host.write()?;
        state.fail_if(&Fault::NetworkStart, "network failed to start")?;
        let active = state
            .networks
            .get_mut(&network.name)
            .ok_or_else(|| HypervisorError::NotFound(format!("network '{}'", network.name)))?;
        *active = true;
        info!(network = %network.name, "Mock network started");
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<String>> {
        self.check()?;
        let state = self.host.read()?;
        Ok(state.networks.iter().filter(|(_, a)| **a).map(|(n, _)| n.clone()).collect())
    }

    async fn list_defined_networks(&self) -> Result<Vec<String>> {
        self.check()?;
        let state = self.host.read()?;
        Ok(state.networks.iter().filter(|(_, a)| !**a).map(|(n, _)| n.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn session(host: &Arc<MockHost>) -> Arc<dyn ControlPlane> {
        host.connector().open("test:///default").await.unwrap()
    }

    #[tokio::test]
    async fn test_active_and_defined_are_disjoint() {
        let host = MockHost::new("hv-01");
        host.add_domain("web", 1024, 1, true);
        host.add_domain("db", 2048, 2, false);
        let session = session(&host).await;

        let ids = session.list_active_ids().await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(session.lookup_by_id(ids[0]).await.unwrap().name, "web");
        assert_eq!(session.list_defined_names().await.unwrap(), vec!["db"]);
    }

    #[tokio::test]
    async fn test_start_assigns_console_port() {
        let host = MockHost::new("hv-01");
        host.add_domain("web", 1024, 1, false);
        let session = session(&host).await;

        let domain = session.lookup_by_name("web").await.unwrap();
        assert!(session.xml_desc(&domain).await.unwrap().contains("port='-1'"));

        session.start(&domain).await.unwrap();
        let xml = session.xml_desc(&domain).await.unwrap();
        let info = DescriptorInfo::parse(&xml).unwrap();
        assert_eq!(info.vnc.unwrap().port, Some(FIRST_VNC_PORT));
        assert!(info.uuid.is_some());
    }

    #[tokio::test]
    async fn test_restart_invalidates_sessions() {
        let host = MockHost::new("hv-01");
        let session = session(&host).await;
        assert!(session.is_alive().await);

        host.restart_daemon();
        assert!(!session.is_alive().await);
        assert!(session.hostname().await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn test_faults_are_reported() {
        let host = MockHost::new("hv-01").with_network("default", false);
        host.set_fault(Fault::NetworkStart, true);
        let session = session(&host).await;

        let network = session.lookup_network("default").await.unwrap();
        assert!(session.start_network(&network).await.is_err());
        assert_eq!(host.network_active("default"), Some(false));

        host.set_fault(Fault::NetworkStart, false);
        session.start_network(&network).await.unwrap();
        assert_eq!(host.network_active("default"), Some(true));
    }
}
