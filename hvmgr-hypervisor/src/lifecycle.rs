//! Lifecycle controller.
//!
//! Orchestrates create/start/restart/stop/delete against the control plane.
//! At most one operation runs per domain name: a second operation on a name
//! that already has one in flight fails with `Conflict` before doing
//! anything. Each operation acquires a live connection once and runs every
//! control-plane call against that handle.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::descriptor::{DescriptorBuilder, DomainDescriptor, DEFAULT_VNC_LISTEN};
use crate::error::{HypervisorError, Result};
use crate::network::NetworkValidator;
use crate::storage::{DiskProvisioner, ImageTool};
use crate::tasks::TaskHandle;
use crate::traits::ControlPlane;
use crate::types::{
    Confirmation, ConsoleEndpoint, DiskFormat, DomainRef, DomainState, DomainSummary, ProvisionedDisk,
    ResourceInput,
};
use crate::validate::SpecValidator;
use crate::xml::DescriptorInfo;

/// Delay before re-reading a console port libvirt has not assigned yet.
pub const CONSOLE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default host handed to console viewers.
pub const DEFAULT_CONSOLE_HOST: &str = "localhost";

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of a create workflow that got as far as defining the domain.
#[derive(Debug)]
pub struct CreateReport {
    pub descriptor: DomainDescriptor,
    pub disk: ProvisionedDisk,
    /// `Running` on success, `DefinedStopped` if the auto-start failed.
    pub state: DomainState,
    pub start_error: Option<HypervisorError>,
}

impl CreateReport {
    pub fn started(&self) -> bool {
        self.start_error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The domain was stopped, so it was started instead.
    Started,
    /// A graceful reboot was requested.
    Rebooting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyStopped,
    /// ACPI shutdown requested; the guest powers off on its own schedule.
    ShutdownRequested,
    /// Powered off immediately.
    Stopped,
}

/// Result of deleting a domain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub name: String,
    /// Disk images the domain referenced. They are left in place.
    pub disk_paths: Vec<PathBuf>,
}

// =============================================================================
// PER-NAME EXCLUSION
// =============================================================================

type InFlight = Arc<Mutex<HashMap<String, DomainState>>>;

/// Claim on a domain name for the duration of one operation.
#[derive(Debug)]
struct OperationGuard {
    name: String,
    in_flight: InFlight,
}

impl OperationGuard {
    fn claim(in_flight: &InFlight, name: &str, state: DomainState) -> Result<Self> {
        let mut map = in_flight
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;

        if let Some(current) = map.get(name) {
            return Err(HypervisorError::Conflict {
                name: name.to_string(),
                state: current.to_string(),
            });
        }

        map.insert(name.to_string(), state);
        Ok(Self {
            name: name.to_string(),
            in_flight: Arc::clone(in_flight),
        })
    }

    fn set(&self, state: DomainState) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.insert(self.name.clone(), state);
        }
        debug!(vm_name = %self.name, state = %state, "Lifecycle transition");
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.remove(&self.name);
        }
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// Drives domain lifecycle workflows.
pub struct LifecycleController {
    connections: Arc<ConnectionManager>,
    validator: SpecValidator,
    networks: Arc<NetworkValidator>,
    provisioner: DiskProvisioner,
    vnc_listen: String,
    console_host: String,
    console_retry_delay: Duration,
    in_flight: InFlight,
}

impl LifecycleController {
    /// Create a controller that keeps disk images in `image_dir`.
    pub fn new(connections: Arc<ConnectionManager>, image_dir: impl Into<PathBuf>) -> Self {
        let image_dir = image_dir.into();
        Self {
            connections,
            validator: SpecValidator::new(image_dir.clone()),
            networks: Arc::new(NetworkValidator::new()),
            provisioner: DiskProvisioner::new(image_dir),
            vnc_listen: DEFAULT_VNC_LISTEN.to_string(),
            console_host: DEFAULT_CONSOLE_HOST.to_string(),
            console_retry_delay: CONSOLE_RETRY_DELAY,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_image_tool(mut self, tool: ImageTool) -> Self {
        self.provisioner = self.provisioner.with_tool(tool);
        self
    }

    pub fn with_disk_format(mut self, format: DiskFormat) -> Self {
        self.provisioner = self.provisioner.with_format(format);
        self
    }

    /// Share a network validator, e.g. with an inventory reconnect watcher.
    pub fn with_networks(mut self, networks: Arc<NetworkValidator>) -> Self {
        self.networks = networks;
        self
    }

    pub fn with_vnc_listen(mut self, listen: impl Into<String>) -> Self {
        self.vnc_listen = listen.into();
        self
    }

    pub fn with_console_host(mut self, host: impl Into<String>) -> Self {
        self.console_host = host.into();
        self
    }

    pub fn with_console_retry_delay(mut self, delay: Duration) -> Self {
        self.console_retry_delay = delay;
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn networks(&self) -> &Arc<NetworkValidator> {
        &self.networks
    }

    pub fn provisioner(&self) -> &DiskProvisioner {
        &self.provisioner
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Validate, provision, define and start a new domain.
    ///
    /// Fails with no side effects on validation or network errors. A failure
    /// after the disk was provisioned removes that disk. If the domain was
    /// defined but does not start, it stays defined and the report carries
    /// the start error.
    #[instrument(skip(self, input), fields(vm_name = %input.name.trim()))]
    pub async fn create(&self, input: ResourceInput) -> Result<CreateReport> {
        let guard = OperationGuard::claim(&self.in_flight, input.name.trim(), DomainState::Defining)?;
        let handle = self.connections.acquire().await?;

        let existing = existing_names(handle.session()).await?;
        let spec = self.validator.validate(&input, &existing)?;
        self.networks.ensure_network_active(&handle, &spec.network).await?;

        let format = self.provisioner.format();
        let path = self.provisioner.disk_path(&spec.name);
        let disk = self.provisioner.create(&path, format, spec.disk_gib).await?;

        let descriptor = DescriptorBuilder::new(&spec, &disk.path)
            .with_format(format)
            .with_vnc_listen(self.vnc_listen.clone())
            .build();

        let domain = match self.define(&handle, &descriptor).await {
            Ok(domain) => domain,
            Err(e) => {
                error!(error = %e, "Domain definition failed, rolling back disk");
                self.provisioner.remove(&disk.path).await;
                return Err(e);
            }
        };
        info!(path = %disk.path.display(), "Domain defined");

        guard.set(DomainState::Starting);
        let start_error = match handle.session().start(&domain).await {
            Ok(()) => {
                info!("Domain started");
                None
            }
            Err(e) => {
                warn!(error = %e, "Domain defined but failed to start");
                Some(e)
            }
        };

        let state = if start_error.is_none() {
            DomainState::Running
        } else {
            DomainState::DefinedStopped
        };

        Ok(CreateReport {
            descriptor,
            disk,
            state,
            start_error,
        })
    }

    pub fn spawn_create(self: &Arc<Self>, input: ResourceInput) -> TaskHandle<CreateReport> {
        let controller = Arc::clone(self);
        TaskHandle::spawn("create", async move { controller.create(input).await })
    }

    async fn define(&self, handle: &ConnectionHandle, descriptor: &DomainDescriptor) -> Result<DomainRef> {
        let xml = descriptor.to_xml()?;
        debug!(xml = %xml, "Defining domain");

        handle.session().define_xml(&xml).await.map_err(|e| match e {
            HypervisorError::Connection(_) | HypervisorError::Definition(_) => e,
            other => HypervisorError::Definition(other.to_string()),
        })
    }

    // =========================================================================
    // Start / restart / stop
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<StartOutcome> {
        let _guard = OperationGuard::claim(&self.in_flight, name, DomainState::Starting)?;
        let handle = self.connections.acquire().await?;
        let session = handle.session();

        let domain = session.lookup_by_name(name).await?;
        if session.is_active(&domain).await? {
            info!("Domain is already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        session.start(&domain).await?;
        info!("Domain started");
        Ok(StartOutcome::Started)
    }

    pub fn spawn_start(self: &Arc<Self>, name: impl Into<String>) -> TaskHandle<StartOutcome> {
        let controller = Arc::clone(self);
        let name = name.into();
        TaskHandle::spawn("start", async move { controller.start(&name).await })
    }

    /// Reboot a running domain, or start a stopped one.
    #[instrument(skip(self))]
    pub async fn restart(&self, name: &str) -> Result<RestartOutcome> {
        let guard = OperationGuard::claim(&self.in_flight, name, DomainState::Starting)?;
        let handle = self.connections.acquire().await?;
        let session = handle.session();

        let domain = session.lookup_by_name(name).await?;
        if !session.is_active(&domain).await? {
            session.start(&domain).await?;
            info!("Domain was stopped, started it");
            return Ok(RestartOutcome::Started);
        }

        guard.set(DomainState::Running);
        session.reboot(&domain).await?;
        info!("Reboot requested");
        Ok(RestartOutcome::Rebooting)
    }

    pub fn spawn_restart(self: &Arc<Self>, name: impl Into<String>) -> TaskHandle<RestartOutcome> {
        let controller = Arc::clone(self);
        let name = name.into();
        TaskHandle::spawn("restart", async move { controller.restart(&name).await })
    }

    /// Request a graceful ACPI shutdown.
    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        let _guard = OperationGuard::claim(&self.in_flight, name, DomainState::Stopping)?;
        let handle = self.connections.acquire().await?;
        let session = handle.session();

        let domain = session.lookup_by_name(name).await?;
        if !session.is_active(&domain).await? {
            return Ok(StopOutcome::AlreadyStopped);
        }

        session.shutdown(&domain).await?;
        info!("Shutdown requested");
        Ok(StopOutcome::ShutdownRequested)
    }

    pub fn spawn_stop(self: &Arc<Self>, name: impl Into<String>) -> TaskHandle<StopOutcome> {
        let controller = Arc::clone(self);
        let name = name.into();
        TaskHandle::spawn("stop", async move { controller.stop(&name).await })
    }

    /// Power a domain off immediately.
    #[instrument(skip(self))]
    pub async fn force_stop(&self, name: &str) -> Result<StopOutcome> {
        let _guard = OperationGuard::claim(&self.in_flight, name, DomainState::Stopping)?;
        let handle = self.connections.acquire().await?;
        let session = handle.session();

        let domain = session.lookup_by_name(name).await?;
        if !session.is_active(&domain).await? {
            return Ok(StopOutcome::AlreadyStopped);
        }

        session.destroy(&domain).await?;
        info!("Domain force stopped");
        Ok(StopOutcome::Stopped)
    }

    pub fn spawn_force_stop(self: &Arc<Self>, name: impl Into<String>) -> TaskHandle<StopOutcome> {
        let controller = Arc::clone(self);
        let name = name.into();
        TaskHandle::spawn("force_stop", async move { controller.force_stop(&name).await })
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Undefine a domain, force-stopping it first if it is running.
    ///
    /// Disk images are not touched; see [`remove_disk`](Self::remove_disk).
    #[instrument(skip(self, confirmation))]
    pub async fn delete(&self, name: &str, confirmation: Confirmation) -> Result<DeleteReport> {
        if confirmation != Confirmation::Granted {
            return Err(HypervisorError::Unconfirmed(format!("deleting domain '{}'", name)));
        }

        let guard = OperationGuard::claim(&self.in_flight, name, DomainState::Stopping)?;
        let handle = self.connections.acquire().await?;
        let session = handle.session();

        let domain = session.lookup_by_name(name).await?;
        let disk_paths = match session.xml_desc(&domain).await {
            Ok(xml) => match DescriptorInfo::parse(&xml) {
                Ok(info) => info.disk_paths,
                Err(e) => {
                    warn!(error = %e, "Could not read disk paths from descriptor");
                    Vec::new()
                }
            },
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Could not fetch descriptor");
                Vec::new()
            }
        };

        if session.is_active(&domain).await? {
            info!("Domain is running, force stopping before undefine");
            session.destroy(&domain).await?;
        }

        guard.set(DomainState::Destroying);
        session.undefine(&domain).await?;
        info!("Domain undefined");

        Ok(DeleteReport {
            name: name.to_string(),
            disk_paths,
        })
    }

    pub fn spawn_delete(self: &Arc<Self>, name: impl Into<String>, confirmation: Confirmation) -> TaskHandle<DeleteReport> {
        let controller = Arc::clone(self);
        let name = name.into();
        TaskHandle::spawn("delete", async move { controller.delete(&name, confirmation).await })
    }

    /// Delete a disk image left behind by [`delete`](Self::delete).
    ///
    /// Only files under the image directory can be removed.
    #[instrument(skip(self, confirmation), fields(path = %path.display()))]
    pub async fn remove_disk(&self, path: &Path, confirmation: Confirmation) -> Result<()> {
        if confirmation != Confirmation::Granted {
            return Err(HypervisorError::Unconfirmed(format!("deleting disk {}", path.display())));
        }

        if !self.provisioner.owns(path) {
            return Err(HypervisorError::validation(
                "path",
                format!(
                    "{} is outside the image directory {}",
                    path.display(),
                    self.provisioner.base_dir().display()
                ),
            ));
        }

        if !path.exists() {
            return Err(HypervisorError::NotFound(path.display().to_string()));
        }

        if self.provisioner.remove(path).await {
            Ok(())
        } else {
            Err(HypervisorError::OperationFailed(format!("failed to remove {}", path.display())))
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current lifecycle state, including any operation in flight.
    pub async fn state(&self, name: &str) -> Result<DomainState> {
        if let Some(state) = self.in_flight_state(name)? {
            return Ok(state);
        }

        let handle = self.connections.acquire().await?;
        let session = handle.session();

        let domain = match session.lookup_by_name(name).await {
            Ok(domain) => domain,
            Err(HypervisorError::NotFound(_)) => return Ok(DomainState::Undefined),
            Err(e) => return Err(e),
        };

        Ok(settled_state(session.is_active(&domain).await?))
    }

    /// Details of one domain as reported by the control plane.
    #[instrument(skip(self))]
    pub async fn describe(&self, name: &str) -> Result<DomainSummary> {
        let handle = self.connections.acquire().await?;
        let session = handle.session();

        let domain = session.lookup_by_name(name).await?;
        let active = session.is_active(&domain).await?;
        let memory_kib = session.max_memory_kib(&domain).await?;
        let vcpus = session.max_vcpus(&domain).await?;
        let autostart = session.autostart(&domain).await?;
        let info = DescriptorInfo::parse(&session.xml_desc(&domain).await?)?;

        let state = self.in_flight_state(name)?.unwrap_or_else(|| settled_state(active));

        Ok(DomainSummary {
            name: domain.name,
            state,
            uuid: info.uuid,
            arch: info.arch,
            memory_mib: memory_kib / 1024,
            vcpus,
            autostart,
            disk_paths: info.disk_paths,
            vnc_port: info.vnc.and_then(|v| v.port),
        })
    }

    /// Where a VNC viewer should connect for a running domain.
    #[instrument(skip(self))]
    pub async fn console_endpoint(&self, name: &str) -> Result<ConsoleEndpoint> {
        let handle = self.connections.acquire().await?;
        let session = handle.session();

        let domain = session.lookup_by_name(name).await?;
        if !session.is_active(&domain).await? {
            return Err(HypervisorError::InvalidState(format!("domain '{}' is not running", name)));
        }

        let mut port = vnc_port(session, &domain).await?;
        if port.is_none() {
            debug!("Console port not assigned yet, retrying");
            tokio::time::sleep(self.console_retry_delay).await;
            port = vnc_port(session, &domain).await?;
        }

        let port = port.ok_or_else(|| {
            HypervisorError::OperationFailed(format!("console port for '{}' is not assigned yet", name))
        })?;

        Ok(ConsoleEndpoint {
            host: self.console_host.clone(),
            port,
        })
    }

    fn in_flight_state(&self, name: &str) -> Result<Option<DomainState>> {
        let map = self
            .in_flight
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        Ok(map.get(name).copied())
    }
}

fn settled_state(active: bool) -> DomainState {
    if active {
        DomainState::Running
    } else {
        DomainState::DefinedStopped
    }
}

async fn vnc_port(session: &dyn ControlPlane, domain: &DomainRef) -> Result<Option<u16>> {
    let info = DescriptorInfo::parse(&session.xml_desc(domain).await?)?;
    let vnc = info
        .vnc
        .ok_or_else(|| HypervisorError::InvalidState(format!("domain '{}' has no VNC console", domain.name)))?;
    Ok(vnc.port)
}

/// Names of every running and defined domain.
async fn existing_names(session: &dyn ControlPlane) -> Result<HashSet<String>> {
    let mut names = HashSet::new();

    match session.list_defined_names().await {
        Ok(defined) => names.extend(defined),
        Err(e) if e.is_connection() => return Err(e),
        Err(e) => warn!(error = %e, "Failed to list defined domains"),
    }

    let ids = match session.list_active_ids().await {
        Ok(ids) => ids,
        Err(e) if e.is_connection() => return Err(e),
        Err(e) => {
            warn!(error = %e, "Failed to list active domains");
            Vec::new()
        }
    };

    for id in ids {
        match session.lookup_by_id(id).await {
            Ok(domain) => {
                names.insert(domain.name);
            }
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => warn!(id, error = %e, "Failed to look up active domain"),
        }
    }

    Ok(names)
}
