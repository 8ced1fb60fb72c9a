//! Domain inventory.
//!
//! Listings are rebuilt from scratch on every refresh. Inactive domains get
//! synthetic display IDs starting at [`SYNTHETIC_ID_BASE`]; those IDs never
//! address a domain, names do.

use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager};
use crate::error::Result;
use crate::network::NetworkValidator;
use crate::traits::ControlPlane;
use crate::types::{DisplayId, DomainRecord, DomainRef, SYNTHETIC_ID_BASE};

/// Read model of the domains on one host.
#[derive(Default)]
pub struct Inventory {
    snapshot: RwLock<Vec<DomainRecord>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate every domain on the host, running ones first.
    ///
    /// A failed active or inactive enumeration is logged and that half is
    /// treated as empty. A failed detail lookup drops only that domain.
    /// Connection errors always propagate.
    #[instrument(skip(handle), fields(uri = %handle.uri()))]
    pub async fn list_all(handle: &ConnectionHandle) -> Result<Vec<DomainRecord>> {
        let session = handle.session();
        let mut records = Vec::new();

        let active_ids = match session.list_active_ids().await {
            Ok(ids) => ids,
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to list active domains");
                Vec::new()
            }
        };

        for id in active_ids {
            let domain = match session.lookup_by_id(id).await {
                Ok(domain) => domain,
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => {
                    warn!(id, error = %e, "Active domain vanished during listing");
                    continue;
                }
            };
            if let Some(record) = record_for(session, &domain, true, DisplayId::Active(id)).await? {
                records.push(record);
            }
        }

        let defined = match session.list_defined_names().await {
            Ok(names) => names,
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Failed to list defined domains");
                Vec::new()
            }
        };

        for (offset, name) in defined.into_iter().enumerate() {
            // Consumed even if the lookup below fails, so IDs follow enumeration order.
            let id = DisplayId::Synthetic(SYNTHETIC_ID_BASE + offset as u32);
            let domain = DomainRef::new(name, None);
            if let Some(record) = record_for(session, &domain, false, id).await? {
                records.push(record);
            }
        }

        debug!(count = records.len(), "Listed domains");
        Ok(records)
    }

    /// Rebuild the snapshot from the control plane.
    pub async fn refresh(&self, manager: &ConnectionManager) -> Result<Vec<DomainRecord>> {
        let handle = manager.acquire().await?;
        let records = Self::list_all(&handle).await?;
        *self.snapshot.write().await = records.clone();
        Ok(records)
    }

    /// The listing produced by the last successful refresh.
    pub async fn snapshot(&self) -> Vec<DomainRecord> {
        self.snapshot.read().await.clone()
    }

    /// Refresh the snapshot and invalidate the network catalog on every reconnect.
    pub fn watch_reconnects(
        self: &Arc<Self>,
        manager: Arc<ConnectionManager>,
        networks: Arc<NetworkValidator>,
    ) -> JoinHandle<()> {
        let inventory = Arc::clone(self);
        let mut events = manager.subscribe();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Reconnected { generation, .. }) => {
                        info!(generation, "Reconnected, refreshing inventory");
                        networks.invalidate().await;
                        if let Err(e) = inventory.refresh(&manager).await {
                            warn!(error = %e, "Inventory refresh after reconnect failed");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed connection events, refreshing inventory");
                        networks.invalidate().await;
                        let _ = inventory.refresh(&manager).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn record_for(
    session: &dyn ControlPlane,
    domain: &DomainRef,
    running: bool,
    id: DisplayId,
) -> Result<Option<DomainRecord>> {
    let details = async {
        let memory_kib = session.max_memory_kib(domain).await?;
        let vcpus = session.max_vcpus(domain).await?;
        let autostart = session.autostart(domain).await?;
        Ok::<_, crate::error::HypervisorError>((memory_kib, vcpus, autostart))
    };

    match details.await {
        Ok((memory_kib, vcpus, autostart)) => Ok(Some(DomainRecord {
            name: domain.name.clone(),
            running,
            id,
            memory_mib: memory_kib / 1024,
            vcpus,
            autostart,
        })),
        Err(e) if e.is_connection() => Err(e),
        Err(e) => {
            warn!(vm_name = %domain.name, error = %e, "Failed to read domain details, skipping");
            Ok(None)
        }
    }
}
