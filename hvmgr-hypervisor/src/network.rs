//! Virtual network prerequisites.

use std::collections::BTreeSet;

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::connection::ConnectionHandle;
use crate::error::{HypervisorError, Result};

/// Confirms target networks exist and are active.
///
/// Holds a catalog of known network names for presenting choices. The
/// catalog is cached until [`invalidate`](Self::invalidate) is called,
/// which happens on every reconnect.
#[derive(Default)]
pub struct NetworkValidator {
    catalog: RwLock<Option<BTreeSet<String>>>,
}

impl NetworkValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `name` exists and is active, starting it if it is only defined.
    #[instrument(skip(self, handle), fields(network = %name))]
    pub async fn ensure_network_active(&self, handle: &ConnectionHandle, name: &str) -> Result<()> {
        let session = handle.session();

        let network = match session.lookup_network(name).await {
            Ok(network) => network,
            Err(HypervisorError::NotFound(e)) => {
                let available = self.fetch_catalog(handle).await?;
                warn!(error = %e, available = ?available, "Network not found");
                return Err(HypervisorError::Network {
                    name: name.to_string(),
                    reason: "network not found".to_string(),
                    available,
                });
            }
            Err(e) => return Err(e),
        };

        if session.network_is_active(&network).await? {
            return Ok(());
        }

        info!("Network is inactive, starting it");
        match session.start_network(&network).await {
            Ok(()) => {}
            Err(e) if e.is_connection() => return Err(e),
            Err(e) => {
                return Err(HypervisorError::Network {
                    name: name.to_string(),
                    reason: format!("failed to start network: {}", e),
                    available: BTreeSet::new(),
                })
            }
        }

        info!("Network started");
        Ok(())
    }

    /// Active and defined network names, from cache when possible.
    pub async fn available_networks(&self, handle: &ConnectionHandle) -> Result<BTreeSet<String>> {
        if let Some(cached) = self.catalog.read().await.as_ref() {
            return Ok(cached.clone());
        }
        self.fetch_catalog(handle).await
    }

    /// Drop the cached catalog.
    pub async fn invalidate(&self) {
        *self.catalog.write().await = None;
    }

    async fn fetch_catalog(&self, handle: &ConnectionHandle) -> Result<BTreeSet<String>> {
        let session = handle.session();
        let mut names = BTreeSet::new();

        // One failing half still leaves the other as remediation data.
        for listing in [session.list_networks().await, session.list_defined_networks().await] {
            match listing {
                Ok(list) => names.extend(list),
                Err(e) if e.is_connection() => return Err(e),
                Err(e) => warn!(error = %e, "Failed to list networks"),
            }
        }

        *self.catalog.write().await = Some(names.clone());
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::connection::ConnectionManager;
    use crate::mock::{Fault, MockHost};

    async fn connect(host: &Arc<MockHost>) -> Arc<ConnectionHandle> {
        ConnectionManager::new(Arc::new(host.connector()))
            .connect("test:///default")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_active_network_passes() {
        let host = MockHost::new("hv-01").with_network("default", true);
        let handle = connect(&host).await;

        NetworkValidator::new().ensure_network_active(&handle, "default").await.unwrap();
    }

    #[tokio::test]
    async fn test_inactive_network_is_started() {
        let host = MockHost::new("hv-01").with_network("default", false);
        let handle = connect(&host).await;

        NetworkValidator::new().ensure_network_active(&handle, "default").await.unwrap();
        assert_eq!(host.network_active("default"), Some(true));
    }

    #[tokio::test]
    async fn test_missing_network_lists_alternatives() {
        let host = MockHost::new("hv-01")
            .with_network("default", true)
            .with_network("isolated", false);
        let handle = connect(&host).await;

        let err = NetworkValidator::new()
            .ensure_network_active(&handle, "lab")
            .await
            .unwrap_err();
        match err {
            HypervisorError::Network { name, available, .. } => {
                assert_eq!(name, "lab");
                assert_eq!(available.into_iter().collect::<Vec<_>>(), vec!["default", "isolated"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_networks_is_an_error() {
        let host = MockHost::new("hv-01");
        let handle = connect(&host).await;

        let err = NetworkValidator::new()
            .ensure_network_active(&handle, "default")
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Network { ref available, .. } if available.is_empty()));
    }

    #[tokio::test]
    async fn test_start_failure_is_network_error() {
        let host = MockHost::new("hv-01").with_network("default", false);
        host.set_fault(Fault::NetworkStart, true);
        let handle = connect(&host).await;

        let err = NetworkValidator::new()
            .ensure_network_active(&handle, "default")
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Network { .. }));
    }

    #[tokio::test]
    async fn test_lookup_failure_is_not_reported_as_missing() {
        let host = MockHost::new("hv-01").with_network("default", true);
        host.set_fault(Fault::NetworkLookup, true);
        let handle = connect(&host).await;

        let err = NetworkValidator::new()
            .ensure_network_active(&handle, "default")
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::OperationFailed(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_catalog_cached_until_invalidated() {
        let host = MockHost::new("hv-01").with_network("default", true);
        let handle = connect(&host).await;
        let validator = NetworkValidator::new();

        assert_eq!(validator.available_networks(&handle).await.unwrap().len(), 1);
        host.add_network("isolated", false);
        assert_eq!(validator.available_networks(&handle).await.unwrap().len(), 1);

        validator.invalidate().await;
        assert_eq!(validator.available_networks(&handle).await.unwrap().len(), 2);
    }
}
