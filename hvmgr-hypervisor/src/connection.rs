//! Connection manager.
//!
//! Owns the one authoritative session slot. Callers borrow an
//! `Arc<ConnectionHandle>` for the duration of a single operation and never
//! cache it. A reconnect takes the slot's write lock, swaps the handle and
//! releases, so an in-flight operation either finishes against the handle it
//! started with or sees that handle fail its liveness check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::tasks::TaskHandle;
use crate::traits::{Connector, ControlPlane};

/// Default libvirt connection URI.
pub const DEFAULT_URI: &str = "qemu:///system";

const EVENT_CAPACITY: usize = 16;

/// An open session to the control plane.
pub struct ConnectionHandle {
    uri: String,
    hostname: String,
    generation: u64,
    session: Arc<dyn ControlPlane>,
}

impl ConnectionHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Host identity reported when the session was opened.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Monotonic counter distinguishing successive sessions.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn session(&self) -> &dyn ControlPlane {
        self.session.as_ref()
    }

    pub async fn is_alive(&self) -> bool {
        self.session.is_alive().await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("uri", &self.uri)
            .field("hostname", &self.hostname)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { uri: String, hostname: String },
    /// The slot now holds a new session; cached listings are stale.
    Reconnected { uri: String, hostname: String, generation: u64 },
    ReconnectFailed { uri: String, reason: String },
    Disconnected { uri: String },
}

#[derive(Default)]
struct Slot {
    handle: Option<Arc<ConnectionHandle>>,
    last_uri: Option<String>,
}

/// Owner of the control-plane connection.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    slot: RwLock<Slot>,
    generation: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connector,
            slot: RwLock::new(Slot::default()),
            generation: AtomicU64::new(0),
            events,
        }
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Open a session to `uri` and install it in the slot.
    ///
    /// A previously held session is closed once the new one is in place. On
    /// failure the slot keeps whatever it held before, but `uri` becomes the
    /// target for later reconnects.
    #[instrument(skip(self), fields(uri = %uri))]
    pub async fn connect(&self, uri: &str) -> Result<Arc<ConnectionHandle>> {
        let mut slot = self.slot.write().await;
        slot.last_uri = Some(uri.to_string());

        let handle = self.open_handle(uri).await?;
        let previous = slot.handle.replace(handle.clone());
        drop(slot);

        match previous {
            Some(old) => {
                close_quietly(&old).await;
                self.emit(ConnectionEvent::Reconnected {
                    uri: handle.uri.clone(),
                    hostname: handle.hostname.clone(),
                    generation: handle.generation,
                });
            }
            None => self.emit(ConnectionEvent::Connected {
                uri: handle.uri.clone(),
                hostname: handle.hostname.clone(),
            }),
        }

        Ok(handle)
    }

    /// Run [`connect`](Self::connect) as a background task.
    pub fn spawn_connect(self: &Arc<Self>, uri: impl Into<String>) -> TaskHandle<Arc<ConnectionHandle>> {
        let manager = Arc::clone(self);
        let uri = uri.into();
        TaskHandle::spawn("connect", async move { manager.connect(&uri).await })
    }

    /// Snapshot of the slot without any liveness check.
    pub async fn current(&self) -> Option<Arc<ConnectionHandle>> {
        self.slot.read().await.handle.clone()
    }

    /// URI used for reconnects.
    pub async fn last_uri(&self) -> Option<String> {
        self.slot.read().await.last_uri.clone()
    }

    /// Probe `handle`, reconnecting once with the last-known URI if it is dead.
    ///
    /// Returns whether the slot holds a live session afterwards. Callers must
    /// fetch that session again; `handle` itself is never revived.
    pub async fn ensure_live(&self, handle: &ConnectionHandle) -> bool {
        if handle.is_alive().await {
            return true;
        }

        warn!(uri = %handle.uri, generation = handle.generation, "Connection lost, attempting to reconnect");
        self.reconnect_from(Some(handle.generation)).await.is_ok()
    }

    /// A live handle for one operation, or a connection error.
    pub async fn acquire(&self) -> Result<Arc<ConnectionHandle>> {
        let current = self.current().await;

        let handle = match current {
            Some(handle) => handle,
            None => return self.reconnect_from(None).await,
        };

        if handle.is_alive().await {
            return Ok(handle);
        }

        warn!(uri = %handle.uri, generation = handle.generation, "Connection lost, attempting to reconnect");
        self.reconnect_from(Some(handle.generation)).await
    }

    /// Close the current session and empty the slot.
    ///
    /// The last URI is forgotten too, so [`acquire`](Self::acquire) fails
    /// until the next explicit [`connect`](Self::connect).
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let previous = {
            let mut slot = self.slot.write().await;
            slot.last_uri = None;
            slot.handle.take()
        };

        if let Some(handle) = previous {
            close_quietly(&handle).await;
            info!(uri = %handle.uri, "Connection closed");
            self.emit(ConnectionEvent::Disconnected { uri: handle.uri.clone() });
        }
    }

    /// One reconnect attempt, unless another task already replaced `stale`.
    async fn reconnect_from(&self, stale: Option<u64>) -> Result<Arc<ConnectionHandle>> {
        let mut slot = self.slot.write().await;

        if let Some(current) = slot.handle.clone() {
            if Some(current.generation) != stale && current.is_alive().await {
                return Ok(current);
            }
        }

        let uri = slot.last_uri.clone().ok_or_else(|| {
            HypervisorError::Connection("not connected and no previous URI to reconnect to".to_string())
        })?;

        match self.open_handle(&uri).await {
            Ok(handle) => {
                let previous = slot.handle.replace(handle.clone());
                drop(slot);

                if let Some(old) = previous {
                    close_quietly(&old).await;
                }

                info!(uri = %uri, generation = handle.generation, "Reconnected to hypervisor");
                self.emit(ConnectionEvent::Reconnected {
                    uri,
                    hostname: handle.hostname.clone(),
                    generation: handle.generation,
                });
                Ok(handle)
            }
            Err(e) => {
                drop(slot);
                warn!(uri = %uri, error = %e, "Reconnect failed");
                self.emit(ConnectionEvent::ReconnectFailed {
                    uri,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn open_handle(&self, uri: &str) -> Result<Arc<ConnectionHandle>> {
        info!(uri = %uri, "Connecting to hypervisor");

        let session = self.connector.open(uri).await?;
        let hostname = match session.hostname().await {
            Ok(hostname) => hostname,
            Err(e) => {
                close_session_quietly(session.as_ref()).await;
                return Err(HypervisorError::Connection(format!(
                    "connected to {} but could not read host identity: {}",
                    uri, e
                )));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(uri = %uri, hostname = %hostname, generation, "Connected to hypervisor");

        Ok(Arc::new(ConnectionHandle {
            uri: uri.to_string(),
            hostname,
            generation,
            session,
        }))
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn close_quietly(handle: &ConnectionHandle) {
    close_session_quietly(handle.session()).await;
}

async fn close_session_quietly(session: &dyn ControlPlane) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "Failed to close hypervisor session");
    }
}
