//! Connection registry.
//!
//! Maps logical names to their connection handles and owns the lifecycle of
//! every handle: creation (at most one per name), initialization from a
//! [`ConfigSet`], forced re-initialization and shutdown.
//!
//! The registry is an explicit context object. Construct one in the
//! application's composition root and pass clones of it down; clones share
//! the same state.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = ConnectionRegistry::new(TcpConnector);
//! let config = ConfigSet::new()
//!     .with("default", ConnectionOptions::new("127.0.0.1", 6379))
//!     .with("cache", ConnectionOptions::new("cache.internal", 6379));
//!
//! let router = registry.init(&config, false).await?;
//! router.set("greeting", "hello").await?;
//! let cache = router.connection("cache")?;
//!
//! registry.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::{Client, ConnectionState};
use crate::commands::Commands;
use crate::config::{ConfigSet, ConnectionOptions, DEFAULT_CONNECTION};
use crate::error::RegistryError;
use crate::factory::ClientFactory;
use crate::router::DefaultRouter;
use crate::transport::{Connector, TcpConnector};

/// Overall registry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryStatus {
    /// `init` has not run, or `shutdown` has.
    Uninitialized,
    /// Every configured connection is registered.
    Ready,
    /// Initialized, but these connections ended on their own and were
    /// removed. A forced re-init restores them.
    Degraded { missing: Vec<String> },
}

/// Health of one registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    pub name: String,
    pub state: ConnectionState,
    /// Whether a `PING` succeeded.
    pub healthy: bool,
}

/// Health of every registered connection.
#[derive(Debug, Clone)]
pub struct RegistryHealth {
    pub status: RegistryStatus,
    pub connections: Vec<ConnectionHealth>,
}

impl RegistryHealth {
    /// Returns true if the registry is ready and every connection answered.
    pub fn is_healthy(&self) -> bool {
        self.status == RegistryStatus::Ready && self.connections.iter().all(|c| c.healthy)
    }
}

struct RegistryInner {
    /// Live handles by name.
    connections: DashMap<String, Client>,
    initialized: AtomicBool,
    /// Names removed after their handle ended while initialized.
    evicted: DashSet<String>,
    factory: ClientFactory,
    /// Serializes `init` and `shutdown`.
    lifecycle: Mutex<()>,
}

impl RegistryInner {
    /// Drop `name` if it is still registered to the handle `id`.
    fn evict(&self, name: &str, id: Uuid) {
        if self
            .connections
            .remove_if(name, |_, client| client.id() == id)
            .is_some()
        {
            if self.initialized.load(Ordering::SeqCst) {
                self.evicted.insert(name.to_string());
            }
            warn!(connection = %name, "Connection ended and was removed from the registry");
        }
    }
}

/// Process-wide table of named connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.names())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(TcpConnector)
    }
}

impl ConnectionRegistry {
    /// Create an empty registry whose handles dial through `connector`.
    pub fn new(connector: impl Connector) -> Self {
        info!("Creating connection registry");
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                initialized: AtomicBool::new(false),
                evicted: DashSet::new(),
                factory: ClientFactory::new(connector),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Get the handle for `name`, creating it if it does not exist yet.
    ///
    /// A second call for the same name returns the same handle and opens no
    /// new connection.
    #[instrument(skip_all, fields(connection = %name))]
    pub fn create_instance(&self, name: &str, options: &ConnectionOptions) -> Client {
        let (client, driver) = match self.inner.connections.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                debug!("Reusing existing connection");
                return entry.get().clone();
            }
            Entry::Vacant(entry) => {
                let (client, driver) = self.inner.factory.build(name, options.clone());
                entry.insert(client.clone());
                (client, driver)
            }
        };

        debug!(address = %options.address(), "Created connection");
        let registry = Arc::downgrade(&self.inner);
        let (owned_name, id) = (name.to_string(), client.id());
        self.inner.factory.spawn(&client, driver, move || {
            if let Some(inner) = registry.upgrade() {
                inner.evict(&owned_name, id);
            }
        });

        client
    }

    /// Populate the registry from `config` and return the default router.
    ///
    /// If the registry is already initialized and `force` is false, nothing
    /// changes and a router over the existing connections is returned. With
    /// `force`, every existing connection is shut down first.
    #[instrument(skip(self, config), fields(connections = config.len()))]
    pub async fn init(
        &self,
        config: &ConfigSet,
        force: bool,
    ) -> Result<DefaultRouter, RegistryError> {
        let _guard = self.inner.lifecycle.lock().await;

        if self.is_initialized() && !force {
            debug!("Registry already initialized");
            return Ok(self.router());
        }

        if !config.contains(DEFAULT_CONNECTION) {
            return Err(RegistryError::MissingDefault);
        }
        config.validate()?;

        if force {
            self.shutdown_locked().await;
        }

        for (name, options) in config.iter() {
            self.create_instance(name, options);
        }
        self.inner.evicted.clear();
        self.inner.initialized.store(true, Ordering::SeqCst);

        info!(names = ?self.names(), "Connection registry initialized");
        Ok(self.router())
    }

    /// Close every connection and clear the registry.
    ///
    /// Does nothing unless initialized. Closes run concurrently; the registry
    /// is cleared once all of them settled, whether or not they succeeded.
    pub async fn shutdown(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.shutdown_locked().await;
    }

    async fn shutdown_locked(&self) {
        if !self.is_initialized() {
            debug!("Registry not initialized, nothing to shut down");
            return;
        }

        let clients: Vec<Client> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(count = clients.len(), "Shutting down connections");

        let closes = clients.iter().map(|client| async move {
            (client.name().to_string(), client.quit().await)
        });
        for (name, result) in join_all(closes).await {
            if let Err(error) = result {
                warn!(connection = %name, error = %error, "Connection did not close cleanly");
            }
        }

        self.inner.connections.clear();
        self.inner.evicted.clear();
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("Connection registry shut down");
    }

    /// Get the handle registered under `name`.
    pub fn lookup(&self, name: &str) -> Result<Client, RegistryError> {
        self.inner
            .connections
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// A router over this registry.
    ///
    /// Resolution fails with [`RegistryError::NotFound`] until a `default`
    /// connection is registered.
    pub fn router(&self) -> DefaultRouter {
        DefaultRouter::new(self.clone())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    pub fn status(&self) -> RegistryStatus {
        if !self.is_initialized() {
            return RegistryStatus::Uninitialized;
        }
        let mut missing: Vec<String> = self.inner.evicted.iter().map(|n| n.key().clone()).collect();
        if missing.is_empty() {
            RegistryStatus::Ready
        } else {
            missing.sort();
            RegistryStatus::Degraded { missing }
        }
    }

    /// Ping every connection concurrently.
    ///
    /// A connection that is still dialing answers once it is ready; one that
    /// cannot connect fails after the per-request retry limit.
    #[instrument(skip_all)]
    pub async fn health_check(&self) -> RegistryHealth {
        let clients: Vec<Client> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let checks = clients.iter().map(|client| async move {
            let healthy = client.ping().await.is_ok();
            ConnectionHealth {
                name: client.name().to_string(),
                state: client.state(),
                healthy,
            }
        });
        let mut connections = join_all(checks).await;
        connections.sort_by(|a, b| a.name.cmp(&b.name));

        RegistryHealth {
            status: self.status(),
            connections,
        }
    }
}
