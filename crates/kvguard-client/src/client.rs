//! The kvguard client facade
//!
//! `KvGuardClient` bundles the resolved configuration, the connection
//! manager, the lock manager and the mutation guard behind one handle, and
//! exposes the store commands applications use directly.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};

use kvguard_common::{
    ConnectionError, LockAcquisitionError, LockReleaseError, Logger, ShutdownError,
    default_logger,
};
use kvguard_store::Connector;

use crate::config::Configuration;
use crate::connection::{ConnectionManager, ConnectionState, StoreEvent};
use crate::error::Result;
use crate::guard::{MutationGuard, MutationOutcome};
use crate::lock::LockManager;

/// Builds a [`KvGuardClient`].
pub struct KvGuardClientBuilder {
    config: Configuration,
    logger: Option<Arc<dyn Logger>>,
}

impl KvGuardClientBuilder {
    /// Route log output to `logger` instead of `tracing`.
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub async fn connect(
        self,
        connector: Arc<dyn Connector>,
    ) -> std::result::Result<KvGuardClient, ConnectionError> {
        let logger = self.logger.unwrap_or_else(default_logger);
        let connection = ConnectionManager::connect(self.config, connector, logger.clone()).await?;
        let locks = LockManager::new(connection.clone());
        let guard = MutationGuard::new(locks.clone(), logger);
        Ok(KvGuardClient {
            connection,
            locks,
            guard,
        })
    }
}

/// A connected store client.
///
/// Cloning is cheap; clones share the connection.
#[derive(Clone)]
pub struct KvGuardClient {
    connection: ConnectionManager,
    locks: LockManager,
    guard: MutationGuard,
}

impl KvGuardClient {
    pub fn builder(config: Configuration) -> KvGuardClientBuilder {
        KvGuardClientBuilder {
            config,
            logger: None,
        }
    }

    /// Connect with the default logger.
    pub async fn connect(
        config: Configuration,
        connector: Arc<dyn Connector>,
    ) -> std::result::Result<Self, ConnectionError> {
        Self::builder(config).connect(connector).await
    }

    pub fn config(&self) -> &Configuration {
        self.connection.config()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn guard(&self) -> &MutationGuard {
        &self.guard
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.connection.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn reconnect(&self) -> std::result::Result<(), ConnectionError> {
        self.connection.reconnect().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.connection.ping().await
    }

    pub async fn shutdown(&self) -> std::result::Result<(), ShutdownError> {
        self.connection.shutdown().await
    }

    // ============== Commands ==============

    /// Read a JSON-encoded value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.connection
            .execute(|conn| async move { conn.get(key).await })
            .await
    }

    /// Store a value as JSON.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, &raw).await
    }

    pub async fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        self.connection
            .execute(|conn| async move { conn.set(key, value).await })
            .await
    }

    /// Delete keys, returning how many existed.
    pub async fn del<K: AsRef<str>>(&self, keys: &[K]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();
        self.connection
            .execute(|conn| async move { conn.del(&keys).await })
            .await
    }

    /// Append a JSON-encoded value to the tail of a list.
    pub async fn list_push<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<u64> {
        let raw = serde_json::to_string(value)?;
        self.list_push_raw(key, &raw).await
    }

    pub async fn list_push_raw(&self, key: &str, value: &str) -> Result<u64> {
        self.connection
            .execute(|conn| async move { conn.list_push(key, value).await })
            .await
    }

    /// Pop the head of a list. With [`list_push`](Self::list_push) this
    /// gives FIFO order.
    pub async fn list_pop<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.list_pop_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn list_pop_raw(&self, key: &str) -> Result<Option<String>> {
        self.connection
            .execute(|conn| async move { conn.list_pop(key).await })
            .await
    }

    /// Keys matching a glob pattern, sorted.
    pub async fn scan_keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>> {
        self.connection
            .execute(|conn| async move { conn.scan(pattern).await })
            .await
    }

    // ============== Locking ==============

    /// See [`MutationGuard::protected_mutation`].
    pub async fn protected_mutation<T, E, F, Fut>(
        &self,
        resource: &str,
        ttl: Duration,
        mutation: F,
    ) -> std::result::Result<MutationOutcome<T, E>, LockAcquisitionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
    {
        self.guard.protected_mutation(resource, ttl, mutation).await
    }

    /// See [`MutationGuard::protected_mutation_with`].
    pub async fn protected_mutation_with<T, E, F, Fut, R>(
        &self,
        resource: &str,
        ttl: Duration,
        mutation: F,
        on_failed_release: R,
    ) -> std::result::Result<MutationOutcome<T, E>, LockAcquisitionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Display,
        R: FnOnce(LockReleaseError),
    {
        self.guard
            .protected_mutation_with(resource, ttl, mutation, on_failed_release)
            .await
    }
}

impl fmt::Debug for KvGuardClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvGuardClient")
            .field("connection", &self.connection)
            .finish()
    }
}
