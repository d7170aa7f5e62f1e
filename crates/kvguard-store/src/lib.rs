//! kvguard Store - the seam between kvguard and a key-value store
//!
//! This crate provides:
//! - `Connector`: opens connections to a store endpoint
//! - `StoreConnection`: the command set kvguard issues against an open connection
//! - `GlobPattern`: glob-style key patterns for scans
//! - `MemoryStore`: an in-process backend with expiry and fault injection
//!
//! Wire protocols live behind `Connector` implementations; this crate does not
//! speak any of them.

pub mod memory;
pub mod pattern;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use kvguard_common::{StoreError, StoreResult};
pub use memory::{MemoryConnection, MemoryStore, MemoryStoreStats};
pub use pattern::GlobPattern;

/// Where a store lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// The full URI the endpoint was resolved from
    pub uri: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(uri: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            uri: uri.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens connections to a store.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Make one connection attempt. Retrying is the caller's job.
    async fn connect(&self, endpoint: &Endpoint) -> StoreResult<Arc<dyn StoreConnection>>;
}

/// Commands available on an open store connection.
///
/// Commands issued sequentially on one connection reach the store in issue
/// order. A `StoreError::Connection` result means the connection is broken
/// and every later command on it will fail the same way.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    /// Value of a string key, `None` if absent or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a string key, clearing any expiry.
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Set a string key only if it does not exist, expiring after `ttl`.
    /// Returns whether the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete a string key only if it currently holds `expected`.
    /// Returns whether the key was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Append to the tail of a list, returning its new length.
    async fn list_push(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Remove and return the head of a list.
    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>>;

    /// All live keys matching a glob pattern.
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    async fn ping(&self) -> StoreResult<()>;

    /// Close the connection. Later commands fail with `StoreError::Connection`.
    async fn close(&self) -> StoreResult<()>;
}
