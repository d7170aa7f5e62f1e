//! Single-attempt distributed locks
//!
//! A lock is a store key set only-if-absent with a time-to-live and a random
//! token as its value. Releasing deletes the key only while it still holds
//! that token, so a lock that expired and was taken by someone else is never
//! deleted by its former holder.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use kvguard_common::{
    LockAcquisitionError, LockReleaseError, Logger, current_timestamp, duration_millis, log_debug,
    log_error,
};

use crate::connection::ConnectionManager;
use crate::error::ClientError;

/// A held lock.
///
/// Locks are released by value, so one acquisition is released at most once.
#[derive(Debug)]
#[must_use = "a lock that is never released is held until its ttl expires"]
pub struct Lock {
    resource: String,
    token: String,
    ttl: Duration,
    acquired_at: Instant,
    acquired_at_ms: i64,
}

impl Lock {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The value identifying this holder in the store.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Wall-clock acquisition time in Unix milliseconds.
    pub fn acquired_at(&self) -> i64 {
        self.acquired_at_ms
    }

    /// Time left before the store expires the lock.
    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }
}

/// Lock counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStats {
    pub acquisitions: u64,
    /// Attempts refused because the resource was held
    pub contended: u64,
    /// Attempts that failed on store errors
    pub acquire_failures: u64,
    pub releases: u64,
    pub release_failures: u64,
}

#[derive(Default)]
struct LockStatsCollector {
    acquisitions: AtomicU64,
    contended: AtomicU64,
    acquire_failures: AtomicU64,
    releases: AtomicU64,
    release_failures: AtomicU64,
}

impl LockStatsCollector {
    fn snapshot(&self) -> LockStats {
        LockStats {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            acquire_failures: self.acquire_failures.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
        }
    }
}

/// Acquires and releases locks over the shared connection.
#[derive(Clone)]
pub struct LockManager {
    connection: ConnectionManager,
    stats: Arc<LockStatsCollector>,
}

impl LockManager {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            stats: Arc::new(LockStatsCollector::default()),
        }
    }

    fn logger(&self) -> &Arc<dyn Logger> {
        self.connection.logger()
    }

    /// Try once to take `resource` for `ttl`. Never waits for a holder.
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Lock, LockAcquisitionError> {
        if ttl.is_zero() {
            return Err(LockAcquisitionError::InvalidTtl {
                resource: resource.to_string(),
                ttl,
            });
        }

        let token = uuid::Uuid::new_v4().to_string();
        let result = self
            .connection
            .execute(|conn| {
                let token = token.clone();
                async move { conn.set_if_absent(resource, &token, ttl).await }
            })
            .await;

        match result {
            Ok(true) => {
                self.stats.acquisitions.fetch_add(1, Ordering::Relaxed);
                log_debug!(
                    self.logger(),
                    "Acquired lock {} for {}ms",
                    resource,
                    duration_millis(ttl)
                );
                Ok(Lock {
                    resource: resource.to_string(),
                    token,
                    ttl,
                    acquired_at: Instant::now(),
                    acquired_at_ms: current_timestamp(),
                })
            }
            Ok(false) => {
                self.stats.contended.fetch_add(1, Ordering::Relaxed);
                Err(LockAcquisitionError::AlreadyLocked {
                    resource: resource.to_string(),
                })
            }
            Err(e) => {
                self.stats.acquire_failures.fetch_add(1, Ordering::Relaxed);
                self.report(&e);
                log_error!(self.logger(), "Failed to acquire lock {}: {}", resource, e);
                Err(LockAcquisitionError::Unavailable {
                    resource: resource.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Release a lock taken by [`acquire`](Self::acquire).
    ///
    /// Fails with `NotHeld` if the lock expired or now belongs to someone else.
    pub async fn release(&self, lock: Lock) -> Result<(), LockReleaseError> {
        let Lock {
            resource, token, ..
        } = lock;

        let result = self
            .connection
            .execute(|conn| {
                let resource = resource.clone();
                async move { conn.delete_if_equals(&resource, &token).await }
            })
            .await;

        match result {
            Ok(true) => {
                self.stats.releases.fetch_add(1, Ordering::Relaxed);
                log_debug!(self.logger(), "Released lock {}", resource);
                Ok(())
            }
            Ok(false) => {
                self.stats.release_failures.fetch_add(1, Ordering::Relaxed);
                Err(LockReleaseError::NotHeld { resource })
            }
            Err(e) => {
                self.stats.release_failures.fetch_add(1, Ordering::Relaxed);
                self.report(&e);
                Err(LockReleaseError::Unavailable {
                    resource,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn stats(&self) -> LockStats {
        self.stats.snapshot()
    }

    fn report(&self, error: &ClientError) {
        if let ClientError::Store(e) = error {
            self.connection.lock_client_error(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::connection::StoreEvent;
    use kvguard_common::RecordingLogger;
    use kvguard_store::MemoryStore;

    async fn manager(store: &MemoryStore) -> LockManager {
        let config = RawConfig::new("store://localhost")
            .with_max_connection_retries(1)
            .resolve()
            .unwrap();
        let connection = ConnectionManager::connect(
            config,
            Arc::new(store.clone()),
            Arc::new(RecordingLogger::new()),
        )
        .await
        .unwrap();
        LockManager::new(connection)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let store = MemoryStore::new();
        let locks = manager(&store).await;

        let lock = locks.acquire("orders", Duration::from_secs(5)).await.unwrap();
        assert_eq!(lock.resource(), "orders");
        assert_eq!(store.peek("orders").as_deref(), Some(lock.token()));
        assert!(!lock.is_expired());
        assert!(lock.remaining_ttl() <= Duration::from_secs(5));

        locks.release(lock).await.unwrap();
        assert!(store.peek("orders").is_none());

        let stats = locks.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.releases, 1);
    }

    #[tokio::test]
    async fn test_acquire_contended() {
        let store = MemoryStore::new();
        let locks = manager(&store).await;

        let held = locks.acquire("orders", Duration::from_secs(5)).await.unwrap();
        let err = locks
            .acquire("orders", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LockAcquisitionError::AlreadyLocked { .. }));
        assert_eq!(err.resource(), "orders");
        assert_eq!(locks.stats().contended, 1);

        locks.release(held).await.unwrap();
        let again = locks.acquire("orders", Duration::from_secs(5)).await.unwrap();
        locks.release(again).await.unwrap();
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let store = MemoryStore::new();
        let locks = manager(&store).await;

        let a = locks.acquire("a", Duration::from_secs(5)).await.unwrap();
        let b = locks.acquire("b", Duration::from_secs(5)).await.unwrap();
        assert_ne!(a.token(), b.token());
        locks.release(a).await.unwrap();
        locks.release(b).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_ttl_rejected() {
        let store = MemoryStore::new();
        let locks = manager(&store).await;

        let err = locks.acquire("orders", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, LockAcquisitionError::InvalidTtl { .. }));
        assert_eq!(store.stats().set_if_absent, 0);
    }

    #[tokio::test]
    async fn test_release_after_expiry_is_not_held() {
        let store = MemoryStore::new();
        let locks = manager(&store).await;

        let lock = locks
            .acquire("orders", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(lock.is_expired());
        assert_eq!(lock.remaining_ttl(), Duration::ZERO);

        // Someone else takes the expired lock
        let other = locks.acquire("orders", Duration::from_secs(5)).await.unwrap();

        let err = locks.release(lock).await.unwrap_err();
        assert!(matches!(err, LockReleaseError::NotHeld { .. }));
        assert_eq!(store.peek("orders").as_deref(), Some(other.token()));
        locks.release(other).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_failure_emits_lock_client_error() {
        let store = MemoryStore::new();
        let locks = manager(&store).await;
        let mut events = locks.connection.subscribe();

        store.fail_commands(true);
        let err = locks
            .acquire("orders", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LockAcquisitionError::Unavailable { .. }));
        assert!(matches!(
            events.recv().await.unwrap(),
            StoreEvent::LockClientError(_)
        ));
        assert_eq!(locks.stats().acquire_failures, 1);
    }

    #[tokio::test]
    async fn test_release_store_failure() {
        let store = MemoryStore::new();
        let locks = manager(&store).await;

        let lock = locks.acquire("orders", Duration::from_secs(5)).await.unwrap();
        store.fail_commands(true);
        let err = locks.release(lock).await.unwrap_err();
        assert!(matches!(err, LockReleaseError::Unavailable { .. }));
        assert_eq!(locks.stats().release_failures, 1);
    }

    #[tokio::test]
    async fn test_stats_serialize_camel_case() {
        let store = MemoryStore::new();
        let locks = manager(&store).await;

        let lock = locks.acquire("orders", Duration::from_secs(5)).await.unwrap();
        let _ = locks.acquire("orders", Duration::from_secs(5)).await;
        locks.release(lock).await.unwrap();

        let value = serde_json::to_value(locks.stats()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "acquisitions": 1,
                "contended": 1,
                "acquireFailures": 0,
                "releases": 1,
                "releaseFailures": 0
            })
        );
        let parsed: LockStats = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, locks.stats());
    }
}
