//! In-memory store backend
//!
//! `MemoryStore` keeps string values and lists in a `DashMap` with per-key
//! expiry, and implements `Connector` so it can stand in for a remote store.
//! Expired keys are purged lazily when touched.
//!
//! Fault injection:
//! - `set_reachable(false)` refuses new connections and breaks every open one.
//!   Broken connections stay broken after the store becomes reachable again.
//! - `fail_next_connects(n)` refuses the next `n` connection attempts.
//! - `fail_commands(true)` makes commands fail with `StoreError::Command`.
//! - `fail_close(true)` makes `close()` fail.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::pattern::GlobPattern;
use crate::{Connector, Endpoint, StoreConnection, StoreError, StoreResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn persistent(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Command counters, snapshot of `MemoryStore::stats()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub connect_attempts: u64,
    pub connections: u64,
    pub gets: u64,
    pub sets: u64,
    pub set_if_absent: u64,
    pub delete_if_equals: u64,
    pub dels: u64,
    pub list_pushes: u64,
    pub list_pops: u64,
    pub scans: u64,
    pub closes: u64,
}

#[derive(Default)]
struct StatsCollector {
    connect_attempts: AtomicU64,
    connections: AtomicU64,
    gets: AtomicU64,
    sets: AtomicU64,
    set_if_absent: AtomicU64,
    delete_if_equals: AtomicU64,
    dels: AtomicU64,
    list_pushes: AtomicU64,
    list_pops: AtomicU64,
    scans: AtomicU64,
    closes: AtomicU64,
}

impl StatsCollector {
    fn snapshot(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            set_if_absent: self.set_if_absent.load(Ordering::Relaxed),
            delete_if_equals: self.delete_if_equals.load(Ordering::Relaxed),
            dels: self.dels.load(Ordering::Relaxed),
            list_pushes: self.list_pushes.load(Ordering::Relaxed),
            list_pops: self.list_pops.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    data: DashMap<String, Slot>,
    reachable: AtomicBool,
    /// Bumped whenever the store becomes unreachable; connections from an
    /// older generation are broken.
    generation: AtomicU64,
    failing_connects: AtomicU32,
    fail_commands: AtomicBool,
    fail_close: AtomicBool,
    stats: StatsCollector,
}

impl Inner {
    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.data.remove_if(key, |_, slot| !slot.is_live(now));
    }
}

/// An in-process key-value store. Cloning shares the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                data: DashMap::new(),
                reachable: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                failing_connects: AtomicU32::new(0),
                fail_commands: AtomicBool::new(false),
                fail_close: AtomicBool::new(false),
                stats: StatsCollector::default(),
            }),
        }
    }

    /// Make the store reachable or not. Going unreachable breaks every open
    /// connection for good.
    pub fn set_reachable(&self, reachable: bool) {
        if !reachable {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_commands(&self, fail: bool) {
        self.inner.fail_commands.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.inner.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self) -> MemoryStoreStats {
        self.inner.stats.snapshot()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .data
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a string key directly, bypassing connections and fault injection.
    pub fn peek(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.inner
            .data
            .get(key)
            .filter(|slot| slot.is_live(now))
            .and_then(|slot| match &slot.value {
                Value::Str(s) => Some(s.clone()),
                Value::List(_) => None,
            })
    }

    pub fn clear(&self) {
        self.inner.data.clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(&self, endpoint: &Endpoint) -> StoreResult<Arc<dyn StoreConnection>> {
        self.inner
            .stats
            .connect_attempts
            .fetch_add(1, Ordering::Relaxed);

        if !self.is_reachable() {
            return Err(StoreError::Connection(format!(
                "connection refused: {}",
                endpoint
            )));
        }

        let refused = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StoreError::Connection(format!(
                "connection refused: {}",
                endpoint
            )));
        }

        self.inner.stats.connections.fetch_add(1, Ordering::Relaxed);
        debug!("Memory store accepted connection for {}", endpoint);

        Ok(Arc::new(MemoryConnection {
            inner: self.inner.clone(),
            generation: self.inner.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection to a `MemoryStore`.
pub struct MemoryConnection {
    inner: Arc<Inner>,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection closed".to_string()));
        }
        if !self.inner.reachable.load(Ordering::SeqCst)
            || self.inner.generation.load(Ordering::SeqCst) != self.generation
        {
            return Err(StoreError::Connection(
                "connection reset by peer".to_string(),
            ));
        }
        if self.inner.fail_commands.load(Ordering::SeqCst) {
            return Err(StoreError::Command("injected command failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.stats.gets.fetch_add(1, Ordering::Relaxed);
        self.inner.purge_expired(key);

        match self.inner.data.get(key) {
            Some(slot) => match &slot.value {
                Value::Str(s) => Ok(Some(s.clone())),
                Value::List(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.stats.sets.fetch_add(1, Ordering::Relaxed);
        self.inner.data.insert(
            key.to_string(),
            Slot::persistent(Value::Str(value.to_string())),
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check()?;
        self.inner
            .stats
            .set_if_absent
            .fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let slot = Slot {
            value: Value::Str(value.to_string()),
            expires_at: now.checked_add(ttl),
        };

        match self.inner.data.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_live(now) {
                    Ok(false)
                } else {
                    entry.insert(slot);
                    Ok(true)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(slot);
                Ok(true)
            }
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        self.check()?;
        self.inner
            .stats
            .delete_if_equals
            .fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let removed = self
            .inner
            .data
            .remove_if(key, |_, slot| {
                slot.is_live(now) && matches!(&slot.value, Value::Str(v) if v == expected)
            })
            .is_some();
        if !removed {
            self.inner.purge_expired(key);
        }
        Ok(removed)
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        self.check()?;
        self.inner.stats.dels.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let removed = keys
            .iter()
            .filter_map(|key| self.inner.data.remove(key))
            .filter(|(_, slot)| slot.is_live(now))
            .count();
        Ok(removed as u64)
    }

    async fn list_push(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.check()?;
        self.inner.stats.list_pushes.fetch_add(1, Ordering::Relaxed);
        self.inner.purge_expired(key);

        let mut slot = self
            .inner
            .data
            .entry(key.to_string())
            .or_insert_with(|| Slot::persistent(Value::List(VecDeque::new())));
        match &mut slot.value {
            Value::List(list) => {
                list.push_back(value.to_string());
                Ok(list.len() as u64)
            }
            Value::Str(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn list_pop(&self, key: &str) -> StoreResult<Option<String>> {
        self.check()?;
        self.inner.stats.list_pops.fetch_add(1, Ordering::Relaxed);
        self.inner.purge_expired(key);

        let popped = match self.inner.data.get_mut(key) {
            Some(mut slot) => match &mut slot.value {
                Value::List(list) => Ok(list.pop_front()),
                Value::Str(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(None),
        };

        // Empty lists do not exist
        self.inner
            .data
            .remove_if(key, |_, slot| matches!(&slot.value, Value::List(l) if l.is_empty()));
        popped
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.check()?;
        self.inner.stats.scans.fetch_add(1, Ordering::Relaxed);

        let glob = GlobPattern::new(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .data
            .iter()
            .filter(|entry| entry.value().is_live(now) && glob.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()
    }

    async fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stats.closes.fetch_add(1, Ordering::Relaxed);
        if self.inner.fail_close.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("injected close failure".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("store://localhost:6379", "localhost", 6379)
    }

    async fn connect(store: &MemoryStore) -> Arc<dyn StoreConnection> {
        store.connect(&endpoint()).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_set() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        assert_eq!(conn.get("k").await.unwrap(), None);
        conn.set("k", "v1").await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), Some("v1".to_string()));
        conn.set("k", "v2").await.unwrap();
        assert_eq!(conn.get("k").await.unwrap(), Some("v2".to_string()));
        assert_eq!(store.peek("k"), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn test_set_if_absent_and_expiry() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        assert!(conn
            .set_if_absent("lock", "a", Duration::from_millis(30))
            .await
            .unwrap());
        assert!(!conn
            .set_if_absent("lock", "b", Duration::from_secs(10))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(conn.get("lock").await.unwrap(), None);
        assert!(conn
            .set_if_absent("lock", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.peek("lock"), Some("b".to_string()));
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        conn.set_if_absent("lock", "token-1", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(!conn.delete_if_equals("lock", "token-2").await.unwrap());
        assert!(conn.delete_if_equals("lock", "token-1").await.unwrap());
        assert!(!conn.delete_if_equals("lock", "token-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals_expired() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        conn.set_if_absent("lock", "token", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!conn.delete_if_equals("lock", "token").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_del_counts_existing_keys() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        conn.set("a", "1").await.unwrap();
        conn.set("b", "2").await.unwrap();
        let removed = conn
            .del(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_fifo() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        assert_eq!(conn.list_push("q", "1").await.unwrap(), 1);
        assert_eq!(conn.list_push("q", "2").await.unwrap(), 2);
        assert_eq!(conn.list_pop("q").await.unwrap(), Some("1".to_string()));
        assert_eq!(conn.list_pop("q").await.unwrap(), Some("2".to_string()));
        assert_eq!(conn.list_pop("q").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        conn.set("s", "v").await.unwrap();
        conn.list_push("l", "v").await.unwrap();

        assert_eq!(
            conn.list_push("s", "x").await.unwrap_err(),
            StoreError::WrongType("s".to_string())
        );
        assert_eq!(
            conn.get("l").await.unwrap_err(),
            StoreError::WrongType("l".to_string())
        );
    }

    #[tokio::test]
    async fn test_scan() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        conn.set("k2", "v").await.unwrap();
        conn.set("k1", "v").await.unwrap();
        conn.set("other", "v").await.unwrap();
        conn.list_push("kq", "v").await.unwrap();

        assert_eq!(conn.scan("k*").await.unwrap(), vec!["k1", "k2", "kq"]);
        assert_eq!(conn.scan("k?").await.unwrap(), vec!["k1", "k2", "kq"]);
        assert_eq!(conn.scan("k[0-9]").await.unwrap(), vec!["k1", "k2"]);
        assert!(conn.scan("none*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_breaks_open_connections() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        store.set_reachable(false);
        assert!(conn.ping().await.unwrap_err().is_connection());
        assert!(store.connect(&endpoint()).await.is_err());

        store.set_reachable(true);
        // The old connection stays broken
        assert!(conn.ping().await.unwrap_err().is_connection());
        let fresh = connect(&store).await;
        assert!(fresh.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let store = MemoryStore::new();
        store.fail_next_connects(2);

        assert!(store.connect(&endpoint()).await.is_err());
        assert!(store.connect(&endpoint()).await.is_err());
        assert!(store.connect(&endpoint()).await.is_ok());

        let stats = store.stats();
        assert_eq!(stats.connect_attempts, 3);
        assert_eq!(stats.connections, 1);
    }

    #[tokio::test]
    async fn test_fail_commands() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        store.fail_commands(true);
        let err = conn.get("k").await.unwrap_err();
        assert!(!err.is_connection());

        store.fail_commands(false);
        assert!(conn.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_close() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        conn.close().await.unwrap();
        assert!(conn.get("k").await.unwrap_err().is_connection());
        // Closing twice is harmless
        conn.close().await.unwrap();
        assert_eq!(store.stats().closes, 1);
    }

    #[tokio::test]
    async fn test_fail_close() {
        let store = MemoryStore::new();
        let conn = connect(&store).await;

        store.fail_close(true);
        assert!(conn.close().await.is_err());
    }
}
