//! Store connection lifecycle management
//!
//! `ConnectionManager` owns the single live connection of a client. Its
//! lifecycle is an explicit state machine published on a `watch` channel:
//!
//! ```text
//!  Disconnected ──► Connecting ──► Connected ──(connection error)──► Reconnecting
//!        ▲              ▲  │                                            │
//!        │              │  └──(attempt failed)──► Reconnecting ─────────┤
//!        │              └───────────────(back-off elapsed)──────────────┘
//!        └──────────────(attempts exhausted)
//!
//!  any state ──(shutdown)──► Closed
//! ```
//!
//! Lifecycle events go out on a `broadcast` channel and are logged through
//! the injected `Logger` whether or not anyone subscribes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};

use kvguard_common::{
    ConnectionError, Logger, ShutdownError, StoreError, log_debug, log_error, log_info, log_warn,
};
use kvguard_store::{Connector, Endpoint, StoreConnection, StoreResult};

use crate::config::Configuration;
use crate::error::{ClientError, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of the store connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Observable lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A connection was established
    Connected,
    /// A connection attempt failed; the next one follows after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// The transport reported an error
    Error(StoreError),
    /// The lock client hit a store failure unrelated to lock state
    LockClientError(StoreError),
}

struct Inner {
    config: Configuration,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    logger: Arc<dyn Logger>,
    connection: RwLock<Option<Arc<dyn StoreConnection>>>,
    state: watch::Sender<ConnectionState>,
    /// `None` once shutdown has unregistered all listeners
    events: Mutex<Option<broadcast::Sender<StoreEvent>>>,
    /// Set when an establishment cycle gives up
    failure: Mutex<Option<ConnectionError>>,
    /// Serializes establishment cycles
    establishing: tokio::sync::Mutex<()>,
}

/// Owns the store connection and keeps it alive.
///
/// Cloning is cheap and yields a handle to the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Open a connection, retrying per the configured strategy.
    ///
    /// Fails with `ConnectionError::RetriesExhausted` once
    /// `max_connection_retries` attempts have failed.
    pub async fn connect(
        config: Configuration,
        connector: Arc<dyn Connector>,
        logger: Arc<dyn Logger>,
    ) -> std::result::Result<Self, ConnectionError> {
        let endpoint = config.endpoint();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let manager = Self {
            inner: Arc::new(Inner {
                config,
                endpoint,
                connector,
                logger,
                connection: RwLock::new(None),
                state,
                events: Mutex::new(Some(events)),
                failure: Mutex::new(None),
                establishing: tokio::sync::Mutex::new(()),
            }),
        };

        manager.establish().await?;
        Ok(manager)
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.inner.logger
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to lifecycle events. After shutdown the receiver is
    /// already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        match self.inner.events.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.read().is_some()
    }

    /// The current connection, or why there is none.
    pub fn connection(&self) -> std::result::Result<Arc<dyn StoreConnection>, ConnectionError> {
        if let Some(conn) = self.inner.connection.read().as_ref() {
            return Ok(conn.clone());
        }
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        Err(self
            .inner
            .failure
            .lock()
            .clone()
            .unwrap_or(ConnectionError::NotConnected))
    }

    /// Run one command against the current connection.
    ///
    /// A connection-level failure drops the connection and starts a
    /// background reconnect cycle; the failed command is not replayed.
    pub async fn execute<T, F, Fut>(&self, command: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn StoreConnection>) -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let conn = self.connection()?;
        match command(conn.clone()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if e.is_connection() {
                    self.connection_lost(&conn, &e);
                }
                Err(ClientError::Store(e))
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.execute(|conn| async move { conn.ping().await }).await
    }

    /// Establish a new connection after retries were exhausted.
    ///
    /// Returns immediately if a connection is already up.
    pub async fn reconnect(&self) -> std::result::Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        if self.is_connected() {
            return Ok(());
        }
        self.establish().await
    }

    /// Close the connection.
    ///
    /// Listeners are unregistered before the connection is closed, so no
    /// events fire during teardown. A second call is a no-op.
    pub async fn shutdown(&self) -> std::result::Result<(), ShutdownError> {
        self.inner.events.lock().take();
        let previous = self.inner.state.send_replace(ConnectionState::Closed);
        let connection = self.inner.connection.write().take();

        let Some(conn) = connection else {
            if previous != ConnectionState::Closed {
                log_info!(self.inner.logger, "Store client for {} shut down", self.inner.endpoint);
            }
            return Ok(());
        };

        if let Err(e) = conn.close().await {
            log_error!(
                self.inner.logger,
                "Failed to close store connection to {}: {}",
                self.inner.endpoint,
                e
            );
            return Err(ShutdownError::Close(e));
        }

        log_info!(self.inner.logger, "Store connection to {} closed", self.inner.endpoint);
        Ok(())
    }

    /// Publish a lock client failure.
    pub(crate) fn lock_client_error(&self, error: &StoreError) {
        log_error!(self.inner.logger, "Lock client error: {}", error);
        self.emit(StoreEvent::LockClientError(error.clone()));
    }

    fn emit(&self, event: StoreEvent) {
        if let Some(tx) = self.inner.events.lock().as_ref() {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }

    /// Move to `next` unless closed. Returns false if the manager is closed.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut open = true;
        self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                open = false;
                return false;
            }
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        open
    }

    fn connection_lost(&self, failed: &Arc<dyn StoreConnection>, error: &StoreError) {
        log_error!(
            self.inner.logger,
            "Lost connection to store at {}: {}",
            self.inner.endpoint,
            error
        );
        self.emit(StoreEvent::Error(error.clone()));

        // Only drop the connection that failed; a newer one may be installed
        {
            let mut current = self.inner.connection.write();
            let is_failed = current
                .as_ref()
                .is_some_and(|conn| std::ptr::addr_eq(Arc::as_ptr(conn), Arc::as_ptr(failed)));
            if !is_failed {
                return;
            }
            *current = None;
        }

        let started = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.establish().await {
                log_debug!(manager.inner.logger, "Background reconnect ended: {}", e);
            }
        });
    }

    /// One establishment cycle: up to `max_connection_retries` attempts with
    /// the configured back-off between them.
    async fn establish(&self) -> std::result::Result<(), ConnectionError> {
        let _establishing = self.inner.establishing.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let max_attempts = self.inner.config.max_connection_retries().max(1);
        let strategy = self.inner.config.retry_strategy();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if !self.transition(ConnectionState::Connecting) {
                return Err(ConnectionError::Closed);
            }
            log_debug!(
                self.inner.logger,
                "Connecting to store at {} (attempt {}/{})",
                self.inner.endpoint,
                attempt,
                max_attempts
            );

            match self.inner.connector.connect(&self.inner.endpoint).await {
                Ok(conn) => {
                    // Install and publish together so a failure on the new
                    // connection always finds the state `Connected`
                    let installed = {
                        let mut current = self.inner.connection.write();
                        let open = self.transition(ConnectionState::Connected);
                        if open {
                            *current = Some(conn.clone());
                        }
                        open
                    };
                    if !installed {
                        // Shut down while connecting
                        if let Err(e) = conn.close().await {
                            log_debug!(
                                self.inner.logger,
                                "Closing connection opened during shutdown failed: {}",
                                e
                            );
                        }
                        return Err(ConnectionError::Closed);
                    }
                    *self.inner.failure.lock() = None;
                    log_info!(self.inner.logger, "Connected to store at {}", self.inner.endpoint);
                    self.emit(StoreEvent::Connected);
                    return Ok(());
                }
                Err(e) => {
                    log_error!(
                        self.inner.logger,
                        "Store connection error at {}: {}",
                        self.inner.endpoint,
                        e
                    );
                    self.emit(StoreEvent::Error(e.clone()));

                    if attempt >= max_attempts {
                        let failure = ConnectionError::RetriesExhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        };
                        if !self.transition(ConnectionState::Disconnected) {
                            return Err(ConnectionError::Closed);
                        }
                        *self.inner.failure.lock() = Some(failure.clone());
                        log_error!(
                            self.inner.logger,
                            "Giving up on store at {} after {} attempts",
                            self.inner.endpoint,
                            attempt
                        );
                        return Err(failure);
                    }

                    let delay = strategy.delay_for(attempt);
                    if !self.transition(ConnectionState::Reconnecting) {
                        return Err(ConnectionError::Closed);
                    }
                    log_warn!(
                        self.inner.logger,
                        "Reconnecting to store at {} in {}ms (attempt {})",
                        self.inner.endpoint,
                        delay.as_millis(),
                        attempt
                    );
                    self.emit(StoreEvent::Reconnecting { attempt, delay });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}
