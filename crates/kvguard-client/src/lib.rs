//! kvguard Client - resilient access to a key-value store
//!
//! This crate provides:
//! - Configuration resolution from raw settings, files, and the environment
//! - A connection manager that reconnects with back-off and publishes lifecycle events
//! - Single-attempt distributed locks with expiry and token-checked release
//! - Protected mutations that run caller code under a lock and always release it
//! - `KvGuardClient`, a facade bundling all of the above with typed store commands

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod guard;
pub mod lock;

pub use client::{KvGuardClient, KvGuardClientBuilder};
pub use config::{Configuration, RawConfig, RetryStrategy};
pub use connection::{ConnectionManager, ConnectionState, StoreEvent};
pub use error::{ClientError, Result};
pub use guard::{MutationGuard, MutationOutcome};
pub use lock::{Lock, LockManager, LockStats};

// Shared types re-exported so callers need only this crate
pub use kvguard_common::{
    ConfigError, ConnectionError, LockAcquisitionError, LockReleaseError, LogLevel, Logger,
    MutationError, NoopLogger, RecordingLogger, ShutdownError, StoreError, TracingLogger,
};
pub use kvguard_store::{Connector, Endpoint, MemoryStore, StoreConnection};
