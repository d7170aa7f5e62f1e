//! Error types for kvguard
//!
//! This module defines one error enum per failure domain:
//! - `ConfigError`: invalid or missing configuration
//! - `StoreError`: failures reported by the backing store
//! - `ConnectionError`: the connection is missing, closed, or could not be established
//! - `LockAcquisitionError` / `LockReleaseError`: lease bookkeeping failures
//! - `MutationError`: failures raised by a caller-supplied mutation
//! - `ShutdownError`: failures while closing resources

use std::time::Duration;

/// Invalid or missing configuration. Fatal at startup.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by the backing store or its transport.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transport-level failure; the connection that produced it is unusable.
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store rejected the command.
    #[error("store command error: {0}")]
    Command(String),

    /// The key holds a value of a different kind than the command expects.
    #[error("wrong value type for key '{0}'")]
    WrongType(String),
}

impl StoreError {
    /// Whether this error means the connection must be re-established.
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The connection to the store is unavailable.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection not ready")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("gave up connecting after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<StoreError> for ConnectionError {
    fn from(value: StoreError) -> Self {
        ConnectionError::Transport(value.to_string())
    }
}

/// A lease could not be taken. Surfaced to the caller; never retried internally.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisitionError {
    #[error("resource '{resource}' is already locked")]
    AlreadyLocked { resource: String },

    #[error("invalid ttl {ttl:?} for resource '{resource}'")]
    InvalidTtl { resource: String, ttl: Duration },

    #[error("lock store unavailable for resource '{resource}': {reason}")]
    Unavailable { resource: String, reason: String },
}

impl LockAcquisitionError {
    pub fn resource(&self) -> &str {
        match self {
            LockAcquisitionError::AlreadyLocked { resource }
            | LockAcquisitionError::InvalidTtl { resource, .. }
            | LockAcquisitionError::Unavailable { resource, .. } => resource,
        }
    }
}

/// A lease could not be released after its mutation ran.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LockReleaseError {
    /// The lease expired or is now owned by someone else.
    #[error("lock on resource '{resource}' is no longer held")]
    NotHeld { resource: String },

    #[error("failed to release lock on resource '{resource}': {reason}")]
    Unavailable { resource: String, reason: String },
}

impl LockReleaseError {
    pub fn resource(&self) -> &str {
        match self {
            LockReleaseError::NotHeld { resource } | LockReleaseError::Unavailable { resource, .. } => {
                resource
            }
        }
    }
}

/// Failure raised by a caller-supplied mutation. Returned as a value.
#[derive(thiserror::Error, Debug)]
pub enum MutationError<E> {
    #[error("mutation failed: {0}")]
    Failed(E),

    #[error("mutation panicked: {0}")]
    Panicked(String),
}

impl<E> MutationError<E> {
    /// The error returned by the mutation, if it did not panic.
    pub fn into_failed(self) -> Option<E> {
        match self {
            MutationError::Failed(e) => Some(e),
            MutationError::Panicked(_) => None,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, MutationError::Panicked(_))
    }
}

/// Failure while closing resources.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("failed to close store connection: {0}")]
    Close(StoreError),
}
