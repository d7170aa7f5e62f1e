//! kvguard Common - Shared types and utilities
//!
//! This crate provides the foundational types used across all kvguard components:
//! - Error types for configuration, connection, lock, mutation, and shutdown failures
//! - The `Logger` collaborator and its default implementations
//! - Logging macros and small utility functions

#[macro_use]
pub mod macros;

pub mod error;
pub mod logger;
pub mod utils;

// Re-exports for convenience
pub use error::{
    ConfigError, ConnectionError, LockAcquisitionError, LockReleaseError, MutationError,
    ShutdownError, StoreError, StoreResult,
};
pub use logger::{LogLevel, Logger, NoopLogger, RecordingLogger, TracingLogger, default_logger};
pub use utils::{current_timestamp, duration_millis};
