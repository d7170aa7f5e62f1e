//! Lock-protected mutations
//!
//! `MutationGuard` runs a caller-supplied async mutation while holding a lock
//! on a resource. The lock is released exactly once after the mutation
//! settles, whether it returned a value, returned an error, or panicked.
//! If the call itself is dropped while the lock is held, the release is
//! spawned onto the runtime instead.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use kvguard_common::{
    LockAcquisitionError, LockReleaseError, Logger, MutationError, log_error, log_warn,
};

use crate::lock::{Lock, LockManager};

/// What a protected mutation produced once the lock was held.
///
/// Mutation failures are returned here as values; only failing to take the
/// lock is an error of `protected_mutation` itself.
pub type MutationOutcome<T, E> = Result<T, MutationError<E>>;

#[derive(Clone)]
pub struct MutationGuard {
    locks: LockManager,
    logger: Arc<dyn Logger>,
}

impl MutationGuard {
    pub fn new(locks: LockManager, logger: Arc<dyn Logger>) -> Self {
        Self { locks, logger }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Run `mutation` while holding `resource` for up to `ttl`.
    ///
    /// Returns `Err` only when the lock cannot be taken, in which case the
    /// mutation never runs. A failed release is logged at error level.
    pub async fn protected_mutation<T, E, F, Fut>(
        &self,
        resource: &str,
        ttl: Duration,
        mutation: F,
    ) -> Result<MutationOutcome<T, E>, LockAcquisitionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run(resource, ttl, mutation, None::<fn(LockReleaseError)>)
            .await
    }

    /// Like [`protected_mutation`](Self::protected_mutation), but hands a
    /// failed release to `on_failed_release` instead of logging it.
    pub async fn protected_mutation_with<T, E, F, Fut, R>(
        &self,
        resource: &str,
        ttl: Duration,
        mutation: F,
        on_failed_release: R,
    ) -> Result<MutationOutcome<T, E>, LockAcquisitionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        R: FnOnce(LockReleaseError),
    {
        self.run(resource, ttl, mutation, Some(on_failed_release))
            .await
    }

    async fn run<T, E, F, Fut, R>(
        &self,
        resource: &str,
        ttl: Duration,
        mutation: F,
        on_failed_release: Option<R>,
    ) -> Result<MutationOutcome<T, E>, LockAcquisitionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        R: FnOnce(LockReleaseError),
    {
        let lock = self.locks.acquire(resource, ttl).await?;
        let mut held = HeldLock {
            lock: Some(lock),
            locks: self.locks.clone(),
            logger: self.logger.clone(),
        };

        // Panics while building the future and while polling it both count
        let settled = match std::panic::catch_unwind(AssertUnwindSafe(mutation)) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(payload) => Err(payload),
        };

        let outcome = match settled {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                log_warn!(self.logger, "Mutation of {} failed: {}", resource, e);
                Err(MutationError::Failed(e))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log_error!(self.logger, "Mutation of {} panicked: {}", resource, message);
                Err(MutationError::Panicked(message))
            }
        };

        if let Some(lock) = held.lock.take()
            && let Err(e) = self.locks.release(lock).await
        {
            match on_failed_release {
                Some(callback) => callback(e),
                None => log_error!(self.logger, "Failed to release lock {}: {}", resource, e),
            }
        }

        Ok(outcome)
    }
}

/// A lock owned by an in-flight protected mutation.
///
/// Dropping it while the lock is still inside releases the lock on a
/// spawned task.
struct HeldLock {
    lock: Option<Lock>,
    locks: LockManager,
    logger: Arc<dyn Logger>,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log_warn!(
                self.logger,
                "No runtime to release lock {}; it is held until its ttl expires",
                lock.resource()
            );
            return;
        };

        let locks = self.locks.clone();
        let logger = self.logger.clone();
        handle.spawn(async move {
            let resource = lock.resource().to_string();
            if let Err(e) = locks.release(lock).await {
                log_error!(
                    logger,
                    "Failed to release lock {} of a cancelled mutation: {}",
                    resource,
                    e
                );
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
