//! Distributed Lock - serializes migration batches across processes
//!
//! Uses PostgreSQL session level advisory locks. The lock is taken with
//! `pg_try_advisory_lock` in a polling loop bounded by a deadline, so giving up
//! never leaves a lock request queued on the server.

use std::time::Duration;

use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, warn};

use crate::backends::{LockSession, MigrationBackend};
use crate::config::{MigratorConfig, DEFAULT_LOCK_KEY, DEFAULT_LOCK_POLL_INTERVAL, DEFAULT_LOCK_TIMEOUT};
use crate::error::{MigrateError, MigrateResult};

/// Advisory lock settings
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    key: i64,
    timeout: Duration,
    poll_interval: Duration,
}

impl AdvisoryLock {
    pub fn new(key: i64) -> Self {
        Self {
            key,
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }

    pub fn from_config(config: &MigratorConfig) -> Self {
        Self {
            key: config.lock_key,
            timeout: config.lock_timeout,
            poll_interval: config.lock_poll_interval,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timed_out(&self) -> MigrateError {
        MigrateError::LockTimeout {
            key: self.key,
            timeout: self.timeout,
        }
    }

    fn failed(&self, source: MigrateError) -> MigrateError {
        MigrateError::Lock {
            key: self.key,
            source: source.boxed(),
        }
    }

    /// Wait for the lock, up to the configured timeout
    pub async fn acquire(&self, backend: &dyn MigrationBackend) -> MigrateResult<AdvisoryLockGuard> {
        let deadline = Instant::now() + self.timeout;

        let mut session = match timeout_at(deadline, backend.lock_session()).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(self.failed(err)),
            Err(_) => return Err(self.timed_out()),
        };

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match timeout_at(deadline, session.try_lock(self.key)).await {
                Ok(Ok(true)) => {
                    debug!(key = self.key, attempts, "acquired migration lock");
                    return Ok(AdvisoryLockGuard {
                        key: self.key,
                        session: Some(session),
                    });
                }
                Ok(Ok(false)) => {}
                Ok(Err(err)) => {
                    // unknown whether the lock was taken; ending the session
                    // frees it either way
                    session.abandon();
                    return Err(self.failed(err));
                }
                Err(_) => {
                    session.abandon();
                    return Err(self.timed_out());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if let Err(err) = session.close().await {
                    warn!(key = self.key, error = %err, "closing lock session failed");
                }
                return Err(self.timed_out());
            }

            if attempts == 1 {
                debug!(key = self.key, "migration lock is held elsewhere, waiting");
            }
            sleep_until((now + self.poll_interval).min(deadline)).await;
        }
    }
}

impl Default for AdvisoryLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_KEY)
    }
}

/// A held advisory lock.
///
/// Release it with [`release`](Self::release). A guard dropped while still
/// holding the lock closes its session so the server frees the lock.
pub struct AdvisoryLockGuard {
    key: i64,
    session: Option<Box<dyn LockSession>>,
}

impl AdvisoryLockGuard {
    pub fn key(&self) -> i64 {
        self.key
    }

    /// Release the lock.
    ///
    /// Any failure comes back as [`MigrateError::LockRelease`], which is fatal.
    pub async fn release(mut self) -> MigrateResult<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };

        let reason = match session.unlock(self.key).await {
            Ok(true) => {
                debug!(key = self.key, "released migration lock");
                return session.close().await.map_err(|err| self.release_failed(err));
            }
            Ok(false) => MigrateError::LockNotHeld { key: self.key },
            Err(err) => err,
        };

        error!(key = self.key, error = %reason, "failed to release migration lock");
        session.abandon();
        Err(self.release_failed(reason))
    }

    fn release_failed(&self, reason: MigrateError) -> MigrateError {
        MigrateError::LockRelease {
            key: self.key,
            reason: reason.boxed(),
            batch: None,
        }
    }
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(key = self.key, "migration lock guard dropped while held");
            session.abandon();
        }
    }
}

impl std::fmt::Debug for AdvisoryLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLockGuard")
            .field("key", &self.key)
            .field("held", &self.session.is_some())
            .finish()
    }
}
