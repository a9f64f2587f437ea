//! Readiness wait - blocks until a database answers
//!
//! Pings with exponential backoff and jitter until a ping succeeds or the
//! elapsed-time budget runs out. Meant for startup paths and test fixtures
//! that race a database container coming up; the migrator itself assumes the
//! database is reachable.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::PgPool;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::backends::{MemoryBackend, MigrationBackend, PostgresBackend};
use crate::error::{MigrateError, MigrateResult};

/// Something that can be pinged for reachability
#[async_trait]
pub trait Pinger: Send + Sync {
    async fn ping(&self) -> MigrateResult<()>;
}

#[async_trait]
impl Pinger for PgPool {
    async fn ping(&self) -> MigrateResult<()> {
        sqlx::query("SELECT 1").execute(self).await?;
        Ok(())
    }
}

#[async_trait]
impl Pinger for PostgresBackend {
    async fn ping(&self) -> MigrateResult<()> {
        MigrationBackend::ping(self).await
    }
}

#[async_trait]
impl Pinger for MemoryBackend {
    async fn ping(&self) -> MigrateResult<()> {
        MigrationBackend::ping(self).await
    }
}

#[async_trait]
impl Pinger for dyn MigrationBackend {
    async fn ping(&self) -> MigrateResult<()> {
        MigrationBackend::ping(self).await
    }
}

/// Backoff settings for [`wait`]
#[derive(Debug, Clone)]
pub struct WaitConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    /// Each delay is drawn from `interval * (1 ± randomization_factor)`
    pub randomization_factor: f64,
    pub max_interval: Duration,
    /// Give up once this much time has passed
    pub max_elapsed: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            multiplier: 1.5,
            randomization_factor: 0.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

impl WaitConfig {
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_max_elapsed(mut self, elapsed: Duration) -> Self {
        self.max_elapsed = elapsed;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor;
        self
    }

    fn randomized(&self, interval: Duration) -> Duration {
        let factor = self.randomization_factor.clamp(0.0, 1.0);
        if factor == 0.0 {
            return interval;
        }
        let mut rng = rand::thread_rng();
        interval.mul_f64(rng.gen_range((1.0 - factor)..=(1.0 + factor)))
    }

    fn next_interval(&self, interval: Duration) -> Duration {
        interval.mul_f64(self.multiplier.max(1.0)).min(self.max_interval)
    }
}

/// Ping until `pinger` answers.
///
/// Fails with [`MigrateError::WaitTimeout`], carrying the last ping error,
/// once `max_elapsed` has passed. A ping still running at that point is
/// abandoned.
pub async fn wait<P: Pinger + ?Sized>(pinger: &P, config: &WaitConfig) -> MigrateResult<()> {
    let started = Instant::now();
    let deadline = started + config.max_elapsed;
    let mut interval = config.initial_interval;
    let mut attempt: u32 = 0;
    let mut previous: Option<MigrateError> = None;

    loop {
        attempt += 1;
        let last_error = match timeout_at(deadline, pinger.ping()).await {
            Ok(Ok(())) => {
                debug!(attempt, elapsed_ms = started.elapsed().as_millis() as u64, "database is reachable");
                return Ok(());
            }
            Ok(Err(err)) => err,
            Err(_) => {
                warn!(attempt, "database ping did not answer before the deadline");
                return Err(MigrateError::WaitTimeout {
                    elapsed: started.elapsed(),
                    last_error: previous.map(MigrateError::boxed),
                });
            }
        };

        let delay = config.randomized(interval);
        let elapsed = started.elapsed();
        if elapsed + delay > config.max_elapsed {
            warn!(attempt, error = %last_error, "database did not become reachable");
            return Err(MigrateError::WaitTimeout {
                elapsed,
                last_error: Some(last_error.boxed()),
            });
        }

        debug!(attempt, error = %last_error, delay_ms = delay.as_millis() as u64, "database not reachable yet");
        previous = Some(last_error);
        tokio::time::sleep(delay).await;
        interval = config.next_interval(interval);
    }
}
