//! Expiry Sweeper
//!
//! Background task that cancels PROCESSING payments past their `expires_at`.
//! Only the elected leader sweeps; with several replicas the others idle.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::error::PaymentError;
use super::service::{PaymentLifecycleService, SweepReport};

/// Decides whether this instance runs the sweep
#[async_trait]
pub trait LeaderElection: Send + Sync {
    async fn is_leader(&self) -> bool;
}

/// Single-instance deployments
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysLeader;

#[async_trait]
impl LeaderElection for AlwaysLeader {
    async fn is_leader(&self) -> bool {
        true
    }
}

/// Session-level `pg_try_advisory_lock` held on a dedicated connection
///
/// Leadership lasts as long as the connection; if it breaks, the lock is
/// released server-side and another instance can take over.
pub struct PgAdvisoryLeader {
    pool: PgPool,
    lock_key: i64,
    conn: Mutex<Option<PoolConnection<sqlx::Postgres>>>,
}

impl PgAdvisoryLeader {
    pub const DEFAULT_LOCK_KEY: i64 = 0x5041_5953_5745_4550; // "PAYSWEEP"

    pub fn new(pool: PgPool, lock_key: i64) -> Self {
        Self {
            pool,
            lock_key,
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LeaderElection for PgAdvisoryLeader {
    async fn is_leader(&self) -> bool {
        let mut held = self.conn.lock().await;

        if let Some(conn) = held.as_mut() {
            match sqlx::query("SELECT 1").execute(&mut **conn).await {
                Ok(_) => return true,
                Err(e) => {
                    warn!(error = %e, "Leader connection lost");
                    *held = None;
                }
            }
        }

        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Cannot acquire connection for leader election");
                return false;
            }
        };
        let acquired: Result<bool, sqlx::Error> = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.lock_key)
            .fetch_one(&mut *conn)
            .await;

        match acquired {
            Ok(true) => {
                info!(lock_key = self.lock_key, "Acquired expiry sweep leadership");
                *held = Some(conn);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(error = %e, "Advisory lock query failed");
                false
            }
        }
    }
}

/// Configuration for the expiry sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub scan_interval: Duration,
    /// Maximum payments closed per scan
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

pub struct ExpirySweeper {
    service: Arc<PaymentLifecycleService>,
    leader: Arc<dyn LeaderElection>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(
        service: Arc<PaymentLifecycleService>,
        leader: Arc<dyn LeaderElection>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            service,
            leader,
            config,
        }
    }

    /// Run the sweep loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting expiry sweeper"
        );

        loop {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Expiry sweep failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// One leader-gated sweep; `None` when this instance is not the leader
    pub async fn sweep_once(&self) -> Result<Option<SweepReport>, PaymentError> {
        if !self.leader.is_leader().await {
            debug!("Not the sweep leader; skipping");
            return Ok(None);
        }
        let report = self
            .service
            .close_expired_payments(Utc::now(), self.config.batch_size)
            .await?;
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::RecordingAlertSink;
    use crate::payment::memory::InMemoryStore;
    use crate::payment::service::PaymentSettings;
    use crate::providers::ProviderRegistry;
    use crate::saga::InlineSagaRunner;

    struct NeverLeader;

    #[async_trait]
    impl LeaderElection for NeverLeader {
        async fn is_leader(&self) -> bool {
            false
        }
    }

    fn service() -> Arc<PaymentLifecycleService> {
        let store = Arc::new(InMemoryStore::new());
        Arc::new(PaymentLifecycleService::new(
            store.clone(),
            store,
            ProviderRegistry::new(),
            Arc::new(InlineSagaRunner::default()),
            Arc::new(RecordingAlertSink::new()),
            PaymentSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_follower_skips_sweep() {
        let sweeper = ExpirySweeper::new(service(), Arc::new(NeverLeader), SweeperConfig::default());
        assert_eq!(sweeper.sweep_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_leader_sweeps_empty_store() {
        let sweeper = ExpirySweeper::new(service(), Arc::new(AlwaysLeader), SweeperConfig::default());
        let report = sweeper.sweep_once().await.unwrap().unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn test_default_config() {
        let config = SweeperConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(60));
        assert_eq!(config.batch_size, 100);
    }
}
