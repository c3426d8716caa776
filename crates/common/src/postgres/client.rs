use super::{classify_db_error, OpFailure, PostgresConfig};
use crate::domain::StorageError;
use anyhow::Result;
use deadpool_postgres::{
    Config, ManagerConfig, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime, TimeoutType,
    Timeouts,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_telemetry_messages",
    include_str!("../../migrations/0001_telemetry_messages.sql"),
)];

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Only a wait for a free slot means the pool is at capacity. Timing out
/// while opening or checking a connection means the database did not answer.
fn classify_pool_error(e: PoolError, wait_timeout: Duration) -> OpFailure {
    match e {
        PoolError::Timeout(TimeoutType::Wait) => {
            OpFailure::Permanent(StorageError::PoolExhausted(wait_timeout))
        }
        PoolError::Timeout(kind @ (TimeoutType::Create | TimeoutType::Recycle)) => {
            OpFailure::Transient(format!("database did not respond: {:?} timeout", kind))
        }
        PoolError::Backend(db) => classify_db_error(db),
        PoolError::Closed => OpFailure::Permanent(StorageError::Unavailable(
            "connection pool is closed".to_string(),
        )),
        other => OpFailure::Permanent(StorageError::Unavailable(other.to_string())),
    }
}

/// PostgreSQL client wrapper owning the bounded connection pool.
///
/// Every repository operation leases one connection for its duration. When
/// the pool is at capacity a lease request waits up to `wait_timeout`, then
/// fails with [`StorageError::PoolExhausted`].
#[derive(Clone)]
pub struct PostgresClient {
    pool: Pool,
    wait_timeout: Duration,
    closing: Arc<AtomicBool>,
}

impl PostgresClient {
    pub fn new(config: &PostgresConfig, pool_size: usize, wait_timeout: Duration) -> Result<Self> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.dbname = Some(config.database.clone());
        cfg.user = Some(config.username.clone());
        cfg.password = Some(config.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig {
            max_size: pool_size,
            timeouts: Timeouts {
                wait: Some(wait_timeout),
                create: Some(wait_timeout),
                recycle: Some(wait_timeout),
            },
            ..Default::default()
        });

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

        Ok(Self {
            pool,
            wait_timeout,
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Pings the database to verify connectivity
    pub async fn ping(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.execute("SELECT 1", &[]).await?;
        debug!("postgreSQL connection successful");
        Ok(())
    }

    /// Apply the embedded schema migrations. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        let client = self.pool.get().await?;
        for (name, sql) in MIGRATIONS {
            client.batch_execute(sql).await?;
            info!(migration = name, "applied migration");
        }
        Ok(())
    }

    pub(crate) async fn lease(&self) -> Result<deadpool_postgres::Client, OpFailure> {
        if self.closing.load(Ordering::Acquire) {
            return Err(OpFailure::Permanent(StorageError::Unavailable(
                "connection pool is closing".to_string(),
            )));
        }

        self.pool
            .get()
            .await
            .map_err(|e| classify_pool_error(e, self.wait_timeout))
    }

    /// Number of connections currently leased out
    pub fn leased(&self) -> usize {
        let status = self.pool.status();
        status.size.saturating_sub(status.available)
    }

    /// Refuse new leases, wait for outstanding ones to come back, then close
    /// the pool. Gives up waiting after `timeout` and closes anyway.
    pub async fn close(&self, timeout: Duration) {
        self.closing.store(true, Ordering::Release);

        let drained = tokio::time::timeout(timeout, async {
            while self.leased() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                leased = self.leased(),
                "connection leases still outstanding at close timeout"
            );
        }

        self.pool.close();
        info!("postgres connection pool closed");
    }
}
