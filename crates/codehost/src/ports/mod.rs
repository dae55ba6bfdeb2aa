//! Port pool allocator.
//!
//! Owns the fixed pool of candidate backend ports. The free set lives in a
//! single `ports` row; a port is either in that set or referenced by exactly
//! one live session, never both. Acquire and release are serialized so no
//! two concurrent acquires can hand out the same port.

use std::ops::RangeInclusive;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

const POOL_KEY: &str = "pool";

/// Hands out and reclaims backend ports.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    pool: SqlitePool,
    lock: Arc<Mutex<()>>,
}

impl PortAllocator {
    /// Create a new allocator over the broker database.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Populate the free set. Called once at process start; this is not a
    /// runtime operation and resets any prior pool state.
    pub async fn initialize(&self, range: RangeInclusive<u16>) -> Result<()> {
        let ports: Vec<u16> = range.collect();
        let value = serde_json::to_string(&ports).context("serializing port pool")?;
        sqlx::query(
            r#"
            INSERT INTO ports (name, free_ports) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET free_ports = excluded.free_ports
            "#,
        )
        .bind(POOL_KEY)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("initializing port pool")?;
        Ok(())
    }

    /// Take one port from the free set.
    ///
    /// `None` means the pool is exhausted. That is an admission-control
    /// signal, not a fault.
    pub async fn acquire(&self) -> Result<Option<u16>> {
        let _guard = self.lock.lock().await;
        let mut ports = self.read_free().await?;
        if ports.is_empty() {
            return Ok(None);
        }
        let port = ports.remove(0);
        self.write_free(&ports).await?;
        Ok(Some(port))
    }

    /// Return a port to the free set.
    ///
    /// Releasing a port that is already free is a no-op, so an eviction
    /// retry or duplicate cleanup cannot corrupt the pool.
    pub async fn release(&self, port: u16) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut ports = self.read_free().await?;
        if !ports.contains(&port) {
            ports.push(port);
            ports.sort_unstable();
            self.write_free(&ports).await?;
        }
        Ok(())
    }

    /// Number of ports currently free.
    pub async fn free_count(&self) -> Result<usize> {
        Ok(self.read_free().await?.len())
    }

    async fn read_free(&self) -> Result<Vec<u16>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT free_ports FROM ports WHERE name = ?")
            .bind(POOL_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("reading port pool")?;

        match row {
            Some((raw,)) => serde_json::from_str(&raw).context("parsing port pool"),
            None => Ok(Vec::new()),
        }
    }

    async fn write_free(&self, ports: &[u16]) -> Result<()> {
        let value = serde_json::to_string(ports).context("serializing port pool")?;
        sqlx::query("UPDATE ports SET free_ports = ? WHERE name = ?")
            .bind(value)
            .bind(POOL_KEY)
            .execute(&self.pool)
            .await
            .context("writing port pool")?;
        Ok(())
    }
}
