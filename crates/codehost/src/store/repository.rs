//! Session persistence over the two-index tables.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;

use super::models::Session;

/// Repository mapping users to container leases and back.
///
/// The `users` and `containers` tables are two indexes over the same
/// session and must always agree. Every write here touches both inside one
/// transaction; updating one index without the other is an invariant
/// violation.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Create a new store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write both index rows for a new session as one atomic unit.
    ///
    /// Overwrites any prior entry for the same `user_id`, including the
    /// stale container row it pointed at.
    pub async fn create_session(
        &self,
        user_id: &str,
        container_id: &str,
        port: u16,
        ttl: Duration,
    ) -> Result<Session> {
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;

        let mut tx = self.pool.begin().await.context("beginning session create")?;

        sqlx::query("DELETE FROM containers WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("clearing prior container index")?;

        sqlx::query(
            r#"
            INSERT INTO users (user_id, container_id, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                container_id = excluded.container_id,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(user_id)
        .bind(container_id)
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .context("writing user index")?;

        sqlx::query(
            r#"
            INSERT INTO containers (container_id, user_id, port, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(container_id) DO UPDATE SET
                user_id = excluded.user_id,
                port = excluded.port,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(container_id)
        .bind(user_id)
        .bind(i64::from(port))
        .bind(expires_at)
        .execute(&mut *tx)
        .await
        .context("writing container index")?;

        tx.commit().await.context("committing session create")?;

        Ok(Session {
            user_id: user_id.to_string(),
            container_id: container_id.to_string(),
            port: i64::from(port),
            expires_at,
        })
    }

    /// Look up the live session owned by `user_id`.
    pub async fn get_by_user(&self, user_id: &str) -> Result<Option<Session>> {
        let now = Utc::now().timestamp();
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT c.user_id, c.container_id, c.port, c.expires_at
            FROM users u
            JOIN containers c ON c.container_id = u.container_id
            WHERE u.user_id = ?
              AND (u.expires_at IS NULL OR u.expires_at > ?)
              AND (c.expires_at IS NULL OR c.expires_at > ?)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session by user")?;

        Ok(session)
    }

    /// Look up the live session owning `container_id`.
    pub async fn get_by_container(&self, container_id: &str) -> Result<Option<Session>> {
        let now = Utc::now().timestamp();
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT user_id, container_id, port, expires_at
            FROM containers
            WHERE container_id = ?
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(container_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session by container")?;

        Ok(session)
    }

    /// List all live sessions.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let now = Utc::now().timestamp();
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT c.user_id, c.container_id, c.port, c.expires_at
            FROM users u
            JOIN containers c ON c.container_id = u.container_id
            WHERE (u.expires_at IS NULL OR u.expires_at > ?)
              AND (c.expires_at IS NULL OR c.expires_at > ?)
            ORDER BY c.port
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        Ok(sessions)
    }

    /// Re-stamp both index rows with a fresh expiry, preserving the payload.
    ///
    /// Returns `false` when the user has no live session; the session may
    /// have expired or been evicted concurrently, which is a normal outcome.
    pub async fn renew_ttl(&self, user_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl.as_secs() as i64;

        let mut tx = self.pool.begin().await.context("beginning ttl renewal")?;

        let current: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT container_id FROM users
            WHERE user_id = ? AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .context("fetching session for renewal")?;

        let Some((container_id,)) = current else {
            return Ok(false);
        };

        sqlx::query("UPDATE users SET expires_at = ? WHERE user_id = ?")
            .bind(expires_at)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("renewing user index")?;

        sqlx::query("UPDATE containers SET expires_at = ? WHERE container_id = ?")
            .bind(expires_at)
            .bind(&container_id)
            .execute(&mut *tx)
            .await
            .context("renewing container index")?;

        tx.commit().await.context("committing ttl renewal")?;

        Ok(true)
    }

    /// Remove both index rows for the session owning `container_id` and
    /// return its port for the caller to release.
    ///
    /// Expired rows are removed too; eviction cleans up leases the TTL has
    /// already lapsed on. A crash after this call and before the release
    /// leaks the port rather than double-freeing it.
    pub async fn delete_by_container(&self, container_id: &str) -> Result<Option<u16>> {
        let mut tx = self.pool.begin().await.context("beginning session delete")?;

        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT user_id, port FROM containers WHERE container_id = ?")
                .bind(container_id)
                .fetch_optional(&mut *tx)
                .await
                .context("fetching session for delete")?;

        let Some((user_id, port)) = row else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM users WHERE user_id = ? AND container_id = ?")
            .bind(&user_id)
            .bind(container_id)
            .execute(&mut *tx)
            .await
            .context("deleting user index")?;

        sqlx::query("DELETE FROM containers WHERE container_id = ?")
            .bind(container_id)
            .execute(&mut *tx)
            .await
            .context("deleting container index")?;

        tx.commit().await.context("committing session delete")?;

        Ok(Some(port as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const TTL: Duration = Duration::from_secs(900);

    async fn test_store() -> SessionStore {
        let db = Database::in_memory().await.unwrap();
        SessionStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_create_and_get_by_both_indexes() {
        let store = test_store().await;
        store.create_session("u1", "c1", 3001, TTL).await.unwrap();

        let by_user = store.get_by_user("u1").await.unwrap().unwrap();
        assert_eq!(by_user.container_id, "c1");
        assert_eq!(by_user.port(), 3001);

        let by_container = store.get_by_container("c1").await.unwrap().unwrap();
        assert_eq!(by_container.user_id, "u1");
        assert_eq!(by_user, by_container);
    }

    #[tokio::test]
    async fn test_lookup_misses_are_none() {
        let store = test_store().await;
        assert!(store.get_by_user("nobody").await.unwrap().is_none());
        assert!(store.get_by_container("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_overwrites_prior_user_session() {
        let store = test_store().await;
        store.create_session("u1", "c1", 3001, TTL).await.unwrap();
        store.create_session("u1", "c2", 3002, TTL).await.unwrap();

        let session = store.get_by_user("u1").await.unwrap().unwrap();
        assert_eq!(session.container_id, "c2");
        assert_eq!(session.port(), 3002);

        // The stale container row must not survive the overwrite.
        assert!(store.get_by_container("c1").await.unwrap().is_none());
        assert_eq!(store.list_sessions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_by_container_removes_both_indexes() {
        let store = test_store().await;
        store.create_session("u1", "c1", 3001, TTL).await.unwrap();

        let port = store.delete_by_container("c1").await.unwrap();
        assert_eq!(port, Some(3001));

        assert!(store.get_by_user("u1").await.unwrap().is_none());
        assert!(store.get_by_container("c1").await.unwrap().is_none());

        // A repeated delete is a miss, not an error.
        assert_eq!(store.delete_by_container("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_renew_ttl_extends_both_indexes() {
        let store = test_store().await;
        let created = store
            .create_session("u1", "c1", 3001, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(store.renew_ttl("u1", TTL).await.unwrap());

        let renewed = store.get_by_user("u1").await.unwrap().unwrap();
        assert!(renewed.expires_at > created.expires_at);
        let by_container = store.get_by_container("c1").await.unwrap().unwrap();
        assert_eq!(by_container.expires_at, renewed.expires_at);
    }

    #[tokio::test]
    async fn test_renew_ttl_without_session_is_noop() {
        let store = test_store().await;
        assert!(!store.renew_ttl("ghost", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_session_is_invisible_but_deletable() {
        let store = test_store().await;
        store
            .create_session("u1", "c1", 3001, Duration::ZERO)
            .await
            .unwrap();

        assert!(store.get_by_user("u1").await.unwrap().is_none());
        assert!(store.get_by_container("c1").await.unwrap().is_none());
        assert!(!store.renew_ttl("u1", TTL).await.unwrap());

        // Eviction still reclaims the port of an expired lease.
        assert_eq!(store.delete_by_container("c1").await.unwrap(), Some(3001));
    }

    #[tokio::test]
    async fn test_index_symmetry() {
        let store = test_store().await;
        store.create_session("u1", "c1", 3001, TTL).await.unwrap();
        store.create_session("u2", "c2", 3002, TTL).await.unwrap();

        for session in store.list_sessions().await.unwrap() {
            let by_user = store.get_by_user(&session.user_id).await.unwrap().unwrap();
            let by_container = store
                .get_by_container(&session.container_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(by_user.container_id, session.container_id);
            assert_eq!(by_container.user_id, session.user_id);
        }
    }
}
