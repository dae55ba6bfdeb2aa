//! Session data models.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One user's active container lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Session {
    /// Opaque caller identity.
    pub user_id: String,
    /// Container ID returned by the runtime driver.
    pub container_id: String,
    /// Backend port the container's service is reachable on.
    pub port: i64,
    /// Unix timestamp after which the session is eligible for eviction.
    pub expires_at: i64,
}

impl Session {
    /// The backend port as a `u16`.
    pub fn port(&self) -> u16 {
        self.port as u16
    }

    /// Whether the lease has lapsed without renewal.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().timestamp()
    }
}
