//! Application state shared across admission handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::TokenCodec;
use crate::ports::PortAllocator;
use crate::runtime::RuntimeDriver;
use crate::store::SessionStore;

/// Admission-facing settings.
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    /// Hostname embedded in returned session URLs.
    pub public_host: String,
    /// Public data-plane port the proxy listens on.
    pub proxy_port: u16,
    /// TTL stamped on new sessions.
    pub session_ttl: Duration,
    /// Shared key the operator front-end must present.
    pub operator_key: String,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            proxy_port: 5000,
            session_ttl: Duration::from_secs(15 * 60),
            operator_key: "change-me".to_string(),
        }
    }
}

/// Application state shared across all admission handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session store, the source of truth for user leases.
    pub store: SessionStore,
    /// Port pool allocator.
    pub ports: PortAllocator,
    /// Container runtime driver.
    pub runtime: Arc<dyn RuntimeDriver>,
    /// Token issuer for session URLs.
    pub tokens: Arc<TokenCodec>,
    /// Admission settings.
    pub settings: Arc<AdmissionSettings>,
}

impl AppState {
    /// Create new application state.
    pub fn new(
        store: SessionStore,
        ports: PortAllocator,
        runtime: Arc<dyn RuntimeDriver>,
        tokens: Arc<TokenCodec>,
        settings: AdmissionSettings,
    ) -> Self {
        Self {
            store,
            ports,
            runtime,
            tokens,
            settings: Arc::new(settings),
        }
    }
}
