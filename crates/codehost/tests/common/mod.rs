//! Test utilities and common setup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::NaiveTime;
use tokio::sync::Mutex;

use codehost::api::{self, AdmissionSettings, AppState};
use codehost::auth::TokenCodec;
use codehost::db::Database;
use codehost::ports::PortAllocator;
use codehost::proxy::{self, ProxySettings, ProxyState};
use codehost::runtime::{RuntimeDriver, RuntimeError, RuntimeResult};
use codehost::store::SessionStore;

pub const TEST_SECRET: &str = "test-secret-for-integration-tests";
pub const TEST_OPERATOR_KEY: &str = "test-operator-key";

/// Scriptable in-memory runtime driver.
#[derive(Default)]
pub struct MockDriver {
    /// IDs of containers "running" right now.
    pub containers: Mutex<Vec<String>>,
    /// How many starts have been requested.
    pub started: AtomicUsize,
    /// When set, the next start fails once.
    pub fail_next_start: AtomicBool,
    /// IDs handed to stop_container.
    pub stopped: Mutex<Vec<String>>,
}

#[async_trait]
impl RuntimeDriver for MockDriver {
    async fn list_workload_containers(&self) -> RuntimeResult<Vec<String>> {
        Ok(self.containers.lock().await.clone())
    }

    async fn inspect_started_at(&self, _container_id: &str) -> RuntimeResult<Option<NaiveTime>> {
        Ok(None)
    }

    async fn tail_log_marker(
        &self,
        _container_id: &str,
        _marker: &str,
    ) -> RuntimeResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn start_session_container(&self, port: u16) -> RuntimeResult<String> {
        if self.fail_next_start.swap(false, Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed {
                command: "run".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        let seq = self.started.fetch_add(1, Ordering::SeqCst);
        let container_id = format!("container-{port}-{seq}");
        self.containers.lock().await.push(container_id.clone());
        Ok(container_id)
    }

    async fn stop_container(&self, container_id: &str, _timeout: Duration) -> RuntimeResult<()> {
        self.containers
            .lock()
            .await
            .retain(|id| id != container_id);
        self.stopped.lock().await.push(container_id.to_string());
        Ok(())
    }

    async fn assigned_ports(&self, _container_id: &str) -> RuntimeResult<String> {
        Ok(String::new())
    }

    async fn find_container_by_port(&self, _port: u16) -> RuntimeResult<Option<String>> {
        Ok(None)
    }
}

/// A broker wired to an in-memory database and a mock driver.
pub struct TestBroker {
    pub admission: Router,
    pub store: SessionStore,
    pub ports: PortAllocator,
    pub tokens: Arc<TokenCodec>,
    pub driver: Arc<MockDriver>,
}

impl TestBroker {
    /// Build a proxy router over the same store, pointed at loopback
    /// backends.
    pub fn proxy_router(&self, static_asset_port: u16) -> Router {
        let state = ProxyState::new(
            self.store.clone(),
            self.tokens.clone(),
            ProxySettings {
                target_host: "127.0.0.1".to_string(),
                static_asset_port,
            },
        );
        proxy::create_router(state)
    }
}

/// Create a test broker with the given number of session ports.
pub async fn test_broker_with_ports(port_count: u16) -> TestBroker {
    let db = Database::in_memory().await.unwrap();
    let store = SessionStore::new(db.pool().clone());
    let ports = PortAllocator::new(db.pool().clone());
    ports
        .initialize(3001..=3000 + port_count)
        .await
        .unwrap();

    let driver = Arc::new(MockDriver::default());
    let tokens = Arc::new(TokenCodec::new(TEST_SECRET));

    let state = AppState::new(
        store.clone(),
        ports.clone(),
        driver.clone(),
        tokens.clone(),
        AdmissionSettings {
            public_host: "localhost".to_string(),
            proxy_port: 5000,
            session_ttl: Duration::from_secs(900),
            operator_key: TEST_OPERATOR_KEY.to_string(),
        },
    );

    TestBroker {
        admission: api::create_router(state),
        store,
        ports,
        tokens,
        driver,
    }
}

/// Create a test broker with the default 20-port pool.
pub async fn test_broker() -> TestBroker {
    test_broker_with_ports(20).await
}
