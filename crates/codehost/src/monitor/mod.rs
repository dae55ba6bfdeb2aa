//! Idle monitor: periodic reclamation of abandoned sessions.
//!
//! Each tick enumerates the workload containers from the runtime driver,
//! derives an activity window from their logs, and either renews the
//! owning session's TTL or tears the container down and returns its port
//! to the pool.

mod activity;

pub use activity::{ActivityWindow, LOG_TIME_FORMAT, is_active, parse_log_time, session_duration};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, TimeDelta};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::ports::PortAllocator;
use crate::runtime::RuntimeDriver;
use crate::store::SessionStore;

/// Log line marking an accepted IDE connection.
const CONNECT_MARKER: &str = "New connection established";

/// Log line marking a graceful client disconnect.
const DISCONNECT_MARKER: &str = "The client has disconnected gracefully";

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Wall-clock pause between ticks.
    pub interval: Duration,
    /// Grace period after the last observed activity.
    pub idle_offset: Duration,
    /// TTL stamped on sessions when renewing.
    pub session_ttl: Duration,
    /// Bounded wait before a container stop escalates to a kill.
    pub stop_timeout: Duration,
    /// Containers inspected concurrently per tick.
    pub fan_out: usize,
    /// Port of the shared static-asset backend; never evicted here.
    pub static_asset_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_offset: Duration::from_secs(5 * 60),
            session_ttl: Duration::from_secs(15 * 60),
            stop_timeout: Duration::from_secs(10),
            fan_out: 8,
            static_asset_port: 3000,
        }
    }
}

/// Periodic task that renews sessions with recent activity and tears down
/// the rest.
pub struct IdleMonitor {
    driver: Arc<dyn RuntimeDriver>,
    store: SessionStore,
    ports: PortAllocator,
    config: MonitorConfig,
}

impl IdleMonitor {
    /// Create a new monitor.
    pub fn new(
        driver: Arc<dyn RuntimeDriver>,
        store: SessionStore,
        ports: PortAllocator,
        config: MonitorConfig,
    ) -> Self {
        Self {
            driver,
            store,
            ports,
            config,
        }
    }

    /// Run forever. A failed tick is logged and retried on the next one.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            idle_offset_secs = self.config.idle_offset.as_secs(),
            "starting idle monitor"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(err) = self.tick().await {
                warn!(error = ?err, "monitor tick failed");
            }
        }
    }

    /// One reclamation pass over the fleet.
    pub async fn tick(&self) -> Result<()> {
        self.tick_at(Local::now().naive_local()).await
    }

    /// One reclamation pass, judged against the given wall-clock time.
    ///
    /// One container's failure never aborts the others; zero containers is
    /// a normal, silent outcome.
    pub async fn tick_at(&self, now: NaiveDateTime) -> Result<()> {
        let containers = self
            .driver
            .list_workload_containers()
            .await
            .context("listing workload containers")?;

        if containers.is_empty() {
            debug!("no workload containers running");
            return Ok(());
        }

        futures::stream::iter(containers)
            .for_each_concurrent(self.config.fan_out, |container_id| async move {
                if let Err(err) = self.inspect_container(&container_id, now).await {
                    warn!(
                        container = %container_id,
                        error = ?err,
                        "container inspection failed, retrying next tick"
                    );
                }
            })
            .await;

        Ok(())
    }

    async fn inspect_container(&self, container_id: &str, now: NaiveDateTime) -> Result<()> {
        let bindings = self.driver.assigned_ports(container_id).await?;
        // Output looks like "0.0.0.0:3001->8080/tcp, [::]:3001->8080/tcp".
        if bindings.contains(&format!(":{}->", self.config.static_asset_port)) {
            debug!(container = %container_id, "static asset container ignored");
            return Ok(());
        }

        let (established, closed, started_at) = tokio::try_join!(
            self.driver.tail_log_marker(container_id, CONNECT_MARKER),
            self.driver.tail_log_marker(container_id, DISCONNECT_MARKER),
            self.driver.inspect_started_at(container_id),
        )?;

        let Some(started_at) = started_at else {
            debug!(container = %container_id, "no usable start time, skipping");
            return Ok(());
        };

        let window = ActivityWindow {
            connect: established.last().and_then(|raw| parse_log_time(raw)),
            disconnect: closed.last().and_then(|raw| parse_log_time(raw)),
        };

        let idle_offset =
            TimeDelta::from_std(self.config.idle_offset).context("idle offset out of range")?;
        let active = is_active(now, window, started_at, idle_offset);
        debug!(container = %container_id, ?window, active, "activity verdict");

        if active {
            self.renew(container_id).await
        } else {
            self.evict(container_id, window).await
        }
    }

    async fn renew(&self, container_id: &str) -> Result<()> {
        match self.store.get_by_container(container_id).await? {
            Some(session) => {
                if self
                    .store
                    .renew_ttl(&session.user_id, self.config.session_ttl)
                    .await?
                {
                    debug!(container = %container_id, user = %session.user_id, "session ttl renewed");
                }
                Ok(())
            }
            None => {
                debug!(container = %container_id, "active container has no session entry");
                Ok(())
            }
        }
    }

    /// Tear down an idle container: stop it first, then drop both session
    /// indexes, then free the port. A crash between the last two steps
    /// leaks the port rather than double-freeing it.
    async fn evict(&self, container_id: &str, window: ActivityWindow) -> Result<()> {
        info!(container = %container_id, "evicting idle container");

        self.driver
            .stop_container(container_id, self.config.stop_timeout)
            .await
            .context("stopping idle container")?;

        if let Some(port) = self.store.delete_by_container(container_id).await? {
            self.ports.release(port).await?;
            debug!(container = %container_id, port, "session removed, port released");
        }

        if let Some(duration) = session_duration(window) {
            info!(
                container = %container_id,
                duration_secs = duration.num_seconds(),
                "session duration observed"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::runtime::{RuntimeError, RuntimeResult};
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime};
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default, Clone)]
    struct ContainerScript {
        bindings: String,
        started_at: Option<&'static str>,
        connect_lines: Vec<&'static str>,
        disconnect_lines: Vec<&'static str>,
    }

    #[derive(Default)]
    struct ScriptedDriver {
        containers: Mutex<HashMap<String, ContainerScript>>,
        stopped: Mutex<Vec<String>>,
    }

    impl ScriptedDriver {
        fn insert(&self, id: &str, script: ContainerScript) {
            self.containers
                .lock()
                .unwrap()
                .insert(id.to_string(), script);
        }

        fn script(&self, id: &str) -> RuntimeResult<ContainerScript> {
            self.containers
                .lock()
                .unwrap()
                .get(id)
                .cloned()
                .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
        }

        fn stopped_ids(&self) -> Vec<String> {
            self.stopped.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RuntimeDriver for ScriptedDriver {
        async fn list_workload_containers(&self) -> RuntimeResult<Vec<String>> {
            let mut ids: Vec<String> =
                self.containers.lock().unwrap().keys().cloned().collect();
            ids.sort();
            Ok(ids)
        }

        async fn inspect_started_at(
            &self,
            container_id: &str,
        ) -> RuntimeResult<Option<NaiveTime>> {
            let script = self.script(container_id)?;
            Ok(script
                .started_at
                .map(|raw| NaiveTime::parse_from_str(raw, LOG_TIME_FORMAT).unwrap()))
        }

        async fn tail_log_marker(
            &self,
            container_id: &str,
            marker: &str,
        ) -> RuntimeResult<Vec<String>> {
            let script = self.script(container_id)?;
            let lines = if marker == CONNECT_MARKER {
                script.connect_lines
            } else {
                script.disconnect_lines
            };
            Ok(lines.into_iter().map(String::from).collect())
        }

        async fn start_session_container(&self, _port: u16) -> RuntimeResult<String> {
            unimplemented!("not used by the monitor")
        }

        async fn stop_container(
            &self,
            container_id: &str,
            _timeout: Duration,
        ) -> RuntimeResult<()> {
            self.containers.lock().unwrap().remove(container_id);
            self.stopped.lock().unwrap().push(container_id.to_string());
            Ok(())
        }

        async fn assigned_ports(&self, container_id: &str) -> RuntimeResult<String> {
            Ok(self.script(container_id)?.bindings)
        }

        async fn find_container_by_port(&self, _port: u16) -> RuntimeResult<Option<String>> {
            Ok(None)
        }
    }

    struct Harness {
        monitor: IdleMonitor,
        driver: Arc<ScriptedDriver>,
        store: SessionStore,
        ports: PortAllocator,
    }

    async fn harness() -> Harness {
        let db = Database::in_memory().await.unwrap();
        let store = SessionStore::new(db.pool().clone());
        let ports = PortAllocator::new(db.pool().clone());
        ports.initialize(3001..=3010).await.unwrap();

        let driver = Arc::new(ScriptedDriver::default());
        let monitor = IdleMonitor::new(
            driver.clone(),
            store.clone(),
            ports.clone(),
            MonitorConfig::default(),
        );

        Harness {
            monitor,
            driver,
            store,
            ports,
        }
    }

    fn at(value: &str) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 14)
            .unwrap()
            .and_time(NaiveTime::parse_from_str(value, LOG_TIME_FORMAT).unwrap())
    }

    fn bindings(port: u16) -> String {
        format!("0.0.0.0:{port}->8080/tcp, [::]:{port}->8080/tcp")
    }

    #[tokio::test]
    async fn test_empty_fleet_is_a_silent_tick() {
        let h = harness().await;
        h.monitor.tick_at(at("10:00:00")).await.unwrap();
        assert!(h.driver.stopped_ids().is_empty());
    }

    #[tokio::test]
    async fn test_static_asset_container_is_never_evicted() {
        let h = harness().await;
        h.driver.insert(
            "static-1",
            ContainerScript {
                bindings: bindings(3000),
                // Long past the grace period with no activity at all.
                started_at: Some("01:00:00"),
                ..Default::default()
            },
        );

        h.monitor.tick_at(at("10:00:00")).await.unwrap();
        assert!(h.driver.stopped_ids().is_empty());
    }

    #[tokio::test]
    async fn test_connected_container_gets_ttl_renewed() {
        let h = harness().await;
        let created = h
            .store
            .create_session("u1", "c1", 3001, Duration::from_secs(60))
            .await
            .unwrap();
        h.driver.insert(
            "c1",
            ContainerScript {
                bindings: bindings(3001),
                started_at: Some("09:00:00"),
                connect_lines: vec!["[10:00:00]"],
                ..Default::default()
            },
        );

        h.monitor.tick_at(at("11:30:00")).await.unwrap();

        assert!(h.driver.stopped_ids().is_empty());
        let renewed = h.store.get_by_user("u1").await.unwrap().unwrap();
        assert!(renewed.expires_at > created.expires_at);
    }

    #[tokio::test]
    async fn test_idle_container_is_evicted_end_to_end() {
        let h = harness().await;
        let port = h.ports.acquire().await.unwrap().unwrap();
        h.store
            .create_session("u1", "c1", port, Duration::from_secs(900))
            .await
            .unwrap();
        let free_before = h.ports.free_count().await.unwrap();

        // Disconnected at 09:10, judged at 09:20 with a 5 minute offset.
        h.driver.insert(
            "c1",
            ContainerScript {
                bindings: bindings(port),
                started_at: Some("08:55:00"),
                connect_lines: vec!["[09:00:00]"],
                disconnect_lines: vec!["[09:10:00]"],
            },
        );

        h.monitor.tick_at(at("09:20:00")).await.unwrap();

        assert_eq!(h.driver.stopped_ids(), vec!["c1".to_string()]);
        assert!(h.store.get_by_user("u1").await.unwrap().is_none());
        assert!(h.store.get_by_container("c1").await.unwrap().is_none());
        assert_eq!(h.ports.free_count().await.unwrap(), free_before + 1);
    }

    #[tokio::test]
    async fn test_one_bad_container_does_not_abort_the_tick() {
        let h = harness().await;
        let port = h.ports.acquire().await.unwrap().unwrap();
        h.store
            .create_session("u1", "c1", port, Duration::from_secs(900))
            .await
            .unwrap();

        h.driver.insert(
            "c1",
            ContainerScript {
                bindings: bindings(port),
                started_at: Some("08:55:00"),
                connect_lines: vec!["[09:00:00]"],
                disconnect_lines: vec!["[09:10:00]"],
            },
        );
        // Listing returns an extra id that every inspection call fails on.
        struct ListsExtra(Arc<ScriptedDriver>);

        #[async_trait]
        impl RuntimeDriver for ListsExtra {
            async fn list_workload_containers(&self) -> RuntimeResult<Vec<String>> {
                let mut ids = self.0.list_workload_containers().await?;
                ids.insert(0, "broken".to_string());
                Ok(ids)
            }
            async fn inspect_started_at(&self, id: &str) -> RuntimeResult<Option<NaiveTime>> {
                self.0.inspect_started_at(id).await
            }
            async fn tail_log_marker(&self, id: &str, m: &str) -> RuntimeResult<Vec<String>> {
                self.0.tail_log_marker(id, m).await
            }
            async fn start_session_container(&self, port: u16) -> RuntimeResult<String> {
                self.0.start_session_container(port).await
            }
            async fn stop_container(&self, id: &str, t: Duration) -> RuntimeResult<()> {
                self.0.stop_container(id, t).await
            }
            async fn assigned_ports(&self, id: &str) -> RuntimeResult<String> {
                self.0.assigned_ports(id).await
            }
            async fn find_container_by_port(&self, p: u16) -> RuntimeResult<Option<String>> {
                self.0.find_container_by_port(p).await
            }
        }

        let monitor = IdleMonitor::new(
            Arc::new(ListsExtra(h.driver.clone())),
            h.store.clone(),
            h.ports.clone(),
            MonitorConfig::default(),
        );

        monitor.tick_at(at("09:20:00")).await.unwrap();

        // The healthy idle container was still processed.
        assert_eq!(h.driver.stopped_ids(), vec!["c1".to_string()]);
    }
}
