//! Heartbeat Service (C2): a single cooperative periodic loop per
//! control-plane replica, gated by the `heartbeat` Coordination lease
//! so only one replica runs each cycle.
//!
//! Per-server pings fan out as a bounded worker pool rather than a
//! thread per host, keeping coroutine-heavy I/O fan-out on a
//! worker-pool-plus-channel shape instead of one task per connection.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatConfig;
use crate::container_runtime::{status_from_container_state, ContainerRuntimeClient};
use crate::internal_api::InternalApiClient;
use crate::metrics::Metrics;
use crate::registry::Registry;
use crate::store::WorkspaceStore;
use crate::types::{HealthStatus, ServerHealthSample, ServerId, ServerStatus, WorkspaceStatus};
use crate::AnyError;

const MAX_CONCURRENT_PINGS: usize = 32;

#[derive(Clone)]
pub struct HeartbeatService {
    config: HeartbeatConfig,
    registry: Registry,
    store: WorkspaceStore,
    runtime_client: ContainerRuntimeClient,
    internal_api: InternalApiClient,
    lease: crate::coordination::Coordination,
    metrics: Metrics,
    samples: Arc<DashMap<ServerId, ServerHealthSample>>,
    cycle_count: Arc<std::sync::atomic::AtomicU64>,
}

impl HeartbeatService {
    pub fn new(
        config: HeartbeatConfig,
        registry: Registry,
        store: WorkspaceStore,
        runtime_client: ContainerRuntimeClient,
        internal_api: InternalApiClient,
        lease: crate::coordination::Coordination,
        metrics: Metrics,
    ) -> Self {
        HeartbeatService {
            config,
            registry,
            store,
            runtime_client,
            internal_api,
            lease,
            metrics,
            samples: Arc::new(DashMap::new()),
            cycle_count: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub fn sample(&self, server_id: &str) -> Option<ServerHealthSample> {
        self.samples.get(server_id).map(|s| s.clone())
    }

    /// Spawns the periodic loop. Returns a token the caller can cancel
    /// to request a clean `stop()` — no sample is ever written mid-cycle.
    pub fn spawn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let this = self.clone();
        let loop_token = token.clone();
        tokio::task::spawn(async move {
            this.run_loop(loop_token).await;
        });
        token
    }

    async fn run_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_seconds));
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("heartbeat service stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            let lease_ttl = Duration::from_secs(self.config.interval_seconds.max(5) * 2);
            match self.lease.try_acquire_lease("heartbeat", lease_ttl).await {
                Ok(true) => {
                    self.metrics.active_leases_held.inc();
                    if let Err(err) = self.run_cycle().await {
                        tracing::error!(error = %err, "heartbeat cycle failed");
                    }
                    if let Err(err) = self.lease.release_lease("heartbeat").await {
                        tracing::warn!(error = %err, "failed to release heartbeat lease");
                    }
                    self.metrics.active_leases_held.dec();
                }
                Ok(false) => {
                    tracing::trace!("heartbeat lease held by another replica, skipping cycle");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to acquire heartbeat lease");
                }
            }
        }
    }

    async fn run_cycle(&self) -> Result<(), AnyError> {
        let cycle = self
            .cycle_count
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        self.check_all_servers().await;
        self.mark_stale_servers().await;
        self.refresh_fleet_gauges().await;

        if cycle % self.config.workspace_check_interval_multiplier as u64 == 0 {
            self.check_all_workspace_containers().await?;
        }
        Ok(())
    }

    /// Recomputes `servers_by_status`/`workspaces_by_status` from the
    /// current Registry snapshot and Workspace Store listing. Run once
    /// per cycle rather than incrementally: tallying fresh from what was
    /// just iterated is simpler than tracking deltas and costs nothing
    /// extra at this cadence.
    async fn refresh_fleet_gauges(&self) {
        let mut by_server_status: std::collections::HashMap<ServerStatus, i64> = std::collections::HashMap::new();
        for server in self.registry.snapshot() {
            *by_server_status.entry(server.status).or_default() += 1;
        }
        for status in [
            ServerStatus::Active,
            ServerStatus::Draining,
            ServerStatus::Maintenance,
            ServerStatus::Offline,
            ServerStatus::Error,
        ] {
            self.metrics
                .set_servers_by_status(&status, *by_server_status.get(&status).unwrap_or(&0));
        }

        match self.store.list_all().await {
            Ok(records) => {
                let mut by_workspace_status: std::collections::HashMap<WorkspaceStatus, i64> =
                    std::collections::HashMap::new();
                for record in records {
                    *by_workspace_status.entry(record.status).or_default() += 1;
                }
                for status in [
                    WorkspaceStatus::Creating,
                    WorkspaceStatus::Running,
                    WorkspaceStatus::Stopped,
                    WorkspaceStatus::Error,
                    WorkspaceStatus::Deleting,
                ] {
                    self.metrics
                        .set_workspaces_by_status(&status, *by_workspace_status.get(&status).unwrap_or(&0));
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to list workspaces for status gauges");
            }
        }
    }

    async fn check_all_servers(&self) {
        let servers = self.registry.snapshot();
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PINGS));
        let mut handles = Vec::with_capacity(servers.len());

        for server in servers {
            let this = self.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.check_server(&server.id, &server.address, server.management_port)
                    .await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn check_server(&self, server_id: &str, address: &str, port: u16) {
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let result = tokio::time::timeout(timeout, self.runtime_client.stats(address, port, timeout)).await;

        let old_status = self
            .samples
            .get(server_id)
            .map(|s| s.status)
            .unwrap_or(HealthStatus::Unknown);

        let new_sample = match result {
            Ok(Ok(stats)) => {
                let metrics: crate::types::ServerMetrics = stats.into();
                let status = Self::calculate_status(&metrics, self.registry.get(server_id).as_ref());
                ServerHealthSample {
                    status,
                    last_success_ts: Some(Utc::now()),
                    consecutive_failures: 0,
                    last_error: None,
                    metrics,
                }
            }
            Ok(Err(err)) => self.failed_sample(server_id, err.to_string()),
            Err(_) => self.failed_sample(server_id, "ping timed out".to_string()),
        };

        self.samples.insert(server_id.to_string(), new_sample.clone());
        self.registry
            .record_heartbeat(server_id, new_sample.last_success_ts.is_some())
            .await;

        if let Err(err) = self
            .internal_api
            .report_server_heartbeat(server_id, &new_sample.metrics)
            .await
        {
            tracing::warn!(server_id, error = %err, "failed to report heartbeat upstream");
        }

        if old_status != new_sample.status {
            tracing::info!(
                server_id,
                from = ?old_status,
                to = ?new_sample.status,
                "server health status changed"
            );
        }
    }

    fn failed_sample(&self, server_id: &str, error: String) -> ServerHealthSample {
        let mut previous = self
            .samples
            .get(server_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        previous.consecutive_failures += 1;
        previous.last_error = Some(error);
        previous.status = if previous.consecutive_failures >= self.config.failure_threshold {
            HealthStatus::Unhealthy
        } else {
            previous.status
        };
        previous
    }

    /// DEGRADED if either cpu or memory utilisation of the host exceeds
    /// 95%, otherwise HEALTHY.
    fn calculate_status(
        metrics: &crate::types::ServerMetrics,
        server: Option<&crate::types::ServerRecord>,
    ) -> HealthStatus {
        if let Some(server) = server {
            let cpu_util = if server.capacity.cpu_cores > 0.0 {
                metrics.used_cpu / server.capacity.cpu_cores
            } else {
                0.0
            };
            let mem_util = if server.capacity.memory_mb > 0 {
                metrics.used_memory_mb as f64 / server.capacity.memory_mb as f64
            } else {
                0.0
            };
            if cpu_util > 0.95 || mem_util > 0.95 {
                return HealthStatus::Degraded;
            }
        }
        HealthStatus::Healthy
    }

    async fn mark_stale_servers(&self) {
        let now = Utc::now();
        let mut stale_ids = Vec::new();
        for mut entry in self.samples.iter_mut() {
            if let Some(last) = entry.last_success_ts {
                let elapsed = now.signed_duration_since(last).num_seconds();
                if elapsed > self.config.stale_threshold_seconds {
                    entry.status = HealthStatus::Unreachable;
                    stale_ids.push(entry.key().clone());
                }
            }
        }
        for server_id in stale_ids {
            if self
                .registry
                .mark_offline_if_stale(&server_id, self.config.stale_threshold_seconds)
                .await
            {
                tracing::info!(server_id, "server marked OFFLINE after exceeding stale threshold");
            }
        }
    }

    /// Enumerate workspace containers on each host and refresh Workspace
    /// Record status from container state, per §4.2 step 4.
    async fn check_all_workspace_containers(&self) -> Result<(), AnyError> {
        for server in self.registry.snapshot() {
            let containers = match self
                .runtime_client
                .list_workspace_containers(&server.address, server.management_port)
                .await
            {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(server_id = %server.id, error = %err, "could not list workspace containers");
                    continue;
                }
            };

            for container in containers {
                let Some(workspace_id) = container
                    .labels
                    .get(crate::container_runtime::WORKSPACE_ID_LABEL)
                else {
                    continue;
                };
                let Some(new_status) = status_from_container_state(&container.state) else {
                    continue;
                };
                if let Ok(Some(mut record)) = self.store.get(workspace_id).await {
                    if record.status != new_status {
                        record.status = new_status;
                        record.updated_at = Utc::now();
                        if let Err(err) = self.store.save(&record).await {
                            tracing::warn!(workspace_id, error = %err, "failed to persist workspace status sync");
                            continue;
                        }
                        let status_str = match new_status {
                            WorkspaceStatus::Running => "running",
                            WorkspaceStatus::Stopped => "stopped",
                            WorkspaceStatus::Creating => "starting",
                            WorkspaceStatus::Error | WorkspaceStatus::Deleting => "error",
                        };
                        let _ = self
                            .internal_api
                            .report_workspace_sync_status(workspace_id, status_str)
                            .await;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Quick read-only helper used by the Placement Engine to exclude
/// UNHEALTHY/UNREACHABLE hosts, beyond the `ACTIVE` registry-status
/// filter.
pub fn is_schedulable(sample: Option<&ServerHealthSample>) -> bool {
    match sample {
        None => true,
        Some(s) => matches!(s.status, HealthStatus::Healthy | HealthStatus::Degraded | HealthStatus::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> HeartbeatService {
        let redis = redis::Client::open("redis://127.0.0.1/").unwrap();
        HeartbeatService::new(
            HeartbeatConfig {
                interval_seconds: 10,
                timeout_seconds: 2,
                failure_threshold: 3,
                stale_threshold_seconds: 60,
                workspace_check_interval_multiplier: 1,
            },
            Registry::new(redis.clone()),
            WorkspaceStore::new(redis.clone()),
            ContainerRuntimeClient::new(),
            InternalApiClient::new("http://admin.internal".into(), "token".into()),
            crate::coordination::Coordination::new(redis),
            Metrics::default(),
        )
    }

    // P6: no UNHEALTHY -> HEALTHY flip without an intervening successful
    // ping. Three consecutive timeouts trip a server to UNHEALTHY; the
    // very next successful sample (constructed the same way
    // `check_server` builds one on success) must reset it, never a
    // failed sample alone.
    #[test]
    fn three_consecutive_failures_trip_unhealthy_then_recover_on_success() {
        let service = test_service();
        let server_id = "s1";

        for n in 1..=3 {
            let sample = service.failed_sample(server_id, "ping timed out".to_string());
            service.samples.insert(server_id.to_string(), sample.clone());
            if n < 3 {
                assert_ne!(sample.status, HealthStatus::Unhealthy);
            } else {
                assert_eq!(sample.status, HealthStatus::Unhealthy);
                assert_eq!(sample.consecutive_failures, 3);
            }
        }

        let recovered = ServerHealthSample {
            status: HealthStatus::Healthy,
            last_success_ts: Some(Utc::now()),
            consecutive_failures: 0,
            last_error: None,
            metrics: crate::types::ServerMetrics::default(),
        };
        service.samples.insert(server_id.to_string(), recovered.clone());
        let sample = service.sample(server_id).unwrap();
        assert_eq!(sample.status, HealthStatus::Healthy);
        assert_eq!(sample.consecutive_failures, 0);
    }

    #[test]
    fn degraded_above_95_percent_utilisation() {
        let server = crate::types::ServerRecord {
            id: "s1".into(),
            hostname: "s1".into(),
            address: "127.0.0.1".into(),
            management_port: 9000,
            status: ServerStatus::Active,
            capacity: crate::types::Capacity {
                cpu_cores: 8.0,
                memory_mb: 16384,
                disk_gb: 200,
                bandwidth_mbps: 1000,
            },
            reserved: crate::types::Capacity::default(),
            active_workspaces: 0,
            topology: crate::types::Topology {
                architecture: crate::types::Architecture::Amd64,
                region: "us-east-1".into(),
                labels: Default::default(),
                has_gpu: false,
                gpu_kind: None,
                gpu_count: 0,
            },
            workspace_image_by_variant: Default::default(),
            last_heartbeat_ts: None,
            consecutive_heartbeat_failures: 0,
        };
        let metrics = crate::types::ServerMetrics {
            used_cpu: 7.8,
            used_memory_mb: 1000,
            ..Default::default()
        };
        assert_eq!(
            HeartbeatService::calculate_status(&metrics, Some(&server)),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn unhealthy_and_unreachable_hosts_are_unschedulable() {
        assert!(is_schedulable(None));
        let mut sample = ServerHealthSample::default();
        sample.status = HealthStatus::Healthy;
        assert!(is_schedulable(Some(&sample)));
        sample.status = HealthStatus::Unhealthy;
        assert!(!is_schedulable(Some(&sample)));
        sample.status = HealthStatus::Unreachable;
        assert!(!is_schedulable(Some(&sample)));
    }
}
