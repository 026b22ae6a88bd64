//! Workspace Lifecycle Manager (C4): the central state machine.
//! Per-workspace operations are serialised by `workspace_id` via a
//! striped pool of keyed locks — cheaper than a dedicated actor task
//! per workspace when the fleet holds many thousands of them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::container_runtime::{ContainerLimits, ContainerRuntimeClient, CreateContainerRequest};
use crate::error::CoreError;
use crate::filesync::FileSyncEngine;
use crate::hardware_specs::HardwareSpecCatalogue;
use crate::heartbeat::{is_schedulable, HeartbeatService};
use crate::internal_api::InternalApiClient;
use crate::metrics::Metrics;
use crate::placement::{self, PlacementRequest};
use crate::registry::Registry;
use crate::store::WorkspaceStore;
use crate::types::{
    Assignment, Requirements, SessionId, UserId, WorkspaceId, WorkspaceRecord, WorkspaceStatus,
};
use crate::AnyError;

/// Name of the Coordination lease gating the metering reconciliation job.
const METERING_LEASE: &str = "metering";
/// TTL the metering lease is acquired and renewed with.
const METERING_LEASE_TTL: Duration = Duration::from_secs(120);
/// How many workspaces `run_metering_tick` processes between lease
/// renewals; keeps a single pass well under the lease TTL even when one
/// `report_usage_tick` call takes its full 10s timeout.
const METERING_LEASE_RENEW_EVERY: usize = 20;

#[derive(Clone, Debug)]
pub struct CreateWorkspaceConfig {
    pub tier: String,
    pub required_region: Option<String>,
    pub workspace_id: Option<WorkspaceId>,
    pub pod_template: Option<crate::filesync::PodTemplate>,
}

#[derive(Clone)]
pub struct LifecycleManager {
    config: Arc<Config>,
    registry: Registry,
    store: WorkspaceStore,
    file_sync: FileSyncEngine,
    hardware_specs: HardwareSpecCatalogue,
    runtime_client: ContainerRuntimeClient,
    internal_api: InternalApiClient,
    coordination: crate::coordination::Coordination,
    heartbeat: HeartbeatService,
    metrics: Metrics,
    locks: Arc<DashMap<WorkspaceId, Arc<AsyncMutex<()>>>>,
}

impl LifecycleManager {
    pub fn new(
        config: Arc<Config>,
        registry: Registry,
        store: WorkspaceStore,
        file_sync: FileSyncEngine,
        hardware_specs: HardwareSpecCatalogue,
        runtime_client: ContainerRuntimeClient,
        internal_api: InternalApiClient,
        coordination: crate::coordination::Coordination,
        heartbeat: HeartbeatService,
        metrics: Metrics,
    ) -> Self {
        LifecycleManager {
            config,
            registry,
            store,
            file_sync,
            hardware_specs,
            runtime_client,
            internal_api,
            coordination,
            heartbeat,
            metrics,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, workspace_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn get(&self, workspace_id: &WorkspaceId) -> Result<WorkspaceRecord, CoreError> {
        self.store
            .get(workspace_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?
            .ok_or_else(|| CoreError::NotFound {
                kind: "workspace",
                id: workspace_id.clone(),
            })
    }

    /// Like `get`, but opportunistically re-syncs `status` from the live
    /// container state first, so a caller polling right after an
    /// out-of-band container death sees `ERROR` without waiting for the
    /// next heartbeat cycle. Resync failures are logged and ignored —
    /// the record as last known to the Store is still returned.
    pub async fn get_workspace(&self, workspace_id: &WorkspaceId) -> Result<WorkspaceRecord, CoreError> {
        let mut record = self.get(workspace_id).await?;

        if let (Some(server_id), Some(container_id)) =
            (record.assigned.server_id.clone(), record.assigned.container_id.clone())
        {
            if let Some(server) = self.registry.get(&server_id) {
                match self
                    .runtime_client
                    .container_status(&server.address, server.management_port, &container_id)
                    .await
                {
                    Ok(summary) => {
                        if let Some(live_status) =
                            crate::container_runtime::status_from_container_state(&summary.state)
                        {
                            if live_status != record.status {
                                record.status = live_status;
                                record.updated_at = Utc::now();
                                if let Err(err) = self.save(&record).await {
                                    tracing::warn!(
                                        workspace_id = %workspace_id,
                                        error = %err,
                                        "failed to persist resynced workspace status"
                                    );
                                }
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(
                            workspace_id = %workspace_id,
                            server_id = %server_id,
                            error = %err,
                            "container status resync failed, returning last known record"
                        );
                    }
                }
            }
        }
        Ok(record)
    }

    /// Create a workspace. Each numbered step below runs in a fixed
    /// order; a failure in steps 3-4 releases the reservation and sets
    /// ERROR.
    pub async fn create(
        &self,
        user_id: UserId,
        session_id: SessionId,
        cfg: CreateWorkspaceConfig,
    ) -> Result<WorkspaceRecord, CoreError> {
        let workspace_id = cfg.workspace_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let lock = self.lock_for(&workspace_id);
        let _guard = lock.lock().await;

        let spec = self.hardware_specs.resolve(&cfg.tier).await?;
        let requirements = Requirements {
            cpu_cores: spec.cpu_cores,
            memory_mb: spec.memory_mb,
            disk_gb: spec.disk_gb,
            bandwidth_mbps: spec.bandwidth_mbps,
            architecture: spec.architecture.unwrap_or(crate::types::Architecture::Amd64),
            requires_gpu: spec.is_gpu,
            gpu_kind: spec.gpu_kind,
        };

        // 1. Persist record with status=CREATING.
        let now = Utc::now();
        let owner_user_id = user_id.clone();
        let mut record = WorkspaceRecord {
            id: workspace_id.clone(),
            owner_user_id: user_id,
            owner_session_id: session_id,
            tier: cfg.tier.clone(),
            requirements,
            assigned: Assignment::default(),
            status: WorkspaceStatus::Creating,
            region_preference: cfg.required_region.clone(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        };
        self.save(&record).await?;

        // 2. Placement.
        let (server_id, reservation) = match self.place_with_retries(&requirements, &cfg.required_region).await {
            Ok(pair) => pair,
            Err(err) => {
                record.status = WorkspaceStatus::Error;
                record.metadata.insert(
                    "last_error".to_string(),
                    serde_json::Value::String(err.to_string()),
                );
                let _ = self.save(&record).await;
                return Err(err);
            }
        };

        let server = self
            .registry
            .get(&server_id)
            .ok_or_else(|| CoreError::Internal("server vanished after placement".into()))?;

        // 3-4: allocate workspace directory and launch the container.
        // Any failure here releases the reservation and sets ERROR.
        let launch_result = self.launch_container(&workspace_id, &server, &requirements).await;
        let container_id = match launch_result {
            Ok(id) => id,
            Err(err) => {
                let _ = self.registry.release(&reservation).await;
                record.status = WorkspaceStatus::Error;
                record.metadata.insert(
                    "last_error".to_string(),
                    serde_json::Value::String(err.to_string()),
                );
                let _ = self.save(&record).await;
                return Err(CoreError::Internal(err.to_string()));
            }
        };

        record.assigned = Assignment {
            server_id: Some(server_id.clone()),
            container_id: Some(container_id.clone()),
            host_address: Some(server.address.clone()),
        };

        // 5. File Sync restore; failures here downgrade to a warning.
        match self.file_sync.restore(&workspace_id, &server, &container_id, None).await {
            Ok(result) if result.partial => {
                record.set_restore_partial(true);
                tracing::warn!(workspace_id, "restore completed with partial failures");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(workspace_id, error = %err, "restore failed, continuing with empty tree");
                record.set_restore_partial(true);
            }
        }

        if let Err(err) = self
            .file_sync
            .sync_user_dotfiles(&workspace_id, &server, &container_id, &owner_user_id)
            .await
        {
            tracing::debug!(workspace_id, error = %err, "dotfile sync skipped");
        }

        if let Some(template) = &cfg.pod_template {
            if let Err(err) = self
                .file_sync
                .apply_pod_template(&workspace_id, &server, &container_id, template)
                .await
            {
                tracing::warn!(workspace_id, error = %err, "pod template application had failures");
            }
        }

        // 6. Start background sync loop.
        self.file_sync.start_background(workspace_id.clone(), self.config.file_sync.background_interval);

        // 7. Transition to RUNNING.
        record.status = WorkspaceStatus::Running;
        record.updated_at = Utc::now();
        self.save(&record).await?;

        Ok(record)
    }

    async fn place_with_retries(
        &self,
        requirements: &Requirements,
        region_preference: &Option<String>,
    ) -> Result<(String, crate::registry::ReservationHandle), CoreError> {
        let max_retries = self.config.placement.max_retries;
        let req = PlacementRequest {
            requirements: *requirements,
            region_preference: region_preference.clone(),
            labels_required: Vec::new(),
        };

        for attempt in 0..=max_retries {
            // Heartbeat state lives outside the Registry snapshot
            // placement itself reasons over, so UNHEALTHY/UNREACHABLE
            // hosts are excluded here rather than inside `placement`,
            // which stays a pure function of Registry state alone.
            let snapshot: Vec<_> = self
                .registry
                .snapshot()
                .into_iter()
                .filter(|s| is_schedulable(self.heartbeat.sample(&s.id).as_ref()))
                .collect();
            let server_id = match placement::place(&snapshot, &req) {
                Ok(id) => id,
                Err(placement::PlacementError::RegionUnsatisfiable) => {
                    self.metrics.record_placement_failure("region_unsatisfiable");
                    return Err(CoreError::RegionUnsatisfiable);
                }
                Err(placement::PlacementError::CapacityUnsatisfiable) => {
                    self.metrics.record_placement_failure("capacity_unsatisfiable");
                    return Err(CoreError::CapacityUnsatisfiable);
                }
            };

            match self.registry.reserve(&server_id, requirements).await {
                Ok(handle) => return Ok((server_id, handle)),
                Err(CoreError::CapacityUnsatisfiable) => {
                    tracing::debug!(attempt, server_id, "placement lost the reservation race, retrying");
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
        self.metrics.record_placement_failure("placement_conflict");
        Err(CoreError::PlacementConflict)
    }

    async fn launch_container(
        &self,
        workspace_id: &str,
        server: &crate::types::ServerRecord,
        requirements: &Requirements,
    ) -> Result<String, AnyError> {
        let image = self.image_for(server, requirements);
        let workspace_dir = format!("{}/{}", self.config.workspace_path_base, workspace_id);

        let mut labels = BTreeMap::new();
        labels.insert(crate::container_runtime::WORKSPACE_LABEL.to_string(), "true".to_string());
        labels.insert(
            crate::container_runtime::WORKSPACE_ID_LABEL.to_string(),
            workspace_id.to_string(),
        );

        let req = CreateContainerRequest {
            image: &image,
            labels,
            mounts: vec![(workspace_dir.as_str(), "/home/dev/workspace")],
            limits: ContainerLimits {
                cpu_cores: requirements.cpu_cores,
                memory_mb: requirements.memory_mb,
            },
            bandwidth_mbps: requirements.bandwidth_mbps,
        };

        let resp = self
            .runtime_client
            .create_container(&server.address, server.management_port, &req)
            .await?;
        Ok(resp.container_id)
    }

    fn image_for(&self, server: &crate::types::ServerRecord, requirements: &Requirements) -> String {
        if requirements.requires_gpu {
            if let Some(image) = server.workspace_image_by_variant.get("gpu") {
                return image.clone();
            }
            if let Some(image) = &self.config.default_workspace_images.gpu {
                return image.clone();
            }
        }
        let variant = match requirements.architecture {
            crate::types::Architecture::Amd64 => "amd64",
            crate::types::Architecture::Arm64 => "arm64",
        };
        server
            .workspace_image_by_variant
            .get(variant)
            .cloned()
            .unwrap_or_else(|| match requirements.architecture {
                crate::types::Architecture::Amd64 => self.config.default_workspace_images.amd64.clone(),
                crate::types::Architecture::Arm64 => self.config.default_workspace_images.arm64.clone(),
            })
    }

    /// Stop §4.4.3: flush final backup, stop container, release
    /// reservation, STOPPED. Idempotent.
    pub async fn stop(&self, workspace_id: &WorkspaceId) -> Result<WorkspaceRecord, CoreError> {
        let lock = self.lock_for(workspace_id);
        let _guard = lock.lock().await;
        let mut record = self.get(workspace_id).await?;

        if record.status == WorkspaceStatus::Stopped {
            return Ok(record);
        }
        if !matches!(record.status, WorkspaceStatus::Running | WorkspaceStatus::Error) {
            return Err(CoreError::InvalidState {
                reason: format!("cannot stop workspace in status {:?}", record.status),
            });
        }

        self.file_sync.stop_background(workspace_id).await;

        if let (Some(server_id), Some(container_id)) =
            (&record.assigned.server_id, &record.assigned.container_id)
        {
            if let Some(server) = self.registry.get(server_id) {
                if let Err(err) = self.file_sync.backup(workspace_id, &server, container_id, None, false).await {
                    tracing::warn!(workspace_id, error = %err, "final backup before stop failed");
                }
                if let Err(err) = self
                    .runtime_client
                    .stop_container(&server.address, server.management_port, container_id)
                    .await
                {
                    tracing::warn!(workspace_id, error = %err, "failed to stop container");
                }
            } else {
                tracing::warn!(workspace_id, server_id, "server not in registry, skipping final backup");
            }
            let handle = crate::registry::ReservationHandle {
                server_id: server_id.clone(),
                requirements: record.requirements,
            };
            let _ = self.registry.release(&handle).await;
        }

        record.status = WorkspaceStatus::Stopped;
        record.updated_at = Utc::now();
        self.save(&record).await?;
        Ok(record)
    }

    /// Restart §4.4.3: re-run placement (host may differ), re-launch
    /// the container against the existing workspace directory if it
    /// still exists on the chosen host, else restore from the object
    /// store first.
    pub async fn restart(&self, workspace_id: &WorkspaceId) -> Result<WorkspaceRecord, CoreError> {
        let lock = self.lock_for(workspace_id);
        let _guard = lock.lock().await;
        let mut record = self.get(workspace_id).await?;

        if record.status != WorkspaceStatus::Stopped {
            return Err(CoreError::InvalidState {
                reason: format!("cannot restart workspace in status {:?}", record.status),
            });
        }

        let (server_id, reservation) = self
            .place_with_retries(&record.requirements, &record.region_preference)
            .await?;
        let server = self
            .registry
            .get(&server_id)
            .ok_or_else(|| CoreError::Internal("server vanished after placement".into()))?;

        let host_changed = record.assigned.server_id.as_deref() != Some(server_id.as_str());

        let container_id = match self
            .launch_container(workspace_id, &server, &record.requirements)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                let _ = self.registry.release(&reservation).await;
                return Err(CoreError::Internal(err.to_string()));
            }
        };

        if host_changed {
            if let Err(err) = self.file_sync.restore(workspace_id, &server, &container_id, None).await {
                tracing::warn!(workspace_id, error = %err, "restore on restart had failures");
            }
        }

        record.assigned = Assignment {
            server_id: Some(server_id),
            container_id: Some(container_id),
            host_address: Some(server.address.clone()),
        };
        record.status = WorkspaceStatus::Running;
        record.updated_at = Utc::now();
        self.save(&record).await?;

        self.file_sync
            .start_background(workspace_id.clone(), self.config.file_sync.background_interval);

        Ok(record)
    }

    /// Delete §4.4.4.
    pub async fn delete(&self, workspace_id: &WorkspaceId, preserve_files: bool) -> Result<(), CoreError> {
        let lock = self.lock_for(workspace_id);
        let _guard = lock.lock().await;
        let mut record = self.get(workspace_id).await?;

        record.status = WorkspaceStatus::Deleting;
        self.save(&record).await?;

        // Disable background sync first; only then decide on a final
        // backup vs. wiping object-store state, so a late tick can't
        // race the delete.
        self.file_sync.stop_background(workspace_id).await;

        let server_id_opt = record.assigned.server_id.clone();
        let container_id_opt = record.assigned.container_id.clone();
        let server_opt = server_id_opt.as_ref().and_then(|id| self.registry.get(id));

        if preserve_files {
            match (&server_opt, &container_id_opt) {
                (Some(server), Some(container_id)) => {
                    if let Err(err) = self.file_sync.backup(workspace_id, server, container_id, None, false).await {
                        tracing::warn!(workspace_id, error = %err, "final backup before delete failed");
                    }
                }
                _ => tracing::warn!(workspace_id, "server unreachable, skipping final backup before delete"),
            }
        } else if let Err(err) = self.file_sync.delete_workspace_files(workspace_id).await {
            tracing::warn!(workspace_id, error = %err, "failed to delete object-store files");
        }

        if let (Some(server), Some(container_id)) = (&server_opt, &container_id_opt) {
            let _ = self
                .runtime_client
                .remove_container(&server.address, server.management_port, container_id)
                .await;
            let _ = self
                .runtime_client
                .remove_workspace_directory(&server.address, server.management_port, workspace_id)
                .await;
        }

        // Reservation released unconditionally whenever the workspace
        // was ever assigned, regardless of whether the registry lookup
        // above succeeded.
        if let Some(server_id) = &server_id_opt {
            let handle = crate::registry::ReservationHandle {
                server_id: server_id.clone(),
                requirements: record.requirements,
            };
            let _ = self.registry.release(&handle).await;
        }

        self.store
            .delete(workspace_id)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Live scaling §4.4.5.
    pub async fn scale(&self, workspace_id: &WorkspaceId, new_tier: &str) -> Result<WorkspaceRecord, CoreError> {
        let lock = self.lock_for(workspace_id);
        let _guard = lock.lock().await;
        let mut record = self.get(workspace_id).await?;

        if record.status != WorkspaceStatus::Running {
            return Err(CoreError::InvalidState {
                reason: format!("cannot scale workspace in status {:?}", record.status),
            });
        }

        let spec = self.hardware_specs.resolve(new_tier).await?;
        let new_requirements = Requirements {
            cpu_cores: spec.cpu_cores,
            memory_mb: spec.memory_mb,
            disk_gb: spec.disk_gb,
            bandwidth_mbps: spec.bandwidth_mbps,
            architecture: record.requirements.architecture,
            requires_gpu: record.requirements.requires_gpu,
            gpu_kind: record.requirements.gpu_kind,
        };

        if new_requirements.is_zero_delta(&record.requirements) {
            return Ok(record);
        }

        let delta = new_requirements.saturating_sub(&record.requirements);
        let server_id = record
            .assigned
            .server_id
            .clone()
            .ok_or_else(|| CoreError::Internal("running workspace has no assigned server".into()))?;
        let server = self
            .registry
            .get(&server_id)
            .ok_or_else(|| CoreError::NotFound { kind: "server", id: server_id.clone() })?;

        placement::place_same_server(&server, &delta).map_err(|_| CoreError::SameServerCapacity)?;

        let container_id = record
            .assigned
            .container_id
            .clone()
            .ok_or_else(|| CoreError::Internal("running workspace has no container".into()))?;

        // 1. container limits, 2. bandwidth shaping, 3. disk quota,
        // 4. record + reservation update. Each step reversible up to
        // the next.
        self.runtime_client
            .update_container_limits(
                &server.address,
                server.management_port,
                &container_id,
                &ContainerLimits {
                    cpu_cores: new_requirements.cpu_cores,
                    memory_mb: new_requirements.memory_mb,
                },
            )
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        self.runtime_client
            .apply_bandwidth_limit(&server.address, server.management_port, &container_id, new_requirements.bandwidth_mbps)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        self.runtime_client
            .update_disk_quota(&server.address, server.management_port, workspace_id, new_requirements.disk_gb)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        self.registry.adjust_reservation(&server_id, &delta).await?;

        record.tier = new_tier.to_string();
        record.requirements = new_requirements;
        record.updated_at = Utc::now();
        self.save(&record).await?;
        Ok(record)
    }

    /// Runs a command inside a workspace's container, for the public
    /// `exec-command` / `exec-command-stream` HTTP operations. Both
    /// share this path: the runtime's exec endpoint itself isn't
    /// streaming, so `exec-command-stream` wraps the same call and
    /// emits its output as a single chunk rather than incrementally.
    pub async fn exec(
        &self,
        workspace_id: &WorkspaceId,
        command: &[String],
        timeout: Duration,
    ) -> Result<crate::container_runtime::ExecResult, CoreError> {
        let record = self.get(workspace_id).await?;
        let (Some(server_id), Some(container_id)) =
            (&record.assigned.server_id, &record.assigned.container_id)
        else {
            return Err(CoreError::InvalidState {
                reason: "workspace has no assigned container".into(),
            });
        };
        let server = self
            .registry
            .get(server_id)
            .ok_or_else(|| CoreError::NotFound { kind: "server", id: server_id.clone() })?;
        self.runtime_client
            .exec(&server.address, server.management_port, container_id, command, timeout)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))
    }

    /// §4.4.7 health probe.
    pub async fn check_health(&self, workspace_id: &WorkspaceId) -> Result<bool, CoreError> {
        let record = self.get(workspace_id).await?;
        let (Some(server_id), Some(container_id)) =
            (&record.assigned.server_id, &record.assigned.container_id)
        else {
            return Ok(false);
        };
        let Some(server) = self.registry.get(server_id) else {
            return Ok(false);
        };
        let healthy = self
            .runtime_client
            .exec_health_check(&server.address, server.management_port, container_id)
            .await
            .unwrap_or(false);
        Ok(healthy)
    }

    /// Metering reconciliation §4.4.6. Gated by the `metering` lease by
    /// the caller (the background job runner in `main.rs`), and renewed
    /// here every `METERING_LEASE_RENEW_EVERY` workspaces so a tick over
    /// a large fleet outlives one lease TTL instead of handing the lease
    /// to a second replica mid-pass. Bails out early if this replica
    /// loses the lease to another holder.
    pub async fn run_metering_tick(&self) -> Result<(), AnyError> {
        let granularity = chrono::Duration::seconds(self.config.metering.granularity_seconds);
        for (i, mut record) in self.store.list_running().await?.into_iter().enumerate() {
            if i > 0 && i % METERING_LEASE_RENEW_EVERY == 0 {
                match self.coordination.renew_lease(METERING_LEASE, METERING_LEASE_TTL).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!("lost metering lease mid-tick, stopping early to avoid a duplicate pass");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "metering lease renewal failed, stopping early");
                        break;
                    }
                }
            }

            let due = match record.last_metering_ts() {
                None => true,
                Some(last) => Utc::now().signed_duration_since(last) >= granularity,
            };
            if !due {
                continue;
            }

            let duration_seconds = record
                .last_metering_ts()
                .map(|last| Utc::now().signed_duration_since(last).num_seconds())
                .unwrap_or(self.config.metering.granularity_seconds);

            let previous_ts = record.last_metering_ts();
            record.set_last_metering_ts(Utc::now());
            if let Err(err) = self.save(&record).await {
                tracing::warn!(workspace_id = %record.id, error = %err, "failed to persist metering timestamp");
                continue;
            }

            let report = self
                .internal_api
                .report_usage_tick(
                    &record.owner_user_id,
                    &record.id,
                    Some(record.owner_session_id.as_str()),
                    &record.tier,
                    duration_seconds,
                )
                .await;

            // Roll back on failure so no billed minute is silently lost.
            if let Err(err) = report {
                tracing::warn!(workspace_id = %record.id, error = %err, "usage tick failed, rolling back timestamp");
                match previous_ts {
                    Some(ts) => record.set_last_metering_ts(ts),
                    None => {
                        record.metadata.remove("last_metering_ts");
                    }
                }
                let _ = self.save(&record).await;
            }
        }
        Ok(())
    }

    /// Discovery reconciliation §4.4.6, gated by the
    /// `workspace_discovery` lease by the caller.
    pub async fn run_discovery(&self) -> Result<(), AnyError> {
        let known = self.store.list_all().await?;
        let known_ids: std::collections::HashSet<String> =
            known.iter().map(|r| r.id.clone()).collect();

        for server in self.registry.snapshot() {
            let containers = match self
                .runtime_client
                .list_workspace_containers(&server.address, server.management_port)
                .await
            {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(server_id = %server.id, error = %err, "discovery: could not list containers");
                    continue;
                }
            };

            let mut seen_on_host = std::collections::HashSet::new();
            for container in &containers {
                if let Some(workspace_id) = container
                    .labels
                    .get(crate::container_runtime::WORKSPACE_ID_LABEL)
                {
                    seen_on_host.insert(workspace_id.clone());
                }
            }

            for record in known.iter().filter(|r| r.assigned.server_id.as_deref() == Some(server.id.as_str())) {
                if record.status == WorkspaceStatus::Running && !seen_on_host.contains(&record.id) {
                    let mut updated = record.clone();
                    updated.status = WorkspaceStatus::Stopped;
                    updated.set_stale_discovery(true);
                    updated.updated_at = Utc::now();
                    if self.save(&updated).await.is_ok() {
                        if let Some(server_id) = &record.assigned.server_id {
                            let handle = crate::registry::ReservationHandle {
                                server_id: server_id.clone(),
                                requirements: record.requirements,
                            };
                            let _ = self.registry.release(&handle).await;
                        }
                    }
                }
            }

            // Orphan workspace directories: present on disk, absent
            // from the Store.
            if let Ok(dirs) = self
                .runtime_client
                .list_workspace_directories(&server.address, server.management_port)
                .await
            {
                for dir_id in dirs {
                    if !known_ids.contains(&dir_id) {
                        let _ = self
                            .runtime_client
                            .remove_workspace_directory(&server.address, server.management_port, &dir_id)
                            .await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn save(&self, record: &WorkspaceRecord) -> Result<(), CoreError> {
        self.store
            .save(record)
            .await
            .map_err(|e| CoreError::Internal(e.to_string()))
    }
}

/// Background job runner: metering every 60s, discovery every
/// `discovery_interval`, each gated by its own named lease, per §4.4.6.
pub fn spawn_reconciliation_jobs(
    lifecycle: LifecycleManager,
    coordination: crate::coordination::Coordination,
    discovery_interval: Duration,
) -> tokio_util::sync::CancellationToken {
    let token = tokio_util::sync::CancellationToken::new();

    {
        let lifecycle = lifecycle.clone();
        let coordination = coordination.clone();
        let token = token.clone();
        tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if matches!(coordination.try_acquire_lease(METERING_LEASE, METERING_LEASE_TTL).await, Ok(true)) {
                    if let Err(err) = lifecycle.run_metering_tick().await {
                        tracing::error!(error = %err, "metering tick failed");
                    }
                    let _ = coordination.release_lease(METERING_LEASE).await;
                }
            }
        });
    }

    {
        let lifecycle = lifecycle.clone();
        let coordination = coordination.clone();
        let token = token.clone();
        tokio::task::spawn(async move {
            // Run once immediately on startup, then on the interval.
            let mut interval = tokio::time::interval(discovery_interval);
            loop {
                if matches!(
                    coordination
                        .try_acquire_lease("workspace_discovery", discovery_interval)
                        .await,
                    Ok(true)
                ) {
                    if let Err(err) = lifecycle.run_discovery().await {
                        tracing::error!(error = %err, "discovery reconciliation failed");
                    }
                    let _ = coordination.release_lease("workspace_discovery").await;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
            }
        });
    }

    token
}
