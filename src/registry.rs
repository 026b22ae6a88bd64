//! Fleet Registry (C1): authoritative index of Server Records and the
//! arithmetic of capacity accounting.
//!
//! `reserve`/`release` must be serialised per `server_id` so no two
//! placement decisions observe the same pre-reservation view.
//! `dashmap` gives us that for free: every access goes through
//! `DashMap::entry`, which holds the shard lock for the duration of the
//! closure, so a read-modify-write on one server never interleaves with
//! another on the same server.

use std::sync::Arc;

use dashmap::DashMap;
use redis::AsyncCommands;

use crate::error::{AnyError, CoreError};
use crate::types::{Capacity, Requirements, ServerId, ServerRecord, ServerStatus};

/// Proof that a reservation was taken. Dropping it without calling
/// `release` is a bug (the capacity leaks); `Registry::release` is the
/// only way to consume one.
#[derive(Debug, Clone)]
pub struct ReservationHandle {
    pub server_id: ServerId,
    pub requirements: Requirements,
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<DashMap<ServerId, ServerRecord>>,
    redis: redis::Client,
}

impl Registry {
    pub fn new(redis: redis::Client) -> Self {
        Registry {
            inner: Arc::new(DashMap::new()),
            redis,
        }
    }

    /// Repopulate the in-memory map from the Redis mirror. Called once
    /// at control-plane startup.
    pub async fn load_from_redis(&self) -> Result<(), AnyError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let keys: Vec<String> = conn.keys("server:*").await?;
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(raw) = raw {
                match serde_json::from_str::<ServerRecord>(&raw) {
                    Ok(record) => {
                        self.inner.insert(record.id.clone(), record);
                    }
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "skipping corrupt server record")
                    }
                }
            }
        }
        tracing::info!(count = self.inner.len(), "fleet registry loaded from redis");
        Ok(())
    }

    async fn persist(&self, record: &ServerRecord) -> Result<(), AnyError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let raw = serde_json::to_string(record)?;
        let _: () = conn.set(format!("server:{}", record.id), raw).await?;
        Ok(())
    }

    async fn persist_delete(&self, server_id: &str) -> Result<(), AnyError> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        let _: () = conn.del(format!("server:{}", server_id)).await?;
        Ok(())
    }

    pub async fn register(&self, descriptor: ServerRecord) -> Result<ServerRecord, CoreError> {
        if self
            .inner
            .iter()
            .any(|entry| entry.hostname == descriptor.hostname)
        {
            return Err(CoreError::AlreadyExists {
                kind: "server",
                id: descriptor.hostname.clone(),
            });
        }
        self.inner.insert(descriptor.id.clone(), descriptor.clone());
        if let Err(err) = self.persist(&descriptor).await {
            tracing::warn!(error = %err, "failed to persist newly registered server");
        }
        Ok(descriptor)
    }

    pub fn get(&self, server_id: &str) -> Option<ServerRecord> {
        self.inner.get(server_id).map(|r| r.clone())
    }

    pub async fn update(
        &self,
        server_id: &str,
        patch: ServerPatch,
    ) -> Result<ServerRecord, CoreError> {
        let mut entry = self
            .inner
            .get_mut(server_id)
            .ok_or_else(|| CoreError::NotFound {
                kind: "server",
                id: server_id.to_string(),
            })?;
        if let Some(labels) = patch.labels {
            entry.topology.labels = labels;
        }
        if let Some(status) = patch.status {
            Self::validate_status_transition(entry.status, status)?;
            entry.status = status;
        }
        if let Some(max_workspaces) = patch.max_workspaces_hint {
            entry
                .topology
                .labels
                .insert("max_workspaces".to_string(), max_workspaces.to_string());
        }
        let updated = entry.clone();
        drop(entry);
        if let Err(err) = self.persist(&updated).await {
            tracing::warn!(error = %err, "failed to persist server update");
        }
        Ok(updated)
    }

    fn validate_status_transition(
        from: ServerStatus,
        to: ServerStatus,
    ) -> Result<(), CoreError> {
        let allowed = matches!(
            to,
            ServerStatus::Active | ServerStatus::Draining | ServerStatus::Maintenance | ServerStatus::Offline
        );
        if !allowed {
            return Err(CoreError::InvalidState {
                reason: format!("cannot patch status {:?} -> {:?}", from, to),
            });
        }
        Ok(())
    }

    pub async fn delete(&self, server_id: &str, force: bool) -> Result<(), CoreError> {
        let active_workspaces = self
            .inner
            .get(server_id)
            .ok_or_else(|| CoreError::NotFound {
                kind: "server",
                id: server_id.to_string(),
            })?
            .active_workspaces;
        if active_workspaces > 0 && !force {
            return Err(CoreError::HasActiveWorkspaces {
                server_id: server_id.to_string(),
            });
        }
        self.inner.remove(server_id);
        if let Err(err) = self.persist_delete(server_id).await {
            tracing::warn!(error = %err, "failed to remove persisted server record");
        }
        Ok(())
    }

    /// Atomically check `available >= requirements` and, on success,
    /// bump `reserved`. Returns a handle the caller must eventually pass
    /// to `release`.
    pub async fn reserve(
        &self,
        server_id: &str,
        requirements: &Requirements,
    ) -> Result<ReservationHandle, CoreError> {
        let mut entry = self
            .inner
            .get_mut(server_id)
            .ok_or_else(|| CoreError::NotFound {
                kind: "server",
                id: server_id.to_string(),
            })?;
        if !entry.capacity.can_fit(&entry.reserved, requirements) {
            return Err(CoreError::CapacityUnsatisfiable);
        }
        entry.reserved.add_requirements(requirements);
        entry.active_workspaces += 1;
        let updated = entry.clone();
        drop(entry);
        if let Err(err) = self.persist(&updated).await {
            tracing::warn!(error = %err, "failed to persist reservation");
        }
        Ok(ReservationHandle {
            server_id: server_id.to_string(),
            requirements: *requirements,
        })
    }

    /// Symmetric undo of `reserve`. Never drives `reserved` below zero
    /// (a double-release is a logic bug upstream, but must not corrupt
    /// the registry's own invariants).
    pub async fn release(&self, handle: &ReservationHandle) -> Result<(), AnyError> {
        if let Some(mut entry) = self.inner.get_mut(&handle.server_id) {
            entry.reserved.sub_requirements(&handle.requirements);
            entry.active_workspaces = entry.active_workspaces.saturating_sub(1);
            let updated = entry.clone();
            drop(entry);
            self.persist(&updated).await?;
        }
        Ok(())
    }

    /// Adjust an existing reservation by a signed delta (used by live
    /// scaling). Fails without mutating anything if the delta would
    /// overflow capacity.
    pub async fn adjust_reservation(
        &self,
        server_id: &str,
        delta: &crate::types::ResourceDelta,
    ) -> Result<(), CoreError> {
        let mut entry = self
            .inner
            .get_mut(server_id)
            .ok_or_else(|| CoreError::NotFound {
                kind: "server",
                id: server_id.to_string(),
            })?;
        let mut projected = entry.reserved;
        projected.add(delta);
        let fits = projected.cpu_cores <= entry.capacity.cpu_cores
            && projected.memory_mb <= entry.capacity.memory_mb
            && projected.disk_gb <= entry.capacity.disk_gb
            && projected.bandwidth_mbps <= entry.capacity.bandwidth_mbps;
        if !fits {
            return Err(CoreError::SameServerCapacity);
        }
        entry.reserved = projected;
        let updated = entry.clone();
        drop(entry);
        if let Err(err) = self.persist(&updated).await {
            tracing::warn!(error = %err, "failed to persist adjusted reservation");
        }
        Ok(())
    }

    /// Records a heartbeat ping outcome on the Server Record itself
    /// (distinct from the Heartbeat Service's own in-memory
    /// `ServerHealthSample` map): a success refreshes `last_heartbeat_ts`
    /// and clears `consecutive_heartbeat_failures`; a failure only bumps
    /// the counter, per §3's Server Record invariants.
    pub async fn record_heartbeat(&self, server_id: &str, success: bool) {
        let Some(mut entry) = self.inner.get_mut(server_id) else {
            return;
        };
        if success {
            entry.last_heartbeat_ts = Some(chrono::Utc::now());
            entry.consecutive_heartbeat_failures = 0;
        } else {
            entry.consecutive_heartbeat_failures += 1;
        }
        let updated = entry.clone();
        drop(entry);
        if let Err(err) = self.persist(&updated).await {
            tracing::warn!(error = %err, "failed to persist heartbeat bookkeeping");
        }
    }

    /// A server transitions to OFFLINE after `stale_threshold_seconds`
    /// without a successful heartbeat (§3). Only auto-transitions out of
    /// ACTIVE — DRAINING/MAINTENANCE are user-initiated and left alone
    /// even if heartbeats lapse, per §4.1's patch semantics.
    pub async fn mark_offline_if_stale(&self, server_id: &str, stale_threshold_seconds: i64) -> bool {
        let Some(mut entry) = self.inner.get_mut(server_id) else {
            return false;
        };
        if entry.status != ServerStatus::Active {
            return false;
        }
        let stale = match entry.last_heartbeat_ts {
            None => false,
            Some(last) => chrono::Utc::now().signed_duration_since(last).num_seconds() > stale_threshold_seconds,
        };
        if !stale {
            return false;
        }
        entry.status = ServerStatus::Offline;
        let updated = entry.clone();
        drop(entry);
        if let Err(err) = self.persist(&updated).await {
            tracing::warn!(error = %err, "failed to persist offline transition");
        }
        true
    }

    /// Cheap immutable snapshot for the Placement Engine. No lock is
    /// held across the filtering pass that follows.
    pub fn snapshot(&self) -> Vec<ServerRecord> {
        self.inner.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list(&self) -> Vec<ServerRecord> {
        self.snapshot()
    }

    pub fn capacity_by_tier(&self, region: &str, requirements: &Requirements) -> usize {
        self.inner
            .iter()
            .filter(|e| e.topology.region == region && e.status == ServerStatus::Active)
            .map(|e| {
                let avail = e.available();
                let per_dim = |avail: f64, need: f64| {
                    if need <= 0.0 {
                        usize::MAX
                    } else {
                        (avail / need).floor().max(0.0) as usize
                    }
                };
                [
                    per_dim(avail.cpu_cores, requirements.cpu_cores),
                    per_dim(avail.memory_mb as f64, requirements.memory_mb as f64),
                    per_dim(avail.disk_gb as f64, requirements.disk_gb as f64),
                ]
                .into_iter()
                .min()
                .unwrap_or(0)
            })
            .sum()
    }
}

#[derive(Default, Debug, Clone)]
pub struct ServerPatch {
    pub labels: Option<std::collections::BTreeMap<String, String>>,
    pub status: Option<ServerStatus>,
    pub max_workspaces_hint: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Architecture, Topology};

    fn sample_server(id: &str) -> ServerRecord {
        ServerRecord {
            id: id.to_string(),
            hostname: format!("host-{id}"),
            address: "10.0.0.1".into(),
            management_port: 9000,
            status: ServerStatus::Active,
            capacity: Capacity {
                cpu_cores: 8.0,
                memory_mb: 16384,
                disk_gb: 200,
                bandwidth_mbps: 1000,
            },
            reserved: Capacity::default(),
            active_workspaces: 0,
            topology: Topology {
                architecture: Architecture::Amd64,
                region: "us-east-1".into(),
                labels: Default::default(),
                has_gpu: false,
                gpu_kind: None,
                gpu_count: 0,
            },
            workspace_image_by_variant: Default::default(),
            last_heartbeat_ts: None,
            consecutive_heartbeat_failures: 0,
        }
    }

    fn requirements(cpu: f64) -> Requirements {
        Requirements {
            cpu_cores: cpu,
            memory_mb: 2048,
            disk_gb: 50,
            bandwidth_mbps: 100,
            architecture: Architecture::Amd64,
            requires_gpu: false,
            gpu_kind: None,
        }
    }

    fn test_registry() -> Registry {
        // A client with a syntactically valid URL never touches the
        // network unless a connection is actually opened; the
        // in-memory reserve/release path exercised here does not
        // await persistence.
        Registry::new(redis::Client::open("redis://127.0.0.1/").unwrap())
    }

    #[tokio::test]
    async fn reserve_never_drives_capacity_negative() {
        let reg = test_registry();
        reg.inner.insert("s1".into(), sample_server("s1"));

        let h1 = reg.reserve("s1", &requirements(4.0)).await.unwrap();
        let h2 = reg.reserve("s1", &requirements(4.0)).await.unwrap();
        assert!(reg.reserve("s1", &requirements(1.0)).await.is_err());

        reg.release(&h1).await.unwrap();
        reg.release(&h2).await.unwrap();
        let server = reg.get("s1").unwrap();
        assert_eq!(server.reserved.cpu_cores, 0.0);
        assert_eq!(server.active_workspaces, 0);
    }

    #[tokio::test]
    async fn release_does_not_underflow_when_called_twice() {
        let reg = test_registry();
        reg.inner.insert("s1".into(), sample_server("s1"));
        let h = reg.reserve("s1", &requirements(2.0)).await.unwrap();
        reg.release(&h).await.unwrap();
        reg.release(&h).await.unwrap();
        let server = reg.get("s1").unwrap();
        assert_eq!(server.active_workspaces, 0);
        assert_eq!(server.reserved.cpu_cores, 0.0);
    }

    #[tokio::test]
    async fn adjust_reservation_accepts_then_rejects_overflow() {
        let reg = test_registry();
        reg.inner.insert("s1".into(), sample_server("s1"));
        let _h = reg.reserve("s1", &requirements(2.0)).await.unwrap();

        // small(cpu:2) -> medium(cpu:4): delta of +2 fits in an 8-core host.
        let scale_up = crate::types::ResourceDelta {
            cpu_cores: 2.0,
            memory_mb: 0,
            disk_gb: 0,
            bandwidth_mbps: 0,
        };
        reg.adjust_reservation("s1", &scale_up).await.unwrap();
        assert_eq!(reg.get("s1").unwrap().reserved.cpu_cores, 4.0);

        // A further +5 would take reserved cpu to 9 against an 8-core cap.
        let overflow = crate::types::ResourceDelta {
            cpu_cores: 5.0,
            memory_mb: 0,
            disk_gb: 0,
            bandwidth_mbps: 0,
        };
        assert!(matches!(
            reg.adjust_reservation("s1", &overflow).await,
            Err(CoreError::SameServerCapacity)
        ));
        // Rejected delta must not have mutated the reservation (P1).
        assert_eq!(reg.get("s1").unwrap().reserved.cpu_cores, 4.0);
    }

    #[tokio::test]
    async fn delete_without_force_fails_with_active_workspaces() {
        let reg = test_registry();
        reg.inner.insert("s1".into(), sample_server("s1"));
        let _h = reg.reserve("s1", &requirements(2.0)).await.unwrap();
        assert!(matches!(
            reg.delete("s1", false).await,
            Err(CoreError::HasActiveWorkspaces { .. })
        ));
        assert!(reg.delete("s1", true).await.is_ok());
    }
}
