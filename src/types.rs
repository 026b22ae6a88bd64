//! Core data model shared by every component: workspace and server
//! records, resource requirements, and the small set of reserved
//! metadata keys the core itself reads and writes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type WorkspaceId = String;
pub type ServerId = String;
pub type UserId = String;
pub type SessionId = String;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

/// Resolved resource requirements for a workspace, looked up from the
/// Hardware Spec Catalogue at create time.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Requirements {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub bandwidth_mbps: u64,
    pub architecture: Architecture,
    pub requires_gpu: bool,
    pub gpu_kind: Option<GpuKind>,
}

impl Requirements {
    /// `self - other`, clamped at zero per dimension. Used to compute
    /// live-scale deltas.
    pub fn saturating_sub(&self, other: &Requirements) -> ResourceDelta {
        ResourceDelta {
            cpu_cores: self.cpu_cores - other.cpu_cores,
            memory_mb: self.memory_mb as i64 - other.memory_mb as i64,
            disk_gb: self.disk_gb as i64 - other.disk_gb as i64,
            bandwidth_mbps: self.bandwidth_mbps as i64 - other.bandwidth_mbps as i64,
        }
    }

    pub fn is_zero_delta(&self, other: &Requirements) -> bool {
        self == other
    }
}

/// Signed difference between two `Requirements`, used for live scaling
/// and reservation adjustment. May be negative (scale-down).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceDelta {
    pub cpu_cores: f64,
    pub memory_mb: i64,
    pub disk_gb: i64,
    pub bandwidth_mbps: i64,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GpuKind {
    Nvidia,
    Amd,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkspaceStatus {
    Creating,
    Running,
    Stopped,
    Error,
    Deleting,
}

/// Where a workspace landed after placement. Absent before placement
/// succeeds.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Assignment {
    pub server_id: Option<ServerId>,
    pub container_id: Option<String>,
    pub host_address: Option<String>,
}

impl Assignment {
    pub fn is_assigned(&self) -> bool {
        self.server_id.is_some() && self.container_id.is_some()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkspaceRecord {
    pub id: WorkspaceId,
    pub owner_user_id: UserId,
    pub owner_session_id: SessionId,
    pub tier: String,
    pub requirements: Requirements,
    pub assigned: Assignment,
    pub status: WorkspaceStatus,
    pub region_preference: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reserved metadata keys. These are the only keys the core itself
/// reads or writes; everything else in `metadata` passes through
/// untouched for external collaborators.
impl WorkspaceRecord {
    pub fn last_metering_ts(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get("last_metering_ts")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn set_last_metering_ts(&mut self, ts: DateTime<Utc>) {
        self.metadata.insert(
            "last_metering_ts".to_string(),
            serde_json::Value::String(ts.to_rfc3339()),
        );
    }

    pub fn set_stale_discovery(&mut self, value: bool) {
        self.metadata
            .insert("stale_discovery".to_string(), serde_json::Value::Bool(value));
    }

    pub fn set_restore_partial(&mut self, value: bool) {
        self.metadata.insert(
            "restore_partial".to_string(),
            serde_json::Value::Bool(value),
        );
    }

    pub fn claude_session_id(&self) -> Option<&str> {
        self.metadata.get("claude_session_id").and_then(|v| v.as_str())
    }

    pub fn claude_project_path(&self) -> Option<&str> {
        self.metadata
            .get("claude_project_path")
            .and_then(|v| v.as_str())
    }

    /// Watched conversations mirrored into this record's metadata so a
    /// laptop bridge restart can recover subscribers. Stored under the
    /// `watched_conversations` key as a JSON array.
    pub fn watched_conversations(&self) -> Vec<WatchedConversation> {
        self.metadata
            .get("watched_conversations")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_watched_conversations(&mut self, watchers: &[WatchedConversation]) {
        self.metadata.insert(
            "watched_conversations".to_string(),
            serde_json::to_value(watchers).expect("WatchedConversation always serialises"),
        );
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerStatus {
    Active,
    Draining,
    Maintenance,
    Offline,
    Error,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct Capacity {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub bandwidth_mbps: u64,
}

impl Capacity {
    /// True if `reserved + requirements` still fits within `self` on
    /// every dimension.
    pub fn can_fit(&self, reserved: &Capacity, requirements: &Requirements) -> bool {
        self.cpu_cores >= reserved.cpu_cores + requirements.cpu_cores
            && self.memory_mb >= reserved.memory_mb + requirements.memory_mb
            && self.disk_gb >= reserved.disk_gb + requirements.disk_gb
            && self.bandwidth_mbps >= reserved.bandwidth_mbps + requirements.bandwidth_mbps
    }

    /// Max utilisation fraction across dimensions once `reserved` is
    /// applied against `self`. Used for the placement tie-break.
    pub fn utilization_after(&self, reserved: &Capacity) -> f64 {
        let frac = |used: f64, total: f64| if total <= 0.0 { 1.0 } else { used / total };
        [
            frac(reserved.cpu_cores, self.cpu_cores),
            frac(reserved.memory_mb as f64, self.memory_mb as f64),
            frac(reserved.disk_gb as f64, self.disk_gb as f64),
            frac(reserved.bandwidth_mbps as f64, self.bandwidth_mbps as f64),
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }

    pub fn add(&mut self, delta: &ResourceDelta) {
        self.cpu_cores += delta.cpu_cores;
        self.memory_mb = (self.memory_mb as i64 + delta.memory_mb).max(0) as u64;
        self.disk_gb = (self.disk_gb as i64 + delta.disk_gb).max(0) as u64;
        self.bandwidth_mbps = (self.bandwidth_mbps as i64 + delta.bandwidth_mbps).max(0) as u64;
    }

    pub fn sub_requirements(&mut self, req: &Requirements) {
        self.cpu_cores = (self.cpu_cores - req.cpu_cores).max(0.0);
        self.memory_mb = self.memory_mb.saturating_sub(req.memory_mb);
        self.disk_gb = self.disk_gb.saturating_sub(req.disk_gb);
        self.bandwidth_mbps = self.bandwidth_mbps.saturating_sub(req.bandwidth_mbps);
    }

    pub fn add_requirements(&mut self, req: &Requirements) {
        self.cpu_cores += req.cpu_cores;
        self.memory_mb += req.memory_mb;
        self.disk_gb += req.disk_gb;
        self.bandwidth_mbps += req.bandwidth_mbps;
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Topology {
    pub architecture: Architecture,
    pub region: String,
    pub labels: BTreeMap<String, String>,
    pub has_gpu: bool,
    pub gpu_kind: Option<GpuKind>,
    pub gpu_count: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServerRecord {
    pub id: ServerId,
    pub hostname: String,
    pub address: String,
    pub management_port: u16,
    pub status: ServerStatus,
    pub capacity: Capacity,
    pub reserved: Capacity,
    pub active_workspaces: u32,
    pub topology: Topology,
    pub workspace_image_by_variant: BTreeMap<String, String>,
    pub last_heartbeat_ts: Option<DateTime<Utc>>,
    pub consecutive_heartbeat_failures: u32,
}

impl ServerRecord {
    pub fn available(&self) -> Capacity {
        Capacity {
            cpu_cores: (self.capacity.cpu_cores - self.reserved.cpu_cores).max(0.0),
            memory_mb: self.capacity.memory_mb.saturating_sub(self.reserved.memory_mb),
            disk_gb: self.capacity.disk_gb.saturating_sub(self.reserved.disk_gb),
            bandwidth_mbps: self
                .capacity
                .bandwidth_mbps
                .saturating_sub(self.reserved.bandwidth_mbps),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unreachable,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServerHealthSample {
    pub status: HealthStatus,
    pub last_success_ts: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub metrics: ServerMetrics,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct ServerMetrics {
    pub used_cpu: f64,
    pub used_memory_mb: u64,
    pub used_disk_gb: u64,
    pub used_bandwidth_mbps: u64,
    pub active_workspaces: u32,
}

impl Default for ServerHealthSample {
    fn default() -> Self {
        ServerHealthSample {
            status: HealthStatus::Unknown,
            last_success_ts: None,
            consecutive_failures: 0,
            last_error: None,
            metrics: ServerMetrics::default(),
        }
    }
}

/// `{user_id, status}` view of a connected laptop agent, derived from
/// the bridge's live connection table. Never persisted on its own.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LocalPod {
    pub id: String,
    pub user_id: UserId,
    pub online: bool,
}

/// Subscription intent for conversation fan-out. Mirrored both inside
/// the laptop agent's own store and in the owning Workspace Record's
/// metadata, so a subscriber can be recovered after the bridge
/// reconnects.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct WatchedConversation {
    pub conversation_id: String,
    pub project_path: String,
    pub subscriber_session_id: SessionId,
    pub subscriber_agent_id: String,
    pub last_synced_entry_id: Option<String>,
}

/// Hardware Spec Catalogue entry, cached from the Admin collaborator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HardwareSpec {
    pub tier: String,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub bandwidth_mbps: u64,
    pub architecture: Option<Architecture>,
    pub is_gpu: bool,
    pub gpu_kind: Option<GpuKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements(cpu: f64, mem: u64) -> Requirements {
        Requirements {
            cpu_cores: cpu,
            memory_mb: mem,
            disk_gb: 50,
            bandwidth_mbps: 100,
            architecture: Architecture::Amd64,
            requires_gpu: false,
            gpu_kind: None,
        }
    }

    fn workspace_record() -> WorkspaceRecord {
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        WorkspaceRecord {
            id: "ws1".into(),
            owner_user_id: "u1".into(),
            owner_session_id: "s1".into(),
            tier: "small".into(),
            requirements: requirements(2.0, 2048),
            assigned: Assignment::default(),
            status: WorkspaceStatus::Creating,
            region_preference: None,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    // P1: reserved must never exceed capacity after a reserve/release
    // sequence; `can_fit` is the gate every mutation goes through.
    #[test]
    fn can_fit_rejects_when_any_single_dimension_overflows() {
        let capacity = Capacity {
            cpu_cores: 4.0,
            memory_mb: 8192,
            disk_gb: 100,
            bandwidth_mbps: 500,
        };
        let reserved = Capacity {
            cpu_cores: 3.0,
            memory_mb: 0,
            disk_gb: 0,
            bandwidth_mbps: 0,
        };
        assert!(capacity.can_fit(&reserved, &requirements(1.0, 1024)));
        assert!(!capacity.can_fit(&reserved, &requirements(1.1, 1024)));
    }

    #[test]
    fn is_assigned_requires_both_server_and_container() {
        assert!(!Assignment::default().is_assigned());
        let partial = Assignment {
            server_id: Some("s1".into()),
            container_id: None,
            host_address: None,
        };
        assert!(!partial.is_assigned());
        let full = Assignment {
            server_id: Some("s1".into()),
            container_id: Some("c1".into()),
            host_address: Some("10.0.0.1".into()),
        };
        assert!(full.is_assigned());
    }

    #[test]
    fn saturating_sub_clamps_rather_than_going_negative_conceptually() {
        let bigger = requirements(4.0, 4096);
        let smaller = requirements(2.0, 2048);
        let delta = smaller.saturating_sub(&bigger);
        assert_eq!(delta.cpu_cores, -2.0);
        assert_eq!(delta.memory_mb, -2048);
    }

    #[test]
    fn available_never_goes_negative_even_if_overreserved() {
        let server = ServerRecord {
            id: "s1".into(),
            hostname: "s1".into(),
            address: "127.0.0.1".into(),
            management_port: 9000,
            status: ServerStatus::Active,
            capacity: Capacity {
                cpu_cores: 2.0,
                memory_mb: 2048,
                disk_gb: 50,
                bandwidth_mbps: 100,
            },
            // Deliberately inconsistent (reserved > capacity) to check
            // the clamp holds regardless of how it got that way.
            reserved: Capacity {
                cpu_cores: 5.0,
                memory_mb: 4096,
                disk_gb: 50,
                bandwidth_mbps: 100,
            },
            active_workspaces: 1,
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
        };
        let available = server.available();
        assert_eq!(available.cpu_cores, 0.0);
        assert_eq!(available.memory_mb, 0);
    }

    // Scenario 5 (conversation fan-out survives bridge restart): the
    // Workspace Record is the only durable copy of a subscription once
    // the bridge's in-memory state is gone after a reconnect.
    #[test]
    fn watched_conversations_round_trip_through_metadata() {
        let mut record = workspace_record();
        assert!(record.watched_conversations().is_empty());

        let watchers = vec![WatchedConversation {
            conversation_id: "conv-1".into(),
            project_path: "/home/dev/proj".into(),
            subscriber_session_id: "s1".into(),
            subscriber_agent_id: "a1".into(),
            last_synced_entry_id: None,
        }];
        record.set_watched_conversations(&watchers);
        assert_eq!(record.watched_conversations(), watchers);
    }
}
