//! Client for a host's container-runtime management endpoint. Every
//! worker host in the fleet runs this agent; the control plane talks to
//! it over plain HTTP rather than through a cluster-wide API, so each
//! host is reached as its own "cluster of one".

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::AnyError;
use crate::types::ServerMetrics;

pub const WORKSPACE_LABEL: &str = "workspace";
pub const WORKSPACE_ID_LABEL: &str = "workspace_id";

#[derive(Clone)]
pub struct ContainerRuntimeClient {
    http: reqwest::Client,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HostStats {
    pub used_cpu: f64,
    pub used_memory_mb: u64,
    pub used_disk_gb: u64,
    pub used_bandwidth_mbps: u64,
    pub active_workspaces: u32,
}

impl From<HostStats> for ServerMetrics {
    fn from(s: HostStats) -> Self {
        ServerMetrics {
            used_cpu: s.used_cpu,
            used_memory_mb: s.used_memory_mb,
            used_disk_gb: s.used_disk_gb,
            used_bandwidth_mbps: s.used_bandwidth_mbps,
            active_workspaces: s.active_workspaces,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ContainerSummary {
    pub container_id: String,
    pub labels: std::collections::BTreeMap<String, String>,
    /// `running | exited | stopped | dead | removing | paused | created`
    pub state: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ContainerLimits {
    pub cpu_cores: f64,
    pub memory_mb: u64,
}

#[derive(Serialize, Debug, Clone)]
pub struct CreateContainerRequest<'a> {
    pub image: &'a str,
    pub labels: std::collections::BTreeMap<String, String>,
    pub mounts: Vec<(&'a str, &'a str)>,
    pub limits: ContainerLimits,
    pub bandwidth_mbps: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CreateContainerResponse {
    pub container_id: String,
}

impl ContainerRuntimeClient {
    pub fn new() -> Self {
        ContainerRuntimeClient {
            http: reqwest::Client::builder()
                .pool_max_idle_per_host(20)
                .build()
                .expect("reqwest client builds with default TLS backend"),
        }
    }

    fn base_url(&self, host_address: &str, management_port: u16) -> String {
        format!("http://{host_address}:{management_port}")
    }

    /// Short-timeout liveness ping, per §4.2 and §5's 5s timeout budget.
    pub async fn ping(&self, host_address: &str, management_port: u16) -> Result<(), AnyError> {
        self.http
            .get(format!("{}/ping", self.base_url(host_address, management_port)))
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn stats(
        &self,
        host_address: &str,
        management_port: u16,
        timeout: Duration,
    ) -> Result<HostStats, AnyError> {
        let stats = self
            .http
            .get(format!("{}/stats", self.base_url(host_address, management_port)))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<HostStats>()
            .await?;
        Ok(stats)
    }

    /// Single-container status lookup, used by `get_workspace`'s
    /// opportunistic resync (a cheaper call than listing every
    /// container on the host).
    pub async fn container_status(
        &self,
        host_address: &str,
        management_port: u16,
        container_id: &str,
    ) -> Result<ContainerSummary, AnyError> {
        let summary = self
            .http
            .get(format!(
                "{}/containers/{container_id}",
                self.base_url(host_address, management_port)
            ))
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .json::<ContainerSummary>()
            .await?;
        Ok(summary)
    }

    pub async fn list_workspace_containers(
        &self,
        host_address: &str,
        management_port: u16,
    ) -> Result<Vec<ContainerSummary>, AnyError> {
        let containers = self
            .http
            .get(format!(
                "{}/containers?label={}",
                self.base_url(host_address, management_port),
                WORKSPACE_LABEL
            ))
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<ContainerSummary>>()
            .await?;
        Ok(containers)
    }

    pub async fn create_container(
        &self,
        host_address: &str,
        management_port: u16,
        req: &CreateContainerRequest<'_>,
    ) -> Result<CreateContainerResponse, AnyError> {
        let resp = self
            .http
            .post(format!("{}/containers", self.base_url(host_address, management_port)))
            .json(req)
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()
            .context("container create failed")?
            .json::<CreateContainerResponse>()
            .await?;
        Ok(resp)
    }

    pub async fn stop_container(
        &self,
        host_address: &str,
        management_port: u16,
        container_id: &str,
    ) -> Result<(), AnyError> {
        self.http
            .post(format!(
                "{}/containers/{container_id}/stop",
                self.base_url(host_address, management_port)
            ))
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn remove_container(
        &self,
        host_address: &str,
        management_port: u16,
        container_id: &str,
    ) -> Result<(), AnyError> {
        self.http
            .delete(format!(
                "{}/containers/{container_id}",
                self.base_url(host_address, management_port)
            ))
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Live-update CPU/memory limits on a running container, without a
    /// restart, used by live scaling.
    pub async fn update_container_limits(
        &self,
        host_address: &str,
        management_port: u16,
        container_id: &str,
        limits: &ContainerLimits,
    ) -> Result<(), AnyError> {
        self.http
            .post(format!(
                "{}/containers/{container_id}/update",
                self.base_url(host_address, management_port)
            ))
            .json(limits)
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn apply_bandwidth_limit(
        &self,
        host_address: &str,
        management_port: u16,
        container_id: &str,
        bandwidth_mbps: u64,
    ) -> Result<(), AnyError> {
        self.http
            .post(format!(
                "{}/containers/{container_id}/bandwidth",
                self.base_url(host_address, management_port)
            ))
            .json(&serde_json::json!({ "bandwidth_mbps": bandwidth_mbps }))
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn update_disk_quota(
        &self,
        host_address: &str,
        management_port: u16,
        workspace_id: &str,
        disk_gb: u64,
    ) -> Result<(), AnyError> {
        self.http
            .post(format!(
                "{}/workspaces/{workspace_id}/quota",
                self.base_url(host_address, management_port)
            ))
            .json(&serde_json::json!({ "disk_gb": disk_gb }))
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Health probe: container must be running, and a trivial `exec
    /// true` must return exit 0 within a short timeout.
    pub async fn exec_health_check(
        &self,
        host_address: &str,
        management_port: u16,
        container_id: &str,
    ) -> Result<bool, AnyError> {
        let resp = self
            .http
            .post(format!(
                "{}/containers/{container_id}/exec",
                self.base_url(host_address, management_port)
            ))
            .json(&serde_json::json!({ "command": ["true"] }))
            .timeout(Duration::from_secs(5))
            .send()
            .await?
            .error_for_status()?
            .json::<ExecResult>()
            .await?;
        Ok(resp.exit_code == 0)
    }

    pub async fn exec(
        &self,
        host_address: &str,
        management_port: u16,
        container_id: &str,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecResult, AnyError> {
        let resp = self
            .http
            .post(format!(
                "{}/containers/{container_id}/exec",
                self.base_url(host_address, management_port)
            ))
            .json(&serde_json::json!({ "command": command }))
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<ExecResult>()
            .await?;
        Ok(resp)
    }

    pub async fn list_workspace_directories(
        &self,
        host_address: &str,
        management_port: u16,
    ) -> Result<Vec<String>, AnyError> {
        let dirs = self
            .http
            .get(format!(
                "{}/workspace-directories",
                self.base_url(host_address, management_port)
            ))
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<String>>()
            .await?;
        Ok(dirs)
    }

    pub async fn remove_workspace_directory(
        &self,
        host_address: &str,
        management_port: u16,
        workspace_id: &str,
    ) -> Result<(), AnyError> {
        self.http
            .delete(format!(
                "{}/workspace-directories/{workspace_id}",
                self.base_url(host_address, management_port)
            ))
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl Default for ContainerRuntimeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Maps a runtime container state string onto the Workspace status it
/// implies, per §4.2 step 4 / §4.4.6.
pub fn status_from_container_state(state: &str) -> Option<crate::types::WorkspaceStatus> {
    use crate::types::WorkspaceStatus as S;
    match state {
        "running" => Some(S::Running),
        "exited" | "stopped" => Some(S::Stopped),
        "dead" | "removing" | "paused" => Some(S::Error),
        "created" => Some(S::Creating),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkspaceStatus;

    #[test]
    fn exited_container_maps_to_stopped() {
        // Reconciliation's orphan case (§4.4.6): a container that
        // disappeared out-of-band shows up as `exited`/`stopped` on the
        // next host listing, and the Workspace Record follows it.
        assert_eq!(status_from_container_state("exited"), Some(WorkspaceStatus::Stopped));
        assert_eq!(status_from_container_state("stopped"), Some(WorkspaceStatus::Stopped));
    }

    #[test]
    fn unknown_state_is_not_mapped() {
        assert_eq!(status_from_container_state("restarting"), None);
    }

    #[test]
    fn host_stats_convert_to_server_metrics() {
        let stats = HostStats {
            used_cpu: 3.5,
            used_memory_mb: 4096,
            used_disk_gb: 20,
            used_bandwidth_mbps: 50,
            active_workspaces: 2,
        };
        let metrics: ServerMetrics = stats.into();
        assert_eq!(metrics.used_cpu, 3.5);
        assert_eq!(metrics.active_workspaces, 2);
    }
}
