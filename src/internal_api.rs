//! Outbound calls to the Admin/Billing collaborator (§6.1). The core
//! never interprets these responses beyond "it worked" / "it didn't" —
//! pricing, plan enforcement and dashboards live entirely on the other
//! side.

use std::time::Duration;

use serde::Serialize;

use crate::error::AnyError;
use crate::types::ServerMetrics;

#[derive(Clone)]
pub struct InternalApiClient {
    http: reqwest::Client,
    base_url: String,
    service_token: String,
}

#[derive(Serialize, Debug)]
struct HeartbeatReport<'a> {
    used_cpu: f64,
    used_memory_mb: u64,
    used_disk_gb: u64,
    used_bandwidth_mbps: u64,
    active_workspaces: u32,
    #[serde(skip)]
    _server_id: &'a str,
}

#[derive(Serialize, Debug)]
struct SyncStatusReport<'a> {
    status: &'a str,
}

#[derive(Serialize, Debug)]
struct UsageReport<'a> {
    user_id: &'a str,
    workspace_id: &'a str,
    session_id: Option<&'a str>,
    tier: &'a str,
    duration_seconds: i64,
    metadata: Option<serde_json::Value>,
}

impl InternalApiClient {
    pub fn new(base_url: String, service_token: String) -> Self {
        InternalApiClient {
            http: reqwest::Client::new(),
            base_url,
            service_token,
        }
    }

    /// Reports are best-effort: a 404 means the Admin side has no record
    /// of this server/workspace (e.g. it was deleted there first), which
    /// is expected and logged at `debug!`, not `warn!`. Any other
    /// non-2xx is logged at `warn!` and swallowed — a failed heartbeat
    /// report must never abort the heartbeat cycle.
    pub async fn report_server_heartbeat(
        &self,
        server_id: &str,
        metrics: &ServerMetrics,
    ) -> Result<(), AnyError> {
        let body = HeartbeatReport {
            used_cpu: metrics.used_cpu,
            used_memory_mb: metrics.used_memory_mb,
            used_disk_gb: metrics.used_disk_gb,
            used_bandwidth_mbps: metrics.used_bandwidth_mbps,
            active_workspaces: metrics.active_workspaces,
            _server_id: server_id,
        };
        let resp = self
            .http
            .post(format!("{}/internal/servers/{server_id}/heartbeat", self.base_url))
            .bearer_auth(&self.service_token)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        self.log_report_outcome(resp, "server_heartbeat")
    }

    pub async fn report_workspace_sync_status(
        &self,
        workspace_id: &str,
        status: &str,
    ) -> Result<(), AnyError> {
        let resp = self
            .http
            .post(format!(
                "{}/internal/workspaces/{workspace_id}/sync-status",
                self.base_url
            ))
            .bearer_auth(&self.service_token)
            .json(&SyncStatusReport { status })
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        self.log_report_outcome(resp, "workspace_sync_status")
    }

    /// The core sends only quantities; pricing is computed downstream.
    pub async fn report_usage_tick(
        &self,
        user_id: &str,
        workspace_id: &str,
        session_id: Option<&str>,
        tier: &str,
        duration_seconds: i64,
    ) -> Result<(), AnyError> {
        let body = UsageReport {
            user_id,
            workspace_id,
            session_id,
            tier,
            duration_seconds,
            metadata: None,
        };
        let resp = self
            .http
            .post(format!("{}/internal/usage/compute", self.base_url))
            .bearer_auth(&self.service_token)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await?
            .error_for_status()?;
        drop(resp);
        Ok(())
    }

    fn log_report_outcome(
        &self,
        resp: Result<reqwest::Response, reqwest::Error>,
        what: &str,
    ) -> Result<(), AnyError> {
        match resp {
            Ok(r) if r.status().as_u16() == 404 => {
                tracing::debug!(report = what, "admin collaborator has no matching record");
                Ok(())
            }
            Ok(r) if r.status().is_success() => Ok(()),
            Ok(r) => {
                tracing::warn!(report = what, status = %r.status(), "report to admin collaborator failed");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(report = what, error = %err, "report to admin collaborator failed");
                Ok(())
            }
        }
    }
}
