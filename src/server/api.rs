//! Handlers for the public/internal HTTP surface. Request/response
//! bodies are plain serde structs; axum 0.4 has no `middleware::from_fn`
//! or `State` extractor, so every handler takes `Extension<Arc<AppState>>`
//! directly and calls `require_internal_token` itself where a handler
//! is gated.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::extract::{Extension, Path, Query};
use axum::response::IntoResponse;
use axum::Json;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::CoreError;
use crate::filesync::PodTemplate;
use crate::lifecycle::CreateWorkspaceConfig;
use crate::registry::ServerPatch;
use crate::types::{Capacity, ServerRecord, ServerStatus, Topology};

use super::State;

/// Bearer-token check shared by every gated handler. `/health` and the
/// bridge websocket upgrade are the only routes that call this
/// themselves rather than unconditionally; everything under `/servers`
/// and `/workspaces` calls it first.
pub(super) fn require_internal_token(headers: &HeaderMap, config: &Config) -> Result<(), StatusCode> {
    let presented = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if config.verify_internal_token(token) => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

fn error_response(err: CoreError) -> axum::response::Response {
    let status = err.http_status();
    let transient = err.is_transient();
    let mut resp = (status, Json(ErrorBody { error: err.to_string() })).into_response();
    if transient {
        resp.headers_mut()
            .insert(http::header::RETRY_AFTER, http::HeaderValue::from_static("1"));
    }
    resp
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

macro_rules! require_auth {
    ($headers:expr, $state:expr) => {
        if let Err(status) = require_internal_token(&$headers, &$state.config) {
            return status.into_response();
        }
    };
}

// ---------------------------------------------------------------- servers

#[derive(Deserialize)]
pub struct ServerRegistrationRequest {
    pub hostname: String,
    pub address: String,
    pub management_port: u16,
    pub capacity: Capacity,
    pub topology: Topology,
    #[serde(default)]
    pub workspace_image_by_variant: BTreeMap<String, String>,
}

pub async fn list_servers(headers: HeaderMap, Extension(state): State) -> axum::response::Response {
    require_auth!(headers, state);
    Json(state.registry.list()).into_response()
}

pub async fn register_server(
    headers: HeaderMap,
    Extension(state): State,
    Json(req): Json<ServerRegistrationRequest>,
) -> axum::response::Response {
    require_auth!(headers, state);
    let record = ServerRecord {
        id: uuid::Uuid::new_v4().to_string(),
        hostname: req.hostname,
        address: req.address,
        management_port: req.management_port,
        status: ServerStatus::Active,
        capacity: req.capacity,
        reserved: Capacity::default(),
        active_workspaces: 0,
        topology: req.topology,
        workspace_image_by_variant: req.workspace_image_by_variant,
        last_heartbeat_ts: None,
        consecutive_heartbeat_failures: 0,
    };
    match state.registry.register(record).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn get_server(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.registry.get(&id) {
        Some(record) => Json(record).into_response(),
        None => error_response(CoreError::NotFound { kind: "server", id }),
    }
}

#[derive(Deserialize)]
pub struct PatchServerRequest {
    pub labels: Option<BTreeMap<String, String>>,
    pub status: Option<ServerStatus>,
    pub max_workspaces_hint: Option<u32>,
}

pub async fn patch_server(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
    Json(req): Json<PatchServerRequest>,
) -> axum::response::Response {
    require_auth!(headers, state);
    let patch = ServerPatch {
        labels: req.labels,
        status: req.status,
        max_workspaces_hint: req.max_workspaces_hint,
    };
    match state.registry.update(&id, patch).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize, Default)]
pub struct DeleteServerQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn delete_server(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
    Query(query): Query<DeleteServerQuery>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.registry.delete(&id, query.force).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn drain_server(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    let patch = ServerPatch {
        status: Some(ServerStatus::Draining),
        ..Default::default()
    };
    match state.registry.update(&id, patch).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn activate_server(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    let patch = ServerPatch {
        status: Some(ServerStatus::Active),
        ..Default::default()
    };
    match state.registry.update(&id, patch).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn server_health(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.heartbeat.sample(&id) {
        Some(sample) => Json(sample).into_response(),
        None => error_response(CoreError::NotFound { kind: "server", id }),
    }
}

pub async fn server_workspaces(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.store.list_by_server(&id).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => error_response(CoreError::Internal(err.to_string())),
    }
}

#[derive(Serialize)]
struct ClusterStatus {
    total_servers: usize,
    active_servers: usize,
    draining_servers: usize,
    offline_servers: usize,
    total_active_workspaces: u32,
}

pub async fn cluster_status(headers: HeaderMap, Extension(state): State) -> axum::response::Response {
    require_auth!(headers, state);
    let servers = state.registry.list();
    let status = ClusterStatus {
        total_servers: servers.len(),
        active_servers: servers.iter().filter(|s| s.status == ServerStatus::Active).count(),
        draining_servers: servers.iter().filter(|s| s.status == ServerStatus::Draining).count(),
        offline_servers: servers.iter().filter(|s| s.status == ServerStatus::Offline).count(),
        total_active_workspaces: servers.iter().map(|s| s.active_workspaces).sum(),
    };
    Json(status).into_response()
}

#[derive(Deserialize)]
pub struct RegionCapacityQuery {
    pub tier: String,
}

#[derive(Serialize)]
struct RegionCapacityResponse {
    region: String,
    tier: String,
    available_workspaces: usize,
}

pub async fn region_capacity(
    headers: HeaderMap,
    Extension(state): State,
    Path(region): Path<String>,
    Query(query): Query<RegionCapacityQuery>,
) -> axum::response::Response {
    require_auth!(headers, state);
    let spec = match state.hardware_specs.resolve(&query.tier).await {
        Ok(spec) => spec,
        Err(err) => return error_response(err),
    };
    let requirements = crate::types::Requirements {
        cpu_cores: spec.cpu_cores,
        memory_mb: spec.memory_mb,
        disk_gb: spec.disk_gb,
        bandwidth_mbps: spec.bandwidth_mbps,
        architecture: spec.architecture.unwrap_or(crate::types::Architecture::Amd64),
        requires_gpu: spec.is_gpu,
        gpu_kind: spec.gpu_kind,
    };
    let available = state.registry.capacity_by_tier(&region, &requirements);
    Json(RegionCapacityResponse {
        region,
        tier: query.tier,
        available_workspaces: available,
    })
    .into_response()
}

// ------------------------------------------------------------- workspaces

#[derive(Deserialize)]
pub struct CreateWorkspaceRequest {
    pub user_id: String,
    pub session_id: String,
    pub tier: String,
    pub required_region: Option<String>,
    pub workspace_id: Option<String>,
    pub pod_template: Option<PodTemplate>,
}

pub async fn create_workspace(
    headers: HeaderMap,
    Extension(state): State,
    Json(req): Json<CreateWorkspaceRequest>,
) -> axum::response::Response {
    require_auth!(headers, state);
    let cfg = CreateWorkspaceConfig {
        tier: req.tier,
        required_region: req.required_region,
        workspace_id: req.workspace_id,
        pod_template: req.pod_template,
    };
    match state.lifecycle.create(req.user_id, req.session_id, cfg).await {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn get_workspace(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.lifecycle.get_workspace(&id).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize, Default)]
pub struct DeleteWorkspaceQuery {
    #[serde(default)]
    pub preserve_files: bool,
}

pub async fn delete_workspace(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
    Query(query): Query<DeleteWorkspaceQuery>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.lifecycle.delete(&id, query.preserve_files).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn stop_workspace(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.lifecycle.stop(&id).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn restart_workspace(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.lifecycle.restart(&id).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
pub struct ScaleWorkspaceRequest {
    pub new_tier: String,
}

pub async fn scale_workspace(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
    Json(req): Json<ScaleWorkspaceRequest>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.lifecycle.scale(&id, &req.new_tier).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn workspace_health(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
) -> axum::response::Response {
    require_auth!(headers, state);
    match state.lifecycle.check_health(&id).await {
        Ok(healthy) => Json(serde_json::json!({ "healthy": healthy })).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Deserialize)]
pub struct ExecCommandRequest {
    pub command: Vec<String>,
    #[serde(default = "ExecCommandRequest::default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl ExecCommandRequest {
    fn default_timeout_seconds() -> u64 {
        30
    }
}

pub async fn exec_command(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
    Json(req): Json<ExecCommandRequest>,
) -> axum::response::Response {
    require_auth!(headers, state);
    let timeout = Duration::from_secs(req.timeout_seconds);
    match state.lifecycle.exec(&id, &req.command, timeout).await {
        Ok(result) => Json(result_body(result)).into_response(),
        Err(err) => error_response(err),
    }
}

/// Identical to `exec_command`: the container runtime's exec endpoint
/// isn't itself streaming, so this delivers the same single-chunk
/// result rather than incrementally. Kept as a distinct route so the
/// caller-facing contract matches what a streaming caller expects to
/// hit, even though today it behaves like the non-streaming variant.
pub async fn exec_command_stream(
    headers: HeaderMap,
    Extension(state): State,
    Path(id): Path<String>,
    Json(req): Json<ExecCommandRequest>,
) -> axum::response::Response {
    require_auth!(headers, state);
    let timeout = Duration::from_secs(req.timeout_seconds);
    match state.lifecycle.exec(&id, &req.command, timeout).await {
        Ok(result) => Json(result_body(result)).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Serialize)]
struct ExecResultBody {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

fn result_body(result: crate::container_runtime::ExecResult) -> ExecResultBody {
    ExecResultBody {
        exit_code: result.exit_code,
        stdout: result.stdout,
        stderr: result.stderr,
    }
}

// ------------------------------------------------------------------ bridge

pub async fn connected_pods(headers: HeaderMap, Extension(state): State) -> axum::response::Response {
    require_auth!(headers, state);
    Json(state.bridge.connected_pods()).into_response()
}

#[derive(Deserialize)]
pub struct BridgeCallQuery {
    #[serde(default = "BridgeCallQuery::default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl BridgeCallQuery {
    fn default_timeout_seconds() -> u64 {
        10
    }
}

/// §6.3: drives any of the 8 Local-Pod Bridge RPC methods
/// (`list_projects`, `list_sessions`, `get_session`, `get_messages`,
/// `sync_session`, `resume_session`, `watch_session`, `unwatch_session`)
/// against the pod owning `id`'s workspace, identified by that
/// workspace's owner user rather than by workspace id directly, since a
/// LocalPod is tied to a user, not a workspace.
pub async fn bridge_call(
    headers: HeaderMap,
    Extension(state): State,
    Path((id, method)): Path<(String, String)>,
    Query(query): Query<BridgeCallQuery>,
    Json(params): Json<serde_json::Value>,
) -> axum::response::Response {
    require_auth!(headers, state);

    let record = match state.lifecycle.get(&id).await {
        Ok(record) => record,
        Err(err) => return error_response(err),
    };

    let Some(pod_id) = state.bridge.pod_for_user(&record.owner_user_id) else {
        return error_response(CoreError::PodNotConnected {
            pod_id: record.owner_user_id,
        });
    };

    let timeout = Duration::from_secs(query.timeout_seconds);
    match state.bridge.call(&pod_id, &method, params, timeout).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------- proxy

pub async fn proxy_request(
    Extension(state): State,
    Path((workspace_id, port, path)): Path<(String, u16, String)>,
    method: http::Method,
    headers: HeaderMap,
    original_uri: axum::extract::OriginalUri,
    body: axum::body::Bytes,
) -> axum::response::Response {
    require_auth!(headers, state);
    state.metrics.proxy_requests_total.inc();
    let query = original_uri.0.query().map(|q| format!("?{q}")).unwrap_or_default();
    let forwarded_path = format!("/{path}{query}");

    // The internal service token lives in this header; it authenticates
    // the caller to the control plane and must never be relayed on to
    // the tenant's own workspace container.
    let mut upstream_headers = headers;
    upstream_headers.remove(http::header::AUTHORIZATION);

    match state
        .proxy
        .forward(
            &state.store,
            &state.registry,
            &workspace_id,
            port,
            method,
            &forwarded_path,
            &upstream_headers,
            body.to_vec(),
        )
        .await
    {
        Ok(resp) => {
            let mut builder = http::Response::builder().status(resp.status);
            for (name, value) in resp.headers.iter() {
                builder = builder.header(name, value);
            }
            builder
                .body(axum::body::boxed(axum::body::Full::from(resp.body)))
                .expect("proxied response headers/status are always valid")
        }
        Err(err) => error_response(err),
    }
}
