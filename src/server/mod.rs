//! Public + internal HTTP surface. One axum `ServiceBuilder` stack
//! providing backpressure (buffer/rate-limit/load-shed/timeout) and
//! tracing, with application state threaded through as an `Extension`.

mod api;

use std::sync::Arc;

use axum::extract::{ws::WebSocketUpgrade, Extension, Query};
use axum::response::IntoResponse;
use axum::routing::{get, post};

use crate::bridge::Bridge;
use crate::config::Config;
use crate::container_runtime::ContainerRuntimeClient;
use crate::hardware_specs::HardwareSpecCatalogue;
use crate::heartbeat::HeartbeatService;
use crate::lifecycle::LifecycleManager;
use crate::metrics::Metrics;
use crate::proxy::ProxyClient;
use crate::registry::Registry;
use crate::store::WorkspaceStore;

pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Registry,
    pub store: WorkspaceStore,
    pub lifecycle: LifecycleManager,
    pub heartbeat: HeartbeatService,
    pub hardware_specs: HardwareSpecCatalogue,
    pub runtime_client: ContainerRuntimeClient,
    pub proxy: ProxyClient,
    pub bridge: Bridge,
    pub metrics: Metrics,
}

pub type State = Extension<Arc<AppState>>;

/// Starts the public/internal webserver. Blocks indefinitely.
pub async fn run_server(state: Arc<AppState>) {
    let address = state.config.server_address;

    let router = axum::Router::new()
        .route("/health", get(health))
        .route("/servers", get(api::list_servers).post(api::register_server))
        .route(
            "/servers/:id",
            get(api::get_server).patch(api::patch_server).delete(api::delete_server),
        )
        .route("/servers/:id/drain", post(api::drain_server))
        .route("/servers/:id/activate", post(api::activate_server))
        .route("/servers/:id/health", get(api::server_health))
        .route("/servers/:id/workspaces", get(api::server_workspaces))
        .route("/servers/cluster/status", get(api::cluster_status))
        .route("/servers/capacity/:region", get(api::region_capacity))
        .route("/workspaces", post(api::create_workspace))
        .route("/workspaces/:id", get(api::get_workspace).delete(api::delete_workspace))
        .route("/workspaces/:id/stop", post(api::stop_workspace))
        .route("/workspaces/:id/restart", post(api::restart_workspace))
        .route("/workspaces/:id/scale", post(api::scale_workspace))
        .route("/workspaces/:id/health", get(api::workspace_health))
        .route("/workspaces/:id/exec-command", post(api::exec_command))
        .route("/workspaces/:id/exec-command-stream", post(api::exec_command_stream))
        .route("/workspaces/:id/proxy/:port/*path", axum::routing::any(api::proxy_request))
        .route("/workspaces/:id/bridge/:method", post(api::bridge_call))
        .route("/bridge/ws", get(bridge_upgrade))
        .route("/bridge/pods", get(api::connected_pods))
        .layer(
            tower::ServiceBuilder::new()
                .layer(axum::error_handling::HandleErrorLayer::new(
                    |error: axum::BoxError| async move {
                        if error.is::<tower::timeout::error::Elapsed>() {
                            Result::<(), _>::Err((
                                http::StatusCode::REQUEST_TIMEOUT,
                                "Request has timed out".to_string(),
                            ))
                        } else if error.is::<tower::load_shed::error::Overloaded>() {
                            Err((
                                http::StatusCode::SERVICE_UNAVAILABLE,
                                "API is overloaded".to_string(),
                            ))
                        } else {
                            Err((
                                http::StatusCode::INTERNAL_SERVER_ERROR,
                                format!("Unhandled internal error: {}", error),
                            ))
                        }
                    },
                ))
                .buffer(1024)
                .rate_limit(500, std::time::Duration::from_secs(1))
                .load_shed()
                .timeout(std::time::Duration::from_secs(30))
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(axum::AddExtensionLayer::new(state))
                .into_inner(),
        );

    tracing::info!(address = %address, "starting control-plane http server");

    axum::Server::bind(&address)
        .serve(router.into_make_service())
        .await
        .unwrap();
}

async fn health() -> impl IntoResponse {
    (http::StatusCode::OK, "ok".to_string())
}

#[derive(serde::Deserialize)]
struct BridgeConnectQuery {
    pod_id: String,
    user_id: String,
}

/// Upgrade handshake for a laptop agent's Local-Pod Bridge connection.
/// Auth is the same bearer-token check as the rest of the public
/// surface (see `api::require_internal_token`) — a connecting laptop
/// presents the same internal service token as any other caller, via
/// an `Authorization` header on the upgrade request.
async fn bridge_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<BridgeConnectQuery>,
    headers: http::HeaderMap,
    Extension(state): State,
) -> axum::response::Response {
    if let Err(status) = api::require_internal_token(&headers, &state.config) {
        return status.into_response();
    }
    let bridge = state.bridge.clone();
    ws.on_upgrade(move |socket| bridge.handle_socket(socket, query.pod_id, query.user_id))
        .into_response()
}
