//! Prometheus metrics exporter (ambient). A small struct of
//! `prometheus-client` collectors shared via `Arc`, rendered on a
//! dedicated `/metrics` router protected by the same rate-limit/load-shed
//! layering as the main API.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::Extension;
use prometheus_client::encoding::text::Encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::family::Family;

use crate::AnyError;

#[derive(Clone, Hash, PartialEq, Eq, Encode)]
struct StatusLabel {
    status: String,
}

#[derive(Clone, Hash, PartialEq, Eq, Encode)]
struct ErrorKindLabel {
    kind: String,
}

/// Collectors every component pushes into. Constructed once at startup
/// and threaded through via `Arc`, same as the Registry/Store/etc.
#[derive(Clone)]
pub struct Metrics {
    pub servers_by_status: Family<StatusLabel, Gauge>,
    pub workspaces_by_status: Family<StatusLabel, Gauge>,
    pub placement_failures: Family<ErrorKindLabel, Counter>,
    pub active_leases_held: Gauge,
    pub proxy_requests_total: Counter,
    pub bridge_connected_pods: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            servers_by_status: Family::default(),
            workspaces_by_status: Family::default(),
            placement_failures: Family::default(),
            active_leases_held: Gauge::default(),
            proxy_requests_total: Counter::default(),
            bridge_connected_pods: Gauge::default(),
        }
    }
}

impl Metrics {
    pub fn set_servers_by_status(&self, status: &crate::types::ServerStatus, count: i64) {
        self.servers_by_status
            .get_or_create(&StatusLabel {
                status: format!("{status:?}"),
            })
            .set(count);
    }

    pub fn set_workspaces_by_status(&self, status: &crate::types::WorkspaceStatus, count: i64) {
        self.workspaces_by_status
            .get_or_create(&StatusLabel {
                status: format!("{status:?}"),
            })
            .set(count);
    }

    pub fn record_placement_failure(&self, kind: &str) {
        self.placement_failures
            .get_or_create(&ErrorKindLabel { kind: kind.to_string() })
            .inc();
    }
}

type Registry = prometheus_client::registry::Registry<
    Box<dyn prometheus_client::encoding::text::SendEncodeMetric>,
>;

fn build_registry(metrics: &Metrics) -> Registry {
    let mut reg = Registry::default();
    reg.register(
        "workspace_control_plane_servers",
        "Registered servers by status.",
        Box::new(metrics.servers_by_status.clone()),
    );
    reg.register(
        "workspace_control_plane_workspaces",
        "Workspaces by status.",
        Box::new(metrics.workspaces_by_status.clone()),
    );
    reg.register(
        "workspace_control_plane_placement_failures",
        "Placement failures by error kind.",
        Box::new(metrics.placement_failures.clone()),
    );
    reg.register(
        "workspace_control_plane_active_leases",
        "Number of named leases currently held by this replica.",
        Box::new(metrics.active_leases_held.clone()),
    );
    reg.register(
        "workspace_control_plane_proxy_requests",
        "Total reverse-proxy requests forwarded.",
        Box::new(metrics.proxy_requests_total.clone()),
    );
    reg.register(
        "workspace_control_plane_bridge_connected_pods",
        "Number of Local-Pod Bridge connections currently online.",
        Box::new(metrics.bridge_connected_pods.clone()),
    );
    reg
}

type State = Arc<Mutex<Registry>>;

async fn handler(Extension(registry): Extension<State>) -> impl axum::response::IntoResponse {
    let mut buffer = Vec::new();
    prometheus_client::encoding::text::encode(&mut buffer, &registry.lock().unwrap()).unwrap();

    axum::response::Response::builder()
        .status(http::StatusCode::OK)
        .header(
            http::header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(axum::body::Body::from(buffer))
        .unwrap()
}

async fn run_exporter(metrics: Metrics, address: SocketAddr) -> Result<(), AnyError> {
    let registry: State = Arc::new(Mutex::new(build_registry(&metrics)));

    let router = axum::Router::new()
        .route("/metrics", axum::routing::get(handler))
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
                .buffer(5)
                .rate_limit(20, std::time::Duration::from_secs(1))
                .load_shed()
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(axum::AddExtensionLayer::new(registry))
                .into_inner(),
        );

    tracing::info!(address = %address, "starting prometheus metrics exporter");

    axum::Server::bind(&address)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

/// Runs the exporter forever, restarting it with a short backoff if the
/// bind/serve loop ever returns an error.
pub async fn run_exporter_service(metrics: Metrics, address: SocketAddr) {
    loop {
        if let Err(err) = run_exporter(metrics.clone(), address).await {
            tracing::error!(error = %err, "prometheus metrics exporter failed, restarting");
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        }
    }
}
