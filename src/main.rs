//! # workspace-control-plane
//!
//! Fleet control plane for ephemeral developer workspaces: places
//! workspace containers onto registered servers, keeps their Fleet
//! Registry and Workspace Store entries consistent with the hosts
//! actually running them, and exposes the public HTTP surface plus the
//! Local-Pod Bridge laptop agents connect over.

mod bridge;
mod config;
mod container_runtime;
mod coordination;
mod error;
mod filesync;
mod hardware_specs;
mod heartbeat;
mod internal_api;
mod lifecycle;
mod metrics;
mod placement;
mod proxy;
mod registry;
mod server;
mod session_watcher;
mod store;
mod types;

pub(crate) use error::AnyError;

use std::sync::Arc;
use std::time::Duration;

use server::AppState;

/// How often the orphan-reconciliation job re-scans hosts for untracked
/// containers, per §4.4.6. Not operator-tunable: unlike the heartbeat
/// interval (which trades detection latency against ping volume on a
/// fleet an operator sized themselves), this job's cost is independent
/// of fleet size, so there is nothing for an operator to tune it against.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(300);

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let config = match config::Config::load_from_env() {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = ?err, "could not load config");
            std::process::exit(1);
        }
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("could not create runtime");

    let res = rt.block_on(run(config));

    if let Err(err) = res {
        tracing::error!(error = ?err, "control plane failed");
        std::process::exit(1);
    } else {
        tracing::info!("orderly shutdown");
    }
}

async fn run(config: config::Config) -> Result<(), AnyError> {
    let config = Arc::new(config);
    let redis = redis::Client::open(config.redis_url.as_str())?;

    let registry = registry::Registry::new(redis.clone());
    registry.load_from_redis().await?;

    let store = store::WorkspaceStore::new(redis.clone());
    store.rebuild_indexes().await?;

    let coordination = coordination::Coordination::new(redis.clone());
    let runtime_client = container_runtime::ContainerRuntimeClient::new();
    let internal_api =
        internal_api::InternalApiClient::new(config.admin_base_url.clone(), config.internal_service_token.clone());
    let hardware_specs = hardware_specs::HardwareSpecCatalogue::new(
        config.admin_base_url.clone(),
        config.internal_service_token.clone(),
    );
    hardware_specs.refresh().await?;

    let s3 = filesync::build_s3_client(&config.object_store).await;
    let file_sync = filesync::FileSyncEngine::new(
        s3,
        runtime_client.clone(),
        registry.clone(),
        store.clone(),
        &config.object_store,
        config.file_sync.restore_error_rate_threshold,
    );

    let metrics = metrics::Metrics::default();
    if let Some(address) = config.prometheus_address {
        let metrics = metrics.clone();
        tokio::task::spawn(async move {
            metrics::run_exporter_service(metrics, address).await;
        });
    }

    let heartbeat = heartbeat::HeartbeatService::new(
        config.heartbeat.clone(),
        registry.clone(),
        store.clone(),
        runtime_client.clone(),
        internal_api.clone(),
        coordination.clone(),
        metrics.clone(),
    );

    let lifecycle = lifecycle::LifecycleManager::new(
        config.clone(),
        registry.clone(),
        store.clone(),
        file_sync,
        hardware_specs.clone(),
        runtime_client.clone(),
        internal_api.clone(),
        coordination.clone(),
        heartbeat.clone(),
        metrics.clone(),
    );

    let heartbeat_token = heartbeat.spawn();
    let reconciliation_token =
        lifecycle::spawn_reconciliation_jobs(lifecycle.clone(), coordination.clone(), DISCOVERY_INTERVAL);

    let bridge = bridge::Bridge::new(store.clone(), metrics.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        registry,
        store,
        lifecycle,
        heartbeat,
        hardware_specs,
        runtime_client,
        proxy: proxy::ProxyClient::new(),
        bridge,
        metrics,
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::select! {
        _ = server::run_server(state) => {}
        _ = shutdown => {
            tracing::info!("received shutdown signal");
        }
    }

    heartbeat_token.cancel();
    reconciliation_token.cancel();
    Ok(())
}
