mod config;
mod controller;
mod health;

use std::sync::Arc;

use caph_machine::MachineReconciler;
use caph_machine::harvester::KubeconfigConnector;
use caph_machine::store::KubeStore;
use caph_machine::vmspec::VmOptions;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::ControllerConfig;
use crate::health::{HealthState, health_router};

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ControllerConfig::from_env().expect("invalid controller configuration");

    let client = caph_api::create_client(config.kubeconfig.as_deref())
        .await
        .expect("failed to create management cluster client");
    tracing::info!(namespace = client.default_namespace(), "management cluster client ready");

    let reconciler = Arc::new(MachineReconciler::new(
        Arc::new(KubeStore::new(client.clone())),
        Arc::new(KubeconfigConnector),
        VmOptions {
            network_name: config.vm_network_name.clone(),
        },
    ));

    let cancel = CancellationToken::new();
    let health = HealthState::default();
    let worker = tokio::spawn({
        let config = config.clone();
        let health = health.clone();
        let cancel = cancel.clone();
        async move { controller::run(client, reconciler, &config, health, cancel).await }
    });

    let app = health_router(health).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(config.health_listen_addr)
        .await
        .expect("failed to bind health listener");

    tracing::info!(addr = %config.health_listen_addr, "starting HarvesterMachine controller");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        })
        .await
        .expect("health server error");

    cancel.cancel();
    if let Err(e) = worker.await {
        tracing::error!(error = %e, "controller task failed");
    }
}
