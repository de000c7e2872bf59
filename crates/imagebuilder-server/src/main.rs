//! Service entry point: wiring, startup cleanup, the reconcile loop, and the
//! HTTP listener with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use imagebuilder_core::{CatalogGateway, WorkloadGateway};
use imagebuilder_engine::{CleanupReconciler, Orchestrator, ReconcileLoop};
use imagebuilder_kube::KubeWorkloadGateway;
use imagebuilder_server::{
    router, AppState, HttpCatalogClient, ImageBuilderConfig, ServiceOptions,
};
use imagebuilder_storage::StorageSink;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let options = ServiceOptions::parse();
    let config = ImageBuilderConfig::try_from(options)
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    let storage = Arc::new(StorageSink::new(config.storage.clone()));
    tracing::info!(
        listen = %config.listen_addr,
        namespace = %config.build_namespace,
        storage = %storage.kind(),
        "starting flightctl-imagebuilder service"
    );
    if config.upload_token.is_none() {
        tracing::warn!("no upload token configured; artifact uploads will be rejected");
    }

    let workloads: Arc<dyn WorkloadGateway> = Arc::new(
        KubeWorkloadGateway::connect()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("failed to initialize cluster client")?,
    );
    let catalog: Arc<dyn CatalogGateway> = Arc::new(HttpCatalogClient::new(&config.catalog_url));

    let orchestrator = Arc::new(Orchestrator::new(
        catalog.clone(),
        workloads.clone(),
        storage.clone(),
        config.build_namespace.clone(),
        config.service_url.clone(),
        config.upload_token.clone().unwrap_or_default(),
        config.enrollment.clone(),
    ));

    let state = AppState {
        storage,
        workloads: workloads.clone(),
        build_namespace: config.build_namespace.clone(),
        upload_token: config.upload_token.clone(),
        enrollment: config.enrollment.clone(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "http api listening");

    let shutdown = CancellationToken::new();
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        })
    };

    // One cleanup pass at startup, under the cluster-wide lease. Failures
    // are logged, never fatal.
    let cleanup = CleanupReconciler::new(
        catalog.clone(),
        workloads.clone(),
        config.build_namespace.clone(),
        config.holder.clone(),
    );
    if let Err(err) = cleanup.run().await {
        tracing::warn!(error = %err, "initial cleanup failed, continuing");
    }

    let reconciler = ReconcileLoop::new(catalog, orchestrator).with_interval(config.poll_interval);
    let loop_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };

    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();

    if let Err(err) = loop_handle.await {
        tracing::warn!(error = %err, "reconcile loop task failed");
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => tracing::info!("http server stopped"),
        Ok(Ok(Err(err))) => tracing::error!(error = %err, "http server error"),
        Ok(Err(err)) => tracing::error!(error = %err, "http server task failed"),
        Err(_) => tracing::warn!("http server did not drain in time, exiting"),
    }

    tracing::info!("flightctl-imagebuilder service stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
