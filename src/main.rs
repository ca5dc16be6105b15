//! PostgreSQL Operator
//!
//! Main entry point. Resolves the namespaces this installation manages, starts a
//! controller group for each of them and keeps the set up to date until shutdown.

use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pgo_operator::{
    config::OperatorConfig,
    controllers::{namespace, Context, ControllerManager},
    events::EventPublisher,
    metrics,
    ns::NamespaceResolver,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Arc::new(OperatorConfig::from_env()?);
    info!(
        version = %config.pgo_version,
        namespace = %config.operator_namespace,
        installation = %config.installation_name,
        "Starting PostgreSQL Operator"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let events = EventPublisher::new(config.event_addr.clone())?;
    if !events.is_enabled() {
        info!("EVENT_ADDR not set, eventing disabled");
    }
    let context = Arc::new(Context::new(client.clone(), config.clone(), events));

    let resolver = NamespaceResolver::new(client.clone(), config.clone());
    let mode = resolver.operating_mode().await?;
    info!(mode = %mode, "Namespace operating mode detected");
    let namespaces = resolver.initial_namespace_list(mode).await?;

    let metrics_handle = tokio::spawn(metrics::serve(config.metrics_port));
    info!("Metrics server starting on port {}", config.metrics_port);

    let manager = ControllerManager::new(context, resolver, mode, &namespaces).await;
    if let Err(e) = manager.run_all().await {
        // groups that could not start are retried by the refresh loop
        warn!(error = %e, "Not every controller group could be started");
    }

    let cancel = CancellationToken::new();
    let namespace_watch = mode.watches_namespaces().then(|| {
        namespace::watch_namespaces(
            client.clone(),
            &config.installation_name,
            manager.clone(),
            cancel.clone(),
        )
    });
    let refresh = tokio::spawn(manager.clone().run_refresh(cancel.clone()));

    metrics::set_ready(true);
    metrics::OPERATOR_HEALTH.set(1.0);
    info!("PostgreSQL Operator running");

    tokio::select! {
        result = metrics_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "Metrics server failed"),
                _ => error!("Metrics server exited unexpectedly"),
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    metrics::set_ready(false);
    cancel.cancel();
    if let Some(watch) = namespace_watch {
        watch.join().await;
    }
    if let Err(e) = refresh.await {
        warn!(error = %e, "Refresh task failed");
    }
    manager.remove_all().await;

    info!("PostgreSQL Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
