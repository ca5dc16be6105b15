//! Removes a cluster, one of its replicas, or its backups
//!
//! Launched as a Job for `delete-data` tasks. Exits with status 2 when the request in the
//! environment is incomplete.

use std::sync::Arc;

use kube::Client;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pgo_operator::{
    config::OperatorConfig,
    controllers::{Context, GroupContext},
    events::EventPublisher,
    operator::rmdata::{self, Request},
    Error,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kube=warn")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let request = match Request::from_lookup(|key| std::env::var(key).ok()) {
        Ok(request) => request,
        Err(Error::Config(message)) => {
            error!(error = %message, "Invalid rmdata request");
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };
    info!(
        cluster = %request.cluster,
        namespace = %request.namespace,
        replica = %request.replica_name,
        remove_data = request.remove_data,
        remove_backup = request.remove_backup,
        is_replica = request.is_replica,
        is_backup = request.is_backup,
        "Starting rmdata"
    );

    let client = Client::try_default().await?;
    let config = OperatorConfig::from_lookup(|key| match key {
        // rmdata runs in the target namespace and only needs the cluster's own resources
        "PGO_OPERATOR_NAMESPACE" | "PGO_INSTALLATION_NAME" => std::env::var(key)
            .ok()
            .or_else(|| Some(request.namespace.clone())),
        _ => std::env::var(key).ok(),
    })?;
    let context = Arc::new(Context::new(client, Arc::new(config), EventPublisher::disabled()));
    let ctx = GroupContext::standalone(context, &request.namespace);

    rmdata::run(&ctx, &request).await?;
    info!(cluster = %request.cluster, "rmdata complete");
    Ok(())
}
