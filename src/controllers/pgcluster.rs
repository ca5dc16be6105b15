//! Pgcluster event handler
//!
//! Sets up new clusters, either from scratch or bootstrapped from another cluster's
//! pgBackRest repository, and queues the removal of deleted ones. Updates shut a cluster
//! down or start it up again and toggle Patroni autofailover through the `autofail` label.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use super::informer::EventHandler;
use super::{observe, GroupContext};
use crate::config::labels;
use crate::crd::{ClusterLifecycle, Pgcluster, Pgtask};
use crate::error::{Error, Result};
use crate::kubeapi::{self, Merge7386};
use crate::lifecycle;
use crate::operator::cluster::{self, AddAction, ScaleTargets};
use crate::operator::task;

/// Deployments stopped by a shutdown
const SHUTDOWN_TARGETS: ScaleTargets = ScaleTargets {
    primary: true,
    replicas: true,
    backrest_repo: true,
    pgbouncer: true,
};

/// Deployments started again on startup; replicas follow once the primary is promoted
const STARTUP_TARGETS: ScaleTargets = ScaleTargets {
    primary: true,
    replicas: false,
    backrest_repo: true,
    pgbouncer: true,
};

/// Power change requested by a cluster update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerChange {
    Shutdown,
    Startup,
}

/// Whether `spec.shutdown` asks for a change of the current state
pub fn power_change(cluster: &Pgcluster) -> Option<PowerChange> {
    let shut_down = cluster.lifecycle() == ClusterLifecycle::Shutdown;
    match (cluster.spec.shutdown, shut_down) {
        (true, false) => Some(PowerChange::Shutdown),
        (false, true) => Some(PowerChange::Startup),
        _ => None,
    }
}

/// New autofailover setting when the `autofail` label changed between versions
pub fn autofail_change(old: &Pgcluster, new: &Pgcluster) -> Option<bool> {
    match (old.autofail(), new.autofail()) {
        (Some(before), Some(after)) if before != after => Some(after),
        _ => None,
    }
}

pub struct PgclusterHandler {
    ctx: Arc<GroupContext>,
}

impl PgclusterHandler {
    pub fn new(ctx: Arc<GroupContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler<Pgcluster> for PgclusterHandler {
    async fn on_add(&self, cluster: Arc<Pgcluster>) {
        observe("pgcluster", handle_add(&self.ctx, &cluster)).await;
    }

    async fn on_update(&self, old: Arc<Pgcluster>, new: Arc<Pgcluster>) {
        if new.reconcile_paused() {
            debug!(cluster = %new.name_any(), state = %new.lifecycle(), "Cluster is paused, ignoring update");
            return;
        }
        observe("pgcluster", handle_update(&self.ctx, &old, &new)).await;
    }

    async fn on_delete(&self, cluster: Arc<Pgcluster>) {
        observe("pgcluster", handle_delete(&self.ctx, &cluster)).await;
    }
}

#[instrument(skip(ctx, pgcluster), fields(cluster = %pgcluster.name_any(), namespace = pgcluster.namespace()))]
async fn handle_add(ctx: &GroupContext, pgcluster: &Pgcluster) -> Result<()> {
    match cluster::add_action(pgcluster) {
        AddAction::Skip => {
            debug!(state = %pgcluster.lifecycle(), "Cluster already set up, nothing to add");
            Ok(())
        }
        AddAction::Bootstrap(source) => {
            info!(source = %source, "Bootstrapping cluster from an existing repository");
            match cluster::add_bootstrap_repo(ctx, pgcluster).await {
                // the pod handler starts the bootstrap once the new repository is ready
                Ok(true) => Ok(()),
                Ok(false) => cluster::add_cluster_bootstrap(ctx, pgcluster).await,
                Err(e) => {
                    cluster::publish_create_failure(ctx, pgcluster, &e.to_string()).await;
                    Err(e)
                }
            }
        }
        AddAction::Create => {
            let namespace = pgcluster.namespace().unwrap_or_else(|| ctx.namespace.clone());
            lifecycle::set_cluster_state(
                ctx.client(),
                &namespace,
                &pgcluster.name_any(),
                ClusterLifecycle::Creating,
                "Successfully processed Pgcluster by controller",
            )
            .await?;
            cluster::add_cluster_base(ctx, pgcluster).await
        }
    }
}

#[instrument(skip(ctx, pgcluster), fields(cluster = %pgcluster.name_any(), namespace = pgcluster.namespace()))]
async fn handle_delete(ctx: &GroupContext, pgcluster: &Pgcluster) -> Result<()> {
    let namespace = pgcluster.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let name = pgcluster.cluster_name();
    let tasks: Api<Pgtask> = ctx.api(&namespace);

    // a removal already underway deletes the Pgcluster itself
    let selector = labels::selector(&[
        (labels::LABEL_PG_CLUSTER, &name),
        (labels::LABEL_RMDATA, labels::LABEL_TRUE),
    ]);
    if !tasks.list(&ListParams::default().labels(&selector)).await?.items.is_empty() {
        debug!("Cluster removal already queued");
        return Ok(());
    }

    let removal = task::cluster_removal_task(pgcluster);
    match tasks.create(&PostParams::default(), &removal).await {
        Ok(_) => {
            info!(
                keep_data = pgcluster.keep_data(),
                keep_backups = pgcluster.keep_backups(),
                "Queued removal of deleted cluster"
            );
            Ok(())
        }
        Err(e) => {
            let e = Error::from(e);
            if e.is_already_exists() {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

#[instrument(skip(ctx, old, new), fields(cluster = %new.name_any(), namespace = new.namespace()))]
async fn handle_update(ctx: &GroupContext, old: &Pgcluster, new: &Pgcluster) -> Result<()> {
    let namespace = new.namespace().unwrap_or_else(|| ctx.namespace.clone());

    match power_change(new) {
        Some(PowerChange::Shutdown) => shutdown(ctx, &namespace, new).await?,
        Some(PowerChange::Startup) => {
            cluster::toggle_autofailover(ctx, &namespace, &new.pgha_scope(), true).await?;
            let scaled = cluster::scale_cluster_deployments(ctx, new, 1, STARTUP_TARGETS).await?;
            info!(primary = scaled.primary.as_deref().unwrap_or_default(), "Cluster startup initiated");
        }
        None => {}
    }

    if let Some(enable) = autofail_change(old, new) {
        if !cluster::toggle_autofailover(ctx, &namespace, &new.pgha_scope(), enable).await? {
            warn!("Autofailover not changed, Patroni has not written its configuration yet");
        }
    }
    Ok(())
}

async fn shutdown(ctx: &GroupContext, namespace: &str, pgcluster: &Pgcluster) -> Result<()> {
    let name = pgcluster.name_any();
    let clusters: Api<Pgcluster> = ctx.api(namespace);

    // startup brings back the deployment that was primary when the cluster stopped
    let primary = cluster::primary_pod(ctx, namespace, &name).await?;
    if let Some(deployment) = primary.labels().get(labels::LABEL_DEPLOYMENT_NAME) {
        let mut patch = Merge7386::new();
        patch.add(
            &["metadata", "annotations", labels::ANNOTATION_PRIMARY_DEPLOYMENT],
            deployment.as_str(),
        );
        kubeapi::merge_patch(&clusters, &name, &patch.to_value()).await?;
    }

    cluster::toggle_autofailover(ctx, namespace, &pgcluster.pgha_scope(), false).await?;
    cluster::scale_cluster_deployments(ctx, pgcluster, 0, SHUTDOWN_TARGETS).await?;
    lifecycle::set_cluster_state(
        ctx.client(),
        namespace,
        &name,
        ClusterLifecycle::Shutdown,
        "Database shutdown along with the pgBackRest repository and pgBouncer",
    )
    .await?;

    let config_maps: Api<ConfigMap> = ctx.api(namespace);
    let leader = format!("{}-leader", pgcluster.pgha_scope());
    kubeapi::delete_if_present(&config_maps, &leader, &DeleteParams::default()).await?;
    info!(cluster = %name, "Cluster shut down");
    Ok(())
}
