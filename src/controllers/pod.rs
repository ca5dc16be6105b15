//! Pod event handlers
//!
//! Cluster initialization is driven by the database or repository container of a cluster
//! becoming ready, and failover handling by Patroni relabelling the promoted pod.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::informer::EventHandler;
use super::{observe, GroupContext};
use crate::config::labels;
use crate::crd::{ClusterLifecycle, Pgcluster, Pgreplica};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::kubeapi::{self, Json6902, Merge7386, Poll};
use crate::operator::cluster::{self, ScaleTargets};
use crate::operator::{backrest, policy, workflow};

/// Waiting for a promoted standby to accept writes
const STANDBY_PROMOTION_POLL: Poll =
    Poll::new(Duration::from_millis(500), Duration::from_secs(300)).delayed();

const PATRONI_ROLE_STANDBY_LEADER: &str = "standby_leader";

/// Pod carries a PostgreSQL instance
pub fn is_postgres_pod(pod: &Pod) -> bool {
    pod.labels().contains_key(labels::LABEL_PG_DATABASE)
}

/// Pod runs a pgBackRest repository
pub fn is_backrest_repo_pod(pod: &Pod) -> bool {
    pod.labels().contains_key(labels::LABEL_PGO_BACKREST_REPO)
}

fn container_ready(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .into_iter()
        .flatten()
        .find(|c| c.name == container)
        .is_some_and(|c| c.ready)
}

/// `container` was not ready in `old` and is ready in `new`
pub fn is_container_becoming_ready(container: &str, old: &Pod, new: &Pod) -> bool {
    !container_ready(old, container) && container_ready(new, container)
}

pub fn is_db_container_becoming_ready(old: &Pod, new: &Pod) -> bool {
    is_postgres_pod(new) && is_container_becoming_ready(labels::CONTAINER_DATABASE, old, new)
}

pub fn is_backrest_repo_becoming_ready(old: &Pod, new: &Pod) -> bool {
    is_backrest_repo_pod(new) && is_container_becoming_ready(labels::CONTAINER_DATABASE, old, new)
}

fn role(pod: &Pod) -> Option<&str> {
    pod.labels().get(labels::LABEL_PGHA_ROLE).map(String::as_str)
}

/// Patroni moved the pod from `promoted` to `master`
pub fn is_promoted_postgres_pod(old: &Pod, new: &Pod) -> bool {
    is_postgres_pod(new)
        && role(old) == Some(labels::LABEL_PGHA_ROLE_PROMOTED)
        && role(new) == Some(labels::LABEL_PGHA_ROLE_PRIMARY)
}

/// Role Patroni reports in the pod's `status` annotation
pub fn patroni_status_role(pod: &Pod) -> Option<String> {
    let raw = pod.annotations().get(labels::ANNOTATION_PATRONI_STATUS)?;
    let status: Value = serde_json::from_str(raw).ok()?;
    status.get("role")?.as_str().map(str::to_string)
}

/// A standby leader became a read-write primary
pub fn is_promoted_standby(old: &Pod, new: &Pod) -> bool {
    is_postgres_pod(new)
        && patroni_status_role(old).as_deref() == Some(PATRONI_ROLE_STANDBY_LEADER)
        && patroni_status_role(new).as_deref() == Some(labels::LABEL_PGHA_ROLE_PRIMARY)
}

/// Output of `SELECT pg_is_in_recovery()` shows recovery has ended
pub fn recovery_disabled(output: &str) -> bool {
    output.trim() == "f"
}

/// Patroni's `/master` endpoint reports a running primary with no restart pending
pub fn leader_accepting_writes(output: &str) -> bool {
    let Ok(status) = serde_json::from_str::<Value>(output) else {
        return false;
    };
    status.get("state").and_then(Value::as_str) == Some("running")
        && !status
            .get("pending_restart")
            .and_then(Value::as_bool)
            .unwrap_or(false)
}

/// Service a pod's labels should point at
///
/// A service already recorded on the deployment wins, since the pod may have been restarted.
pub fn service_name_for(cluster: &str, deployment_service: Option<&str>, replica: bool) -> String {
    match deployment_service {
        Some(name) if !name.is_empty() => name.to_string(),
        _ if replica => labels::replica_service_name(cluster),
        _ => cluster.to_string(),
    }
}

/// Handles Pod events for one namespace
pub struct PodHandler {
    ctx: Arc<GroupContext>,
}

impl PodHandler {
    pub fn new(ctx: Arc<GroupContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler<Pod> for PodHandler {
    async fn on_add(&self, pod: Arc<Pod>) {
        if is_postgres_pod(&pod) {
            observe("pod", label_postgres_pod_and_deployment(&self.ctx, &pod)).await;
        }
    }

    async fn on_update(&self, old: Arc<Pod>, new: Arc<Pod>) {
        if new.labels().get(labels::LABEL_VENDOR).map(String::as_str) != Some(labels::LABEL_CRUNCHY) {
            return;
        }
        if !new.labels().contains_key(labels::LABEL_PG_CLUSTER) {
            debug!(pod = %new.name_any(), "Pod is not part of a cluster, ignoring");
            return;
        }
        observe("pod", handle_update(&self.ctx, &old, &new)).await;
    }
}

#[instrument(skip(ctx, old, new), fields(pod = %new.name_any(), namespace = new.namespace()))]
async fn handle_update(ctx: &GroupContext, old: &Pod, new: &Pod) -> Result<()> {
    let pod_labels = new.labels();
    // a repository started for a bootstrap belongs to the cluster being bootstrapped
    let cluster_name = pod_labels
        .get(labels::LABEL_PGHA_BOOTSTRAP)
        .filter(|c| !c.is_empty())
        .or_else(|| pod_labels.get(labels::LABEL_PG_CLUSTER))
        .cloned()
        .unwrap_or_default();
    let namespace = pod_labels
        .get(labels::LABEL_PGHA_BOOTSTRAP_NAMESPACE)
        .filter(|ns| !ns.is_empty())
        .cloned()
        .unwrap_or_else(|| new.namespace().unwrap_or_default());

    let clusters: Api<Pgcluster> = ctx.api(&namespace);
    let pgcluster = clusters.get(&cluster_name).await?;
    if pgcluster.reconcile_paused() {
        debug!(cluster = %cluster_name, state = %pgcluster.lifecycle(), "Cluster is paused, ignoring pod update");
        return Ok(());
    }

    if pgcluster.lifecycle() != ClusterLifecycle::Initialized
        && (is_db_container_becoming_ready(old, new) || is_backrest_repo_becoming_ready(old, new))
    {
        return handle_cluster_init(ctx, new, &pgcluster).await;
    }

    if is_promoted_postgres_pod(old, new) {
        info!(cluster = %cluster_name, "Pod promoted to primary");
        if let Some(deployment) = new.labels().get(labels::LABEL_DEPLOYMENT_NAME) {
            if let Err(e) = cluster::set_current_primary(ctx, &namespace, &pgcluster, deployment).await {
                warn!(cluster = %cluster_name, error = %e, "Unable to record current primary");
            }
        }
        handle_postgres_pod_promotion(ctx, new, &pgcluster).await?;
    }

    if is_promoted_standby(old, new) {
        info!(cluster = %cluster_name, "Standby leader promoted to primary");
        handle_standby_promotion(ctx, new, &pgcluster).await?;
    }
    Ok(())
}

async fn handle_cluster_init(ctx: &GroupContext, pod: &Pod, pgcluster: &Pgcluster) -> Result<()> {
    if is_backrest_repo_pod(pod) {
        return handle_backrest_repo_init(ctx, pod, pgcluster).await;
    }

    handle_common_init(ctx, pgcluster).await?;

    if pgcluster.spec.standby {
        info!(cluster = %pgcluster.name_any(), "Initializing standby cluster");
        return handle_standby_init(ctx, pgcluster).await;
    }
    handle_bootstrap_init(ctx, pgcluster).await
}

async fn handle_backrest_repo_init(ctx: &GroupContext, pod: &Pod, pgcluster: &Pgcluster) -> Result<()> {
    if pod.labels().contains_key(labels::LABEL_PGHA_BOOTSTRAP) {
        return cluster::add_cluster_bootstrap(ctx, pgcluster).await;
    }

    let scaled = cluster::scale_cluster_deployments(ctx, pgcluster, 1, ScaleTargets::PRIMARY).await?;
    info!(
        cluster = %pgcluster.name_any(),
        primary = scaled.primary.as_deref().unwrap_or_default(),
        "Repository ready, scaled primary to proceed with initialization"
    );
    Ok(())
}

async fn handle_common_init(ctx: &GroupContext, pgcluster: &Pgcluster) -> Result<()> {
    let namespace = pgcluster.namespace().unwrap_or_default();

    if pgcluster.autofail() == Some(false) {
        if let Err(e) = cluster::toggle_autofailover(ctx, &namespace, &pgcluster.pgha_scope(), false).await {
            warn!(cluster = %pgcluster.name_any(), error = %e, "Unable to disable autofailover");
        }
    }

    cluster::update_pgha_init_flag(ctx, &namespace, &pgcluster.name_any(), false).await
}

async fn publish_cluster_complete(ctx: &GroupContext, namespace: &str, pgcluster: &Pgcluster) {
    let workflow_id = pgcluster
        .spec
        .user_labels
        .get(labels::LABEL_WORKFLOW_ID)
        .cloned()
        .unwrap_or_default();
    ctx.events()
        .publish(
            namespace,
            EventKind::CreateClusterCompleted {
                cluster: pgcluster.name_any(),
                workflow_id,
            },
        )
        .await;
}

async fn add_pgbouncer_if_enabled(ctx: &GroupContext, pgcluster: &Pgcluster) {
    if !pgcluster.pgbouncer_enabled() {
        return;
    }
    if let Err(e) = cluster::add_pgbouncer(ctx, pgcluster).await {
        warn!(cluster = %pgcluster.name_any(), error = %e, "Unable to add pgBouncer");
    }
}

#[instrument(skip(ctx, pgcluster), fields(cluster = %pgcluster.name_any()))]
async fn handle_bootstrap_init(ctx: &GroupContext, pgcluster: &Pgcluster) -> Result<()> {
    let namespace = pgcluster.namespace().unwrap_or_default();
    let cluster_name = pgcluster.name_any();

    if pgcluster.restore_requested() {
        let clusters: Api<Pgcluster> = ctx.api(&namespace);
        let mut patch = Json6902::new();
        patch.remove(&["metadata", "annotations", labels::ANNOTATION_BACKREST_RESTORE]);
        if let Err(e) = kubeapi::json_patch(&clusters, &cluster_name, &patch).await {
            warn!(error = %e, "Unable to remove the restore annotation");
        }
    } else {
        debug!("Primary ready, applying policies");
        if let Err(e) = policy::apply_policies(ctx, &namespace, pgcluster).await {
            warn!(error = %e, "Unable to apply policies");
        }
    }

    if let Err(e) = workflow::complete_create_cluster_workflow(ctx, &namespace, &cluster_name).await {
        warn!(error = %e, "Unable to complete create cluster workflow");
    }
    publish_cluster_complete(ctx, &namespace, pgcluster).await;

    backrest::clean_stanza_create_resources(ctx, &namespace, &cluster_name).await?;
    backrest::stanza_create(ctx, &namespace, &cluster_name).await?;

    add_pgbouncer_if_enabled(ctx, pgcluster).await;
    Ok(())
}

#[instrument(skip(ctx, pgcluster), fields(cluster = %pgcluster.name_any()))]
async fn handle_standby_init(ctx: &GroupContext, pgcluster: &Pgcluster) -> Result<()> {
    let namespace = pgcluster.namespace().unwrap_or_default();
    let cluster_name = pgcluster.name_any();

    if let Err(e) = workflow::complete_create_cluster_workflow(ctx, &namespace, &cluster_name).await {
        warn!(error = %e, "Unable to complete create cluster workflow");
    }
    publish_cluster_complete(ctx, &namespace, pgcluster).await;

    cluster::scale_cluster_deployments(ctx, pgcluster, 1, ScaleTargets::REPLICAS).await?;

    if pgcluster.backrest_s3_only() {
        cluster::set_initialized(ctx, &namespace, &cluster_name).await?;
    } else {
        backrest::clean_stanza_create_resources(ctx, &namespace, &cluster_name).await?;
        backrest::stanza_create(ctx, &namespace, &cluster_name).await?;
    }

    cluster::initialize_replica_creation(ctx, &namespace, &cluster_name).await?;
    add_pgbouncer_if_enabled(ctx, pgcluster).await;
    Ok(())
}

#[instrument(skip(ctx, pod, pgcluster), fields(cluster = %pgcluster.name_any()))]
async fn handle_postgres_pod_promotion(ctx: &GroupContext, pod: &Pod, pgcluster: &Pgcluster) -> Result<()> {
    let namespace = pod.namespace().unwrap_or_default();
    let cluster_name = pgcluster.name_any();

    if pgcluster.lifecycle() == ClusterLifecycle::Shutdown {
        cluster::set_initialized(ctx, &namespace, &cluster_name).await?;
        cluster::scale_cluster_deployments(ctx, pgcluster, 1, ScaleTargets::REPLICAS).await?;
        info!("Cluster started up");
    }

    // no failover backup while the cluster is still taking its initial one
    if !pgcluster.spec.standby && pgcluster.lifecycle() == ClusterLifecycle::Initialized {
        clean_and_create_post_failover_backup(ctx, &namespace, &cluster_name).await?;
    }
    Ok(())
}

#[instrument(skip(ctx, pod, pgcluster), fields(cluster = %pgcluster.name_any()))]
async fn handle_standby_promotion(ctx: &GroupContext, pod: &Pod, pgcluster: &Pgcluster) -> Result<()> {
    let namespace = pod.namespace().unwrap_or_default();
    let cluster_name = pgcluster.name_any();

    wait_for_standby_promotion(ctx, pod, pgcluster).await?;

    if pgcluster.pgbouncer_enabled() {
        cluster::rotate_pgbouncer_password(ctx, pgcluster).await?;
    }

    clean_and_create_post_failover_backup(ctx, &namespace, &cluster_name).await
}

async fn wait_for_standby_promotion(ctx: &GroupContext, pod: &Pod, pgcluster: &Pgcluster) -> Result<()> {
    let namespace = pod.namespace().unwrap_or_default();
    let pod_name = pod.name_any();
    let leader_container = pod
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
        .unwrap_or_else(|| labels::CONTAINER_DATABASE.to_string());

    let in_recovery = vec![
        "psql".to_string(),
        "-t".to_string(),
        "-c".to_string(),
        "SELECT pg_is_in_recovery();".to_string(),
        "-p".to_string(),
        pgcluster.port().to_string(),
    ];
    let leader_status = vec![
        "curl".to_string(),
        format!("localhost:{}/master", labels::PATRONI_PORT),
    ];

    let what = format!(
        "timed out waiting for cluster {} to accept writes after disabling standby mode",
        pgcluster.name_any()
    );
    STANDBY_PROMOTION_POLL
        .until(&ctx.cancel, &what, || {
            let in_recovery = in_recovery.clone();
            let leader_status = leader_status.clone();
            let (namespace, pod_name, leader_container) = (&namespace, &pod_name, &leader_container);
            async move {
                // exec failures are expected while Patroni restarts PostgreSQL
                let recovery = kubeapi::exec(ctx.client(), namespace, pod_name, labels::CONTAINER_DATABASE, in_recovery)
                    .await
                    .map(|out| recovery_disabled(&out.stdout))
                    .unwrap_or(false);
                if !recovery {
                    return Ok(false);
                }
                Ok(kubeapi::exec(ctx.client(), namespace, pod_name, leader_container, leader_status)
                    .await
                    .map(|out| leader_accepting_writes(&out.stdout))
                    .unwrap_or(false))
            }
        })
        .await
}

/// Replace any backup of the cluster with a fresh one taken after failover
async fn clean_and_create_post_failover_backup(ctx: &GroupContext, namespace: &str, cluster_name: &str) -> Result<()> {
    let repo_pods = ctx
        .select_names::<Pod>(
            &ctx.index.pods,
            namespace,
            &[
                (labels::LABEL_PG_CLUSTER, cluster_name),
                (labels::LABEL_PGO_BACKREST_REPO, labels::LABEL_TRUE),
            ],
        )
        .await?;
    let [repo_pod] = repo_pods.as_slice() else {
        return Err(Error::validation(format!(
            "expected one pgBackRest repository pod for cluster {cluster_name}, found {}",
            repo_pods.len()
        )));
    };

    backrest::clean_backup_resources(ctx, namespace, cluster_name).await?;
    backrest::create_post_failover_backup(ctx, namespace, cluster_name, repo_pod).await?;
    Ok(())
}

/// Point a new instance pod and its deployment at the primary or replica service
#[instrument(skip(ctx, pod), fields(pod = %pod.name_any()))]
async fn label_postgres_pod_and_deployment(ctx: &GroupContext, pod: &Pod) -> Result<()> {
    let namespace = pod.namespace().unwrap_or_default();
    let Some(deployment_name) = pod.labels().get(labels::LABEL_DEPLOYMENT_NAME).cloned() else {
        debug!("Pod has no deployment label");
        return Ok(());
    };
    let cluster_name = pod
        .labels()
        .get(labels::LABEL_PG_CLUSTER)
        .cloned()
        .unwrap_or_default();

    let replicas: Api<Pgreplica> = ctx.api(&namespace);
    let replica = kubeapi::exists(&replicas, &deployment_name).await?;

    let deployments: Api<Deployment> = ctx.api(&namespace);
    let deployment = deployments.get(&deployment_name).await?;
    let service = service_name_for(
        &cluster_name,
        deployment.labels().get(labels::LABEL_SERVICE_NAME).map(String::as_str),
        replica,
    );

    let mut patch = Merge7386::new();
    patch.add(&["metadata", "labels", labels::LABEL_SERVICE_NAME], service.as_str());
    let patch = patch.to_value();

    let pods: Api<Pod> = ctx.api(&namespace);
    kubeapi::merge_patch(&pods, &pod.name_any(), &patch).await?;
    kubeapi::merge_patch(&deployments, &deployment_name, &patch).await?;
    debug!(service = %service, replica, "Labelled pod and deployment");
    Ok(())
}
