//! Job event handlers
//!
//! Jobs launched by the operator report back through their status. Each handler reacts
//! only to a terminal condition (success, or an exhausted backoff limit for bootstrap
//! jobs) and re-reads the objects it acts on, so a redelivered update is harmless.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::api::DeleteParams;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::informer::EventHandler;
use super::{observe, GroupContext};
use crate::config::labels;
use crate::crd::{ClusterLifecycle, Pgcluster, Pgtask, PgtaskState, WORKFLOW_RESTORE_PRIMARY_CREATED};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::kubeapi::{self, Poll};
use crate::lifecycle;
use crate::metrics;
use crate::operator::{backrest, cluster, workflow};

/// Deleting a finished rmdata job is confirmed for up to 10 × 5s
const RMDATA_JOB_DELETE_POLL: Poll = Poll::tries(Duration::from_secs(5), 10);

const JOB_COMPLETED_MESSAGE: &str = "job completed";

/// What a Job was launched for, read from its labels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    RmData,
    Backup,
    StanzaCreate,
    /// Any other pgBackRest command
    Backrest,
    PgDump,
    PgRestore,
    Bootstrap,
}

impl JobKind {
    pub fn of(job: &Job) -> Option<Self> {
        let labels = job.labels();
        let is_true = |key: &str| labels.get(key).map(String::as_str) == Some(labels::LABEL_TRUE);

        if is_true(labels::LABEL_RMDATA) {
            return Some(JobKind::RmData);
        }
        if is_true(labels::LABEL_BACKREST) {
            return Some(
                match labels.get(labels::LABEL_BACKREST_COMMAND).map(String::as_str) {
                    Some(labels::BACKREST_COMMAND_BACKUP) => JobKind::Backup,
                    Some(labels::BACKREST_COMMAND_STANZA_CREATE) => JobKind::StanzaCreate,
                    _ => JobKind::Backrest,
                },
            );
        }
        if is_true(labels::LABEL_PGDUMP_COMMAND) {
            return Some(JobKind::PgDump);
        }
        if is_true(labels::LABEL_PGRESTORE_COMMAND) {
            return Some(JobKind::PgRestore);
        }
        if labels.contains_key(labels::LABEL_PGHA_BOOTSTRAP) {
            return Some(JobKind::Bootstrap);
        }
        None
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::RmData => "rmdata",
            JobKind::Backup => "backup",
            JobKind::StanzaCreate => "stanza-create",
            JobKind::Backrest => "backrest",
            JobKind::PgDump => "pgdump",
            JobKind::PgRestore => "pgrestore",
            JobKind::Bootstrap => "bootstrap",
        }
    }
}

/// At least one pod of the job succeeded
pub fn is_job_successful(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.succeeded)
        .is_some_and(|n| n >= 1)
}

/// The job is being removed with foreground propagation
pub fn is_job_in_foreground_deletion(job: &Job) -> bool {
    job.metadata.deletion_timestamp.is_some()
        && job
            .finalizers()
            .iter()
            .any(|f| f == labels::FOREGROUND_DELETION_FINALIZER)
}

/// The job failed as many times as its backoff limit allows
pub fn is_backoff_limit_exceeded(job: &Job) -> bool {
    let limit = job.spec.as_ref().and_then(|s| s.backoff_limit).unwrap_or(6);
    job.status
        .as_ref()
        .and_then(|s| s.failed)
        .is_some_and(|failed| failed >= limit)
}

/// Value of an environment variable set on any container of the job's pod template
pub fn job_env(job: &Job, name: &str) -> Option<String> {
    job.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .into_iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.env.iter().flatten())
        .find(|e| e.name == name)
        .and_then(|e| e.value.clone())
}

fn cluster_label(job: &Job) -> Result<String> {
    job.labels()
        .get(labels::LABEL_PG_CLUSTER)
        .cloned()
        .ok_or_else(|| Error::validation(format!("job {} has no {} label", job.name_any(), labels::LABEL_PG_CLUSTER)))
}

/// Handles Job updates for one namespace
pub struct JobHandler {
    ctx: Arc<GroupContext>,
}

impl JobHandler {
    pub fn new(ctx: Arc<GroupContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler<Job> for JobHandler {
    async fn on_update(&self, _old: Arc<Job>, new: Arc<Job>) {
        let Some(kind) = JobKind::of(&new) else {
            return;
        };
        let ctx = self.ctx.as_ref();
        match kind {
            JobKind::Bootstrap => observe("job", handle_bootstrap(ctx, &new)).await,
            _ => {
                if !is_job_successful(&new) {
                    debug!(job = %new.name_any(), "Job not successful yet, ignoring");
                    return;
                }
                if is_job_in_foreground_deletion(&new) {
                    debug!(job = %new.name_any(), "Job is being deleted, ignoring");
                    return;
                }
                let body = async {
                    match kind {
                        JobKind::Backup => handle_backup(ctx, &new).await,
                        JobKind::StanzaCreate => handle_stanza_create(ctx, &new).await,
                        JobKind::RmData => handle_rmdata(ctx, &new).await,
                        JobKind::Backrest | JobKind::PgDump | JobKind::PgRestore => {
                            complete_job_task(ctx, &new).await
                        }
                        JobKind::Bootstrap => Ok(()),
                    }
                };
                observe("job", body).await
            }
        }
    }
}

/// Mark the Pgtask that launched a job as completed
async fn complete_task(ctx: &GroupContext, namespace: &str, task: &str) -> Result<()> {
    let api: Api<Pgtask> = ctx.api(namespace);
    let patch = json!({
        "status": { "state": PgtaskState::Completed, "message": JOB_COMPLETED_MESSAGE }
    });
    match kubeapi::merge_patch_status(&api, task, &patch).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(task = %task, "No task to complete");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn complete_job_task(ctx: &GroupContext, job: &Job) -> Result<()> {
    let namespace = job.namespace().unwrap_or_default();
    let task = job
        .labels()
        .get(labels::LABEL_PGTASK)
        .cloned()
        .unwrap_or_else(|| job.name_any());
    complete_task(ctx, &namespace, &task).await?;
    info!(job = %job.name_any(), task = %task, "Job completed");
    Ok(())
}

#[instrument(skip(ctx, job), fields(job = %job.name_any()))]
async fn handle_backup(ctx: &GroupContext, job: &Job) -> Result<()> {
    let _timer = metrics::HANDLER_DURATION
        .with_label_values(&["job_backup"])
        .start_timer();

    let namespace = job.namespace().unwrap_or_default();
    let cluster_name = cluster_label(job)?;
    let backup_type = job
        .labels()
        .get(labels::LABEL_PGHA_BACKUP_TYPE)
        .cloned()
        .unwrap_or_default();

    if let Err(e) = complete_task(ctx, &namespace, &job.name_any()).await {
        error!(task = %job.name_any(), error = %e, "Error patching backup task");
    }

    ctx.events()
        .publish(
            &namespace,
            EventKind::CreateBackupCompleted {
                cluster: cluster_name.clone(),
                backup_type: "pgbackrest".to_string(),
                path: String::new(),
            },
        )
        .await;
    metrics::BACKUPS_COMPLETED
        .with_label_values(&[if backup_type.is_empty() { "manual" } else { backup_type.as_str() }])
        .inc();
    info!(cluster = %cluster_name, backup_type = %backup_type, "Backup completed");

    let clusters: Api<Pgcluster> = ctx.api(&namespace);
    let pgcluster = clusters.get(&cluster_name).await?;
    if pgcluster.reconcile_paused() {
        info!(cluster = %cluster_name, state = %pgcluster.lifecycle(), "Cluster is paused, not advancing it");
        return Ok(());
    }

    match backup_type.as_str() {
        labels::BACKUP_TYPE_BOOTSTRAP => {
            cluster::set_initialized(ctx, &namespace, &cluster_name).await?;
            cluster::initialize_replica_creation(ctx, &namespace, &cluster_name).await?;
        }
        labels::BACKUP_TYPE_FAILOVER => {
            cluster::remove_primary_on_role_change_tag(ctx, &namespace, &cluster_name).await?;
        }
        _ => {}
    }
    Ok(())
}

#[instrument(skip(ctx, job), fields(job = %job.name_any()))]
async fn handle_stanza_create(ctx: &GroupContext, job: &Job) -> Result<()> {
    let namespace = job.namespace().unwrap_or_default();
    let cluster_name = cluster_label(job)?;
    info!(cluster = %cluster_name, "pgBackRest stanza created");

    let repo_pod = job_env(job, labels::ENV_PODNAME).unwrap_or_default();
    debug!(cluster = %cluster_name, pod = %repo_pod, "Repository pod for the initial backup");

    let clusters: Api<Pgcluster> = ctx.api(&namespace);
    let pgcluster = clusters.get(&cluster_name).await?;
    if pgcluster.reconcile_paused() {
        info!(cluster = %cluster_name, state = %pgcluster.lifecycle(), "Cluster is paused, not advancing it");
        return Ok(());
    }

    if pgcluster.spec.standby {
        info!(cluster = %cluster_name, "Standby cluster, skipping the initial backup");
        cluster::set_initialized(ctx, &namespace, &cluster_name).await?;
        cluster::initialize_replica_creation(ctx, &namespace, &cluster_name).await?;
    } else {
        backrest::clean_backup_resources(ctx, &namespace, &cluster_name).await?;
        backrest::create_initial_backup(ctx, &namespace, &cluster_name, &repo_pod).await?;
    }

    backrest::clean_stanza_create_resources(ctx, &namespace, &cluster_name).await
}

#[instrument(skip(ctx, job), fields(job = %job.name_any()))]
async fn handle_bootstrap(ctx: &GroupContext, job: &Job) -> Result<()> {
    if is_job_in_foreground_deletion(job) {
        debug!("Bootstrap job is being deleted, ignoring");
        return Ok(());
    }

    let namespace = job.namespace().unwrap_or_default();
    let cluster_name = cluster_label(job)?;
    let clusters: Api<Pgcluster> = ctx.api(&namespace);
    let pgcluster = clusters.get(&cluster_name).await?;
    let restore = pgcluster.restore_requested();

    if is_backoff_limit_exceeded(job) {
        warn!(cluster = %cluster_name, "Bootstrap job exceeded its backoff limit, cleaning up");
        cleanup_bootstrap_resources(ctx, job, &pgcluster, restore).await?;
        cluster::publish_create_failure(ctx, &pgcluster, "bootstrap job exceeded its backoff limit")
            .await;
        return Ok(());
    }

    if !is_job_successful(job) {
        return Ok(());
    }
    if pgcluster.reconcile_paused() {
        info!(cluster = %cluster_name, state = %pgcluster.lifecycle(), "Cluster is paused, not advancing it");
        return Ok(());
    }

    match cluster::toggle_autofailover(ctx, &namespace, &pgcluster.pgha_scope(), true).await {
        Ok(_) => {}
        Err(e) => warn!(
            cluster = %cluster_name,
            error = %e,
            "Unable to enable autofailover during bootstrap, cluster could initialize paused"
        ),
    }

    if pgcluster.lifecycle() == ClusterLifecycle::Bootstrapping {
        cleanup_bootstrap_resources(ctx, job, &pgcluster, restore).await?;
        lifecycle::set_cluster_state(
            ctx.client(),
            &namespace,
            &cluster_name,
            ClusterLifecycle::Bootstrapped,
            "Pgcluster successfully bootstrapped from an existing data source",
        )
        .await?;

        let jobs: Api<Job> = ctx.api(&namespace);
        kubeapi::delete_if_present(&jobs, &job.name_any(), &DeleteParams::background()).await?;
        return Ok(());
    }

    if restore {
        let workflow_id = job
            .labels()
            .get(labels::LABEL_WORKFLOW_ID)
            .cloned()
            .unwrap_or_default();
        if let Err(e) =
            workflow::update_workflow(ctx, &namespace, &workflow_id, WORKFLOW_RESTORE_PRIMARY_CREATED).await
        {
            warn!(workflow = %workflow_id, error = %e, "Unable to update restore workflow");
        }
        ctx.events()
            .publish(
                &namespace,
                EventKind::RestoreClusterCompleted {
                    cluster: cluster_name.clone(),
                },
            )
            .await;
        info!(cluster = %cluster_name, "Restore completed");
    }
    Ok(())
}

/// Remove the repository and secret a bootstrap job used
///
/// The source repository is only removed when it was started for the bootstrap.
async fn cleanup_bootstrap_resources(
    ctx: &GroupContext,
    job: &Job,
    pgcluster: &Pgcluster,
    restore: bool,
) -> Result<()> {
    let repo_namespace = pgcluster.bootstrap_namespace();

    let (source_cluster, clean_repo) = if restore {
        (cluster_label(job)?, true)
    } else {
        let source = pgcluster.spec.pg_data_source.restore_from.clone();
        let deployments: Api<Deployment> = ctx.api(&repo_namespace);
        let repo = deployments.get(&labels::backrest_repo_name(&source)).await?;
        let bootstrap_repo = repo.labels().contains_key(labels::LABEL_PGHA_BOOTSTRAP);
        (source, bootstrap_repo)
    };

    if clean_repo {
        let repo_name = labels::backrest_repo_name(&source_cluster);
        let services: Api<Service> = ctx.api(&repo_namespace);
        kubeapi::delete_if_present(&services, &repo_name, &DeleteParams::default()).await?;
        let deployments: Api<Deployment> = ctx.api(&repo_namespace);
        kubeapi::delete_if_present(&deployments, &repo_name, &DeleteParams::default()).await?;
    }

    let secrets: Api<Secret> = ctx.api(&job.namespace().unwrap_or_default());
    kubeapi::delete_if_present(
        &secrets,
        &labels::bootstrap_repo_secret_name(&pgcluster.name_any()),
        &DeleteParams::default(),
    )
    .await?;
    debug!(cluster = %pgcluster.name_any(), "Cleaned up bootstrap resources");
    Ok(())
}

#[instrument(skip(ctx, job), fields(job = %job.name_any()))]
async fn handle_rmdata(ctx: &GroupContext, job: &Job) -> Result<()> {
    let namespace = job.namespace().unwrap_or_default();
    let cluster_name = cluster_label(job)?;
    let job_name = job.name_any();
    let jobs: Api<Job> = ctx.api(&namespace);

    kubeapi::delete_if_present(&jobs, &job_name, &DeleteParams::foreground()).await?;
    let what = format!("Timed out waiting for deletion of rmdata job {job_name}");
    RMDATA_JOB_DELETE_POLL
        .until(&ctx.cancel, &what, || async {
            Ok(jobs.get_opt(&job_name).await?.is_none())
        })
        .await?;

    let pvcs: Api<PersistentVolumeClaim> = ctx.api(&namespace);
    if kubeapi::delete_if_present(&pvcs, &labels::wal_pvc_name(&cluster_name), &DeleteParams::default()).await? {
        info!(cluster = %cluster_name, "Deleted WAL volume claim");
    }

    let selector = labels::selector(&[(labels::LABEL_PG_CLUSTER, &cluster_name)]);
    match jobs.list(&kubeapi::selector(&selector)).await {
        Ok(list) => {
            for finished in list.items.iter().filter(|j| is_job_successful(j)) {
                if let Err(e) =
                    kubeapi::delete_if_present(&jobs, &finished.name_any(), &DeleteParams::foreground()).await
                {
                    error!(job = %finished.name_any(), error = %e, "Error deleting completed job");
                }
            }
        }
        Err(e) => error!(cluster = %cluster_name, error = %e, "Error listing completed jobs"),
    }
    info!(cluster = %cluster_name, "Data removal finished");
    Ok(())
}
