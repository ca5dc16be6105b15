//! pgBackRest workflows: stanza creation, backups and in-place restores

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::config::labels;
use crate::controllers::GroupContext;
use crate::crd::{
    ClusterLifecycle, Pgcluster, Pgreplica, Pgtask, PgtaskSpec, TASK_TYPE_BACKREST,
};
use crate::error::{Error, Result};
use crate::kubeapi::{self, Merge7386, Poll};
use crate::operator::{cluster, manifests};

const BACKUP_CLEANUP_POLL: Poll = Poll::new(Duration::from_secs(1), Duration::from_secs(30)).delayed();
const RESTORE_PVC_POLL: Poll = Poll::new(Duration::from_millis(500), Duration::from_secs(180)).delayed();

fn pgtask(name: &str, cluster: &str, parameters: BTreeMap<String, String>) -> Pgtask {
    let mut task = Pgtask::new(
        name,
        PgtaskSpec {
            name: name.to_string(),
            task_type: TASK_TYPE_BACKREST.to_string(),
            parameters,
            status: String::new(),
        },
    );
    task.metadata.labels = Some(BTreeMap::from([(
        labels::LABEL_PG_CLUSTER.to_string(),
        cluster.to_string(),
    )]));
    task
}

/// Parameters of the backup task for a cluster
pub fn backup_parameters(
    cluster: &str,
    pod_name: &str,
    extra: BTreeMap<String, String>,
    backup_opts: &str,
) -> BTreeMap<String, String> {
    let mut params = BTreeMap::from([
        (labels::LABEL_JOB_NAME.to_string(), labels::backrest_backup_name(cluster)),
        (labels::LABEL_PG_CLUSTER.to_string(), cluster.to_string()),
        (labels::LABEL_POD_NAME.to_string(), pod_name.to_string()),
        (labels::LABEL_CONTAINER_NAME.to_string(), labels::CONTAINER_DATABASE.to_string()),
        (labels::LABEL_BACKREST_COMMAND.to_string(), labels::BACKREST_COMMAND_BACKUP.to_string()),
        (labels::LABEL_BACKREST_OPTS.to_string(), backup_opts.to_string()),
    ]);
    params.extend(extra);
    params
}

/// Request a backup by creating its Pgtask
#[instrument(skip(ctx, extra))]
pub async fn create_backup(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &str,
    pod_name: &str,
    extra: BTreeMap<String, String>,
    backup_opts: &str,
) -> Result<Pgtask> {
    let api: Api<Pgtask> = ctx.api(namespace);
    let name = labels::backrest_backup_name(cluster);
    let task = pgtask(&name, cluster, backup_parameters(cluster, pod_name, extra, backup_opts));
    let created = api.create(&PostParams::default(), &task).await?;
    info!(cluster = %cluster, task = %name, "Created backup task");
    Ok(created)
}

/// Full backup taken once a new cluster has its stanza
pub async fn create_initial_backup(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &str,
    pod_name: &str,
) -> Result<Pgtask> {
    let extra = BTreeMap::from([(
        labels::LABEL_PGHA_BACKUP_TYPE.to_string(),
        labels::BACKUP_TYPE_BOOTSTRAP.to_string(),
    )]);
    create_backup(ctx, namespace, cluster, pod_name, extra, "--type=full").await
}

/// Backup taken after a failover
pub async fn create_post_failover_backup(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &str,
    pod_name: &str,
) -> Result<Pgtask> {
    let extra = BTreeMap::from([(
        labels::LABEL_PGHA_BACKUP_TYPE.to_string(),
        labels::BACKUP_TYPE_FAILOVER.to_string(),
    )]);
    create_backup(ctx, namespace, cluster, pod_name, extra, "").await
}

/// Remove the backup Pgtask and Jobs of a cluster and wait for the Jobs to go away
#[instrument(skip(ctx))]
pub async fn clean_backup_resources(ctx: &GroupContext, namespace: &str, cluster: &str) -> Result<()> {
    let tasks: Api<Pgtask> = ctx.api(namespace);
    kubeapi::delete_if_present(&tasks, &labels::backrest_backup_name(cluster), &DeleteParams::default())
        .await?;

    let jobs: Api<Job> = ctx.api(namespace);
    let selector = labels::selector(&[
        (labels::LABEL_BACKREST_COMMAND, labels::BACKREST_COMMAND_BACKUP),
        (labels::LABEL_PG_CLUSTER, cluster),
        (labels::LABEL_BACKREST, labels::LABEL_TRUE),
    ]);
    if let Err(e) = kubeapi::delete_matching(&jobs, &selector, &DeleteParams::foreground()).await {
        warn!(cluster = %cluster, error = %e, "Error deleting backup jobs");
    }

    let what = format!("Timed out waiting for deletion of pgBackRest backup job for cluster {cluster}");
    BACKUP_CLEANUP_POLL
        .until(&ctx.cancel, &what, || async {
            Ok(jobs.list(&kubeapi::selector(&selector)).await?.items.is_empty())
        })
        .await
}

/// Parameters of the stanza-create task for a cluster
pub fn stanza_parameters(cluster: &Pgcluster, repo_pod: &str) -> BTreeMap<String, String> {
    let name = cluster.name_any();
    let storage_type = cluster.backrest_storage_type();
    let (storage_type, opts) = if cluster.spec.standby {
        let local = if storage_type.contains("local") { "local" } else { "" };
        (local, "--no-online")
    } else {
        (storage_type, "")
    };

    let mut params = BTreeMap::from([
        (labels::LABEL_JOB_NAME.to_string(), labels::stanza_create_name(&name)),
        (labels::LABEL_PG_CLUSTER.to_string(), name),
        (labels::LABEL_POD_NAME.to_string(), repo_pod.to_string()),
        (labels::LABEL_CONTAINER_NAME.to_string(), labels::CONTAINER_BACKREST_REPO.to_string()),
        (
            labels::LABEL_BACKREST_COMMAND.to_string(),
            labels::BACKREST_COMMAND_STANZA_CREATE.to_string(),
        ),
        (labels::LABEL_BACKREST_OPTS.to_string(), opts.to_string()),
    ]);
    if !storage_type.is_empty() {
        params.insert(labels::LABEL_BACKREST_STORAGE_TYPE.to_string(), storage_type.to_string());
    }
    params
}

/// Create the stanza-create Pgtask for a cluster
///
/// The repository pod must be unique.
#[instrument(skip(ctx))]
pub async fn stanza_create(ctx: &GroupContext, namespace: &str, cluster_name: &str) -> Result<()> {
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

    let clusters: Api<Pgcluster> = ctx.api(namespace);
    let cluster = clusters.get(cluster_name).await?;

    let name = labels::stanza_create_name(cluster_name);
    let task = pgtask(&name, cluster_name, stanza_parameters(&cluster, repo_pod));
    let tasks: Api<Pgtask> = ctx.api(namespace);
    tasks.create(&PostParams::default(), &task).await?;
    info!(cluster = %cluster_name, pod = %repo_pod, "Created stanza-create task");
    Ok(())
}

/// Remove the stanza-create Pgtask and Job of a cluster
pub async fn clean_stanza_create_resources(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &str,
) -> Result<()> {
    let name = labels::stanza_create_name(cluster);
    let tasks: Api<Pgtask> = ctx.api(namespace);
    kubeapi::delete_if_present(&tasks, &name, &DeleteParams::default()).await?;
    let jobs: Api<Job> = ctx.api(namespace);
    kubeapi::delete_if_present(&jobs, &name, &DeleteParams::background()).await?;
    Ok(())
}

fn has_option(opts: &str, names: &[&str]) -> bool {
    opts.split_whitespace()
        .any(|opt| names.iter().any(|name| opt.starts_with(name)))
}

/// Options pointing a backrest job at the running primary
///
/// `--db-host` and `--db-path` are only added when the task options do not already name
/// the host or data path.
pub fn command_opts_from_pod(task_opts: &str, primary: &Pod) -> Result<String> {
    let mut opts = Vec::new();

    if !has_option(task_opts, &["--db-host", "--pg1-host"]) {
        let ip = primary
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .unwrap_or_default();
        opts.push(format!("--db-host={ip}"));
    }

    if !has_option(task_opts, &["--db-path", "--pg1-path"]) {
        let db_path = primary
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|e| e.name == "PGBACKREST_DB_PATH"))
            .and_then(|e| e.value.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Error::not_found(format!(
                    "PGBACKREST_DB_PATH on primary pod {}",
                    primary.name_any()
                ))
            })?;
        opts.push(format!("--db-path={db_path}"));
    }

    Ok(opts.join(" "))
}

/// Create the Job for a `backrest` task
#[instrument(skip(ctx, task), fields(task = %task.name_any()))]
pub async fn run_backrest_task(ctx: &GroupContext, namespace: &str, task: &Pgtask) -> Result<()> {
    let cluster_name = task.parameter(labels::LABEL_PG_CLUSTER).unwrap_or_default();
    let clusters: Api<Pgcluster> = ctx.api(namespace);
    let cluster = clusters.get(cluster_name).await?;

    let pods: Api<Pod> = ctx.api(namespace);
    let params = ListParams::default()
        .labels(&format!(
            "{}={},{} in ({},{})",
            labels::LABEL_PG_CLUSTER,
            cluster_name,
            labels::LABEL_PGHA_ROLE,
            labels::LABEL_PGHA_ROLE_PROMOTED,
            labels::LABEL_PGHA_ROLE_PRIMARY
        ))
        .fields("status.phase=Running");
    let primaries = pods.list(&params).await?.items;
    let job_name = task.parameter(labels::LABEL_JOB_NAME).unwrap_or_default();
    let primary = match primaries.as_slice() {
        [one] => one,
        [] => {
            return Err(Error::not_found(format!(
                "primary when creating backrest job {job_name}"
            )))
        }
        _ => {
            return Err(Error::validation(format!(
                "more than one primary found when creating backrest job {job_name}"
            )))
        }
    };

    let task_opts = task.parameter(labels::LABEL_BACKREST_OPTS).unwrap_or_default();
    let pod_opts = command_opts_from_pod(task_opts, primary)?;
    let command_opts = format!("{task_opts} {pod_opts}").trim().to_string();

    let job = manifests::backrest_job(ctx.config(), &cluster, task, namespace, &command_opts);
    let jobs: Api<Job> = ctx.api(namespace);
    jobs.create(&PostParams::default(), &job).await?;
    info!(cluster = %cluster_name, job = %job.name_any(), "Created backrest job");
    Ok(())
}

/// Restore options for a restore task, adding the PITR target and repository type
pub fn restore_opts(task: &Pgtask) -> String {
    let mut opts = task
        .parameter(labels::LABEL_BACKREST_RESTORE_OPTS)
        .unwrap_or_default()
        .to_string();

    if let Some(target) = task.parameter(labels::LABEL_BACKREST_PITR_TARGET).filter(|t| !t.is_empty()) {
        if !has_option(&opts, &["--target"]) {
            opts = format!("{opts} --target={target:?}");
        }
    }
    if let Some(storage) = task.parameter(labels::LABEL_BACKREST_STORAGE_TYPE).filter(|t| !t.is_empty()) {
        if !opts.contains("--repo-type") {
            opts = format!("{opts} --repo-type={storage}");
        }
    }
    opts.trim().to_string()
}

/// Tear down a cluster's instances so a bootstrap Job can restore it in place
///
/// Returns the cluster as patched for the restore.
#[instrument(skip(ctx, task), fields(cluster = %cluster_name))]
pub async fn prepare_cluster_for_restore(
    ctx: &GroupContext,
    namespace: &str,
    cluster_name: &str,
    task: &Pgtask,
) -> Result<Pgcluster> {
    let clusters: Api<Pgcluster> = ctx.api(namespace);
    let mut patch = Merge7386::new();
    patch
        .add(&["metadata", "annotations", labels::ANNOTATION_BACKREST_RESTORE], "")
        .add(&["metadata", "annotations", labels::ANNOTATION_CURRENT_PRIMARY], cluster_name)
        .add(&["metadata", "labels", labels::LABEL_DEPLOYMENT_NAME], cluster_name)
        .add(&["spec", "pgDataSource", "restoreFrom"], cluster_name)
        .add(&["spec", "pgDataSource", "restoreOpts"], restore_opts(task));
    kubeapi::merge_patch(&clusters, cluster_name, &patch.to_value()).await?;

    crate::lifecycle::set_cluster_state(
        ctx.client(),
        namespace,
        cluster_name,
        ClusterLifecycle::Restore,
        "Cluster is being restored",
    )
    .await?;
    debug!(cluster = %cluster_name, "Patched cluster for restore");

    let replicas: Api<Pgreplica> = ctx.api(namespace);
    let mut replica_patch = Merge7386::new();
    replica_patch.remove(&["metadata", "annotations", labels::ANNOTATION_PGHA_BOOTSTRAP_REPLICA]);
    let replica_patch = replica_patch.to_value();
    let by_cluster = labels::selector(&[(labels::LABEL_PG_CLUSTER, cluster_name)]);
    for replica in replicas.list(&kubeapi::selector(&by_cluster)).await? {
        kubeapi::merge_patch(&replicas, &replica.name_any(), &replica_patch).await?;
    }

    let deployments: Api<Deployment> = ctx.api(namespace);
    let instances = format!("{},{}", by_cluster, labels::LABEL_PG_DATABASE);
    let removed = kubeapi::delete_matching(&deployments, &instances, &DeleteParams::default()).await?;
    debug!(cluster = %cluster_name, deployments = ?removed, "Deleted instance deployments");

    let jobs: Api<Job> = ctx.api(namespace);
    kubeapi::delete_matching(&jobs, &by_cluster, &DeleteParams::background()).await?;

    let pvcs: Api<PersistentVolumeClaim> = ctx.api(namespace);
    for name in &removed {
        kubeapi::delete_if_present(&pvcs, name, &DeleteParams::default()).await?;
    }
    RESTORE_PVC_POLL
        .until(
            &ctx.cancel,
            &format!("deletion of PVCs for cluster {cluster_name}"),
            || async {
                for name in &removed {
                    if kubeapi::exists(&pvcs, name).await? {
                        return Ok(false);
                    }
                }
                Ok(true)
            },
        )
        .await?;

    let config_maps: Api<ConfigMap> = ctx.api(namespace);
    for name in [labels::dcs_configmap_name(cluster_name), format!("{cluster_name}-leader")] {
        kubeapi::delete_if_present(&config_maps, &name, &DeleteParams::default()).await?;
    }
    cluster::update_pgha_init_flag(ctx, namespace, cluster_name, true).await?;

    info!(cluster = %cluster_name, "Prepared cluster for restore");
    clusters.get(cluster_name).await.map_err(Error::from)
}

/// Run an in-place restore requested by a `restore` task
pub async fn restore(ctx: &GroupContext, namespace: &str, task: &Pgtask) -> Result<()> {
    let cluster_name = task
        .parameter(labels::LABEL_BACKREST_RESTORE_FROM_CLUSTER)
        .or_else(|| task.parameter(labels::LABEL_PG_CLUSTER))
        .unwrap_or_default()
        .to_string();
    if cluster_name.is_empty() {
        return Err(Error::validation(format!(
            "restore task {} does not name a cluster",
            task.name_any()
        )));
    }

    let cluster = prepare_cluster_for_restore(ctx, namespace, &cluster_name, task).await?;
    cluster::add_cluster_bootstrap(ctx, &cluster).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_option_matches_prefix() {
        assert!(has_option("--type=full --db-host=10.0.0.1", &["--db-host"]));
        assert!(!has_option("--type=full", &["--db-host", "--pg1-host"]));
    }

    #[test]
    fn test_backup_parameters_merge_extra() {
        let extra = BTreeMap::from([(
            labels::LABEL_PGHA_BACKUP_TYPE.to_string(),
            labels::BACKUP_TYPE_BOOTSTRAP.to_string(),
        )]);
        let params = backup_parameters("hippo", "hippo-abc", extra, "--type=full");
        assert_eq!(params[labels::LABEL_JOB_NAME], "backrest-backup-hippo");
        assert_eq!(params[labels::LABEL_BACKREST_OPTS], "--type=full");
        assert_eq!(params[labels::LABEL_PGHA_BACKUP_TYPE], "bootstrap");
    }
}
