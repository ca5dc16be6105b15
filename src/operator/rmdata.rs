//! Removal of a cluster, a replica, or a cluster's backups
//!
//! Runs inside the `pgo-rmdata` Job launched for a `delete-data` task. Every step is best
//! effort: a failed delete is logged and the remaining steps still run, so a partially
//! removed cluster can be cleaned up by running the Job again.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::DeleteParams;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{labels, parse_bool};
use crate::controllers::GroupContext;
use crate::crd::{Pgcluster, Pgreplica, Pgtask};
use crate::error::{Error, Result};
use crate::kubeapi::{self, Poll};
use crate::operator::cluster;

const DEPLOYMENT_POLL: Poll = Poll::tries(Duration::from_secs(4), 16).delayed();

/// What to remove
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Request {
    pub namespace: String,
    pub cluster: String,
    pub replica_name: String,
    pub pgha_scope: String,
    pub remove_data: bool,
    pub remove_backup: bool,
    pub is_replica: bool,
    pub is_backup: bool,
}

impl Request {
    /// Read a request from `PG_CLUSTER`, `NAMESPACE` and the optional removal flags
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::config(format!("{key} environment variable is required")))
        };
        let flag = |key: &str| -> Result<bool> {
            match lookup(key) {
                None => Ok(false),
                Some(v) if v.is_empty() => Ok(false),
                Some(v) => parse_bool(&v)
                    .ok_or_else(|| Error::config(format!("{key} must be a boolean, got '{v}'"))),
            }
        };

        let cluster = required("PG_CLUSTER")?;
        Ok(Self {
            namespace: required("NAMESPACE")?,
            replica_name: lookup("REPLICA_NAME").unwrap_or_default(),
            pgha_scope: lookup("PGHA_SCOPE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| cluster.clone()),
            cluster,
            remove_data: flag("REMOVE_DATA")?,
            remove_backup: flag("REMOVE_BACKUP")?,
            is_replica: flag("IS_REPLICA")?,
            is_backup: flag("IS_BACKUP")?,
        })
    }
}

/// What happens to the `<cluster>-replica` Service when a replica is removed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaServiceAction {
    /// No replica pods exist, which is unexpected during a scale down
    NoReplicas,
    /// The last replica is going away
    Delete,
    /// Other replicas still use the Service
    Keep,
}

/// Decide the fate of the replica Service from the number of replica pods
pub fn replica_service_action(replica_pods: usize) -> ReplicaServiceAction {
    match replica_pods {
        0 => ReplicaServiceAction::NoReplicas,
        1 => ReplicaServiceAction::Delete,
        _ => ReplicaServiceAction::Keep,
    }
}

/// Instance PVCs of a cluster: everything except logical backups and the repository
pub fn instance_pvcs(cluster: &str, pvcs: &[String]) -> Vec<String> {
    let dump_prefix = labels::pgdump_pvc_prefix(cluster);
    let repo = labels::backrest_repo_pvc_name(cluster);
    pvcs.iter()
        .filter(|name| !name.starts_with(&dump_prefix) && **name != repo)
        .cloned()
        .collect()
}

/// PVCs of one replica: its data volume, its WAL volume and its tablespaces
pub fn replica_pvcs(replica: &str, pvcs: &[String]) -> Vec<String> {
    let tablespace_prefix = format!("{replica}-tablespace-");
    let wal = labels::wal_pvc_name(replica);
    let mut names = vec![replica.to_string()];
    names.extend(
        pvcs.iter()
            .filter(|name| name.starts_with(&tablespace_prefix) || **name == wal)
            .cloned(),
    );
    names
}

/// Logical (pg_dump) backup PVCs of a cluster
pub fn logical_backup_pvcs(cluster: &str, pvcs: &[String]) -> Vec<String> {
    let dump_prefix = labels::pgdump_pvc_prefix(cluster);
    pvcs.iter()
        .filter(|name| name.starts_with(&dump_prefix))
        .cloned()
        .collect()
}

/// ConfigMaps owned by a cluster
pub fn cluster_configmaps(cluster: &str) -> Vec<String> {
    vec![
        labels::pgha_configmap_name(cluster),
        format!("{cluster}-leader"),
        labels::dcs_configmap_name(cluster),
        format!("{cluster}-failover"),
        format!("{cluster}-pgbouncer-cm"),
    ]
}

/// Carry out a removal request
#[instrument(skip(ctx), fields(cluster = %request.cluster, namespace = %request.namespace))]
pub async fn run(ctx: &GroupContext, request: &Request) -> Result<()> {
    info!(?request, "Processing data removal");

    if request.is_replica {
        return remove_replica_instance(ctx, request).await;
    }

    if request.is_backup {
        remove_backup_jobs(ctx, request).await;
        remove_pvcs(ctx, request, logical_backup_pvcs(&request.cluster, &cluster_pvcs(ctx, request).await)).await;
        return Ok(());
    }

    remove_cluster(ctx, request).await;
    Ok(())
}

async fn remove_replica_instance(ctx: &GroupContext, request: &Request) -> Result<()> {
    let ns = &request.namespace;
    remove_replica_services(ctx, request).await;
    let pvcs = replica_pvcs(&request.replica_name, &cluster_pvcs(ctx, request).await);

    let replicas: Api<Pgreplica> = ctx.api(ns);
    match replicas.delete(&request.replica_name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(e) if crate::error::is_kube_not_found(&e) && request.replica_name == request.pgha_scope => {
            debug!("Replica name matches the PGHA scope, assuming the original primary is scaled down");
        }
        Err(e) => return Err(e.into()),
    }

    if let Err(e) = remove_deployment(ctx, ns, &request.replica_name).await {
        error!(replica = %request.replica_name, error = %e, "Error removing replica deployment");
    }

    if request.remove_data {
        remove_pvcs(ctx, request, pvcs).await;
    }
    Ok(())
}

async fn remove_cluster(ctx: &GroupContext, request: &Request) {
    let ns = &request.namespace;
    let name = &request.cluster;

    debug!("Disabling autofailover for cluster removal");
    if let Err(e) = cluster::toggle_autofailover(ctx, ns, &request.pgha_scope, false).await {
        warn!(error = %e, "Unable to disable autofailover");
    }

    if request.remove_data {
        remove_user_secrets(ctx, request).await;
    }

    remove_instance_deployments(ctx, request).await;

    let clusters: Api<Pgcluster> = ctx.api(ns);
    log_err(
        "pgcluster",
        kubeapi::delete_if_present(&clusters, name, &DeleteParams::default()).await,
    );

    let by_cluster = labels::selector(&[(labels::LABEL_PG_CLUSTER, name)]);
    let services: Api<Service> = ctx.api(ns);
    log_err(
        "services",
        kubeapi::delete_matching(&services, &by_cluster, &DeleteParams::default()).await,
    );

    let deployments: Api<Deployment> = ctx.api(ns);
    let pgbouncer = labels::pgbouncer_name(name);
    log_err(
        "pgbouncer deployment",
        kubeapi::delete_if_present(&deployments, &pgbouncer, &DeleteParams::foreground()).await,
    );
    log_err(
        "pgbouncer service",
        kubeapi::delete_if_present(&services, &pgbouncer, &DeleteParams::default()).await,
    );

    let replicas: Api<Pgreplica> = ctx.api(ns);
    log_err(
        "pgreplicas",
        kubeapi::delete_matching(&replicas, &by_cluster, &DeleteParams::default()).await,
    );
    let tasks: Api<Pgtask> = ctx.api(ns);
    log_err(
        "pgtasks",
        kubeapi::delete_matching(&tasks, &by_cluster, &DeleteParams::default()).await,
    );

    let config_maps: Api<ConfigMap> = ctx.api(ns);
    for config_map in cluster_configmaps(name) {
        log_err(
            "configmap",
            kubeapi::delete_if_present(&config_maps, &config_map, &DeleteParams::default()).await,
        );
    }

    let pvcs = cluster_pvcs(ctx, request).await;
    if request.remove_data {
        remove_pvcs(ctx, request, instance_pvcs(name, &pvcs)).await;
    }

    remove_backup_jobs(ctx, request).await;

    let repo = labels::backrest_repo_name(name);
    log_err(
        "backrest repo deployment",
        kubeapi::delete_if_present(&deployments, &repo, &DeleteParams::foreground()).await,
    );
    log_err(
        "backrest repo service",
        kubeapi::delete_if_present(&services, &repo, &DeleteParams::default()).await,
    );

    if request.remove_backup {
        let secrets: Api<Secret> = ctx.api(ns);
        log_err(
            "backrest repo secret",
            kubeapi::delete_if_present(
                &secrets,
                &labels::backrest_repo_secret_name(name),
                &DeleteParams::default(),
            )
            .await,
        );
        let mut backups = logical_backup_pvcs(name, &pvcs);
        backups.push(labels::backrest_repo_pvc_name(name));
        remove_pvcs(ctx, request, backups).await;
    }
    info!("Cluster removed");
}

fn log_err<T>(what: &str, result: Result<T>) {
    if let Err(e) = result {
        error!(resource = %what, error = %e, "Error during data removal");
    }
}

async fn cluster_pvcs(ctx: &GroupContext, request: &Request) -> Vec<String> {
    let pvcs: Api<PersistentVolumeClaim> = ctx.api(&request.namespace);
    let selector = labels::selector(&[(labels::LABEL_PG_CLUSTER, &request.cluster)]);
    match pvcs.list(&kubeapi::selector(&selector)).await {
        Ok(list) => list.items.iter().map(|p| p.name_any()).collect(),
        Err(e) => {
            error!(error = %e, "Unable to list PVCs");
            Vec::new()
        }
    }
}

async fn remove_pvcs(ctx: &GroupContext, request: &Request, names: Vec<String>) {
    let pvcs: Api<PersistentVolumeClaim> = ctx.api(&request.namespace);
    for name in names {
        info!(pvc = %name, "Deleting PVC");
        log_err(
            "pvc",
            kubeapi::delete_if_present(&pvcs, &name, &DeleteParams::foreground()).await,
        );
    }
}

async fn remove_user_secrets(ctx: &GroupContext, request: &Request) {
    let secrets: Api<Secret> = ctx.api(&request.namespace);
    let selector = labels::selector(&[(labels::LABEL_PG_CLUSTER, &request.cluster)]);
    let list = match secrets.list(&kubeapi::selector(&selector)).await {
        Ok(list) => list,
        Err(e) => {
            error!(error = %e, "Unable to list secrets");
            return;
        }
    };
    for secret in list {
        if secret.labels().contains_key(labels::LABEL_PGO_BACKREST_REPO) {
            continue;
        }
        log_err(
            "secret",
            kubeapi::delete_if_present(&secrets, &secret.name_any(), &DeleteParams::default()).await,
        );
    }
}

async fn remove_instance_deployments(ctx: &GroupContext, request: &Request) {
    let deployments: Api<Deployment> = ctx.api(&request.namespace);
    let selector = format!(
        "{}={},{}!=true",
        labels::LABEL_PG_CLUSTER,
        request.cluster,
        labels::LABEL_PGO_BACKREST_REPO
    );
    log_err(
        "deployments",
        kubeapi::delete_matching(&deployments, &selector, &DeleteParams::foreground()).await,
    );

    let waited = DEPLOYMENT_POLL
        .until(&ctx.cancel, "termination of cluster deployments", || async {
            Ok(deployments.list(&kubeapi::selector(&selector)).await?.items.is_empty())
        })
        .await;
    if let Err(e) = waited {
        error!(error = %e, "Could not terminate all cluster deployments");
    }
}

async fn remove_deployment(ctx: &GroupContext, namespace: &str, name: &str) -> Result<()> {
    let deployments: Api<Deployment> = ctx.api(namespace);
    deployments.delete(name, &DeleteParams::foreground()).await?;
    DEPLOYMENT_POLL
        .until(&ctx.cancel, &format!("deletion of deployment {name}"), || async {
            Ok(!kubeapi::exists(&deployments, name).await?)
        })
        .await
}

async fn remove_backup_jobs(ctx: &GroupContext, request: &Request) {
    let jobs: Api<Job> = ctx.api(&request.namespace);
    for marker in [labels::LABEL_BACKREST_JOB, labels::LABEL_PGDUMP_COMMAND] {
        let selector = labels::selector(&[
            (labels::LABEL_PG_CLUSTER, &request.cluster),
            (marker, labels::LABEL_TRUE),
        ]);
        log_err(
            "backup jobs",
            kubeapi::delete_matching(&jobs, &selector, &DeleteParams::foreground()).await,
        );
        let waited = DEPLOYMENT_POLL
            .until(&ctx.cancel, &format!("removal of backup jobs {selector}"), || async {
                Ok(jobs.list(&kubeapi::selector(&selector)).await?.items.is_empty())
            })
            .await;
        if let Err(e) = waited {
            error!(selector = %selector, error = %e, "Could not remove all backup jobs");
        }
    }
}

/// Delete the replica Service when the last replica is being removed
pub async fn remove_replica_services(ctx: &GroupContext, request: &Request) {
    let pods = match ctx
        .select_names::<Pod>(
            &ctx.index.pods,
            &request.namespace,
            &[
                (labels::LABEL_PG_CLUSTER, &request.cluster),
                (labels::LABEL_PGHA_ROLE, labels::LABEL_PGHA_ROLE_REPLICA),
            ],
        )
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            error!(error = %e, "Unable to list replica pods");
            return;
        }
    };

    match replica_service_action(pods.len()) {
        ReplicaServiceAction::NoReplicas => error!("No replicas found for this cluster"),
        ReplicaServiceAction::Delete => {
            debug!("Removing replica service when scaling down to 0 replicas");
            let services: Api<Service> = ctx.api(&request.namespace);
            log_err(
                "replica service",
                kubeapi::delete_if_present(
                    &services,
                    &labels::replica_service_name(&request.cluster),
                    &DeleteParams::default(),
                )
                .await,
            );
        }
        ReplicaServiceAction::Keep => {
            debug!("More than one replica detected, replica service will not be deleted")
        }
    }
}
