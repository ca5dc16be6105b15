//! Execution of Pgtask work orders

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use kube::api::PostParams;
use kube::{Api, ResourceExt};
use rand::Rng;
use tracing::{debug, info, instrument};

use crate::config::{labels, parse_bool};
use crate::controllers::GroupContext;
use crate::crd::{Pgcluster, Pgtask, PgtaskSpec, TaskKind, TASK_TYPE_DELETE_DATA};
use crate::error::{Error, Result};
use crate::kubeapi::{self, Merge7386};
use crate::operator::rmdata::Request;
use crate::operator::{backrest, cluster, manifests, upgrade};

/// Cluster a task is about, from its `pg-cluster` parameter or label
pub fn task_cluster(task: &Pgtask) -> Option<String> {
    task.parameter(labels::LABEL_PG_CLUSTER)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .or_else(|| task.labels().get(labels::LABEL_PG_CLUSTER).cloned())
}

fn required_cluster(task: &Pgtask) -> Result<String> {
    task_cluster(task)
        .ok_or_else(|| Error::validation(format!("task {} does not name a cluster", task.name_any())))
}

async fn get_cluster(ctx: &GroupContext, namespace: &str, task: &Pgtask) -> Result<Pgcluster> {
    let name = required_cluster(task)?;
    let api: Api<Pgcluster> = ctx.api(namespace);
    Ok(api.get(&name).await?)
}

/// Whether a task of this kind changes its cluster, and so waits out a pending upgrade
pub fn requires_upgraded_cluster(kind: &TaskKind) -> bool {
    !matches!(kind, TaskKind::Upgrade | TaskKind::DeleteData | TaskKind::Workflow)
}

/// Carry out a task of the given kind
#[instrument(skip(ctx, task), fields(task = %task.name_any(), kind = %kind))]
pub async fn execute(ctx: &GroupContext, namespace: &str, kind: &TaskKind, task: &Pgtask) -> Result<()> {
    if requires_upgraded_cluster(kind) {
        if let Some(name) = task_cluster(task) {
            let api: Api<Pgcluster> = ctx.api(namespace);
            if api.get_opt(&name).await?.is_some_and(|c| c.awaiting_upgrade()) {
                info!(cluster = %name, "Cluster is awaiting an upgrade, skipping task");
                return Ok(());
            }
        }
    }

    match kind {
        TaskKind::PgAdminAdd => {
            let cluster = get_cluster(ctx, namespace, task).await?;
            cluster::add_pgadmin(ctx, &cluster).await
        }
        TaskKind::PgAdminDelete => {
            cluster::delete_pgadmin(ctx, namespace, &required_cluster(task)?).await
        }
        TaskKind::Upgrade => upgrade::complete_upgrade(ctx, namespace, task).await,
        TaskKind::RollingUpdate => {
            let cluster = get_cluster(ctx, namespace, task).await?;
            cluster::rolling_update(ctx, &cluster).await
        }
        TaskKind::DeleteData => delete_data(ctx, namespace, task).await,
        TaskKind::Backrest(_) => backrest::run_backrest_task(ctx, namespace, task).await,
        TaskKind::BackrestRestore => backrest::restore(ctx, namespace, task).await,
        TaskKind::PgDump => create_pgdump_job(ctx, namespace, task, false).await,
        TaskKind::PgRestore => create_pgdump_job(ctx, namespace, task, true).await,
        TaskKind::Workflow => {
            debug!(
                workflow = task.parameter(labels::LABEL_WORKFLOW_ID).unwrap_or_default(),
                "Workflow task added"
            );
            Ok(())
        }
    }
}

async fn create_pgdump_job(ctx: &GroupContext, namespace: &str, task: &Pgtask, restore: bool) -> Result<()> {
    let cluster = get_cluster(ctx, namespace, task).await?;
    let job = manifests::pgdump_job(ctx.config(), &cluster, task, namespace, restore);
    let jobs: Api<Job> = ctx.api(namespace);
    jobs.create(&PostParams::default(), &job).await?;
    info!(cluster = %cluster.name_any(), job = %job.name_any(), "Created pgdump job");
    Ok(())
}

/// Removal request described by a `delete-data` task
pub fn rmdata_request(namespace: &str, task: &Pgtask) -> Result<Request> {
    let cluster = required_cluster(task)?;
    let flag = |key: &str| task.parameter(key).and_then(parse_bool).unwrap_or(false);
    Ok(Request {
        namespace: namespace.to_string(),
        pgha_scope: task
            .parameter(labels::LABEL_PGHA_SCOPE)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| cluster.clone()),
        cluster,
        replica_name: task.parameter(labels::LABEL_REPLICA_NAME).unwrap_or_default().to_string(),
        remove_data: flag(labels::LABEL_DELETE_DATA),
        remove_backup: flag(labels::LABEL_DELETE_BACKUPS),
        is_replica: flag(labels::LABEL_IS_REPLICA),
        is_backup: flag(labels::LABEL_IS_BACKUP),
    })
}

/// `delete-data` task removing a deleted cluster, honouring its keep annotations
pub fn cluster_removal_task(cluster: &Pgcluster) -> Pgtask {
    let name = cluster.cluster_name();
    let task_name = format!("{name}-rmdata");
    let flag = |v: bool| if v { labels::LABEL_TRUE } else { labels::LABEL_FALSE }.to_string();

    let mut task = Pgtask::new(
        &task_name,
        PgtaskSpec {
            name: task_name.clone(),
            task_type: TASK_TYPE_DELETE_DATA.to_string(),
            parameters: BTreeMap::from([
                (labels::LABEL_DELETE_DATA.to_string(), flag(!cluster.keep_data())),
                (labels::LABEL_DELETE_BACKUPS.to_string(), flag(!cluster.keep_backups())),
                (labels::LABEL_IS_REPLICA.to_string(), flag(false)),
                (labels::LABEL_IS_BACKUP.to_string(), flag(false)),
                (labels::LABEL_PG_CLUSTER.to_string(), name.clone()),
                (labels::LABEL_PGHA_SCOPE.to_string(), cluster.pgha_scope()),
            ]),
            status: String::new(),
        },
    );
    task.metadata.labels = Some(BTreeMap::from([
        (labels::LABEL_PG_CLUSTER.to_string(), name),
        (labels::LABEL_RMDATA.to_string(), labels::LABEL_TRUE.to_string()),
    ]));
    task
}

fn random_suffix(len: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Launch the rmdata Job for a task, then mark the task so redelivery does not launch another
async fn delete_data(ctx: &GroupContext, namespace: &str, task: &Pgtask) -> Result<()> {
    let request = rmdata_request(namespace, task)?;
    let job_name = format!("{}-rmdata-{}", request.cluster, random_suffix(4));
    let job = manifests::rmdata_job(ctx.config(), &request, &job_name, &task.name_any());

    let jobs: Api<Job> = ctx.api(namespace);
    jobs.create(&PostParams::default(), &job).await?;

    let tasks: Api<Pgtask> = ctx.api(namespace);
    let mut patch = Merge7386::new();
    patch.add(&["spec", "parameters", labels::LABEL_DELETE_DATA_STARTED], job_name.as_str());
    kubeapi::merge_patch(&tasks, &task.name_any(), &patch.to_value()).await?;

    info!(cluster = %request.cluster, job = %job_name, "Created rmdata job");
    Ok(())
}
