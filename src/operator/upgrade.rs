//! Version gate for clusters created by another operator version

use kube::api::ListParams;
use kube::{Api, Resource, ResourceExt};
use tracing::{info, instrument, warn};

use crate::config::labels;
use crate::controllers::GroupContext;
use crate::crd::{Pgcluster, Pgreplica, Pgtask};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::kubeapi::{self, Merge7386};

/// Whether an object's `pgo-version` label differs from the running operator
///
/// A missing label counts as a mismatch.
pub fn needs_upgrade<K: Resource>(obj: &K, operator_version: &str) -> bool {
    obj.labels().get(labels::LABEL_PGO_VERSION).map(String::as_str) != Some(operator_version)
}

fn pause_patch() -> serde_json::Value {
    let mut patch = Merge7386::new();
    patch.add(
        &["metadata", "annotations", labels::ANNOTATION_IS_UPGRADED],
        labels::LABEL_FALSE,
    );
    patch.to_value()
}

/// Annotate every Pgcluster and Pgreplica of `namespace` whose version differs from the operator
///
/// Returns the names of the clusters that were paused.
#[instrument(skip(ctx))]
pub async fn check_version(ctx: &GroupContext, namespace: &str) -> Result<Vec<String>> {
    let version = ctx.config().pgo_version.as_str();
    let patch = pause_patch();

    let clusters: Api<Pgcluster> = ctx.api(namespace);
    let mut paused = Vec::new();
    for cluster in clusters.list(&ListParams::default()).await? {
        if needs_upgrade(&cluster, version) && !cluster.awaiting_upgrade() {
            kubeapi::merge_patch(&clusters, &cluster.name_any(), &patch).await?;
            warn!(
                cluster = %cluster.name_any(),
                found = cluster.pgo_version().unwrap_or("none"),
                expected = %version,
                "Cluster version does not match the operator, pausing it until upgraded"
            );
            paused.push(cluster.name_any());
        }
    }

    let replicas: Api<Pgreplica> = ctx.api(namespace);
    for replica in replicas.list(&ListParams::default()).await? {
        let annotated = replica.annotations().get(labels::ANNOTATION_IS_UPGRADED).map(String::as_str)
            == Some(labels::LABEL_FALSE);
        if needs_upgrade(&replica, version) && !annotated {
            kubeapi::merge_patch(&replicas, &replica.name_any(), &patch).await?;
        }
    }
    Ok(paused)
}

/// Bring a paused cluster and its replicas to the running operator version
#[instrument(skip(ctx, task), fields(task = %task.name_any()))]
pub async fn complete_upgrade(ctx: &GroupContext, namespace: &str, task: &Pgtask) -> Result<()> {
    let cluster_name = task
        .labels()
        .get(labels::LABEL_PG_CLUSTER)
        .cloned()
        .or_else(|| task.parameter(labels::LABEL_PG_CLUSTER).map(str::to_string))
        .ok_or_else(|| Error::validation(format!("upgrade task {} names no cluster", task.name_any())))?;

    let mut patch = Merge7386::new();
    patch
        .remove(&["metadata", "annotations", labels::ANNOTATION_IS_UPGRADED])
        .add(
            &["metadata", "labels", labels::LABEL_PGO_VERSION],
            ctx.config().pgo_version.as_str(),
        );
    let patch = patch.to_value();

    let clusters: Api<Pgcluster> = ctx.api(namespace);
    kubeapi::merge_patch(&clusters, &cluster_name, &patch).await?;

    let replicas: Api<Pgreplica> = ctx.api(namespace);
    let selector = labels::selector(&[(labels::LABEL_PG_CLUSTER, &cluster_name)]);
    for replica in replicas.list(&kubeapi::selector(&selector)).await? {
        kubeapi::merge_patch(&replicas, &replica.name_any(), &patch).await?;
    }

    ctx.events()
        .publish(
            namespace,
            EventKind::UpgradeCluster {
                cluster: cluster_name.clone(),
            },
        )
        .await;
    info!(cluster = %cluster_name, version = %ctx.config().pgo_version, "Cluster upgraded");
    Ok(())
}
