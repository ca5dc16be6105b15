//! SQL policies applied to a cluster once its primary is ready

use kube::{Api, ResourceExt};
use tracing::{info, instrument, warn};

use crate::config::labels;
use crate::controllers::GroupContext;
use crate::crd::{Pgcluster, Pgpolicy};
use crate::error::Result;
use crate::kubeapi::{self, Merge7386};
use crate::operator::cluster;

/// Policy names listed in a cluster's `policies` field
pub fn policy_names(policies: &str) -> Vec<&str> {
    policies
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Run every policy requested by a cluster against its primary
///
/// A policy that cannot be applied is logged and skipped.
#[instrument(skip(ctx, pgcluster), fields(cluster = %pgcluster.name_any()))]
pub async fn apply_policies(ctx: &GroupContext, namespace: &str, pgcluster: &Pgcluster) -> Result<()> {
    let names = policy_names(&pgcluster.spec.policies);
    if names.is_empty() {
        return Ok(());
    }

    let cluster_name = pgcluster.name_any();
    let primary = cluster::primary_pod(ctx, namespace, &cluster_name).await?;
    let policies: Api<Pgpolicy> = ctx.api(namespace);
    let clusters: Api<Pgcluster> = ctx.api(namespace);

    for name in names {
        let policy = match policies.get(name).await {
            Ok(policy) => policy,
            Err(e) => {
                warn!(policy = %name, error = %e, "Unable to read policy");
                continue;
            }
        };
        if policy.spec.sql.is_empty() {
            warn!(policy = %name, "Policy has no SQL to apply");
            continue;
        }

        let command = vec![
            "psql".to_string(),
            "-p".to_string(),
            pgcluster.port().to_string(),
            "-c".to_string(),
            policy.spec.sql.clone(),
        ];
        if let Err(e) = kubeapi::exec(
            ctx.client(),
            namespace,
            &primary.name_any(),
            labels::CONTAINER_DATABASE,
            command,
        )
        .await
        {
            warn!(policy = %name, error = %e, "Error applying policy");
            continue;
        }

        let mut patch = Merge7386::new();
        patch.add(&["metadata", "labels", name], labels::LABEL_PGPOLICY);
        kubeapi::merge_patch(&clusters, &cluster_name, &patch.to_value()).await?;
        info!(policy = %name, "Applied policy");
    }
    Ok(())
}
