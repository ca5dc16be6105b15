//! Workflow Pgtasks record the progress of multi-step operations

use kube::{Api, ResourceExt};
use tracing::{debug, info};

use crate::config::labels;
use crate::controllers::GroupContext;
use crate::crd::{Pgtask, WORKFLOW_COMPLETED_STATUS, WORKFLOW_CREATE_CLUSTER};
use crate::error::{Error, Result};
use crate::kubeapi::{self, Merge7386};

/// `<cluster>-createcluster`
pub fn create_cluster_workflow_name(cluster: &str) -> String {
    format!("{cluster}-{WORKFLOW_CREATE_CLUSTER}")
}

fn timestamp_patch(status: &str) -> Merge7386 {
    let mut patch = Merge7386::new();
    patch.add(&["spec", "parameters", status], chrono::Utc::now().to_rfc3339());
    patch
}

/// Record completion of the create-cluster workflow
///
/// Clusters created without a workflow are left alone.
pub async fn complete_create_cluster_workflow(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &str,
) -> Result<()> {
    let api: Api<Pgtask> = ctx.api(namespace);
    let name = create_cluster_workflow_name(cluster);
    let patch = timestamp_patch(WORKFLOW_COMPLETED_STATUS);
    match kubeapi::merge_patch(&api, &name, &patch.to_value()).await {
        Ok(_) => {
            info!(cluster = %cluster, workflow = %name, "Completed create cluster workflow");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(cluster = %cluster, "No create cluster workflow");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Stamp `status` on the workflow task carrying `workflow_id`
pub async fn update_workflow(
    ctx: &GroupContext,
    namespace: &str,
    workflow_id: &str,
    status: &str,
) -> Result<()> {
    let api: Api<Pgtask> = ctx.api(namespace);
    let selector = labels::selector(&[(labels::LABEL_WORKFLOW_ID, workflow_id)]);
    let tasks = api.list(&kubeapi::selector(&selector)).await?;
    let [task] = tasks.items.as_slice() else {
        return Err(Error::not_found(format!("workflow {workflow_id}")));
    };

    kubeapi::merge_patch(&api, &task.name_any(), &timestamp_patch(status).to_value()).await?;
    info!(workflow = %workflow_id, status = %status, "Updated workflow");
    Ok(())
}
