//! Pgcluster lifecycle transitions
//!
//! The persisted `status.state` of a Pgcluster is a [`ClusterLifecycle`]. Every write goes
//! through [`set_cluster_state`], which re-reads the live object, checks the requested
//! change against [`TRANSITIONS`] and patches with the observed resourceVersion so a
//! concurrent writer causes a conflict instead of a silent overwrite.

use kube::{
    api::{Patch, PatchParams},
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info};

use crate::crd::{ClusterLifecycle, Pgcluster};
use crate::error::{Error, Result};
use crate::kubeapi::FIELD_MANAGER;

use ClusterLifecycle::*;

/// A permitted state change
#[derive(Debug)]
pub struct Transition {
    pub from: ClusterLifecycle,
    pub to: ClusterLifecycle,
    pub description: &'static str,
}

impl Transition {
    const fn new(from: ClusterLifecycle, to: ClusterLifecycle, description: &'static str) -> Self {
        Self {
            from,
            to,
            description,
        }
    }
}

/// Every legal change of `status.state`; re-asserting the current state is always allowed
pub const TRANSITIONS: &[Transition] = &[
    // === Creating ===
    Transition::new(Creating, Bootstrapping, "bootstrap from an existing data source started"),
    Transition::new(Creating, Initialized, "initial backup completed"),
    Transition::new(Creating, Restore, "restore requested before initialization"),
    Transition::new(Creating, Shutdown, "cluster shut down before initialization"),
    // === Bootstrapping ===
    Transition::new(Bootstrapping, Bootstrapped, "bootstrap job completed"),
    // === Bootstrapped ===
    Transition::new(Bootstrapped, Initialized, "bootstrapped cluster completed its initial backup"),
    Transition::new(Bootstrapped, Shutdown, "bootstrapped cluster shut down"),
    // === Restore ===
    Transition::new(Restore, Bootstrapping, "restore job started"),
    Transition::new(Restore, Bootstrapped, "restore job completed"),
    Transition::new(Restore, Initialized, "restored cluster initialized"),
    // === Initialized ===
    Transition::new(Initialized, Restore, "restore requested"),
    Transition::new(Initialized, Shutdown, "cluster shut down"),
    // === Shutdown ===
    Transition::new(Shutdown, Initialized, "cluster started up"),
    Transition::new(Shutdown, Restore, "restore requested while shut down"),
];

/// Look up the transition from one state to another
pub fn transition(from: ClusterLifecycle, to: ClusterLifecycle) -> Option<&'static Transition> {
    TRANSITIONS.iter().find(|t| t.from == from && t.to == to)
}

/// Whether `from -> to` is allowed
pub fn can_transition(from: ClusterLifecycle, to: ClusterLifecycle) -> bool {
    from == to || transition(from, to).is_some()
}

/// States reachable from `from` in a single step
pub fn next_states(from: ClusterLifecycle) -> Vec<ClusterLifecycle> {
    TRANSITIONS
        .iter()
        .filter(|t| t.from == from)
        .map(|t| t.to)
        .collect()
}

/// Reject a transition that is not in the table
pub fn validate(cluster: &str, from: ClusterLifecycle, to: ClusterLifecycle) -> Result<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            cluster: cluster.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Move a cluster to `to`, validating against its live state
pub async fn set_cluster_state(
    client: &Client,
    namespace: &str,
    name: &str,
    to: ClusterLifecycle,
    message: &str,
) -> Result<()> {
    let api: Api<Pgcluster> = Api::namespaced(client.clone(), namespace);
    let live = api.get(name).await?;
    let from = live.lifecycle();

    validate(name, from, to)?;

    if from == to && live.status.as_ref().is_some_and(|s| s.message == message) {
        debug!(cluster = %name, state = %to, "Cluster already in requested state");
        return Ok(());
    }

    let patch = json!({
        "metadata": { "resourceVersion": live.resource_version() },
        "status": { "state": to, "message": message }
    });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;

    info!(
        cluster = %name,
        namespace = %namespace,
        from = %from,
        to = %to,
        "Updated cluster state"
    );
    Ok(())
}
