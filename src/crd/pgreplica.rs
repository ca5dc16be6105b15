//! Pgreplica Custom Resource Definition

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::PgStorageSpec;

/// Pgreplica resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crunchydata.com",
    version = "v1",
    kind = "Pgreplica",
    plural = "pgreplicas",
    singular = "pgreplica",
    namespaced,
    status = "PgreplicaStatus",
    printcolumn = r#"{"name": "Cluster", "type": "string", "jsonPath": ".spec.clustername"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#
)]
pub struct PgreplicaSpec {
    /// Name of the replica, also its deployment name
    #[serde(default)]
    pub name: String,

    /// Owning cluster
    #[serde(rename = "clustername", default)]
    pub cluster_name: String,

    /// Storage backing the replica
    #[serde(rename = "replicastorage", default)]
    pub replica_storage: PgStorageSpec,

    /// Labels supplied by the user
    #[serde(rename = "userlabels", default)]
    pub user_labels: BTreeMap<String, String>,
}

/// Pgreplica status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PgreplicaStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}
