//! Pgcluster Custom Resource Definition

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::labels;

/// Pgcluster resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crunchydata.com",
    version = "v1",
    kind = "Pgcluster",
    plural = "pgclusters",
    singular = "pgcluster",
    namespaced,
    status = "PgclusterStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Standby", "type": "boolean", "jsonPath": ".spec.standby"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
pub struct PgclusterSpec {
    /// Cluster name, also the value of the `pg-cluster` label
    #[serde(rename = "clustername", default)]
    pub cluster_name: String,

    /// Database container image
    #[serde(rename = "ccpimage", default)]
    pub ccp_image: String,

    /// Database container image tag
    #[serde(rename = "ccpimagetag", default)]
    pub ccp_image_tag: String,

    /// PostgreSQL port
    #[serde(default = "default_port")]
    pub port: String,

    /// Comma separated policies applied once the cluster is initialized
    #[serde(default)]
    pub policies: String,

    /// Number of replicas requested at creation
    #[serde(default)]
    pub replicas: String,

    /// Secret holding the primary user credentials
    #[serde(rename = "primarysecretname", default)]
    pub primary_secret_name: String,

    /// Storage backing the primary instance
    #[serde(rename = "PrimaryStorage", default)]
    pub primary_storage: PgStorageSpec,

    /// Storage backing the WAL volume
    #[serde(rename = "WALStorage", default)]
    pub wal_storage: PgStorageSpec,

    /// Storage backing the pgBackRest repository
    #[serde(rename = "BackrestStorage", default)]
    pub backrest_storage: PgStorageSpec,

    /// Labels supplied by the user, including `backrest-storage-type`
    #[serde(rename = "userlabels", default)]
    pub user_labels: BTreeMap<String, String>,

    /// pgBouncer settings
    #[serde(rename = "pgBouncer", default)]
    pub pg_bouncer: PgBouncerSpec,

    /// Whether metrics collection is enabled
    #[serde(default)]
    pub exporter: bool,

    /// Run as a standby of another cluster
    #[serde(default)]
    pub standby: bool,

    /// Scale all instances down to zero
    #[serde(default)]
    pub shutdown: bool,

    /// Source of an existing data set to bootstrap from
    #[serde(rename = "pgDataSource", default)]
    pub pg_data_source: PgDataSourceSpec,

    /// Tolerations applied to all instances
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
}

fn default_port() -> String {
    "5432".to_string()
}

/// Storage specification for a cluster volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PgStorageSpec {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "storageclass", default)]
    pub storage_class: String,
    #[serde(rename = "accessmode", default)]
    pub access_mode: String,
    #[serde(default)]
    pub size: String,
    #[serde(rename = "storagetype", default)]
    pub storage_type: String,
}

/// Toleration applied to cluster pods
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// pgBouncer settings of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct PgBouncerSpec {
    /// pgBouncer is enabled when greater than zero
    #[serde(default)]
    pub replicas: i32,
}

/// Existing data source for a bootstrap
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PgDataSourceSpec {
    /// Cluster whose pgBackRest repository holds the data
    #[serde(default)]
    pub restore_from: String,
    /// Extra pgBackRest restore options
    #[serde(default)]
    pub restore_opts: String,
    /// Namespace of the source cluster, defaults to the cluster's own namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Pgcluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PgclusterStatus {
    /// Current lifecycle state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ClusterLifecycle>,

    /// Human readable detail for the current state
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Persisted lifecycle state of a Pgcluster
///
/// The `pgcluster <State>` spellings written by earlier operator versions are accepted.
/// Any other value reads as [`ClusterLifecycle::Unknown`], which no transition leaves.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClusterLifecycle {
    /// Resources are being created
    #[default]
    #[serde(alias = "pgcluster Created", alias = "pgcluster Processed")]
    Creating,
    /// Data is being restored from an existing repository by the bootstrap job
    #[serde(alias = "pgcluster Bootstrapping")]
    Bootstrapping,
    /// The bootstrap job finished, the cluster is being brought up on the restored data
    #[serde(alias = "pgcluster Bootstrapped")]
    Bootstrapped,
    /// An in-place restore is in progress
    #[serde(alias = "pgcluster Restoring")]
    Restore,
    /// The cluster is up and has completed its initial backup
    #[serde(alias = "pgcluster Initialized")]
    Initialized,
    /// All instances are scaled to zero
    #[serde(alias = "pgcluster Shutdown")]
    Shutdown,
    /// A state this operator does not recognise; handlers leave such clusters alone
    #[serde(other)]
    Unknown,
}

impl ClusterLifecycle {
    pub const ALL: [ClusterLifecycle; 6] = [
        ClusterLifecycle::Creating,
        ClusterLifecycle::Bootstrapping,
        ClusterLifecycle::Bootstrapped,
        ClusterLifecycle::Restore,
        ClusterLifecycle::Initialized,
        ClusterLifecycle::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterLifecycle::Creating => "Creating",
            ClusterLifecycle::Bootstrapping => "Bootstrapping",
            ClusterLifecycle::Bootstrapped => "Bootstrapped",
            ClusterLifecycle::Restore => "Restore",
            ClusterLifecycle::Initialized => "Initialized",
            ClusterLifecycle::Shutdown => "Shutdown",
            ClusterLifecycle::Unknown => "Unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != ClusterLifecycle::Unknown
    }
}

impl fmt::Display for ClusterLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterLifecycle {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| crate::Error::validation(format!("unknown cluster state '{s}'")))
    }
}

impl Pgcluster {
    /// Current state, a cluster without status is still being created
    pub fn lifecycle(&self) -> ClusterLifecycle {
        self.status
            .as_ref()
            .and_then(|s| s.state)
            .unwrap_or_default()
    }

    /// Cluster name from the spec, falling back to the object name
    pub fn cluster_name(&self) -> String {
        if self.spec.cluster_name.is_empty() {
            self.metadata.name.clone().unwrap_or_default()
        } else {
            self.spec.cluster_name.clone()
        }
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    /// Whether the cluster has been paused by a version mismatch
    pub fn awaiting_upgrade(&self) -> bool {
        self.annotation(labels::ANNOTATION_IS_UPGRADED) == Some(labels::LABEL_FALSE)
    }

    /// Whether handlers must leave the cluster alone: paused for an upgrade, or in a state
    /// this operator does not recognise
    pub fn reconcile_paused(&self) -> bool {
        self.awaiting_upgrade() || !self.lifecycle().is_known()
    }

    /// Whether an in-place restore was requested
    pub fn restore_requested(&self) -> bool {
        self.annotation(labels::ANNOTATION_BACKREST_RESTORE).is_some()
    }

    /// Deployment currently running the primary
    pub fn current_primary(&self) -> String {
        self.annotation(labels::ANNOTATION_CURRENT_PRIMARY)
            .map(str::to_string)
            .unwrap_or_else(|| self.cluster_name())
    }

    /// Patroni scope, which is also the cluster name unless overridden
    pub fn pgha_scope(&self) -> String {
        self.label(labels::LABEL_PGHA_SCOPE)
            .map(str::to_string)
            .unwrap_or_else(|| self.cluster_name())
    }

    /// Value of the `autofail` label, if present and parseable
    pub fn autofail(&self) -> Option<bool> {
        self.label(labels::LABEL_AUTOFAIL)
            .and_then(crate::config::parse_bool)
    }

    /// Whether removing the cluster leaves its data volumes in place
    pub fn keep_data(&self) -> bool {
        self.annotation(labels::ANNOTATION_KEEP_DATA)
            .and_then(crate::config::parse_bool)
            .unwrap_or(false)
    }

    /// Whether removing the cluster leaves its backups in place
    pub fn keep_backups(&self) -> bool {
        self.annotation(labels::ANNOTATION_KEEP_BACKUPS)
            .and_then(crate::config::parse_bool)
            .unwrap_or(false)
    }

    /// Version of the operator that last managed the cluster
    pub fn pgo_version(&self) -> Option<&str> {
        self.label(labels::LABEL_PGO_VERSION)
    }

    /// Storage type of the pgBackRest repository (`local`, `s3`, or both)
    pub fn backrest_storage_type(&self) -> &str {
        self.spec
            .user_labels
            .get(labels::LABEL_BACKREST_STORAGE_TYPE)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Whether the repository lives only in S3
    pub fn backrest_s3_only(&self) -> bool {
        self.backrest_storage_type() == "s3"
    }

    /// PostgreSQL port
    pub fn port(&self) -> &str {
        &self.spec.port
    }

    /// Namespace holding the repository a bootstrap restores from
    pub fn bootstrap_namespace(&self) -> String {
        if self.spec.pg_data_source.namespace.is_empty() {
            self.metadata.namespace.clone().unwrap_or_default()
        } else {
            self.spec.pg_data_source.namespace.clone()
        }
    }

    /// Whether pgBouncer is enabled
    pub fn pgbouncer_enabled(&self) -> bool {
        self.spec.pg_bouncer.replicas > 0
    }

    /// Image tag for database containers
    pub fn ccp_image_tag(&self) -> &str {
        &self.spec.ccp_image_tag
    }
}
