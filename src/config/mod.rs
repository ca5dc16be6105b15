//! Operator configuration
//!
//! Everything the operator needs from its environment is read once at startup into an
//! [`OperatorConfig`] and handed to the components that need it.

pub mod labels;

use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_PGTASK_WORKER_COUNT: usize = 1;
const DEFAULT_CONFIGMAP_WORKER_COUNT: usize = 2;
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
const DEFAULT_METRICS_PORT: u16 = 8080;
const DEFAULT_IMAGE_PREFIX: &str = "registry.developers.crunchydata.com/crunchydata";

/// Process wide operator settings
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace the operator itself runs in
    pub operator_namespace: String,
    /// Value of the `pgo-installation-name` label owned by this installation
    pub installation_name: String,
    /// Namespaces named explicitly through `NAMESPACE`
    pub target_namespaces: Vec<String>,
    /// Explicit namespace operating mode, skipping detection when set
    pub namespace_mode: Option<String>,
    /// Worker tasks per Pgtask queue
    pub pgtask_worker_count: usize,
    /// Worker tasks per ConfigMap queue
    pub configmap_worker_count: usize,
    /// How often controller groups are re-validated
    pub controller_group_refresh_interval: Duration,
    /// Skip RBAC reconciliation in target namespaces
    pub disable_reconcile_rbac: bool,
    /// Address of the event bus, eventing is disabled when absent
    pub event_addr: Option<String>,
    /// Version stamped on resources managed by this operator
    pub pgo_version: String,
    /// Port for the metrics server
    pub metrics_port: u16,
    /// Registry prefix of operator images (pgBackRest, rmdata)
    pub pgo_image_prefix: String,
    /// Tag of operator images
    pub pgo_image_tag: String,
    /// Registry prefix of database images
    pub ccp_image_prefix: String,
}

impl OperatorConfig {
    /// Build the configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let operator_namespace = get("PGO_OPERATOR_NAMESPACE")
            .ok_or_else(|| Error::config("PGO_OPERATOR_NAMESPACE must be set"))?;
        let installation_name = get("PGO_INSTALLATION_NAME")
            .ok_or_else(|| Error::config("PGO_INSTALLATION_NAME must be set"))?;

        let target_namespaces = get("NAMESPACE")
            .map(|v| parse_namespace_csv(&v))
            .unwrap_or_default();

        let pgo_version =
            get("PGO_VERSION").unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

        Ok(Self {
            operator_namespace,
            installation_name,
            target_namespaces,
            namespace_mode: get("PGO_NAMESPACE_MODE"),
            pgtask_worker_count: parse_or(
                "PGO_TASK_WORKER_COUNT",
                get("PGO_TASK_WORKER_COUNT"),
                DEFAULT_PGTASK_WORKER_COUNT,
            )?,
            configmap_worker_count: parse_or(
                "CONFIGMAP_WORKER_COUNT",
                get("CONFIGMAP_WORKER_COUNT"),
                DEFAULT_CONFIGMAP_WORKER_COUNT,
            )?,
            controller_group_refresh_interval: Duration::from_secs(parse_or(
                "CONTROLLER_GROUP_REFRESH_INTERVAL",
                get("CONTROLLER_GROUP_REFRESH_INTERVAL"),
                DEFAULT_REFRESH_INTERVAL_SECS,
            )?),
            disable_reconcile_rbac: match get("DISABLE_RECONCILE_RBAC") {
                Some(v) => parse_bool(&v).ok_or_else(|| {
                    Error::config(format!("DISABLE_RECONCILE_RBAC is not a boolean: {v}"))
                })?,
                None => false,
            },
            event_addr: get("EVENT_ADDR"),
            metrics_port: parse_or("METRICS_PORT", get("METRICS_PORT"), DEFAULT_METRICS_PORT)?,
            pgo_image_prefix: get("PGO_IMAGE_PREFIX")
                .unwrap_or_else(|| DEFAULT_IMAGE_PREFIX.to_string()),
            pgo_image_tag: get("PGO_IMAGE_TAG").unwrap_or_else(|| pgo_version.clone()),
            ccp_image_prefix: get("CCP_IMAGE_PREFIX")
                .unwrap_or_else(|| DEFAULT_IMAGE_PREFIX.to_string()),
            pgo_version,
        })
    }
}

/// Split a comma separated namespace list, dropping blanks and duplicates
pub fn parse_namespace_csv(value: &str) -> Vec<String> {
    let mut namespaces: Vec<String> = Vec::new();
    for ns in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !namespaces.iter().any(|n| n == ns) {
            namespaces.push(ns.to_string());
        }
    }
    namespaces
}

/// Parse the boolean spellings accepted in environment variables and labels
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "t" => Some(true),
        "false" | "0" | "no" | "f" => Some(false),
        _ => None,
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        Some(v) => v
            .parse()
            .map_err(|_| Error::config(format!("{key} has an invalid value: {v}"))),
        None => Ok(default),
    }
}
