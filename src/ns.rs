//! Namespace resolution and access checks
//!
//! Decides which namespaces this installation manages and whether the operator holds the
//! privileges needed to act in them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::config::{labels, OperatorConfig};
use crate::error::{Error, Result};
use crate::kubeapi;

/// How much control the operator has over namespaces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamespaceOperatingMode {
    /// Namespaces can be created, updated and deleted, and are watched
    Dynamic,
    /// Namespaces can be read and watched but not changed
    ReadOnly,
    /// No cluster-wide namespace access, namespaces come from configuration
    Disabled,
}

impl NamespaceOperatingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamespaceOperatingMode::Dynamic => "dynamic",
            NamespaceOperatingMode::ReadOnly => "readonly",
            NamespaceOperatingMode::Disabled => "disabled",
        }
    }

    /// Whether namespace membership can change while the operator runs
    pub fn watches_namespaces(&self) -> bool {
        !matches!(self, NamespaceOperatingMode::Disabled)
    }
}

impl fmt::Display for NamespaceOperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NamespaceOperatingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dynamic" => Ok(NamespaceOperatingMode::Dynamic),
            "readonly" => Ok(NamespaceOperatingMode::ReadOnly),
            "disabled" => Ok(NamespaceOperatingMode::Disabled),
            other => Err(Error::config(format!(
                "invalid namespace operating mode '{other}': must be one of dynamic, readonly, disabled"
            ))),
        }
    }
}

/// Resource to verbs that must all be allowed
pub type AccessPrivs = BTreeMap<&'static str, Vec<&'static str>>;

/// Privileges that make the mode `dynamic`
pub fn namespace_privs_dynamic() -> AccessPrivs {
    BTreeMap::from([("namespaces", vec!["create", "update", "delete"])])
}

/// Privileges that make the mode `readonly`
pub fn namespace_privs_readonly() -> AccessPrivs {
    BTreeMap::from([("namespaces", vec!["get", "list", "watch"])])
}

/// Pick the mode from the outcome of the dynamic and readonly checks
pub fn mode_from_privileges(dynamic: bool, readonly: bool) -> NamespaceOperatingMode {
    if dynamic {
        NamespaceOperatingMode::Dynamic
    } else if readonly {
        NamespaceOperatingMode::ReadOnly
    } else {
        NamespaceOperatingMode::Disabled
    }
}

/// Whether `name` is a valid DNS-1123 label
pub fn is_dns1123_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(&bytes[0])
        && alnum(&bytes[bytes.len() - 1])
        && bytes.iter().all(|b| alnum(b) || *b == b'-')
}

/// Reject any namespace name that is not a DNS-1123 label
pub fn validate_namespace_names(names: &[String]) -> Result<()> {
    let invalid: Vec<&str> = names
        .iter()
        .map(String::as_str)
        .filter(|n| !is_dns1123_label(n))
        .collect();
    if invalid.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid namespace name(s): {}",
            invalid.join(", ")
        )))
    }
}

/// Append `extra` to `base`, keeping first-seen order and dropping duplicates
pub fn merge_namespace_lists(base: Vec<String>, extra: Vec<String>) -> Vec<String> {
    let mut merged = base;
    for ns in extra {
        if !merged.contains(&ns) {
            merged.push(ns);
        }
    }
    merged
}

/// Label selector identifying namespaces owned by an installation
pub fn owned_namespace_selector(installation_name: &str) -> String {
    labels::selector(&[
        (labels::LABEL_VENDOR, labels::LABEL_CRUNCHY),
        (labels::LABEL_PGO_INSTALLATION_NAME, installation_name),
    ])
}

/// Labels marking a namespace as owned by an installation
pub fn owned_labels(installation_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::LABEL_VENDOR.to_string(), labels::LABEL_CRUNCHY.to_string()),
        (
            labels::LABEL_PGO_INSTALLATION_NAME.to_string(),
            installation_name.to_string(),
        ),
    ])
}

/// Whether a namespace carries the ownership labels of an installation
pub fn is_owned_namespace(ns: &Namespace, installation_name: &str) -> bool {
    let ns_labels = ns.labels();
    ns_labels.get(labels::LABEL_VENDOR).map(String::as_str) == Some(labels::LABEL_CRUNCHY)
        && ns_labels.get(labels::LABEL_PGO_INSTALLATION_NAME).map(String::as_str)
            == Some(installation_name)
}

/// Namespace lookups and privilege checks bound to one client and configuration
#[derive(Clone)]
pub struct NamespaceResolver {
    client: Client,
    config: Arc<OperatorConfig>,
}

impl NamespaceResolver {
    pub fn new(client: Client, config: Arc<OperatorConfig>) -> Self {
        Self { client, config }
    }

    /// Ask the API server whether the operator may perform `verb` on `resource`
    pub async fn access_review(
        &self,
        resource: &str,
        verb: &str,
        api_group: &str,
        namespace: Option<&str>,
    ) -> Result<bool> {
        let review = SelfSubjectAccessReview {
            metadata: ObjectMeta::default(),
            spec: SelfSubjectAccessReviewSpec {
                resource_attributes: Some(ResourceAttributes {
                    namespace: namespace.map(str::to_string),
                    group: Some(api_group.to_string()),
                    resource: Some(resource.to_string()),
                    verb: Some(verb.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            status: None,
        };

        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let result = api.create(&PostParams::default(), &review).await?;
        Ok(result.status.map(|s| s.allowed).unwrap_or(false))
    }

    /// Check every `(resource, verb)` pair, stopping at the first one denied
    pub async fn check_access_privs(
        &self,
        privs: &AccessPrivs,
        api_group: &str,
        namespace: Option<&str>,
    ) -> Result<bool> {
        for (resource, verbs) in privs {
            for verb in verbs {
                if !self.access_review(resource, verb, api_group, namespace).await? {
                    debug!(
                        resource = %resource,
                        verb = %verb,
                        api_group = %api_group,
                        namespace = namespace.unwrap_or(""),
                        "Access denied"
                    );
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Determine the operating mode, honouring an explicit configuration override
    pub async fn operating_mode(&self) -> Result<NamespaceOperatingMode> {
        if let Some(mode) = &self.config.namespace_mode {
            return mode.parse();
        }
        let dynamic = self
            .check_access_privs(&namespace_privs_dynamic(), "", None)
            .await?;
        let readonly = dynamic
            || self
                .check_access_privs(&namespace_privs_readonly(), "", None)
                .await?;
        Ok(mode_from_privileges(dynamic, readonly))
    }

    /// Namespaces named in configuration, falling back to the operator namespace
    pub fn configured_namespaces(&self) -> Vec<String> {
        if self.config.target_namespaces.is_empty() {
            vec![self.config.operator_namespace.clone()]
        } else {
            self.config.target_namespaces.clone()
        }
    }

    /// Namespaces currently owned by this installation
    pub async fn current_namespace_list(
        &self,
        mode: NamespaceOperatingMode,
    ) -> Result<Vec<String>> {
        if mode == NamespaceOperatingMode::Disabled {
            return Ok(self.configured_namespaces());
        }

        let api: Api<Namespace> = Api::all(self.client.clone());
        let owned = api
            .list(&kubeapi::selector(&owned_namespace_selector(
                &self.config.installation_name,
            )))
            .await?;
        Ok(owned.items.iter().map(|ns| ns.name_any()).collect())
    }

    /// Namespaces to start with: the configured ones plus those already owned
    pub async fn initial_namespace_list(
        &self,
        mode: NamespaceOperatingMode,
    ) -> Result<Vec<String>> {
        let configured = self.config.target_namespaces.clone();
        validate_namespace_names(&configured)?;

        if mode == NamespaceOperatingMode::Disabled {
            return Ok(self.configured_namespaces());
        }

        self.ensure_owned(&configured, mode).await?;
        let owned = self.current_namespace_list(mode).await?;
        let merged = merge_namespace_lists(configured, owned);
        info!(namespaces = ?merged, mode = %mode, "Resolved initial namespace list");
        Ok(merged)
    }

    /// Make sure configured namespaces carry the installation labels
    ///
    /// In dynamic mode missing namespaces are created and unlabelled ones are labelled; in
    /// readonly mode they must already exist and be owned.
    async fn ensure_owned(
        &self,
        namespaces: &[String],
        mode: NamespaceOperatingMode,
    ) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let installation = &self.config.installation_name;

        for name in namespaces {
            let existing = api.get_opt(name).await?;
            match (mode, existing) {
                (_, Some(ns)) if is_owned_namespace(&ns, installation) => {}
                (NamespaceOperatingMode::Dynamic, Some(_)) => {
                    let patch = json!({ "metadata": { "labels": owned_labels(installation) } });
                    kubeapi::merge_patch(&api, name, &patch).await?;
                    info!(namespace = %name, "Labelled namespace for this installation");
                }
                (NamespaceOperatingMode::Dynamic, None) => {
                    let ns = Namespace {
                        metadata: ObjectMeta {
                            name: Some(name.clone()),
                            labels: Some(owned_labels(installation)),
                            ..Default::default()
                        },
                        ..Default::default()
                    };
                    api.create(&PostParams::default(), &ns).await?;
                    info!(namespace = %name, "Created namespace");
                }
                (_, Some(_)) => {
                    return Err(Error::validation(format!(
                        "namespace {name} is not owned by installation {installation}"
                    )));
                }
                (_, None) => {
                    return Err(Error::not_found(format!("namespace {name}")));
                }
            }
        }
        Ok(())
    }
}
