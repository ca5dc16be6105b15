//! RBAC reconciliation for target namespaces
//!
//! Every namespace managed by the operator needs the service accounts, roles and role
//! bindings used by database pods and operator jobs. They are created when missing and
//! brought back in line when they drift.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LocalObjectReference, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info};

use crate::config::labels;
use crate::error::Result;
use crate::operator::manifests::{
    SERVICE_ACCOUNT_BACKREST, SERVICE_ACCOUNT_DEFAULT, SERVICE_ACCOUNT_PG, SERVICE_ACCOUNT_TARGET,
};

/// Logged with every RBAC failure; reconciliation carries on with the next resource
pub const ERR_RECONCILE_RBAC: &str = "operator is unable to reconcile RBAC resource";

/// Service account the operator itself runs as
pub const OPERATOR_SERVICE_ACCOUNT: &str = "postgres-operator";

pub const ROLE_TARGET: &str = "pgo-target-role";
pub const ROLE_BACKREST: &str = "pgo-backrest-role";
pub const ROLE_PG: &str = "pgo-pg-role";

pub const ROLE_BINDING_TARGET: &str = "pgo-target-role-binding";
pub const ROLE_BINDING_BACKREST: &str = "pgo-backrest-role-binding";
pub const ROLE_BINDING_PG: &str = "pgo-pg-role-binding";

const ALL_VERBS: &[&str] = &[
    "get",
    "list",
    "watch",
    "create",
    "patch",
    "update",
    "delete",
    "deletecollection",
];

fn rule(api_group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            labels::LABEL_VENDOR.to_string(),
            labels::LABEL_CRUNCHY.to_string(),
        )])),
        ..Default::default()
    }
}

/// Names of the service accounts required in every target namespace
pub fn service_account_names() -> [&'static str; 4] {
    [
        SERVICE_ACCOUNT_DEFAULT,
        SERVICE_ACCOUNT_TARGET,
        SERVICE_ACCOUNT_BACKREST,
        SERVICE_ACCOUNT_PG,
    ]
}

pub fn service_account(
    name: &str,
    namespace: &str,
    pull_secrets: &[LocalObjectReference],
) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(name, namespace),
        image_pull_secrets: (!pull_secrets.is_empty()).then(|| pull_secrets.to_vec()),
        ..Default::default()
    }
}

/// Roles required in every target namespace
pub fn roles(namespace: &str) -> Vec<Role> {
    let target = vec![
        rule(
            "",
            &[
                "configmaps",
                "endpoints",
                "pods",
                "pods/exec",
                "pods/log",
                "replicasets",
                "secrets",
                "services",
                "persistentvolumeclaims",
            ],
            ALL_VERBS,
        ),
        rule("apps", &["deployments", "replicasets"], ALL_VERBS),
        rule("batch", &["jobs"], ALL_VERBS),
        rule(
            labels::API_GROUP,
            &["pgclusters", "pgpolicies", "pgtasks", "pgreplicas"],
            ALL_VERBS,
        ),
    ];
    let backrest = vec![
        rule("", &["pods"], &["get", "list"]),
        rule("", &["pods/exec"], &["create"]),
    ];
    let pg = vec![
        rule("", &["endpoints", "configmaps"], ALL_VERBS),
        rule("", &["pods"], &["get", "list", "patch", "update", "watch"]),
        rule("", &["pods/exec"], &["create"]),
        rule("", &["services"], &["create", "get", "list"]),
        rule(labels::API_GROUP, &["pgclusters", "pgtasks"], &["get", "list", "patch", "update", "watch"]),
    ];

    [(ROLE_TARGET, target), (ROLE_BACKREST, backrest), (ROLE_PG, pg)]
        .into_iter()
        .map(|(name, rules)| Role {
            metadata: meta(name, namespace),
            rules: Some(rules),
        })
        .collect()
}

/// Role bindings required in every target namespace
///
/// The target role is bound to the operator's own service account in `operator_namespace`,
/// the others to service accounts living in the target namespace.
pub fn role_bindings(operator_namespace: &str, namespace: &str) -> Vec<RoleBinding> {
    [
        (ROLE_BINDING_TARGET, ROLE_TARGET, OPERATOR_SERVICE_ACCOUNT, operator_namespace),
        (ROLE_BINDING_BACKREST, ROLE_BACKREST, SERVICE_ACCOUNT_BACKREST, namespace),
        (ROLE_BINDING_PG, ROLE_PG, SERVICE_ACCOUNT_PG, namespace),
    ]
    .into_iter()
    .map(|(name, role, account, account_namespace)| RoleBinding {
        metadata: meta(name, namespace),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: account.to_string(),
            namespace: Some(account_namespace.to_string()),
            ..Default::default()
        }]),
    })
    .collect()
}

fn pull_secrets_of(account: &ServiceAccount) -> &[LocalObjectReference] {
    account.image_pull_secrets.as_deref().unwrap_or_default()
}

/// Create or repair one service account; `true` when it was written
async fn reconcile_service_account(api: &Api<ServiceAccount>, desired: ServiceAccount) -> Result<bool> {
    let name = desired.name_any();
    match api.get_opt(&name).await? {
        None => {
            debug!(service_account = %name, "ServiceAccount does not exist and will be created");
            api.create(&PostParams::default(), &desired).await?;
            Ok(true)
        }
        Some(mut current) if pull_secrets_of(&current) != pull_secrets_of(&desired) => {
            debug!(service_account = %name, "ServiceAccount is invalid and will now be reconciled");
            current.image_pull_secrets = desired.image_pull_secrets;
            api.replace(&name, &PostParams::default(), &current).await?;
            Ok(true)
        }
        Some(_) => Ok(false),
    }
}

async fn reconcile_role(api: &Api<Role>, desired: Role) -> Result<()> {
    let name = desired.name_any();
    match api.get_opt(&name).await? {
        None => {
            debug!(role = %name, "Role does not exist and will be created");
            api.create(&PostParams::default(), &desired).await?;
        }
        Some(mut current) if current.rules != desired.rules => {
            debug!(role = %name, "Role is invalid and will now be reconciled");
            current.rules = desired.rules;
            api.replace(&name, &PostParams::default(), &current).await?;
        }
        Some(_) => {}
    }
    Ok(())
}

async fn reconcile_role_binding(api: &Api<RoleBinding>, desired: RoleBinding) -> Result<()> {
    let name = desired.name_any();
    match api.get_opt(&name).await? {
        None => {
            debug!(role_binding = %name, "RoleBinding does not exist and will be created");
            api.create(&PostParams::default(), &desired).await?;
        }
        Some(mut current)
            if current.subjects != desired.subjects || current.role_ref != desired.role_ref =>
        {
            debug!(role_binding = %name, "RoleBinding is invalid and will now be reconciled");
            current.subjects = desired.subjects;
            current.role_ref = desired.role_ref;
            api.replace(&name, &PostParams::default(), &current).await?;
        }
        Some(_) => {}
    }
    Ok(())
}

/// Copy a secret from the operator namespace, replacing the target copy when present
///
/// A secret missing from the operator namespace is not an error.
pub async fn copy_secret(client: &Client, name: &str, from: &str, to: &str) -> Result<()> {
    let source: Api<Secret> = Api::namespaced(client.clone(), from);
    let Some(secret) = source.get_opt(name).await? else {
        return Ok(());
    };
    let copy = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(to.to_string()),
            labels: secret.metadata.labels,
            annotations: secret.metadata.annotations,
            ..Default::default()
        },
        ..secret
    };

    let target: Api<Secret> = Api::namespaced(client.clone(), to);
    match target.get_opt(name).await? {
        None => {
            target.create(&PostParams::default(), &copy).await?;
        }
        Some(existing) => {
            let mut copy = copy;
            copy.metadata.resource_version = existing.metadata.resource_version;
            target.replace(name, &PostParams::default(), &copy).await?;
        }
    }
    Ok(())
}

/// Bring the operator's RBAC resources in `namespace` up to date
///
/// Failures are logged per resource so one bad object does not block the rest.
pub async fn reconcile_rbac(client: &Client, operator_namespace: &str, namespace: &str) {
    debug!(namespace = %namespace, "Reconciling RBAC");

    let operator_accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), operator_namespace);
    let pull_secrets = match operator_accounts.get(OPERATOR_SERVICE_ACCOUNT).await {
        Ok(account) => pull_secrets_of(&account).to_vec(),
        Err(e) => {
            error!(namespace = %namespace, error = %e, "{ERR_RECONCILE_RBAC}");
            Vec::new()
        }
    };

    let accounts: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
    let mut accounts_changed = false;
    for name in service_account_names() {
        match reconcile_service_account(&accounts, service_account(name, namespace, &pull_secrets)).await {
            Ok(changed) => accounts_changed |= changed,
            Err(e) => error!(namespace = %namespace, service_account = %name, error = %e, "{ERR_RECONCILE_RBAC}"),
        }
    }

    let role_api: Api<Role> = Api::namespaced(client.clone(), namespace);
    for role in roles(namespace) {
        let name = role.name_any();
        if let Err(e) = reconcile_role(&role_api, role).await {
            error!(namespace = %namespace, role = %name, error = %e, "{ERR_RECONCILE_RBAC}");
        }
    }

    let binding_api: Api<RoleBinding> = Api::namespaced(client.clone(), namespace);
    for binding in role_bindings(operator_namespace, namespace) {
        let name = binding.name_any();
        if let Err(e) = reconcile_role_binding(&binding_api, binding).await {
            error!(namespace = %namespace, role_binding = %name, error = %e, "{ERR_RECONCILE_RBAC}");
        }
    }

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    for reference in &pull_secrets {
        let name = reference.name.as_str();
        let missing = match secrets.get_opt(name).await {
            Ok(found) => found.is_none(),
            Err(e) => {
                error!(namespace = %namespace, secret = %name, error = %e, "{ERR_RECONCILE_RBAC}");
                continue;
            }
        };
        if missing || accounts_changed {
            if let Err(e) = copy_secret(client, name, operator_namespace, namespace).await {
                error!(namespace = %namespace, secret = %name, error = %e, "{ERR_RECONCILE_RBAC}");
            }
        }
    }
    info!(namespace = %namespace, "RBAC reconciled");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_binding_points_at_operator_namespace() {
        let bindings = role_bindings("pgo", "team-a");
        let target = bindings
            .iter()
            .find(|b| b.name_any() == ROLE_BINDING_TARGET)
            .unwrap();
        let subject = &target.subjects.as_ref().unwrap()[0];
        assert_eq!(subject.name, OPERATOR_SERVICE_ACCOUNT);
        assert_eq!(subject.namespace.as_deref(), Some("pgo"));
        assert_eq!(target.role_ref.name, ROLE_TARGET);
        assert_eq!(target.metadata.namespace.as_deref(), Some("team-a"));
    }

    #[test]
    fn test_service_account_omits_empty_pull_secrets() {
        let sa = service_account(SERVICE_ACCOUNT_PG, "team-a", &[]);
        assert!(sa.image_pull_secrets.is_none());
    }
}
