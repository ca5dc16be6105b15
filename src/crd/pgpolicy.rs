//! Pgpolicy Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pgpolicy resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crunchydata.com",
    version = "v1",
    kind = "Pgpolicy",
    plural = "pgpolicies",
    singular = "pgpolicy",
    namespaced,
    status = "PgpolicyStatus",
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#
)]
pub struct PgpolicySpec {
    #[serde(default)]
    pub name: String,

    /// Location the SQL can be fetched from
    #[serde(default)]
    pub url: String,

    /// SQL applied to clusters carrying the policy label
    #[serde(default)]
    pub sql: String,
}

/// Pgpolicy status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PgpolicyStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Status of a policy that has been seen by the operator
pub const POLICY_STATE_PROCESSED: &str = "processed";

impl Pgpolicy {
    pub fn is_processed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.state == POLICY_STATE_PROCESSED)
    }
}
