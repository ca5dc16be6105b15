//! Custom Resource Definitions for the PostgreSQL Operator

mod pgcluster;
mod pgpolicy;
mod pgreplica;
mod pgtask;

pub use pgcluster::*;
pub use pgpolicy::*;
pub use pgreplica::*;
pub use pgtask::*;

use kube::CustomResourceExt;

use crate::error::Result;

/// Generate all CRD YAML manifests
pub fn generate_crds() -> Result<Vec<String>> {
    Ok(vec![
        serde_yaml::to_string(&Pgcluster::crd())?,
        serde_yaml::to_string(&Pgreplica::crd())?,
        serde_yaml::to_string(&Pgtask::crd())?,
        serde_yaml::to_string(&Pgpolicy::crd())?,
    ])
}
