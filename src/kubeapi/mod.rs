//! Resource client facade
//!
//! Thin helpers over `kube::Api` shared by every controller: patch builders, exec into
//! pods, bounded polling, and deletes that treat an absent object as success.

mod exec;
mod patch;
mod wait;

pub use exec::{exec, ExecOutput};
pub use patch::{escape_token, pointer, Json6902, Merge7386};
pub use wait::Poll;

use std::fmt::Debug;

use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{is_kube_not_found, Result};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "pgo-operator";

/// List parameters for a label selector
pub fn selector(selector: &str) -> ListParams {
    ListParams::default().labels(selector)
}

/// Delete an object, treating NotFound as success
///
/// Returns whether the object existed.
pub async fn delete_if_present<K>(api: &Api<K>, name: &str, params: &DeleteParams) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, params).await {
        Ok(_) => Ok(true),
        Err(e) if is_kube_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete every object matching `selector`, one by one
///
/// Returns the names of the deleted objects.
pub async fn delete_matching<K>(
    api: &Api<K>,
    label_selector: &str,
    params: &DeleteParams,
) -> Result<Vec<String>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut deleted = Vec::new();
    for obj in api.list(&selector(label_selector)).await? {
        let name = obj.name_any();
        if delete_if_present(api, &name, params).await? {
            deleted.push(name);
        }
    }
    Ok(deleted)
}

/// Whether an object currently exists
pub async fn exists<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api.get_opt(name).await?.is_some())
}

/// Apply a JSON merge patch
pub async fn merge_patch<K, P>(api: &Api<K>, name: &str, patch: &P) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    P: Serialize + Debug,
{
    Ok(api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await?)
}

/// Apply a JSON patch built with [`Json6902`]
pub async fn json_patch<K>(api: &Api<K>, name: &str, patch: &Json6902) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    Ok(api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &patch.to_patch()?)
        .await?)
}

/// Apply a JSON merge patch to the status subresource
pub async fn merge_patch_status<K, P>(api: &Api<K>, name: &str, patch: &P) -> Result<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    P: Serialize + Debug,
{
    Ok(api
        .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
        .await?)
}
