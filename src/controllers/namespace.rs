//! Namespace watcher
//!
//! In `dynamic` and `readonly` modes the set of managed namespaces follows the namespaces
//! labelled for this installation.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::informer::{EventHandler, Informer};
use super::manager::ControllerManager;
use crate::ns::owned_namespace_selector;

/// Whether the namespace is being deleted
pub fn is_terminating(namespace: &Namespace) -> bool {
    namespace
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Terminating")
}

/// Starts and stops controller groups as owned namespaces come and go
pub struct NamespaceHandler {
    manager: Arc<ControllerManager>,
}

impl NamespaceHandler {
    pub fn new(manager: Arc<ControllerManager>) -> Self {
        Self { manager }
    }

    async fn sync(&self, namespace: &Namespace) {
        let name = namespace.name_any();
        if is_terminating(namespace) {
            info!(namespace = %name, "Namespace is terminating, removing its controller group");
            self.manager.remove_group(&name).await;
            return;
        }
        if let Err(e) = self.manager.add_and_run_group(&name).await {
            error!(namespace = %name, error = %e, "Error syncing namespace");
        }
    }
}

#[async_trait]
impl EventHandler<Namespace> for NamespaceHandler {
    async fn on_add(&self, namespace: Arc<Namespace>) {
        self.sync(&namespace).await;
    }

    async fn on_update(&self, _old: Arc<Namespace>, new: Arc<Namespace>) {
        self.sync(&new).await;
    }

    async fn on_delete(&self, namespace: Arc<Namespace>) {
        debug!(namespace = %namespace.name_any(), "Namespace deleted or no longer owned");
        self.manager.remove_group(&namespace.name_any()).await;
    }
}

/// Watch the namespaces owned by `installation_name` until `cancel` fires
pub fn watch_namespaces(
    client: Client,
    installation_name: &str,
    manager: Arc<ControllerManager>,
    cancel: CancellationToken,
) -> Informer {
    let config = watcher::Config::default().labels(&owned_namespace_selector(installation_name));
    Informer::spawn(
        "namespace",
        Api::<Namespace>::all(client),
        config,
        Arc::new(NamespaceHandler::new(manager)),
        None,
        cancel,
    )
}
