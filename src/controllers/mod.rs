//! Controllers for PostgreSQL clusters
//!
//! The [`ControllerManager`] owns one [`ControllerGroup`] per managed namespace. A group
//! runs informers for the operator's custom resources and for Pods, Jobs and ConfigMaps,
//! and hands their events to the handlers in this module.

pub mod configmap;
mod group;
pub mod informer;
pub mod job;
mod manager;
pub mod namespace;
pub mod pgcluster;
pub mod pgpolicy;
pub mod pgtask;
pub mod pod;
pub mod rbac;
pub mod workqueue;

pub use group::ControllerGroup;
pub use manager::{group_action, lister_privs, ControllerManager, GroupAction};

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::config::{labels, OperatorConfig};
use crate::error::Result;
use crate::events::EventPublisher;
use crate::index::LabelIndex;
use crate::kubeapi;
use crate::metrics;

/// Process wide dependencies shared by every controller group
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
    /// Event bus publisher
    pub events: EventPublisher,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: Arc<OperatorConfig>, events: EventPublisher) -> Self {
        Self {
            client,
            config,
            events,
        }
    }
}

/// Label indexes maintained by a group's informers
#[derive(Debug, Default)]
pub struct Indexes {
    pub pods: Arc<LabelIndex>,
    pub jobs: Arc<LabelIndex>,
    pub replicas: Arc<LabelIndex>,
}

/// Everything a handler running inside one controller group needs
pub struct GroupContext {
    pub shared: Arc<Context>,
    /// Namespace the group watches
    pub namespace: String,
    /// Cancelled when the group stops
    pub cancel: CancellationToken,
    pub index: Arc<Indexes>,
    indexed: bool,
}

impl GroupContext {
    /// Context for a running group whose informers feed `index`
    pub fn new(shared: Arc<Context>, namespace: &str, index: Arc<Indexes>) -> Self {
        Self {
            shared,
            namespace: namespace.to_string(),
            cancel: CancellationToken::new(),
            index,
            indexed: true,
        }
    }

    /// Context without informers; label lookups always go to the API server
    pub fn standalone(shared: Arc<Context>, namespace: &str) -> Self {
        Self {
            shared,
            namespace: namespace.to_string(),
            cancel: CancellationToken::new(),
            index: Arc::new(Indexes::default()),
            indexed: false,
        }
    }

    pub fn client(&self) -> &Client {
        &self.shared.client
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EventPublisher {
        &self.shared.events
    }

    /// Namespaced API handle
    pub fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.shared.client.clone(), namespace)
    }

    /// Names of the objects in `namespace` carrying every label in `pairs`
    ///
    /// Served from the group's index for its own namespace, listed from the API otherwise.
    pub async fn select_names<K>(
        &self,
        index: &LabelIndex,
        namespace: &str,
        pairs: &[(&str, &str)],
    ) -> Result<Vec<String>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        if self.indexed && namespace == self.namespace {
            return Ok(index.select(namespace, pairs));
        }
        let api: Api<K> = self.api(namespace);
        let list = api
            .list(&kubeapi::selector(&labels::selector(pairs)))
            .await?;
        let mut names: Vec<String> = list.items.iter().map(|o| o.name_any()).collect();
        names.sort();
        Ok(names)
    }
}

/// Run a handler body, recording metrics and logging its error
pub(crate) async fn observe<F>(kind: &'static str, body: F)
where
    F: Future<Output = Result<()>>,
{
    let _timer = metrics::HANDLER_DURATION
        .with_label_values(&[kind])
        .start_timer();
    metrics::HANDLER_INVOCATIONS.with_label_values(&[kind]).inc();

    if let Err(e) = body.await {
        metrics::HANDLER_ERRORS.with_label_values(&[kind]).inc();
        error!(kind, error = %e, "Handler failed");
    }
}
