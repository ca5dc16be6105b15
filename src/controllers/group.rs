//! Controller group for one namespace

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::runtime::watcher;
use kube::Api;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::configmap::ConfigMapController;
use super::informer::{IgnoreEvents, Informer};
use super::job::JobHandler;
use super::pgcluster::PgclusterHandler;
use super::pgpolicy::PgpolicyHandler;
use super::pgtask::PgtaskController;
use super::pod::PodHandler;
use super::workqueue::WorkQueue;
use super::{Context, GroupContext, Indexes};
use crate::crd::{Pgcluster, Pgpolicy, Pgreplica, Pgtask};
use crate::error::{Error, Result};

/// Upper bound on the initial list of every informer in a group
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(300);

struct Running {
    ctx: Arc<GroupContext>,
    informers: Vec<Informer>,
    queues: Vec<Arc<WorkQueue>>,
    workers: Vec<JoinHandle<()>>,
}

/// Informers, work queues and workers serving one namespace
pub struct ControllerGroup {
    namespace: String,
    shared: Arc<Context>,
    running: Option<Running>,
}

impl ControllerGroup {
    pub fn new(shared: Arc<Context>, namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            shared,
            running: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_started(&self) -> bool {
        self.running.is_some()
    }

    /// Start the informers, wait for their caches and spawn the queue workers
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let namespace = self.namespace.as_str();
        let client = self.shared.client.clone();
        let config = self.shared.config.clone();

        let index = Arc::new(Indexes::default());
        let ctx = Arc::new(GroupContext::new(self.shared.clone(), namespace, index.clone()));
        let cancel = ctx.cancel.clone();

        let pgtasks = PgtaskController::new(ctx.clone());
        let config_maps = ConfigMapController::new(ctx.clone());

        let mut informers = vec![
            Informer::spawn(
                "pgcluster",
                Api::<Pgcluster>::namespaced(client.clone(), namespace),
                watcher::Config::default(),
                Arc::new(PgclusterHandler::new(ctx.clone())),
                None,
                cancel.clone(),
            ),
            Informer::spawn(
                "pgreplica",
                Api::<Pgreplica>::namespaced(client.clone(), namespace),
                watcher::Config::default(),
                Arc::new(IgnoreEvents),
                Some(index.replicas.clone()),
                cancel.clone(),
            ),
            Informer::spawn(
                "pgtask",
                Api::<Pgtask>::namespaced(client.clone(), namespace),
                watcher::Config::default(),
                pgtasks.clone(),
                None,
                cancel.clone(),
            ),
            Informer::spawn(
                "pgpolicy",
                Api::<Pgpolicy>::namespaced(client.clone(), namespace),
                watcher::Config::default(),
                Arc::new(PgpolicyHandler::new(ctx.clone())),
                None,
                cancel.clone(),
            ),
            Informer::spawn(
                "pod",
                Api::<Pod>::namespaced(client.clone(), namespace),
                watcher::Config::default(),
                Arc::new(PodHandler::new(ctx.clone())),
                Some(index.pods.clone()),
                cancel.clone(),
            ),
            Informer::spawn(
                "job",
                Api::<Job>::namespaced(client.clone(), namespace),
                watcher::Config::default(),
                Arc::new(JobHandler::new(ctx.clone())),
                Some(index.jobs.clone()),
                cancel.clone(),
            ),
            Informer::spawn(
                "configmap",
                Api::<ConfigMap>::namespaced(client.clone(), namespace),
                watcher::Config::default(),
                config_maps.clone(),
                None,
                cancel.clone(),
            ),
        ];

        let mut unsynced = None;
        for informer in informers.iter_mut() {
            let synced = tokio::time::timeout(CACHE_SYNC_TIMEOUT, informer.wait_for_sync())
                .await
                .unwrap_or(false);
            if !synced {
                unsynced = Some(informer.kind());
                break;
            }
        }
        if let Some(kind) = unsynced {
            cancel.cancel();
            for informer in informers {
                informer.join().await;
            }
            return Err(Error::ControllerGroup(format!(
                "failed waiting for {kind} cache to sync in namespace {namespace}"
            )));
        }
        debug!(namespace = %namespace, "Informer caches synced");

        let mut workers = Vec::new();
        for _ in 0..config.pgtask_worker_count {
            workers.push(tokio::spawn(pgtasks.clone().run_worker()));
        }
        for _ in 0..config.configmap_worker_count {
            workers.push(tokio::spawn(config_maps.clone().run_worker()));
        }
        workers.push(tokio::spawn(
            config_maps
                .clone()
                .run_resync(config.controller_group_refresh_interval),
        ));

        info!(
            namespace = %namespace,
            informers = informers.len(),
            workers = workers.len(),
            "Controller group started"
        );
        self.running = Some(Running {
            ctx,
            informers,
            queues: vec![pgtasks.queue().clone(), config_maps.queue().clone()],
            workers,
        });
        Ok(())
    }

    /// Stop watching, shut the queues down and wait for every worker to return
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            debug!(namespace = %self.namespace, "Controller group was never started, skipping shutdown");
            return;
        };

        running.ctx.cancel.cancel();
        for queue in &running.queues {
            queue.shut_down();
        }

        debug!(
            namespace = %self.namespace,
            workers = running.workers.len(),
            "Waiting for controller group workers to shut down"
        );
        for worker in running.workers {
            if let Err(e) = worker.await {
                warn!(namespace = %self.namespace, error = %e, "Worker task failed");
            }
        }
        for informer in running.informers {
            informer.join().await;
        }
        info!(namespace = %self.namespace, "Controller group stopped");
    }
}
