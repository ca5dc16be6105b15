//! Pgtask work queue controller
//!
//! A task is marked `processed` before its operation runs. Redelivery of a processed task,
//! from a relist or an operator restart, is dropped, so each task runs at most once.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::informer::EventHandler;
use super::workqueue::{object_key, split_key, WorkQueue};
use super::{observe, GroupContext};
use crate::crd::{Pgtask, PgtaskState, TaskKind};
use crate::error::Result;
use crate::kubeapi;
use crate::metrics;
use crate::operator::task;

const PROCESSED_MESSAGE: &str = "Successfully processed Pgtask by controller";

/// Queues new Pgtasks and runs them on a pool of workers
pub struct PgtaskController {
    ctx: Arc<GroupContext>,
    queue: Arc<WorkQueue>,
}

impl PgtaskController {
    pub fn new(ctx: Arc<GroupContext>) -> Arc<Self> {
        let queue = WorkQueue::new("pgtask", &ctx.namespace);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Process keys until the queue shuts down
    pub async fn run_worker(self: Arc<Self>) {
        while self.process_next_item().await {}
        debug!(namespace = %self.ctx.namespace, "Pgtask worker stopped");
    }

    /// Handle one key; `false` once the queue is shut down
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        self.process(&key).await;
        self.queue.forget(&key);
        self.queue.done(&key);
        true
    }

    #[instrument(skip(self))]
    async fn process(&self, key: &str) {
        let Some((namespace, name)) = split_key(key) else {
            error!("Invalid work queue key");
            return;
        };
        let api: Api<Pgtask> = self.ctx.api(namespace);

        let live = match api.get_opt(name).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("Pgtask no longer exists");
                return;
            }
            Err(e) => {
                error!(error = %e, "Unable to read Pgtask");
                return;
            }
        };
        if live.is_processed() {
            debug!(state = ?live.state(), "Pgtask already processed");
            return;
        }

        let kind = match TaskKind::of(&live) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(task_type = %live.spec.task_type, error = %e, "Ignoring Pgtask");
                return;
            }
        };

        if let Err(e) = mark_processed(&api, name).await {
            error!(error = %e, "Unable to mark Pgtask processed");
            return;
        }

        if kind == TaskKind::DeleteData && live.delete_data_started() {
            info!("Data removal already started for this task");
            return;
        }

        info!(kind = %kind, "Dispatching Pgtask");
        metrics::TASKS_DISPATCHED.with_label_values(&[kind.name()]).inc();
        observe("pgtask", task::execute(&self.ctx, namespace, &kind, &live)).await;
    }
}

async fn mark_processed(api: &Api<Pgtask>, name: &str) -> Result<()> {
    let patch = json!({
        "status": { "state": PgtaskState::Processed, "message": PROCESSED_MESSAGE }
    });
    kubeapi::merge_patch_status(api, name, &patch).await?;
    Ok(())
}

#[async_trait]
impl EventHandler<Pgtask> for PgtaskController {
    async fn on_add(&self, task: Arc<Pgtask>) {
        if task.is_processed() {
            debug!(task = %task.name_any(), "Skipping processed Pgtask");
            return;
        }
        if let Some(key) = object_key(task.as_ref()) {
            self.queue.add(&key);
        }
    }
}
