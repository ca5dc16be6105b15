//! Pgpolicy event handler

use std::sync::Arc;

use async_trait::async_trait;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use super::informer::EventHandler;
use super::{observe, GroupContext};
use crate::crd::{Pgpolicy, POLICY_STATE_PROCESSED};
use crate::error::Result;
use crate::events::EventKind;
use crate::kubeapi;

/// Marks new policies processed and announces them
pub struct PgpolicyHandler {
    ctx: Arc<GroupContext>,
}

impl PgpolicyHandler {
    pub fn new(ctx: Arc<GroupContext>) -> Self {
        Self { ctx }
    }

    async fn process(&self, policy: &Pgpolicy) -> Result<()> {
        let namespace = policy.namespace().unwrap_or_else(|| self.ctx.namespace.clone());
        let name = policy.name_any();

        let api: Api<Pgpolicy> = self.ctx.api(&namespace);
        let patch = json!({
            "status": {
                "state": POLICY_STATE_PROCESSED,
                "message": "Successfully processed Pgpolicy by controller"
            }
        });
        kubeapi::merge_patch_status(&api, &name, &patch).await?;

        self.ctx
            .events()
            .publish(&namespace, EventKind::CreatePolicy { policy: name.clone() })
            .await;
        info!(policy = %name, namespace = %namespace, "Processed policy");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<Pgpolicy> for PgpolicyHandler {
    async fn on_add(&self, policy: Arc<Pgpolicy>) {
        if policy.is_processed() {
            debug!(policy = %policy.name_any(), "Policy already processed");
            return;
        }
        observe("pgpolicy", self.process(&policy)).await;
    }
}
