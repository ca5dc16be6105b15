//! PGHA ConfigMap controller
//!
//! The DCS configuration users edit in `<cluster>-pgha-config` is pushed into the `config`
//! annotation Patroni reads from `<scope>-config`. Patroni's own `pause` flag is kept as is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, ResourceExt};
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, instrument, warn};

use super::informer::EventHandler;
use super::workqueue::{object_key, split_key, WorkQueue};
use super::GroupContext;
use crate::config::labels;
use crate::crd::{ClusterLifecycle, Pgcluster};
use crate::error::{Error, Result};
use crate::kubeapi::{self, Merge7386};
use crate::metrics;
use crate::operator::cluster::DCS_CONFIG_ANNOTATION;

/// Keys Patroni manages itself and that are never overwritten from the PGHA ConfigMap
const LIVE_ONLY_KEYS: &[&str] = &["pause"];

fn without_live_keys(dcs: &Value) -> Value {
    let mut dcs = dcs.clone();
    if let Some(map) = dcs.as_object_mut() {
        for key in LIVE_ONLY_KEYS {
            map.remove(*key);
        }
    }
    dcs
}

/// DCS document to write to the live annotation, `None` when it is already up to date
pub fn desired_dcs(desired: &Value, live: &Value) -> Option<Value> {
    if without_live_keys(desired) == without_live_keys(live) {
        return None;
    }
    let mut merged = desired.clone();
    if let (Some(target), Some(source)) = (merged.as_object_mut(), live.as_object()) {
        for key in LIVE_ONLY_KEYS {
            if let Some(value) = source.get(*key) {
                target.insert(key.to_string(), value.clone());
            }
        }
    }
    Some(merged)
}

/// Syncs PGHA ConfigMaps through a rate limited work queue
pub struct ConfigMapController {
    ctx: Arc<GroupContext>,
    queue: Arc<WorkQueue>,
}

impl ConfigMapController {
    pub fn new(ctx: Arc<GroupContext>) -> Arc<Self> {
        let queue = WorkQueue::new("configmap", &ctx.namespace);
        Arc::new(Self { ctx, queue })
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub async fn run_worker(self: Arc<Self>) {
        while self.process_next_item().await {}
        debug!(namespace = %self.ctx.namespace, "ConfigMap worker stopped");
    }

    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let _timer = metrics::HANDLER_DURATION
            .with_label_values(&["configmap"])
            .start_timer();
        metrics::HANDLER_INVOCATIONS.with_label_values(&["configmap"]).inc();

        match self.sync(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                metrics::HANDLER_ERRORS.with_label_values(&["configmap"]).inc();
                error!(key = %key, error = %e, "Error syncing ConfigMap, will requeue");
                self.queue.add_rate_limited(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    /// Re-queue every PGHA ConfigMap of the namespace each `period` until the group stops
    pub async fn run_resync(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately and the informer already delivered everything
        ticker.tick().await;

        let config_maps: Api<ConfigMap> = self.ctx.api(&self.ctx.namespace);
        let params = kubeapi::selector(labels::LABEL_PGHA_CONFIGMAP);
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match config_maps.list(&params).await {
                Ok(list) => list.items.iter().for_each(|cm| self.enqueue(cm)),
                Err(e) => warn!(namespace = %self.ctx.namespace, error = %e, "Unable to resync PGHA ConfigMaps"),
            }
        }
        debug!(namespace = %self.ctx.namespace, "ConfigMap resync stopped");
    }

    fn enqueue(&self, config_map: &ConfigMap) {
        if !config_map.labels().contains_key(labels::LABEL_PGHA_CONFIGMAP) {
            return;
        }
        if let Some(key) = object_key(config_map) {
            self.queue.add(&key);
        }
    }

    #[instrument(skip(self))]
    async fn sync(&self, key: &str) -> Result<()> {
        let (namespace, name) =
            split_key(key).ok_or_else(|| Error::validation(format!("invalid key {key}")))?;

        let config_maps: Api<ConfigMap> = self.ctx.api(namespace);
        let Some(pgha) = config_maps.get_opt(name).await? else {
            debug!("ConfigMap no longer exists");
            return Ok(());
        };
        let Some(cluster_name) = pgha.labels().get(labels::LABEL_PG_CLUSTER).cloned() else {
            return Ok(());
        };

        let clusters: Api<Pgcluster> = self.ctx.api(namespace);
        let Some(cluster) = clusters.get_opt(&cluster_name).await? else {
            debug!(cluster = %cluster_name, "Cluster not found, skipping sync");
            return Ok(());
        };
        if cluster.lifecycle() != ClusterLifecycle::Initialized || cluster.awaiting_upgrade() {
            debug!(cluster = %cluster_name, state = %cluster.lifecycle(), "Cluster not ready for config sync");
            return Ok(());
        }

        let dcs_name = labels::dcs_configmap_name(&cluster.pgha_scope());
        let dcs_map = config_maps.get(&dcs_name).await?;
        let live: Value = dcs_map
            .annotations()
            .get(DCS_CONFIG_ANNOTATION)
            .ok_or_else(|| Error::not_found(format!("{DCS_CONFIG_ANNOTATION} annotation on {dcs_name}")))
            .and_then(|raw| Ok(serde_json::from_str(raw)?))?;

        let data_key = labels::dcs_config_key(&cluster_name);
        let desired = pgha.data.as_ref().and_then(|d| d.get(&data_key));

        match desired {
            Some(yaml) => {
                let desired: Value = serde_yaml::from_str(yaml)?;
                let Some(merged) = desired_dcs(&desired, &live) else {
                    debug!(cluster = %cluster_name, "DCS config up to date");
                    return Ok(());
                };
                let mut patch = Merge7386::new();
                patch.add(
                    &["metadata", "annotations", DCS_CONFIG_ANNOTATION],
                    serde_json::to_string(&merged)?,
                );
                kubeapi::merge_patch(&config_maps, &dcs_name, &patch.to_value()).await?;
                debug!(cluster = %cluster_name, "Applied DCS config");
            }
            None => {
                // seed the user facing copy from what Patroni runs with
                let mut patch = Merge7386::new();
                patch.add(&["data", data_key.as_str()], serde_yaml::to_string(&live)?);
                kubeapi::merge_patch(&config_maps, name, &patch.to_value()).await?;
                debug!(cluster = %cluster_name, "Refreshed DCS config from the cluster");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<ConfigMap> for ConfigMapController {
    async fn on_add(&self, config_map: Arc<ConfigMap>) {
        self.enqueue(&config_map);
    }

    async fn on_update(&self, _old: Arc<ConfigMap>, new: Arc<ConfigMap>) {
        self.enqueue(&new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_desired_dcs_keeps_live_pause() {
        let desired = json!({"ttl": 30, "loop_wait": 10});
        let live = json!({"ttl": 20, "loop_wait": 10, "pause": true});
        let merged = desired_dcs(&desired, &live).unwrap();
        assert_eq!(merged, json!({"ttl": 30, "loop_wait": 10, "pause": true}));
    }

    #[test]
    fn test_desired_dcs_up_to_date_ignores_pause() {
        let desired = json!({"ttl": 30});
        let live = json!({"ttl": 30, "pause": true});
        assert_eq!(desired_dcs(&desired, &live), None);
    }
}
