//! Controller manager
//!
//! Keeps one [`ControllerGroup`] per managed namespace. A group only runs while the
//! operator can list every resource its informers watch; a group that loses those
//! privileges is torn down on the next refresh and started again once they return.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::ControllerGroup;
use super::{rbac, Context, GroupContext};
use crate::config::labels;
use crate::error::{Error, Result};
use crate::metrics;
use crate::ns::{AccessPrivs, NamespaceOperatingMode, NamespaceResolver};
use crate::operator::upgrade;

/// What `run_group` does with a group, given whether it runs and may list its resources
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupAction {
    /// Already running with the privileges it needs
    KeepRunning,
    /// Running but no longer privileged, remove it
    Revoke,
    /// Not running and not privileged, leave it stopped
    Deny,
    /// Not running and privileged, start it
    Start,
}

pub fn group_action(started: bool, privileged: bool) -> GroupAction {
    match (started, privileged) {
        (true, true) => GroupAction::KeepRunning,
        (true, false) => GroupAction::Revoke,
        (false, false) => GroupAction::Deny,
        (false, true) => GroupAction::Start,
    }
}

/// `list` privileges a group needs, keyed by API group
pub fn lister_privs() -> BTreeMap<&'static str, AccessPrivs> {
    let list = |resources: &[&'static str]| -> AccessPrivs {
        resources.iter().map(|r| (*r, vec!["list"])).collect()
    };
    BTreeMap::from([
        (
            labels::API_GROUP,
            list(&["pgtasks", "pgclusters", "pgreplicas", "pgpolicies"]),
        ),
        ("", list(&["pods", "configmaps"])),
        ("batch", list(&["jobs"])),
    ])
}

/// Owns the controller groups of every managed namespace
pub struct ControllerManager {
    context: Arc<Context>,
    resolver: NamespaceResolver,
    mode: NamespaceOperatingMode,
    groups: Mutex<HashMap<String, ControllerGroup>>,
    clean_permit: Semaphore,
}

impl ControllerManager {
    /// Create a manager holding a stopped group for each of `namespaces`
    pub async fn new(
        context: Arc<Context>,
        resolver: NamespaceResolver,
        mode: NamespaceOperatingMode,
        namespaces: &[String],
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            context,
            resolver,
            mode,
            groups: Mutex::new(HashMap::new()),
            clean_permit: Semaphore::new(1),
        });
        for namespace in namespaces {
            manager.add_group(namespace).await;
        }
        debug!(namespaces = ?namespaces, "Controller manager created");
        manager
    }

    pub fn mode(&self) -> NamespaceOperatingMode {
        self.mode
    }

    /// Register a stopped group for `namespace`; a no-op when one exists
    pub async fn add_group(&self, namespace: &str) {
        let mut groups = self.groups.lock().await;
        self.insert_group(&mut groups, namespace).await;
    }

    /// Register `namespace` if needed and start its group
    pub async fn add_and_run_group(&self, namespace: &str) -> Result<()> {
        let mut groups = self.groups.lock().await;
        if groups.contains_key(namespace) {
            self.reconcile_rbac(namespace).await;
        } else {
            self.insert_group(&mut groups, namespace).await;
        }
        self.run_locked(&mut groups, namespace).await
    }

    /// Start the group of `namespace`, if one is registered
    pub async fn run_group(&self, namespace: &str) -> Result<()> {
        let mut groups = self.groups.lock().await;
        if !groups.contains_key(namespace) {
            debug!(namespace = %namespace, "No controller group registered, nothing to run");
            return Ok(());
        }
        self.run_locked(&mut groups, namespace).await
    }

    /// Start every registered group, stopping at the first failure
    pub async fn run_all(&self) -> Result<()> {
        let mut groups = self.groups.lock().await;
        let namespaces: Vec<String> = groups.keys().cloned().collect();
        for namespace in namespaces {
            self.run_locked(&mut groups, &namespace).await?;
        }
        debug!("All controller groups are running");
        Ok(())
    }

    /// Stop and forget the group of `namespace`
    pub async fn remove_group(&self, namespace: &str) {
        let mut groups = self.groups.lock().await;
        Self::remove_locked(&mut groups, namespace).await;
    }

    /// Stop and forget every group
    pub async fn remove_all(&self) {
        let mut groups = self.groups.lock().await;
        let namespaces: Vec<String> = groups.keys().cloned().collect();
        for namespace in namespaces {
            Self::remove_locked(&mut groups, &namespace).await;
        }
        debug!("All controller groups removed");
    }

    /// Namespaces with a registered group, sorted
    pub async fn namespaces(&self) -> Vec<String> {
        let mut namespaces: Vec<String> = self.groups.lock().await.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    /// Remove the groups of namespaces this installation no longer owns
    ///
    /// `namespace` names the caller in the error returned when another clean is running.
    pub async fn clean(&self, namespace: &str) -> Result<()> {
        let Ok(_permit) = self.clean_permit.try_acquire() else {
            return Err(Error::ControllerGroup(format!(
                "controller group clean already in progress, namespace {namespace} will not clean"
            )));
        };

        let current = self.resolver.current_namespace_list(self.mode).await?;
        let mut groups = self.groups.lock().await;
        let stale: Vec<String> = groups
            .keys()
            .filter(|ns| !current.contains(ns))
            .cloned()
            .collect();
        for namespace in stale {
            info!(namespace = %namespace, "Namespace no longer owned by this installation, removing its controller group");
            Self::remove_locked(&mut groups, &namespace).await;
        }
        Ok(())
    }

    /// Periodically re-check the privileges of every group, dropping unowned namespaces
    /// first when namespace membership can change
    pub async fn run_refresh(self: Arc<Self>, cancel: CancellationToken) {
        let period = self.context.config.controller_group_refresh_interval;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            debug!("Refreshing controller groups");
            if self.mode.watches_namespaces() {
                if let Err(e) = self.clean(&self.context.config.operator_namespace).await {
                    warn!(error = %e, "Unable to clean controller groups");
                }
            }
            for namespace in self.namespaces().await {
                if let Err(e) = self.run_group(&namespace).await {
                    error!(namespace = %namespace, error = %e, "Unable to run controller group");
                }
            }
        }
        debug!("Controller group refresh stopped");
    }

    async fn insert_group(&self, groups: &mut HashMap<String, ControllerGroup>, namespace: &str) {
        if groups.contains_key(namespace) {
            debug!(namespace = %namespace, "Controller group already exists");
            return;
        }
        groups.insert(
            namespace.to_string(),
            ControllerGroup::new(self.context.clone(), namespace),
        );
        debug!(namespace = %namespace, "Added controller group");
        self.reconcile_rbac(namespace).await;
    }

    async fn reconcile_rbac(&self, namespace: &str) {
        if self.context.config.disable_reconcile_rbac {
            return;
        }
        rbac::reconcile_rbac(
            &self.context.client,
            &self.context.config.operator_namespace,
            namespace,
        )
        .await;
    }

    /// Whether the operator may list every resource a group watches in `namespace`
    ///
    /// Every privilege is checked so each missing one gets logged.
    async fn has_lister_privs(&self, namespace: &str) -> bool {
        let mut privileged = true;
        for (api_group, privs) in lister_privs() {
            for (resource, verbs) in privs {
                let single: AccessPrivs = BTreeMap::from([(resource, verbs)]);
                match self
                    .resolver
                    .check_access_privs(&single, api_group, Some(namespace))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            namespace = %namespace,
                            resource = %resource,
                            api_group = %api_group,
                            "Controller group does not have the required list privileges"
                        );
                        privileged = false;
                    }
                    Err(e) => {
                        error!(namespace = %namespace, resource = %resource, error = %e, "Access review failed");
                        privileged = false;
                    }
                }
            }
        }
        privileged
    }

    async fn run_locked(
        &self,
        groups: &mut HashMap<String, ControllerGroup>,
        namespace: &str,
    ) -> Result<()> {
        let Some(group) = groups.get_mut(namespace) else {
            return Ok(());
        };
        let privileged = self.has_lister_privs(namespace).await;

        match group_action(group.is_started(), privileged) {
            GroupAction::KeepRunning => {
                debug!(namespace = %namespace, "Controller group is already running");
                return Ok(());
            }
            GroupAction::Revoke => {
                Self::remove_locked(groups, namespace).await;
                return Err(Error::AccessDenied(format!(
                    "removing the running controller group for namespace {namespace} because it no longer has the required privileges, will attempt to restart on the next refresh"
                )));
            }
            GroupAction::Deny => {
                return Err(Error::AccessDenied(format!(
                    "cannot start controller group for namespace {namespace} because it does not have the required privileges, will attempt to start on the next refresh"
                )));
            }
            GroupAction::Start => {}
        }

        let checker = GroupContext::standalone(self.context.clone(), namespace);
        if let Err(e) = upgrade::check_version(&checker, namespace).await {
            error!(namespace = %namespace, error = %e, "Version check failed, the controller group will not be started");
            return Err(e);
        }

        group.start().await?;
        Self::record_groups(groups);
        info!(namespace = %namespace, "Controller group is now running");
        Ok(())
    }

    async fn remove_locked(groups: &mut HashMap<String, ControllerGroup>, namespace: &str) {
        let Some(mut group) = groups.remove(namespace) else {
            debug!(namespace = %namespace, "No controller group to remove");
            return;
        };
        group.stop().await;
        Self::record_groups(groups);
        info!(namespace = %namespace, "Controller group removed");
    }

    fn record_groups(groups: &HashMap<String, ControllerGroup>) {
        let running = groups.values().filter(|g| g.is_started()).count();
        metrics::CONTROLLER_GROUPS.set(running as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lister_privs_cover_every_watched_kind() {
        let privs = lister_privs();
        let resources: Vec<&str> = privs.values().flat_map(|p| p.keys().copied()).collect();
        for kind in ["pgtasks", "pgclusters", "pgreplicas", "pgpolicies", "pods", "configmaps", "jobs"] {
            assert!(resources.contains(&kind), "missing {kind}");
        }
        assert!(privs
            .values()
            .flat_map(|p| p.values())
            .all(|verbs| verbs == &vec!["list"]));
    }
}
