//! Cluster level workflows: initialization, scaling, autofailover and add-ons

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, ResourceExt};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::config::labels;
use crate::controllers::GroupContext;
use crate::crd::{ClusterLifecycle, Pgcluster, Pgreplica};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::kubeapi::{self, Merge7386, Poll};
use crate::lifecycle;
use crate::operator::manifests;

/// Key of the PGHA configMap telling the primary to run initialization
pub const PGHA_INIT_SETTING: &str = "init";
/// Annotation on the Patroni DCS configMap holding the dynamic configuration
pub const DCS_CONFIG_ANNOTATION: &str = "config";

const PASSWORD_LENGTH: usize = 24;
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
const ROLLOUT_POLL: Poll = Poll::new(Duration::from_secs(2), Duration::from_secs(300)).delayed();

/// Which kinds of cluster deployments a scale request touches
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScaleTargets {
    pub primary: bool,
    pub replicas: bool,
    pub backrest_repo: bool,
    pub pgbouncer: bool,
}

impl ScaleTargets {
    pub const PRIMARY: Self = Self {
        primary: true,
        replicas: false,
        backrest_repo: false,
        pgbouncer: false,
    };

    pub const REPLICAS: Self = Self {
        primary: false,
        replicas: true,
        backrest_repo: false,
        pgbouncer: false,
    };

    pub const INSTANCES: Self = Self {
        primary: true,
        replicas: true,
        backrest_repo: false,
        pgbouncer: false,
    };
}

/// Role a deployment plays in a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentRole {
    Primary,
    PgBouncer,
    BackrestRepo,
    Replica,
}

/// Classify a deployment of `cluster`
pub fn classify_deployment(deployment: &Deployment, cluster: &Pgcluster) -> DeploymentRole {
    let deployment_labels = deployment.labels();
    let is_true = |key: &str| deployment_labels.get(key).map(String::as_str) == Some(labels::LABEL_TRUE);

    if deployment.name_any() == cluster.current_primary() {
        DeploymentRole::Primary
    } else if is_true(labels::LABEL_PGBOUNCER) {
        DeploymentRole::PgBouncer
    } else if is_true(labels::LABEL_PGO_BACKREST_REPO) {
        DeploymentRole::BackrestRepo
    } else {
        DeploymentRole::Replica
    }
}

/// Replica count to apply to a deployment of the given role, `None` to leave it alone
pub fn scale_for(
    role: DeploymentRole,
    targets: ScaleTargets,
    replicas: i32,
    cluster: &Pgcluster,
) -> Option<i32> {
    match role {
        DeploymentRole::Primary => targets.primary.then_some(replicas),
        DeploymentRole::Replica => targets.replicas.then_some(replicas),
        DeploymentRole::BackrestRepo => targets.backrest_repo.then_some(replicas),
        DeploymentRole::PgBouncer if targets.pgbouncer => {
            if replicas > 0 {
                Some(cluster.spec.pg_bouncer.replicas)
            } else {
                Some(0)
            }
        }
        DeploymentRole::PgBouncer => None,
    }
}

/// Deployments found while scaling, by role
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScaledDeployments {
    pub primary: Option<String>,
    pub replicas: Vec<String>,
    pub backrest_repo: Option<String>,
    pub pgbouncer: Option<String>,
}

/// Scale the selected deployments of a cluster to `replicas`
///
/// A failure to scale one deployment is logged and the next one is attempted.
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn scale_cluster_deployments(
    ctx: &GroupContext,
    cluster: &Pgcluster,
    replicas: i32,
    targets: ScaleTargets,
) -> Result<ScaledDeployments> {
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let api: Api<Deployment> = ctx.api(&namespace);
    let selector = labels::selector(&[(labels::LABEL_PG_CLUSTER, &cluster.name_any())]);

    let mut scaled = ScaledDeployments::default();
    for deployment in api.list(&kubeapi::selector(&selector)).await? {
        let name = deployment.name_any();
        let role = classify_deployment(&deployment, cluster);
        match role {
            DeploymentRole::Primary => scaled.primary = Some(name.clone()),
            DeploymentRole::PgBouncer => scaled.pgbouncer = Some(name.clone()),
            DeploymentRole::BackrestRepo => scaled.backrest_repo = Some(name.clone()),
            DeploymentRole::Replica => scaled.replicas.push(name.clone()),
        }

        let Some(count) = scale_for(role, targets, replicas, cluster) else {
            continue;
        };
        let mut patch = Merge7386::new();
        patch.add(&["spec", "replicas"], count);
        debug!(deployment = %name, replicas = count, "Scaling deployment");
        if let Err(e) = kubeapi::merge_patch(&api, &name, &patch.to_value()).await {
            warn!(deployment = %name, replicas = count, error = %e, "Error scaling deployment");
        }
    }
    Ok(scaled)
}

/// Move a cluster to `Initialized`
pub async fn set_initialized(ctx: &GroupContext, namespace: &str, cluster: &str) -> Result<()> {
    lifecycle::set_cluster_state(
        ctx.client(),
        namespace,
        cluster,
        ClusterLifecycle::Initialized,
        "Cluster has been initialized",
    )
    .await
}

/// Ask every replica of a cluster to start by annotating its Pgreplica
#[instrument(skip(ctx))]
pub async fn initialize_replica_creation(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &str,
) -> Result<()> {
    let names = ctx
        .select_names::<Pgreplica>(
            &ctx.index.replicas,
            namespace,
            &[(labels::LABEL_PG_CLUSTER, cluster)],
        )
        .await?;

    let api: Api<Pgreplica> = ctx.api(namespace);
    let mut patch = Merge7386::new();
    patch.add(
        &["metadata", "annotations", labels::ANNOTATION_PGHA_BOOTSTRAP_REPLICA],
        labels::LABEL_TRUE,
    );

    for name in names {
        match kubeapi::merge_patch(&api, &name, &patch.to_value()).await {
            Ok(_) => debug!(replica = %name, "Replica creation initialized"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Record the deployment now running the primary
pub async fn set_current_primary(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &Pgcluster,
    deployment: &str,
) -> Result<()> {
    if cluster.current_primary() == deployment {
        return Ok(());
    }
    let api: Api<Pgcluster> = ctx.api(namespace);
    let mut patch = Merge7386::new();
    patch.add(
        &["metadata", "annotations", labels::ANNOTATION_CURRENT_PRIMARY],
        deployment,
    );
    kubeapi::merge_patch(&api, &cluster.name_any(), &patch.to_value()).await?;
    info!(cluster = %cluster.name_any(), primary = %deployment, "Updated current primary");
    Ok(())
}

/// Set or clear Patroni's `pause` flag in a DCS configuration document
pub fn set_pause(dcs: &mut Value, enable_autofail: bool) {
    if !dcs.is_object() {
        *dcs = json!({});
    }
    if let Some(map) = dcs.as_object_mut() {
        if enable_autofail {
            map.remove("pause");
        } else {
            map.insert("pause".to_string(), Value::Bool(true));
        }
    }
}

/// Enable or pause Patroni autofailover for a cluster
///
/// Returns `false` without changing anything when Patroni has not yet written its
/// configuration annotation, e.g. for a cluster that never finished bootstrapping.
#[instrument(skip(ctx))]
pub async fn toggle_autofailover(
    ctx: &GroupContext,
    namespace: &str,
    pgha_scope: &str,
    enable: bool,
) -> Result<bool> {
    let api: Api<ConfigMap> = ctx.api(namespace);
    let name = labels::dcs_configmap_name(pgha_scope);
    let config_map = api.get(&name).await?;

    let Some(raw) = config_map.annotations().get(DCS_CONFIG_ANNOTATION) else {
        debug!(configmap = %name, "No DCS configuration annotation yet");
        return Ok(false);
    };
    let mut dcs: Value = serde_json::from_str(raw).unwrap_or_else(|_| json!({}));
    set_pause(&mut dcs, enable);

    let mut patch = Merge7386::new();
    patch.add(
        &["metadata", "annotations", DCS_CONFIG_ANNOTATION],
        serde_json::to_string(&dcs)?,
    );
    kubeapi::merge_patch(&api, &name, &patch.to_value()).await?;
    info!(scope = %pgha_scope, enabled = enable, "Toggled autofailover");
    Ok(true)
}

/// Set the `init` flag of a cluster's PGHA configMap
pub async fn update_pgha_init_flag(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &str,
    init: bool,
) -> Result<()> {
    let api: Api<ConfigMap> = ctx.api(namespace);
    let selector = labels::selector(&[
        (labels::LABEL_PG_CLUSTER, cluster),
        (labels::LABEL_PGHA_CONFIGMAP, labels::LABEL_TRUE),
    ]);
    let found = api.list(&kubeapi::selector(&selector)).await?;
    let config_map = match found.items.as_slice() {
        [one] => one,
        [] => {
            return Err(Error::not_found(format!(
                "no pgha configMap for cluster {cluster} using selector {selector}"
            )))
        }
        _ => {
            return Err(Error::validation(format!(
                "more than one pgha configMap for cluster {cluster} using selector {selector}"
            )))
        }
    };

    let mut patch = Merge7386::new();
    patch.add(&["data", PGHA_INIT_SETTING], init.to_string());
    kubeapi::merge_patch(&api, &config_map.name_any(), &patch.to_value()).await?;
    debug!(cluster = %cluster, init, "Updated pgha init flag");
    Ok(())
}

/// The running primary pod of a cluster
pub async fn primary_pod(ctx: &GroupContext, namespace: &str, cluster: &str) -> Result<Pod> {
    let api: Api<Pod> = ctx.api(namespace);
    let params = ListParams::default()
        .labels(&labels::selector(&[
            (labels::LABEL_PG_CLUSTER, cluster),
            (labels::LABEL_PGHA_ROLE, labels::LABEL_PGHA_ROLE_PRIMARY),
        ]))
        .fields("status.phase=Running");
    let mut pods = api.list(&params).await?.items;
    if pods.len() > 1 {
        warn!(cluster = %cluster, count = pods.len(), "More than one primary pod found");
    }
    if pods.is_empty() {
        return Err(Error::not_found(format!("primary pod for cluster {cluster}")));
    }
    Ok(pods.swap_remove(0))
}

fn first_container(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
        .unwrap_or_else(|| labels::CONTAINER_DATABASE.to_string())
}

/// Clear the `primary_on_role_change` tag in the DCS through the primary's Patroni API
#[instrument(skip(ctx))]
pub async fn remove_primary_on_role_change_tag(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &str,
) -> Result<()> {
    let pod = primary_pod(ctx, namespace, cluster).await?;
    let command = vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        format!(
            "curl -s 127.0.0.1:{}/config -XPATCH -d '{{\"tags\":{{\"primary_on_role_change\":null}}}}'",
            labels::PATRONI_PORT
        ),
    ];
    kubeapi::exec(ctx.client(), namespace, &pod.name_any(), &first_container(&pod), command).await?;
    info!(cluster = %cluster, "Removed primary_on_role_change tag");
    Ok(())
}

/// What adding a new cluster starts with
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddAction {
    /// Already past creation, or paused
    Skip,
    /// Restore from the named cluster's repository
    Bootstrap(String),
    /// Create the cluster's own volumes, deployments and repository
    Create,
}

/// Decide how a newly observed cluster is set up
pub fn add_action(cluster: &Pgcluster) -> AddAction {
    if cluster.reconcile_paused() || cluster.lifecycle() != ClusterLifecycle::Creating {
        return AddAction::Skip;
    }
    match cluster.spec.pg_data_source.restore_from.as_str() {
        "" => AddAction::Create,
        source => AddAction::Bootstrap(source.to_string()),
    }
}

/// Start the repository a new cluster bootstraps from
///
/// Returns `true` when a repository was created; the pod handler starts the bootstrap once
/// it is ready. When the source cluster's repository is already running the bootstrap can
/// begin right away.
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn add_bootstrap_repo(ctx: &GroupContext, cluster: &Pgcluster) -> Result<bool> {
    let source = cluster.spec.pg_data_source.restore_from.as_str();
    let namespace = cluster.bootstrap_namespace();
    let repo_name = labels::backrest_repo_name(source);
    let deployments: Api<Deployment> = ctx.api(&namespace);

    if let Some(existing) = deployments.get_opt(&repo_name).await? {
        if existing.labels().contains_key(labels::LABEL_PGHA_BOOTSTRAP) {
            return Err(Error::validation(format!(
                "repository {repo_name} is already running to bootstrap another cluster"
            )));
        }
        debug!(repo = %repo_name, "Source repository already running");
        return Ok(false);
    }

    let (deployment, service) = manifests::backrest_repo(ctx.config(), cluster, source, &namespace, true);
    create_tolerating_existing(&deployments, &deployment).await?;
    let services: Api<Service> = ctx.api(&namespace);
    create_tolerating_existing(&services, &service).await?;
    info!(repo = %repo_name, namespace = %namespace, "Created bootstrap repository");
    Ok(true)
}

/// Create the volumes, primary and pgBackRest repository of a new cluster
///
/// The primary starts scaled to zero and is brought up once the repository is ready.
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn add_cluster_base(ctx: &GroupContext, cluster: &Pgcluster) -> Result<()> {
    let result = create_base(ctx, cluster).await;
    if let Err(e) = &result {
        publish_create_failure(ctx, cluster, &e.to_string()).await;
    }
    result
}

async fn create_base(ctx: &GroupContext, cluster: &Pgcluster) -> Result<()> {
    let name = cluster.cluster_name();
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace.clone());

    ensure_pgha_configmap(ctx, &namespace, &name).await?;

    let pvcs: Api<PersistentVolumeClaim> = ctx.api(&namespace);
    let data = manifests::pvc(&name, &namespace, &name, &cluster.spec.primary_storage);
    create_tolerating_existing(&pvcs, &data).await?;
    let repo = manifests::pvc(
        &labels::backrest_repo_pvc_name(&name),
        &namespace,
        &name,
        &cluster.spec.backrest_storage,
    );
    create_tolerating_existing(&pvcs, &repo).await?;

    let deployments: Api<Deployment> = ctx.api(&namespace);
    let services: Api<Service> = ctx.api(&namespace);
    for (deployment, service) in [
        manifests::primary(ctx.config(), cluster, &namespace),
        manifests::backrest_repo(ctx.config(), cluster, &name, &namespace, false),
    ] {
        create_tolerating_existing(&deployments, &deployment).await?;
        create_tolerating_existing(&services, &service).await?;
    }

    info!(cluster = %name, "Created cluster volumes, primary and repository");
    Ok(())
}

/// Start bootstrapping a cluster from an existing repository
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn add_cluster_bootstrap(ctx: &GroupContext, cluster: &Pgcluster) -> Result<()> {
    let result = bootstrap(ctx, cluster).await;
    if let Err(e) = &result {
        publish_create_failure(ctx, cluster, &e.to_string()).await;
    }
    result
}

async fn bootstrap(ctx: &GroupContext, cluster: &Pgcluster) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace.clone());

    ensure_pgha_configmap(ctx, &namespace, &name).await?;

    let jobs: Api<k8s_openapi::api::batch::v1::Job> = ctx.api(&namespace);
    let job = manifests::bootstrap_job(ctx.config(), cluster, &namespace);
    match jobs.create(&PostParams::default(), &job).await {
        Ok(_) => info!(cluster = %name, "Created bootstrap job"),
        Err(e) => {
            let e = Error::from(e);
            if !e.is_already_exists() {
                return Err(e);
            }
        }
    }

    lifecycle::set_cluster_state(
        ctx.client(),
        &namespace,
        &name,
        ClusterLifecycle::Bootstrapping,
        "Bootstapping cluster from an existing data source",
    )
    .await
}

async fn ensure_pgha_configmap(ctx: &GroupContext, namespace: &str, cluster: &str) -> Result<()> {
    let api: Api<ConfigMap> = ctx.api(namespace);
    let config_map = ConfigMap {
        metadata: ObjectMeta {
            name: Some(labels::pgha_configmap_name(cluster)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (labels::LABEL_VENDOR.to_string(), labels::LABEL_CRUNCHY.to_string()),
                (labels::LABEL_PG_CLUSTER.to_string(), cluster.to_string()),
                (labels::LABEL_PGHA_CONFIGMAP.to_string(), labels::LABEL_TRUE.to_string()),
            ])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            PGHA_INIT_SETTING.to_string(),
            labels::LABEL_TRUE.to_string(),
        )])),
        ..Default::default()
    };

    match api.create(&PostParams::default(), &config_map).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let e = Error::from(e);
            if e.is_already_exists() {
                info!(cluster = %cluster, "Found existing pgha configMap, setting init flag");
                update_pgha_init_flag(ctx, namespace, cluster, true).await
            } else {
                Err(e)
            }
        }
    }
}

/// Publish a cluster creation failure
pub async fn publish_create_failure(ctx: &GroupContext, cluster: &Pgcluster, error: &str) {
    let workflow_id = cluster
        .labels()
        .get(labels::LABEL_WORKFLOW_ID)
        .cloned()
        .unwrap_or_default();
    ctx.events()
        .publish(
            &cluster.namespace().unwrap_or_default(),
            EventKind::CreateClusterFailure {
                cluster: cluster.name_any(),
                error: error.to_string(),
                workflow_id,
            },
        )
        .await;
}

/// Random alphanumeric password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

async fn set_pgbouncer_role_password(
    ctx: &GroupContext,
    namespace: &str,
    cluster: &Pgcluster,
    password: &str,
) -> Result<()> {
    let pod = primary_pod(ctx, namespace, &cluster.name_any()).await?;
    let sql = format!(
        "DO $$ BEGIN \
           IF NOT EXISTS (SELECT FROM pg_roles WHERE rolname = 'pgbouncer') THEN \
             CREATE ROLE pgbouncer LOGIN; \
           END IF; \
         END $$; ALTER ROLE pgbouncer PASSWORD '{password}';"
    );
    let command = vec![
        "psql".to_string(),
        "-p".to_string(),
        cluster.port().to_string(),
        "-c".to_string(),
        sql,
    ];
    kubeapi::exec(ctx.client(), namespace, &pod.name_any(), labels::CONTAINER_DATABASE, command)
        .await?;
    Ok(())
}

/// Add pgBouncer to a cluster; an existing deployment is left untouched
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn add_pgbouncer(ctx: &GroupContext, cluster: &Pgcluster) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let deployments: Api<Deployment> = ctx.api(&namespace);
    if kubeapi::exists(&deployments, &labels::pgbouncer_name(&name)).await? {
        debug!(cluster = %name, "pgBouncer already deployed");
        return Ok(());
    }

    let secrets: Api<Secret> = ctx.api(&namespace);
    let secret_name = manifests::pgbouncer_secret_name(&name);
    let password = match secrets.get_opt(&secret_name).await? {
        Some(secret) => secret_password(&secret).unwrap_or_else(|| generate_password(PASSWORD_LENGTH)),
        None => {
            let password = generate_password(PASSWORD_LENGTH);
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(secret_name.clone()),
                    namespace: Some(namespace.clone()),
                    labels: Some(BTreeMap::from([
                        (labels::LABEL_VENDOR.to_string(), labels::LABEL_CRUNCHY.to_string()),
                        (labels::LABEL_PG_CLUSTER.to_string(), name.clone()),
                        (labels::LABEL_PGBOUNCER.to_string(), labels::LABEL_TRUE.to_string()),
                    ])),
                    ..Default::default()
                },
                string_data: Some(BTreeMap::from([
                    ("username".to_string(), "pgbouncer".to_string()),
                    ("password".to_string(), password.clone()),
                ])),
                ..Default::default()
            };
            secrets.create(&PostParams::default(), &secret).await?;
            password
        }
    };

    set_pgbouncer_role_password(ctx, &namespace, cluster, &password).await?;

    let (deployment, service) = manifests::pgbouncer(ctx.config(), cluster, &namespace);
    create_tolerating_existing(&deployments, &deployment).await?;
    let services: Api<Service> = ctx.api(&namespace);
    create_tolerating_existing(&services, &service).await?;
    info!(cluster = %name, "Added pgBouncer");
    Ok(())
}

fn secret_password(secret: &Secret) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get("password"))
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
}

/// Give the pgBouncer role a new password and roll the pgBouncer pods onto it
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn rotate_pgbouncer_password(ctx: &GroupContext, cluster: &Pgcluster) -> Result<()> {
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let password = generate_password(PASSWORD_LENGTH);

    set_pgbouncer_role_password(ctx, &namespace, cluster, &password).await?;

    let secrets: Api<Secret> = ctx.api(&namespace);
    let mut secret_patch = Merge7386::new();
    secret_patch.add(&["stringData", "password"], password);
    kubeapi::merge_patch(&secrets, &manifests::pgbouncer_secret_name(&name), &secret_patch.to_value())
        .await?;

    let deployments: Api<Deployment> = ctx.api(&namespace);
    kubeapi::merge_patch(&deployments, &labels::pgbouncer_name(&name), &restart_patch()).await?;
    info!(cluster = %name, "Rotated pgBouncer password");
    Ok(())
}

fn restart_patch() -> Value {
    let mut patch = Merge7386::new();
    patch.add(
        &["spec", "template", "metadata", "annotations", RESTARTED_AT_ANNOTATION],
        chrono::Utc::now().to_rfc3339(),
    );
    patch.to_value()
}

/// Whether a deployment has rolled out its latest template to every replica
pub fn rollout_complete(deployment: &Deployment) -> bool {
    let generation = deployment.metadata.generation.unwrap_or_default();
    let wanted = deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    status.observed_generation.unwrap_or_default() >= generation
        && status.updated_replicas.unwrap_or_default() >= wanted
        && status.ready_replicas.unwrap_or_default() >= wanted
        && status.replicas.unwrap_or_default() == wanted
}

/// Restart every instance of a cluster, replicas first and the primary last
///
/// Each deployment must finish its rollout before the next one is restarted.
#[instrument(skip(ctx, cluster), fields(cluster = %cluster.name_any()))]
pub async fn rolling_update(ctx: &GroupContext, cluster: &Pgcluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let api: Api<Deployment> = ctx.api(&namespace);
    let selector = format!(
        "{},{}",
        labels::selector(&[(labels::LABEL_PG_CLUSTER, &cluster.name_any())]),
        labels::LABEL_PG_DATABASE
    );

    let mut instances: Vec<Deployment> = api.list(&kubeapi::selector(&selector)).await?.items;
    instances.sort_by_key(|d| classify_deployment(d, cluster) == DeploymentRole::Primary);

    for deployment in instances {
        let name = deployment.name_any();
        kubeapi::merge_patch(&api, &name, &restart_patch()).await?;
        info!(deployment = %name, "Restarting instance");

        ROLLOUT_POLL
            .until(&ctx.cancel, &format!("rollout of deployment {name}"), || async {
                Ok(api.get_opt(&name).await?.as_ref().is_some_and(rollout_complete))
            })
            .await?;
    }
    Ok(())
}

/// Deploy pgAdmin for a cluster
pub async fn add_pgadmin(ctx: &GroupContext, cluster: &Pgcluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let (deployment, service) = manifests::pgadmin(ctx.config(), cluster, &namespace);
    let deployments: Api<Deployment> = ctx.api(&namespace);
    create_tolerating_existing(&deployments, &deployment).await?;
    let services: Api<Service> = ctx.api(&namespace);
    create_tolerating_existing(&services, &service).await?;
    info!(cluster = %cluster.name_any(), "Added pgAdmin");
    Ok(())
}

/// Remove pgAdmin from a cluster
pub async fn delete_pgadmin(ctx: &GroupContext, namespace: &str, cluster: &str) -> Result<()> {
    let name = manifests::pgadmin_name(cluster);
    let deployments: Api<Deployment> = ctx.api(namespace);
    kubeapi::delete_if_present(&deployments, &name, &DeleteParams::foreground()).await?;
    let services: Api<Service> = ctx.api(namespace);
    kubeapi::delete_if_present(&services, &name, &DeleteParams::default()).await?;
    info!(cluster = %cluster, "Deleted pgAdmin");
    Ok(())
}

async fn create_tolerating_existing<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + serde::Serialize + std::fmt::Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let e = Error::from(e);
            if e.is_already_exists() {
                Ok(())
            } else {
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_pause_toggles_flag() {
        let mut dcs = json!({"ttl": 30});
        set_pause(&mut dcs, false);
        assert_eq!(dcs["pause"], json!(true));
        set_pause(&mut dcs, true);
        assert!(dcs.get("pause").is_none());
        assert_eq!(dcs["ttl"], json!(30));
    }

    #[test]
    fn test_generate_password_is_alphanumeric() {
        let password = generate_password(PASSWORD_LENGTH);
        assert_eq!(password.len(), PASSWORD_LENGTH);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
