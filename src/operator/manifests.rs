//! Manifests for the Jobs, Deployments and Services the operator creates
//!
//! Every builder here is a pure function from its inputs to a Kubernetes object.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, Service, ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::config::{labels, OperatorConfig};
use crate::crd::{PgStorageSpec, Pgcluster, Pgtask};
use crate::operator::rmdata::Request;

pub const SERVICE_ACCOUNT_BACKREST: &str = "pgo-backrest";
pub const SERVICE_ACCOUNT_TARGET: &str = "pgo-target";
pub const SERVICE_ACCOUNT_PG: &str = "pgo-pg";
pub const SERVICE_ACCOUNT_DEFAULT: &str = "pgo-default";

const IMAGE_PGO_BACKREST: &str = "pgo-backrest";
const IMAGE_PGO_RMDATA: &str = "pgo-rmdata";
const IMAGE_PGO_BACKREST_REPO: &str = "pgo-backrest-repo";
const IMAGE_CRUNCHY_POSTGRES_HA: &str = "crunchy-postgres-ha";
const IMAGE_CRUNCHY_PGDUMP: &str = "crunchy-pgdump";
const IMAGE_CRUNCHY_PGRESTORE: &str = "crunchy-pgrestore";
const IMAGE_CRUNCHY_PGBOUNCER: &str = "crunchy-pgbouncer";
const IMAGE_CRUNCHY_PGADMIN: &str = "crunchy-pgadmin4";

const POSTGRES_PORT: i32 = 5432;
const BACKREST_REPO_PORT: i32 = 2022;
const PGBOUNCER_PORT: i32 = 5432;
const PGADMIN_PORT: i32 = 5050;

/// Shape shared by every one-shot Job the operator runs
#[derive(Clone, Debug, Default)]
pub struct JobTemplate {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub image: String,
    pub container: String,
    pub env: Vec<(String, String)>,
    pub service_account: String,
    pub backoff_limit: i32,
    pub tolerations: Vec<Toleration>,
}

impl JobTemplate {
    pub fn build(&self) -> Job {
        Job {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.labels.clone()),
                annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(self.backoff_limit),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.service_account.clone()),
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: self.container.clone(),
                            image: Some(self.image.clone()),
                            env: Some(env_vars(&self.env)),
                            ..Default::default()
                        }],
                        tolerations: (!self.tolerations.is_empty())
                            .then(|| self.tolerations.clone()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }
}

fn env_vars(pairs: &[(String, String)]) -> Vec<EnvVar> {
    pairs
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        })
        .collect()
}

fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn base_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::LABEL_VENDOR.to_string(), labels::LABEL_CRUNCHY.to_string()),
        (labels::LABEL_PG_CLUSTER.to_string(), cluster.to_string()),
    ])
}

/// `<prefix>/<name>:<tag>`
pub fn image(prefix: &str, name: &str, tag: &str) -> String {
    format!("{prefix}/{name}:{tag}")
}

fn ccp_image(config: &OperatorConfig, cluster: &Pgcluster, name: &str) -> String {
    let tag = if cluster.ccp_image_tag().is_empty() {
        config.pgo_image_tag.as_str()
    } else {
        cluster.ccp_image_tag()
    };
    image(&config.ccp_image_prefix, name, tag)
}

fn tolerations(cluster: &Pgcluster) -> Vec<Toleration> {
    cluster
        .spec
        .tolerations
        .iter()
        .map(|t| Toleration {
            key: t.key.clone(),
            operator: t.operator.clone(),
            value: t.value.clone(),
            effect: t.effect.clone(),
            toleration_seconds: t.toleration_seconds,
        })
        .collect()
}

/// pgBackRest repository type for a command: `s3` only when the repo lives solely in S3
pub fn repo_type(cluster: &Pgcluster, command: &str) -> &'static str {
    if cluster.spec.standby && command == labels::BACKREST_COMMAND_STANZA_CREATE {
        return "posix";
    }
    if cluster.backrest_s3_only() {
        "s3"
    } else {
        "posix"
    }
}

/// Job running a pgBackRest command for a `backrest` task
pub fn backrest_job(
    config: &OperatorConfig,
    cluster: &Pgcluster,
    task: &Pgtask,
    namespace: &str,
    command_opts: &str,
) -> Job {
    let cluster_name = cluster.cluster_name();
    let command = task.parameter(labels::LABEL_BACKREST_COMMAND).unwrap_or_default();
    let job_name = task
        .parameter(labels::LABEL_JOB_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| format!("backrest-{command}-{cluster_name}"));

    let mut job_labels = base_labels(&cluster_name);
    job_labels.insert(labels::LABEL_BACKREST.to_string(), labels::LABEL_TRUE.to_string());
    job_labels.insert(labels::LABEL_BACKREST_JOB.to_string(), labels::LABEL_TRUE.to_string());
    job_labels.insert(labels::LABEL_BACKREST_COMMAND.to_string(), command.to_string());
    job_labels.insert(labels::LABEL_PGTASK.to_string(), task.metadata.name.clone().unwrap_or_default());
    if let Some(backup_type) = task.parameter(labels::LABEL_PGHA_BACKUP_TYPE) {
        job_labels.insert(labels::LABEL_PGHA_BACKUP_TYPE.to_string(), backup_type.to_string());
    }

    let pod_name = task.parameter(labels::LABEL_POD_NAME).unwrap_or_default();
    let container = task
        .parameter(labels::LABEL_CONTAINER_NAME)
        .unwrap_or(labels::CONTAINER_DATABASE);
    let db_path = format!("/pgdata/{cluster_name}");
    let repo_path = format!("/backrestrepo/{}", labels::backrest_repo_name(&cluster_name));

    JobTemplate {
        name: job_name,
        namespace: namespace.to_string(),
        labels: job_labels,
        image: image(&config.pgo_image_prefix, IMAGE_PGO_BACKREST, &config.pgo_image_tag),
        container: "backrest".to_string(),
        env: env(&[
            ("COMMAND", command),
            ("COMMAND_OPTS", command_opts),
            (labels::ENV_PODNAME, pod_name),
            ("CONTAINER", container),
            ("NAMESPACE", namespace),
            ("PGBACKREST_STANZA", "db"),
            ("PGBACKREST_DB_PATH", &db_path),
            ("PGBACKREST_REPO1_PATH", &repo_path),
            ("PGBACKREST_REPO1_TYPE", repo_type(cluster, command)),
        ]),
        service_account: SERVICE_ACCOUNT_BACKREST.to_string(),
        backoff_limit: 0,
        tolerations: tolerations(cluster),
        ..Default::default()
    }
    .build()
}

/// Job running the data removal workflow
pub fn rmdata_job(config: &OperatorConfig, params: &Request, job_name: &str, task_name: &str) -> Job {
    let mut job_labels = base_labels(&params.cluster);
    job_labels.insert(labels::LABEL_RMDATA.to_string(), labels::LABEL_TRUE.to_string());
    job_labels.insert(labels::LABEL_PGTASK.to_string(), task_name.to_string());
    let flag = |b: bool| if b { labels::LABEL_TRUE } else { labels::LABEL_FALSE };

    JobTemplate {
        name: job_name.to_string(),
        namespace: params.namespace.clone(),
        labels: job_labels,
        image: image(&config.pgo_image_prefix, IMAGE_PGO_RMDATA, &config.pgo_image_tag),
        container: "rmdata".to_string(),
        env: env(&[
            ("PG_CLUSTER", &params.cluster),
            ("PGHA_SCOPE", &params.pgha_scope),
            ("NAMESPACE", &params.namespace),
            ("REPLICA_NAME", &params.replica_name),
            ("REMOVE_DATA", flag(params.remove_data)),
            ("REMOVE_BACKUP", flag(params.remove_backup)),
            ("IS_REPLICA", flag(params.is_replica)),
            ("IS_BACKUP", flag(params.is_backup)),
        ]),
        service_account: SERVICE_ACCOUNT_TARGET.to_string(),
        backoff_limit: 0,
        ..Default::default()
    }
    .build()
}

/// Job bootstrapping a cluster from an existing pgBackRest repository
pub fn bootstrap_job(config: &OperatorConfig, cluster: &Pgcluster, namespace: &str) -> Job {
    let cluster_name = cluster.cluster_name();
    let restore_from = if cluster.restore_requested() || cluster.spec.pg_data_source.restore_from.is_empty() {
        cluster_name.clone()
    } else {
        cluster.spec.pg_data_source.restore_from.clone()
    };
    let bootstrap_namespace = cluster.bootstrap_namespace();

    let mut job_labels = base_labels(&cluster_name);
    job_labels.insert(labels::LABEL_PGHA_BOOTSTRAP.to_string(), cluster_name.clone());
    job_labels.insert(
        labels::LABEL_PGHA_BOOTSTRAP_NAMESPACE.to_string(),
        bootstrap_namespace.clone(),
    );
    if let Some(workflow) = cluster
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::LABEL_WORKFLOW_ID))
    {
        job_labels.insert(labels::LABEL_WORKFLOW_ID.to_string(), workflow.clone());
    }

    let repo_host = format!(
        "{}.{}",
        labels::backrest_repo_name(&restore_from),
        bootstrap_namespace
    );
    let repo_path = format!("/backrestrepo/{}", labels::backrest_repo_name(&restore_from));

    JobTemplate {
        name: format!("{cluster_name}-bootstrap"),
        namespace: namespace.to_string(),
        labels: job_labels,
        image: ccp_image(config, cluster, IMAGE_CRUNCHY_POSTGRES_HA),
        container: labels::CONTAINER_DATABASE.to_string(),
        env: env(&[
            ("PGHA_INIT", labels::LABEL_TRUE),
            ("PGHA_SCOPE", &cluster.pgha_scope()),
            ("PGBACKREST_STANZA", "db"),
            ("PGBACKREST_PG1_PATH", &format!("/pgdata/{cluster_name}")),
            ("PGBACKREST_REPO1_HOST", &repo_host),
            ("PGBACKREST_REPO1_PATH", &repo_path),
            ("PGBACKREST_REPO1_TYPE", repo_type(cluster, labels::BACKREST_COMMAND_RESTORE)),
            ("BACKREST_RESTORE_OPTS", &cluster.spec.pg_data_source.restore_opts),
            ("PG_PORT", cluster.port()),
        ]),
        service_account: SERVICE_ACCOUNT_PG.to_string(),
        backoff_limit: 0,
        tolerations: tolerations(cluster),
        ..Default::default()
    }
    .build()
}

/// Job running pg_dump (`restore == false`) or pg_restore for a task
pub fn pgdump_job(
    config: &OperatorConfig,
    cluster: &Pgcluster,
    task: &Pgtask,
    namespace: &str,
    restore: bool,
) -> Job {
    let cluster_name = cluster.cluster_name();
    let task_name = task.metadata.name.clone().unwrap_or_default();
    let (marker, image_name, job_name) = if restore {
        (labels::LABEL_PGRESTORE_COMMAND, IMAGE_CRUNCHY_PGRESTORE, format!("pgrestore-{task_name}"))
    } else {
        (labels::LABEL_PGDUMP_COMMAND, IMAGE_CRUNCHY_PGDUMP, format!("pgdump-{task_name}"))
    };

    let mut job_labels = base_labels(&cluster_name);
    job_labels.insert(marker.to_string(), labels::LABEL_TRUE.to_string());
    job_labels.insert(labels::LABEL_PGTASK.to_string(), task_name);

    let param = |key: &str| task.parameter(key).unwrap_or_default().to_string();
    let mut vars = vec![
        ("PGHOST".to_string(), cluster_name.clone()),
        ("PGPORT".to_string(), cluster.port().to_string()),
    ];
    if restore {
        vars.push(("PGRESTORE_DB".to_string(), param(labels::LABEL_PGRESTORE_DB)));
        vars.push(("FROM_PVC".to_string(), param(labels::LABEL_PGRESTORE_FROM_PVC)));
        vars.push(("PGRESTORE_CUSTOM_OPTS".to_string(), param(labels::LABEL_PGRESTORE_OPTS)));
    } else {
        vars.push(("PGDUMP_DB".to_string(), param(labels::LABEL_PGDUMP_DB)));
        vars.push(("PGDUMP_PVC".to_string(), param(labels::LABEL_PGDUMP_PVC)));
        vars.push(("PGDUMP_CUSTOM_OPTS".to_string(), param(labels::LABEL_PGDUMP_OPTS)));
    }

    JobTemplate {
        name: job_name,
        namespace: namespace.to_string(),
        labels: job_labels,
        image: ccp_image(config, cluster, image_name),
        container: marker.to_string(),
        env: vars,
        service_account: SERVICE_ACCOUNT_DEFAULT.to_string(),
        backoff_limit: 0,
        tolerations: tolerations(cluster),
        ..Default::default()
    }
    .build()
}

/// A single-container Deployment and the Service in front of it
#[derive(Clone, Debug, Default)]
pub struct ServiceDeployment {
    pub name: String,
    pub namespace: String,
    pub cluster: String,
    /// Labels added to the cluster's base labels
    pub labels: BTreeMap<String, String>,
    pub container: String,
    pub image: String,
    pub port: i32,
    pub replicas: i32,
    pub env: Vec<(String, String)>,
    /// Secret whose `password` key becomes `PG_PASSWORD`
    pub password_secret: Option<String>,
    /// `(claim, mount path)` pairs
    pub volumes: Vec<(String, String)>,
    pub service_account: String,
}

impl ServiceDeployment {
    pub fn build(&self) -> (Deployment, Service) {
        let mut pod_labels = base_labels(&self.cluster);
        pod_labels.extend(self.labels.clone());
        pod_labels.insert(labels::LABEL_SERVICE_NAME.to_string(), self.name.clone());

        let mut env = env_vars(&self.env);
        if let Some(secret) = &self.password_secret {
            env.push(EnvVar {
                name: "PG_PASSWORD".to_string(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret.clone(),
                        key: "password".to_string(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            });
        }

        let volume_name = |i: usize| format!("{}-volume-{i}", self.container);
        let volumes: Vec<Volume> = self
            .volumes
            .iter()
            .enumerate()
            .map(|(i, (claim, _))| Volume {
                name: volume_name(i),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.clone(),
                    read_only: None,
                }),
                ..Default::default()
            })
            .collect();
        let mounts: Vec<VolumeMount> = self
            .volumes
            .iter()
            .enumerate()
            .map(|(i, (_, path))| VolumeMount {
                name: volume_name(i),
                mount_path: path.clone(),
                ..Default::default()
            })
            .collect();

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(pod_labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(self.replicas),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        labels::LABEL_SERVICE_NAME.to_string(),
                        self.name.clone(),
                    )])),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        service_account_name: Some(self.service_account.clone()),
                        containers: vec![Container {
                            name: self.container.clone(),
                            image: Some(self.image.clone()),
                            env: (!env.is_empty()).then_some(env),
                            ports: Some(vec![ContainerPort {
                                container_port: self.port,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            volume_mounts: (!mounts.is_empty()).then_some(mounts),
                            ..Default::default()
                        }],
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        };

        let service = Service {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(pod_labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(
                    labels::LABEL_SERVICE_NAME.to_string(),
                    self.name.clone(),
                )])),
                ports: Some(vec![ServicePort {
                    name: Some(self.container.clone()),
                    port: self.port,
                    target_port: Some(IntOrString::Int(self.port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        };

        (deployment, service)
    }
}

fn marker(key: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), labels::LABEL_TRUE.to_string())])
}

/// PersistentVolumeClaim for a cluster volume
pub fn pvc(name: &str, namespace: &str, cluster: &str, storage: &PgStorageSpec) -> PersistentVolumeClaim {
    let access_mode = if storage.access_mode.is_empty() {
        "ReadWriteOnce".to_string()
    } else {
        storage.access_mode.clone()
    };
    let requests = (!storage.size.is_empty()).then(|| {
        BTreeMap::from([("storage".to_string(), Quantity(storage.size.clone()))])
    });

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(base_labels(cluster)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode]),
            storage_class_name: (!storage.storage_class.is_empty())
                .then(|| storage.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests,
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Primary database Deployment and Service, created scaled to zero
///
/// The pod handler scales it up once the cluster's repository is ready.
pub fn primary(config: &OperatorConfig, cluster: &Pgcluster, namespace: &str) -> (Deployment, Service) {
    let cluster_name = cluster.cluster_name();
    let mut extra = marker(labels::LABEL_PG_DATABASE);
    extra.insert(labels::LABEL_DEPLOYMENT_NAME.to_string(), cluster_name.clone());
    extra.insert(labels::LABEL_PGHA_SCOPE.to_string(), cluster.pgha_scope());
    extra.insert(labels::LABEL_PGO_VERSION.to_string(), config.pgo_version.clone());
    if let Some(autofail) = cluster.autofail() {
        extra.insert(labels::LABEL_AUTOFAIL.to_string(), autofail.to_string());
    }

    let db_path = format!("/pgdata/{cluster_name}");
    ServiceDeployment {
        name: cluster_name.clone(),
        namespace: namespace.to_string(),
        cluster: cluster_name.clone(),
        labels: extra,
        container: labels::CONTAINER_DATABASE.to_string(),
        image: ccp_image(config, cluster, IMAGE_CRUNCHY_POSTGRES_HA),
        port: cluster.port().parse().unwrap_or(POSTGRES_PORT),
        replicas: 0,
        env: env(&[
            ("PGHA_SCOPE", &cluster.pgha_scope()),
            ("PGHA_PG_PORT", cluster.port()),
            ("PGBACKREST_STANZA", "db"),
            ("PGBACKREST_DB_PATH", &db_path),
            ("PGBACKREST_REPO1_HOST", &labels::backrest_repo_name(&cluster_name)),
        ]),
        password_secret: None,
        volumes: vec![(cluster_name.clone(), "/pgdata".to_string())],
        service_account: SERVICE_ACCOUNT_PG.to_string(),
    }
    .build()
}

/// pgBackRest repository Deployment and Service holding the backups of `source`
///
/// A bootstrap repository serves a cluster being created from `source` and is labelled
/// with that cluster's name and namespace so the pod handler can route its readiness.
pub fn backrest_repo(
    config: &OperatorConfig,
    cluster: &Pgcluster,
    source: &str,
    namespace: &str,
    bootstrap: bool,
) -> (Deployment, Service) {
    let repo_name = labels::backrest_repo_name(source);
    let mut extra = marker(labels::LABEL_PGO_BACKREST_REPO);
    if bootstrap {
        extra.insert(labels::LABEL_PGHA_BOOTSTRAP.to_string(), cluster.name_any());
        extra.insert(
            labels::LABEL_PGHA_BOOTSTRAP_NAMESPACE.to_string(),
            cluster.namespace().unwrap_or_default(),
        );
    }

    let repo_path = format!("/backrestrepo/{repo_name}");
    ServiceDeployment {
        name: repo_name.clone(),
        namespace: namespace.to_string(),
        cluster: source.to_string(),
        labels: extra,
        container: labels::CONTAINER_DATABASE.to_string(),
        image: image(&config.pgo_image_prefix, IMAGE_PGO_BACKREST_REPO, &config.pgo_image_tag),
        port: BACKREST_REPO_PORT,
        replicas: 1,
        env: env(&[
            ("PGBACKREST_STANZA", "db"),
            ("PGBACKREST_REPO1_PATH", &repo_path),
            ("PGBACKREST_DB_PATH", &format!("/pgdata/{source}")),
            ("PGBACKREST_PG1_PORT", cluster.port()),
            ("PGBACKREST_REPO1_TYPE", repo_type(cluster, labels::BACKREST_COMMAND_BACKUP)),
        ]),
        password_secret: None,
        volumes: vec![(labels::backrest_repo_pvc_name(source), "/backrestrepo".to_string())],
        service_account: SERVICE_ACCOUNT_DEFAULT.to_string(),
    }
    .build()
}

/// pgBouncer Deployment and Service for a cluster
pub fn pgbouncer(config: &OperatorConfig, cluster: &Pgcluster, namespace: &str) -> (Deployment, Service) {
    let cluster_name = cluster.cluster_name();
    ServiceDeployment {
        name: labels::pgbouncer_name(&cluster_name),
        namespace: namespace.to_string(),
        cluster: cluster_name.clone(),
        labels: marker(labels::LABEL_PGBOUNCER),
        container: labels::LABEL_PGBOUNCER.to_string(),
        image: ccp_image(config, cluster, IMAGE_CRUNCHY_PGBOUNCER),
        port: PGBOUNCER_PORT,
        replicas: cluster.spec.pg_bouncer.replicas.max(1),
        password_secret: Some(pgbouncer_secret_name(&cluster_name)),
        service_account: SERVICE_ACCOUNT_DEFAULT.to_string(),
        ..Default::default()
    }
    .build()
}

/// pgAdmin Deployment and Service for a cluster
pub fn pgadmin(config: &OperatorConfig, cluster: &Pgcluster, namespace: &str) -> (Deployment, Service) {
    let cluster_name = cluster.cluster_name();
    ServiceDeployment {
        name: pgadmin_name(&cluster_name),
        namespace: namespace.to_string(),
        cluster: cluster_name.clone(),
        labels: marker(labels::LABEL_PGADMIN),
        container: labels::LABEL_PGADMIN.to_string(),
        image: ccp_image(config, cluster, IMAGE_CRUNCHY_PGADMIN),
        port: PGADMIN_PORT,
        replicas: 1,
        service_account: SERVICE_ACCOUNT_DEFAULT.to_string(),
        ..Default::default()
    }
    .build()
}

/// `<cluster>-pgbouncer-secret`
pub fn pgbouncer_secret_name(cluster: &str) -> String {
    format!("{cluster}-pgbouncer-secret")
}

/// `<cluster>-pgadmin`
pub fn pgadmin_name(cluster: &str) -> String {
    format!("{cluster}-pgadmin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_template_sets_never_restart_and_env() {
        let job = JobTemplate {
            name: "job".to_string(),
            namespace: "ns".to_string(),
            image: "img".to_string(),
            container: "c".to_string(),
            env: env(&[("A", "1")]),
            ..Default::default()
        }
        .build();

        let pod = job.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let env = pod.containers[0].env.clone().unwrap();
        assert_eq!(env[0].name, "A");
        assert_eq!(env[0].value.as_deref(), Some("1"));
    }
}
