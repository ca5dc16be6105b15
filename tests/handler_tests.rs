//! Integration tests for the predicates behind the Job, Pod and Namespace handlers
//!
//! Handlers only act on specific transitions of the objects they watch. These tests pin
//! down which transitions count.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::batch::v1::{Job, JobSpec, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, EnvVar, Namespace, NamespaceStatus, Pod, PodSpec, PodStatus,
    PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use pgo_operator::config::labels;
use pgo_operator::controllers::job::{
    is_backoff_limit_exceeded, is_job_in_foreground_deletion, is_job_successful, job_env, JobKind,
};
use pgo_operator::controllers::namespace::is_terminating;
use pgo_operator::controllers::pod::{
    is_backrest_repo_becoming_ready, is_db_container_becoming_ready, is_promoted_postgres_pod,
    is_promoted_standby, leader_accepting_writes, patroni_status_role, recovery_disabled,
    service_name_for,
};
use pgo_operator::crd::{Pgcluster, PgclusterSpec};
use pgo_operator::operator::cluster::{
    classify_deployment, rollout_complete, scale_for, DeploymentRole, ScaleTargets,
};
use pgo_operator::operator::policy::policy_names;
use pgo_operator::operator::workflow::create_cluster_workflow_name;

// ============================================================================
// Test Helpers
// ============================================================================

fn label_map(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
    Some(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

fn job(pairs: &[(&str, &str)]) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some("hippo-job".to_string()),
            labels: label_map(pairs),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn pod(pairs: &[(&str, &str)], database_ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("hippo-6d9f-abcde".to_string()),
            labels: label_map(pairs),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: labels::CONTAINER_DATABASE.to_string(),
                ready: database_ready,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

fn with_patroni_status(mut pod: Pod, status: &str) -> Pod {
    pod.metadata.annotations = label_map(&[(labels::ANNOTATION_PATRONI_STATUS, status)]);
    pod
}

fn deployment(name: &str, pairs: &[(&str, &str)]) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: label_map(pairs),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn cluster(name: &str) -> Pgcluster {
    let mut cluster = Pgcluster::new(name, PgclusterSpec::default());
    cluster.metadata.namespace = Some("pgo".to_string());
    cluster
}

// ============================================================================
// Job Kind Tests
// ============================================================================

#[test]
fn test_job_kind_from_labels() {
    let cases = [
        (vec![(labels::LABEL_RMDATA, "true")], Some(JobKind::RmData)),
        (
            vec![
                (labels::LABEL_BACKREST, "true"),
                (labels::LABEL_BACKREST_COMMAND, "backup"),
            ],
            Some(JobKind::Backup),
        ),
        (
            vec![
                (labels::LABEL_BACKREST, "true"),
                (labels::LABEL_BACKREST_COMMAND, "stanza-create"),
            ],
            Some(JobKind::StanzaCreate),
        ),
        (
            vec![
                (labels::LABEL_BACKREST, "true"),
                (labels::LABEL_BACKREST_COMMAND, "expire"),
            ],
            Some(JobKind::Backrest),
        ),
        (vec![(labels::LABEL_PGDUMP_COMMAND, "true")], Some(JobKind::PgDump)),
        (vec![(labels::LABEL_PGRESTORE_COMMAND, "true")], Some(JobKind::PgRestore)),
        (vec![(labels::LABEL_PGHA_BOOTSTRAP, "hippo")], Some(JobKind::Bootstrap)),
        (vec![(labels::LABEL_PG_CLUSTER, "hippo")], None),
    ];
    for (pairs, expected) in cases {
        assert_eq!(JobKind::of(&job(&pairs)), expected, "{pairs:?}");
    }
}

#[test]
fn test_job_kind_requires_true_value() {
    assert_eq!(JobKind::of(&job(&[(labels::LABEL_RMDATA, "false")])), None);
}

#[test]
fn test_job_kind_names() {
    assert_eq!(JobKind::RmData.name(), "rmdata");
    assert_eq!(JobKind::StanzaCreate.name(), "stanza-create");
    assert_eq!(JobKind::Bootstrap.name(), "bootstrap");
}

// ============================================================================
// Job Status Tests
// ============================================================================

#[test]
fn test_job_success_needs_a_succeeded_pod() {
    let mut j = job(&[]);
    assert!(!is_job_successful(&j));

    j.status = Some(JobStatus {
        succeeded: Some(0),
        ..Default::default()
    });
    assert!(!is_job_successful(&j));

    j.status = Some(JobStatus {
        succeeded: Some(1),
        ..Default::default()
    });
    assert!(is_job_successful(&j));
}

#[test]
fn test_foreground_deletion_needs_timestamp_and_finalizer() {
    let mut j = job(&[]);
    j.metadata.finalizers = Some(vec![labels::FOREGROUND_DELETION_FINALIZER.to_string()]);
    assert!(!is_job_in_foreground_deletion(&j));

    j.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
    assert!(is_job_in_foreground_deletion(&j));

    j.metadata.finalizers = None;
    assert!(!is_job_in_foreground_deletion(&j));
}

#[test]
fn test_backoff_limit_defaults_to_six() {
    let mut j = job(&[]);
    j.status = Some(JobStatus {
        failed: Some(5),
        ..Default::default()
    });
    assert!(!is_backoff_limit_exceeded(&j));

    j.status = Some(JobStatus {
        failed: Some(6),
        ..Default::default()
    });
    assert!(is_backoff_limit_exceeded(&j));
}

#[test]
fn test_backoff_limit_from_spec() {
    let mut j = job(&[]);
    j.spec = Some(JobSpec {
        backoff_limit: Some(2),
        ..Default::default()
    });
    j.status = Some(JobStatus {
        failed: Some(2),
        ..Default::default()
    });
    assert!(is_backoff_limit_exceeded(&j));
}

#[test]
fn test_job_env_reads_pod_template() {
    let mut j = job(&[]);
    j.spec = Some(JobSpec {
        template: PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "rmdata".to_string(),
                    env: Some(vec![EnvVar {
                        name: "PG_CLUSTER".to_string(),
                        value: Some("hippo".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        ..Default::default()
    });
    assert_eq!(job_env(&j, "PG_CLUSTER").as_deref(), Some("hippo"));
    assert_eq!(job_env(&j, "NAMESPACE"), None);
}

// ============================================================================
// Pod Transition Tests
// ============================================================================

#[test]
fn test_database_container_becoming_ready() {
    let db = [(labels::LABEL_PG_DATABASE, "true")];
    assert!(is_db_container_becoming_ready(&pod(&db, false), &pod(&db, true)));
    assert!(!is_db_container_becoming_ready(&pod(&db, true), &pod(&db, true)));
    assert!(!is_db_container_becoming_ready(&pod(&db, true), &pod(&db, false)));
}

#[test]
fn test_readiness_ignored_for_non_database_pods() {
    let other = [(labels::LABEL_PG_CLUSTER, "hippo")];
    assert!(!is_db_container_becoming_ready(&pod(&other, false), &pod(&other, true)));
}

#[test]
fn test_backrest_repo_becoming_ready() {
    let repo = [(labels::LABEL_PGO_BACKREST_REPO, "true")];
    assert!(is_backrest_repo_becoming_ready(&pod(&repo, false), &pod(&repo, true)));
    assert!(!is_db_container_becoming_ready(&pod(&repo, false), &pod(&repo, true)));
}

#[test]
fn test_promotion_from_promoted_to_master() {
    let promoted = pod(
        &[
            (labels::LABEL_PG_DATABASE, "true"),
            (labels::LABEL_PGHA_ROLE, labels::LABEL_PGHA_ROLE_PROMOTED),
        ],
        true,
    );
    let master = pod(
        &[
            (labels::LABEL_PG_DATABASE, "true"),
            (labels::LABEL_PGHA_ROLE, labels::LABEL_PGHA_ROLE_PRIMARY),
        ],
        true,
    );
    assert!(is_promoted_postgres_pod(&promoted, &master));
    assert!(!is_promoted_postgres_pod(&master, &master));
}

#[test]
fn test_patroni_status_role() {
    let p = with_patroni_status(pod(&[], true), r#"{"role":"standby_leader","state":"running"}"#);
    assert_eq!(patroni_status_role(&p).as_deref(), Some("standby_leader"));

    let broken = with_patroni_status(pod(&[], true), "not json");
    assert_eq!(patroni_status_role(&broken), None);
    assert_eq!(patroni_status_role(&pod(&[], true)), None);
}

#[test]
fn test_standby_promotion() {
    let db = [(labels::LABEL_PG_DATABASE, "true")];
    let standby = with_patroni_status(pod(&db, true), r#"{"role":"standby_leader"}"#);
    let master = with_patroni_status(pod(&db, true), r#"{"role":"master"}"#);
    assert!(is_promoted_standby(&standby, &master));
    assert!(!is_promoted_standby(&master, &master));
}

#[test]
fn test_recovery_disabled_output() {
    assert!(recovery_disabled(" f\n"));
    assert!(!recovery_disabled("t"));
    assert!(!recovery_disabled(""));
}

#[test]
fn test_leader_accepting_writes() {
    assert!(leader_accepting_writes(r#"{"state":"running","role":"master"}"#));
    assert!(!leader_accepting_writes(r#"{"state":"running","pending_restart":true}"#));
    assert!(!leader_accepting_writes(r#"{"state":"starting"}"#));
    assert!(!leader_accepting_writes("503 Service Unavailable"));
}

#[test]
fn test_service_name_for_pod() {
    assert_eq!(service_name_for("hippo", Some("hippo-custom"), true), "hippo-custom");
    assert_eq!(service_name_for("hippo", Some(""), true), "hippo-replica");
    assert_eq!(service_name_for("hippo", None, false), "hippo");
}

// ============================================================================
// Deployment Scaling Tests
// ============================================================================

#[test]
fn test_classify_deployments() {
    let c = cluster("hippo");
    assert_eq!(classify_deployment(&deployment("hippo", &[]), &c), DeploymentRole::Primary);
    assert_eq!(
        classify_deployment(&deployment("hippo-pgbouncer", &[(labels::LABEL_PGBOUNCER, "true")]), &c),
        DeploymentRole::PgBouncer
    );
    assert_eq!(
        classify_deployment(
            &deployment("hippo-backrest-shared-repo", &[(labels::LABEL_PGO_BACKREST_REPO, "true")]),
            &c
        ),
        DeploymentRole::BackrestRepo
    );
    assert_eq!(classify_deployment(&deployment("hippo-abcd", &[]), &c), DeploymentRole::Replica);
}

#[test]
fn test_scale_only_targeted_roles() {
    let c = cluster("hippo");
    assert_eq!(scale_for(DeploymentRole::Primary, ScaleTargets::PRIMARY, 0, &c), Some(0));
    assert_eq!(scale_for(DeploymentRole::Replica, ScaleTargets::PRIMARY, 0, &c), None);
    assert_eq!(scale_for(DeploymentRole::Replica, ScaleTargets::INSTANCES, 1, &c), Some(1));
    assert_eq!(scale_for(DeploymentRole::BackrestRepo, ScaleTargets::INSTANCES, 1, &c), None);
}

#[test]
fn test_pgbouncer_scales_back_to_requested_replicas() {
    let mut c = cluster("hippo");
    c.spec.pg_bouncer.replicas = 2;
    let targets = ScaleTargets {
        pgbouncer: true,
        ..Default::default()
    };
    assert_eq!(scale_for(DeploymentRole::PgBouncer, targets, 1, &c), Some(2));
    assert_eq!(scale_for(DeploymentRole::PgBouncer, targets, 0, &c), Some(0));
    assert_eq!(scale_for(DeploymentRole::PgBouncer, ScaleTargets::INSTANCES, 0, &c), None);
}

#[test]
fn test_rollout_complete() {
    let mut d = deployment("hippo", &[]);
    d.metadata.generation = Some(3);
    d.spec = Some(DeploymentSpec {
        replicas: Some(1),
        ..Default::default()
    });
    assert!(!rollout_complete(&d));

    d.status = Some(DeploymentStatus {
        observed_generation: Some(3),
        updated_replicas: Some(1),
        ready_replicas: Some(1),
        replicas: Some(1),
        ..Default::default()
    });
    assert!(rollout_complete(&d));

    d.status = Some(DeploymentStatus {
        observed_generation: Some(2),
        updated_replicas: Some(1),
        ready_replicas: Some(1),
        replicas: Some(1),
        ..Default::default()
    });
    assert!(!rollout_complete(&d));
}

// ============================================================================
// Miscellaneous Handler Helper Tests
// ============================================================================

#[test]
fn test_terminating_namespace() {
    let mut ns = Namespace {
        metadata: ObjectMeta {
            name: Some("pgo".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(!is_terminating(&ns));
    ns.status = Some(NamespaceStatus {
        phase: Some("Terminating".to_string()),
        ..Default::default()
    });
    assert!(is_terminating(&ns));
}

#[test]
fn test_policy_names_skip_blanks() {
    assert_eq!(policy_names("p1, p2,,p3 "), vec!["p1", "p2", "p3"]);
    assert!(policy_names("").is_empty());
}

#[test]
fn test_create_cluster_workflow_name() {
    assert_eq!(create_cluster_workflow_name("hippo"), "hippo-createcluster");
}
