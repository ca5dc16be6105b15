//! Integration tests for Pgtask parsing and the parameters derived from tasks
//!
//! These tests verify task type dispatch, the processed guard, and the pure builders used
//! by the backrest, restore and rmdata workflows.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pgo_operator::config::{labels, OperatorConfig};
use pgo_operator::crd::{
    BackrestCommand, Pgcluster, PgclusterSpec, Pgtask, PgtaskSpec, PgtaskState, PgtaskStatus, TaskKind,
};
use pgo_operator::operator::backrest::{command_opts_from_pod, restore_opts, stanza_parameters};
use pgo_operator::operator::manifests;
use pgo_operator::operator::rmdata::{
    cluster_configmaps, instance_pvcs, logical_backup_pvcs, replica_pvcs, replica_service_action,
    ReplicaServiceAction, Request,
};
use pgo_operator::operator::task::{
    cluster_removal_task, requires_upgraded_cluster, rmdata_request, task_cluster,
};
use pgo_operator::Error;

// ============================================================================
// Test Helpers
// ============================================================================

fn task(task_type: &str, params: &[(&str, &str)]) -> Pgtask {
    let mut task = Pgtask::new(
        "hippo-task",
        PgtaskSpec {
            name: "hippo-task".to_string(),
            task_type: task_type.to_string(),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            status: String::new(),
        },
    );
    task.metadata.namespace = Some("pgo".to_string());
    task
}

fn with_state(mut task: Pgtask, state: PgtaskState) -> Pgtask {
    task.status = Some(PgtaskStatus {
        state,
        message: String::new(),
    });
    task
}

fn cluster(name: &str) -> Pgcluster {
    let mut cluster = Pgcluster::new(name, PgclusterSpec::default());
    cluster.metadata.namespace = Some("pgo".to_string());
    cluster
}

fn primary_pod(ip: Option<&str>, db_path: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some("hippo-6d9f-abcde".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: labels::CONTAINER_DATABASE.to_string(),
                env: db_path.map(|p| {
                    vec![EnvVar {
                        name: "PGBACKREST_DB_PATH".to_string(),
                        value: Some(p.to_string()),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: ip.map(str::to_string),
            ..Default::default()
        }),
    }
}

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

// ============================================================================
// Task Kind Tests
// ============================================================================

#[test]
fn test_task_kinds_parse_from_task_type() {
    let cases = [
        ("add-pgadmin", TaskKind::PgAdminAdd),
        ("delete-pgadmin", TaskKind::PgAdminDelete),
        ("clusterupgrade", TaskKind::Upgrade),
        ("rolling-update", TaskKind::RollingUpdate),
        ("delete-data", TaskKind::DeleteData),
        ("restore", TaskKind::BackrestRestore),
        ("pgdump", TaskKind::PgDump),
        ("pgrestore", TaskKind::PgRestore),
        ("workflow", TaskKind::Workflow),
    ];
    for (task_type, expected) in cases {
        assert_eq!(TaskKind::of(&task(task_type, &[])).unwrap(), expected, "{task_type}");
    }
}

#[test]
fn test_backrest_task_reads_command_parameter() {
    let backup = task("backrest", &[(labels::LABEL_BACKREST_COMMAND, "backup")]);
    assert_eq!(
        TaskKind::of(&backup).unwrap(),
        TaskKind::Backrest(BackrestCommand::Backup)
    );

    let stanza = task("backrest", &[(labels::LABEL_BACKREST_COMMAND, "stanza-create")]);
    assert_eq!(
        TaskKind::of(&stanza).unwrap(),
        TaskKind::Backrest(BackrestCommand::StanzaCreate)
    );

    let info = task("backrest", &[(labels::LABEL_BACKREST_COMMAND, "info")]);
    let kind = TaskKind::of(&info).unwrap();
    assert_eq!(kind, TaskKind::Backrest(BackrestCommand::Other("info".to_string())));
    assert_eq!(kind.to_string(), "backrest/info");
    assert_eq!(kind.name(), "backrest");
}

#[test]
fn test_unknown_task_type_is_an_error() {
    match TaskKind::of(&task("reboot", &[])) {
        Err(Error::UnknownTaskType(t)) => assert_eq!(t, "reboot"),
        other => panic!("unexpected result: {other:?}"),
    }
}

// ============================================================================
// Processed Guard Tests
// ============================================================================

#[test]
fn test_new_task_is_not_processed() {
    let t = task("pgdump", &[]);
    assert_eq!(t.state(), PgtaskState::Created);
    assert!(!t.is_processed());
}

#[test]
fn test_processed_and_completed_tasks_are_not_redispatched() {
    assert!(with_state(task("pgdump", &[]), PgtaskState::Processed).is_processed());
    assert!(with_state(task("pgdump", &[]), PgtaskState::Completed).is_processed());
}

#[test]
fn test_delete_data_started_marker() {
    assert!(!task("delete-data", &[]).delete_data_started());
    assert!(task("delete-data", &[(labels::LABEL_DELETE_DATA_STARTED, "2021-01-01")]).delete_data_started());
}

#[test]
fn test_task_state_serializes_lowercase() {
    let value = serde_json::to_value(PgtaskState::Processed).unwrap();
    assert_eq!(value, serde_json::json!("processed"));
}

// ============================================================================
// Task Cluster and rmdata Request Tests
// ============================================================================

#[test]
fn test_task_cluster_prefers_parameter_over_label() {
    let mut t = task("delete-data", &[(labels::LABEL_PG_CLUSTER, "hippo")]);
    t.metadata.labels = Some(BTreeMap::from([(
        labels::LABEL_PG_CLUSTER.to_string(),
        "rhino".to_string(),
    )]));
    assert_eq!(task_cluster(&t).as_deref(), Some("hippo"));

    t.spec.parameters.clear();
    assert_eq!(task_cluster(&t).as_deref(), Some("rhino"));
}

#[test]
fn test_rmdata_request_from_task() {
    let t = task(
        "delete-data",
        &[
            (labels::LABEL_PG_CLUSTER, "hippo"),
            (labels::LABEL_DELETE_DATA, "true"),
            (labels::LABEL_DELETE_BACKUPS, "false"),
            (labels::LABEL_IS_REPLICA, "true"),
            (labels::LABEL_REPLICA_NAME, "hippo-abcd"),
        ],
    );
    let request = rmdata_request("pgo", &t).unwrap();
    assert_eq!(request.cluster, "hippo");
    assert_eq!(request.pgha_scope, "hippo");
    assert_eq!(request.replica_name, "hippo-abcd");
    assert!(request.remove_data);
    assert!(!request.remove_backup);
    assert!(request.is_replica);
    assert!(!request.is_backup);
}

#[test]
fn test_rmdata_request_requires_cluster() {
    assert!(rmdata_request("pgo", &task("delete-data", &[])).is_err());
}

#[test]
fn test_rmdata_request_from_environment() {
    let request = Request::from_lookup(env(&[
        ("PG_CLUSTER", "hippo"),
        ("NAMESPACE", "pgo"),
        ("REMOVE_DATA", "true"),
        ("IS_BACKUP", "false"),
    ]))
    .unwrap();
    assert_eq!(request.cluster, "hippo");
    assert_eq!(request.namespace, "pgo");
    assert_eq!(request.pgha_scope, "hippo");
    assert!(request.remove_data);
    assert!(!request.remove_backup);
}

#[test]
fn test_rmdata_request_missing_namespace_is_config_error() {
    let err = Request::from_lookup(env(&[("PG_CLUSTER", "hippo")])).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_rmdata_request_rejects_bad_flag() {
    let err = Request::from_lookup(env(&[
        ("PG_CLUSTER", "hippo"),
        ("NAMESPACE", "pgo"),
        ("REMOVE_DATA", "maybe"),
    ]))
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

// ============================================================================
// rmdata Decision Tests
// ============================================================================

#[test]
fn test_replica_service_removed_with_last_replica() {
    assert_eq!(replica_service_action(0), ReplicaServiceAction::NoReplicas);
    assert_eq!(replica_service_action(1), ReplicaServiceAction::Delete);
    assert_eq!(replica_service_action(2), ReplicaServiceAction::Keep);
}

#[test]
fn test_instance_pvcs_keep_backups() {
    let pvcs: Vec<String> = [
        "hippo",
        "hippo-wal",
        "hippo-abcd",
        "hippo-pgbr-repo",
        "backup-hippo-pgdump-pvc",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    assert_eq!(instance_pvcs("hippo", &pvcs), vec!["hippo", "hippo-wal", "hippo-abcd"]);
    assert_eq!(logical_backup_pvcs("hippo", &pvcs), vec!["backup-hippo-pgdump-pvc"]);
}

#[test]
fn test_replica_pvcs_include_wal_and_tablespaces() {
    let pvcs: Vec<String> = [
        "hippo-abcd",
        "hippo-abcd-wal",
        "hippo-abcd-tablespace-ts1",
        "hippo-efgh-wal",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    assert_eq!(
        replica_pvcs("hippo-abcd", &pvcs),
        vec!["hippo-abcd", "hippo-abcd-wal", "hippo-abcd-tablespace-ts1"]
    );
}

#[test]
fn test_cluster_configmaps() {
    let names = cluster_configmaps("hippo");
    assert!(names.contains(&"hippo-pgha-config".to_string()));
    assert!(names.contains(&"hippo-leader".to_string()));
    assert!(names.contains(&"hippo-config".to_string()));
}

// ============================================================================
// Backrest Parameter Tests
// ============================================================================

#[test]
fn test_stanza_parameters_for_primary_cluster() {
    let mut c = cluster("hippo");
    c.spec
        .user_labels
        .insert(labels::LABEL_BACKREST_STORAGE_TYPE.to_string(), "local,s3".to_string());
    let params = stanza_parameters(&c, "hippo-backrest-shared-repo-abc");

    assert_eq!(params[labels::LABEL_JOB_NAME], "hippo-stanza-create");
    assert_eq!(params[labels::LABEL_POD_NAME], "hippo-backrest-shared-repo-abc");
    assert_eq!(params[labels::LABEL_CONTAINER_NAME], labels::CONTAINER_BACKREST_REPO);
    assert_eq!(params[labels::LABEL_BACKREST_COMMAND], "stanza-create");
    assert_eq!(params[labels::LABEL_BACKREST_STORAGE_TYPE], "local,s3");
    assert_eq!(params[labels::LABEL_BACKREST_OPTS], "");
}

#[test]
fn test_stanza_parameters_for_standby_use_no_online() {
    let mut c = cluster("hippo");
    c.spec.standby = true;
    c.spec
        .user_labels
        .insert(labels::LABEL_BACKREST_STORAGE_TYPE.to_string(), "s3".to_string());
    let params = stanza_parameters(&c, "repo");

    assert_eq!(params[labels::LABEL_BACKREST_OPTS], "--no-online");
    assert!(!params.contains_key(labels::LABEL_BACKREST_STORAGE_TYPE));
}

#[test]
fn test_command_opts_point_at_primary() {
    let pod = primary_pod(Some("10.2.0.7"), Some("/pgdata/hippo"));
    let opts = command_opts_from_pod("--type=full", &pod).unwrap();
    assert_eq!(opts, "--db-host=10.2.0.7 --db-path=/pgdata/hippo");
}

#[test]
fn test_command_opts_respect_explicit_host() {
    let pod = primary_pod(Some("10.2.0.7"), Some("/pgdata/hippo"));
    let opts = command_opts_from_pod("--pg1-host=elsewhere", &pod).unwrap();
    assert_eq!(opts, "--db-path=/pgdata/hippo");
}

#[test]
fn test_command_opts_require_db_path() {
    let pod = primary_pod(Some("10.2.0.7"), None);
    assert!(command_opts_from_pod("", &pod).unwrap_err().is_not_found());
}

#[test]
fn test_restore_opts_add_target_and_repo_type() {
    let t = task(
        "restore",
        &[
            (labels::LABEL_BACKREST_RESTORE_OPTS, "--type=time"),
            (labels::LABEL_BACKREST_PITR_TARGET, "2021-06-09 14:15:11-04"),
            (labels::LABEL_BACKREST_STORAGE_TYPE, "s3"),
        ],
    );
    assert_eq!(
        restore_opts(&t),
        r#"--type=time --target="2021-06-09 14:15:11-04" --repo-type=s3"#
    );
}

#[test]
fn test_restore_opts_keep_explicit_target() {
    let t = task(
        "restore",
        &[
            (labels::LABEL_BACKREST_RESTORE_OPTS, "--target=abc"),
            (labels::LABEL_BACKREST_PITR_TARGET, "xyz"),
        ],
    );
    assert_eq!(restore_opts(&t), "--target=abc");
}

// ============================================================================
// Job Manifest Tests
// ============================================================================

fn operator_config() -> OperatorConfig {
    OperatorConfig::from_lookup(|key| match key {
        "PGO_OPERATOR_NAMESPACE" => Some("pgo".to_string()),
        "PGO_INSTALLATION_NAME" => Some("devtest".to_string()),
        _ => None,
    })
    .unwrap()
}

#[test]
fn test_backrest_job_carries_removal_labels() {
    let t = task(
        "backrest",
        &[
            (labels::LABEL_BACKREST_COMMAND, "backup"),
            (labels::LABEL_JOB_NAME, "backrest-backup-hippo"),
            (labels::LABEL_PG_CLUSTER, "hippo"),
        ],
    );
    let job = manifests::backrest_job(&operator_config(), &cluster("hippo"), &t, "pgo", "");
    let job_labels = job.metadata.labels.unwrap();

    // rmdata selects backup jobs by these two labels
    assert_eq!(job_labels.get(labels::LABEL_BACKREST_JOB).map(String::as_str), Some("true"));
    assert_eq!(job_labels.get(labels::LABEL_PG_CLUSTER).map(String::as_str), Some("hippo"));
    assert_eq!(job_labels.get(labels::LABEL_BACKREST_COMMAND).map(String::as_str), Some("backup"));
    assert_eq!(job.metadata.name.as_deref(), Some("backrest-backup-hippo"));
}

fn label<'a>(labels: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    labels.get(key).map(String::as_str)
}

#[test]
fn test_primary_deployment_feeds_backrest_commands() {
    let (deployment, service) = manifests::primary(&operator_config(), &cluster("hippo"), "pgo");
    assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(0));
    assert_eq!(service.metadata.name.as_deref(), Some("hippo"));

    let deployment_labels = deployment.metadata.labels.clone().unwrap();
    assert_eq!(label(&deployment_labels, labels::LABEL_PG_DATABASE), Some("true"));
    assert_eq!(label(&deployment_labels, labels::LABEL_DEPLOYMENT_NAME), Some("hippo"));
    assert_eq!(label(&deployment_labels, labels::LABEL_PGHA_SCOPE), Some("hippo"));

    // backups read the data path from the primary pod this template produces
    let template = deployment.spec.unwrap().template;
    let pod = Pod {
        metadata: template.metadata.unwrap_or_default(),
        spec: template.spec,
        status: Some(PodStatus {
            pod_ip: Some("10.2.0.9".to_string()),
            ..Default::default()
        }),
    };
    assert_eq!(
        pod.spec.as_ref().unwrap().containers[0].name,
        labels::CONTAINER_DATABASE
    );
    assert_eq!(
        command_opts_from_pod("", &pod).unwrap(),
        "--db-host=10.2.0.9 --db-path=/pgdata/hippo"
    );
}

#[test]
fn test_bootstrap_repo_points_back_at_new_cluster() {
    let mut new_cluster = cluster("rhino");
    new_cluster.metadata.namespace = Some("target".to_string());
    new_cluster.spec.pg_data_source.restore_from = "hippo".to_string();

    let (deployment, _) = manifests::backrest_repo(&operator_config(), &new_cluster, "hippo", "pgo", true);
    assert_eq!(deployment.metadata.name.as_deref(), Some("hippo-backrest-shared-repo"));
    assert_eq!(deployment.metadata.namespace.as_deref(), Some("pgo"));
    assert_eq!(deployment.spec.as_ref().unwrap().replicas, Some(1));

    let pod_labels = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap();
    assert_eq!(label(&pod_labels, labels::LABEL_PGO_BACKREST_REPO), Some("true"));
    assert_eq!(label(&pod_labels, labels::LABEL_PG_CLUSTER), Some("hippo"));
    assert_eq!(label(&pod_labels, labels::LABEL_PGHA_BOOTSTRAP), Some("rhino"));
    assert_eq!(label(&pod_labels, labels::LABEL_PGHA_BOOTSTRAP_NAMESPACE), Some("target"));
}

#[test]
fn test_cluster_repo_is_not_a_bootstrap_repo() {
    let (deployment, _) = manifests::backrest_repo(&operator_config(), &cluster("hippo"), "hippo", "pgo", false);
    let deployment_labels = deployment.metadata.labels.unwrap();
    assert!(!deployment_labels.contains_key(labels::LABEL_PGHA_BOOTSTRAP));
    assert_eq!(label(&deployment_labels, labels::LABEL_PGO_BACKREST_REPO), Some("true"));
}

#[test]
fn test_pvc_defaults_access_mode() {
    let mut storage = pgo_operator::crd::PgStorageSpec::default();
    storage.size = "1G".to_string();
    let pvc = manifests::pvc("hippo", "pgo", "hippo", &storage);
    let spec = pvc.spec.unwrap();
    assert_eq!(spec.access_modes, Some(vec!["ReadWriteOnce".to_string()]));
    assert_eq!(spec.storage_class_name, None);
    assert_eq!(
        spec.resources.unwrap().requests.unwrap()["storage"].0,
        "1G"
    );
}

// ============================================================================
// Cluster Removal Tests
// ============================================================================

#[test]
fn test_removal_task_removes_everything_by_default() {
    let t = cluster_removal_task(&cluster("hippo"));
    assert_eq!(t.metadata.name.as_deref(), Some("hippo-rmdata"));
    assert_eq!(TaskKind::of(&t).unwrap(), TaskKind::DeleteData);
    let task_labels = t.metadata.labels.clone().unwrap();
    assert_eq!(label(&task_labels, labels::LABEL_RMDATA), Some("true"));

    let request = rmdata_request("pgo", &t).unwrap();
    assert_eq!(request.cluster, "hippo");
    assert_eq!(request.pgha_scope, "hippo");
    assert!(request.remove_data);
    assert!(request.remove_backup);
    assert!(!request.is_replica);
    assert!(!request.is_backup);
}

#[test]
fn test_removal_task_honours_keep_annotations() {
    let mut c = cluster("hippo");
    c.metadata.annotations = Some(BTreeMap::from([
        (labels::ANNOTATION_KEEP_DATA.to_string(), "true".to_string()),
        (labels::ANNOTATION_KEEP_BACKUPS.to_string(), "true".to_string()),
    ]));
    let request = rmdata_request("pgo", &cluster_removal_task(&c)).unwrap();
    assert!(!request.remove_data);
    assert!(!request.remove_backup);

    c.metadata.annotations = Some(BTreeMap::from([(
        labels::ANNOTATION_KEEP_BACKUPS.to_string(),
        "true".to_string(),
    )]));
    let request = rmdata_request("pgo", &cluster_removal_task(&c)).unwrap();
    assert!(request.remove_data);
    assert!(!request.remove_backup);
}

// ============================================================================
// Upgrade Gate Tests
// ============================================================================

#[test]
fn test_only_cluster_changing_tasks_wait_for_upgrade() {
    assert!(requires_upgraded_cluster(&TaskKind::PgAdminAdd));
    assert!(requires_upgraded_cluster(&TaskKind::RollingUpdate));
    assert!(requires_upgraded_cluster(&TaskKind::BackrestRestore));
    assert!(requires_upgraded_cluster(&TaskKind::PgDump));

    // the upgrade itself, removal and workflow bookkeeping run regardless
    assert!(!requires_upgraded_cluster(&TaskKind::Upgrade));
    assert!(!requires_upgraded_cluster(&TaskKind::DeleteData));
    assert!(!requires_upgraded_cluster(&TaskKind::Workflow));
}
