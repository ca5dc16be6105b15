//! Integration tests for the operator plumbing
//!
//! Covers patch builders, bounded polling, the work queue, the label index, namespace
//! helpers, configuration parsing, event payloads and the RBAC builders.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::watcher;
use kube::ResourceExt;
use pgo_operator::config::{labels, parse_bool, parse_namespace_csv, OperatorConfig};
use pgo_operator::controllers::rbac::{role_bindings, roles, service_account_names};
use pgo_operator::controllers::workqueue::{object_key, WorkQueue};
use pgo_operator::controllers::{group_action, GroupAction};
use pgo_operator::events::{Event, EventKind, EventPublisher};
use pgo_operator::index::LabelIndex;
use pgo_operator::kubeapi::{escape_token, pointer, Json6902, Merge7386, Poll};
use pgo_operator::ns::{
    is_dns1123_label, is_owned_namespace, merge_namespace_lists, mode_from_privileges,
    owned_labels, owned_namespace_selector, validate_namespace_names, NamespaceOperatingMode,
};
use pgo_operator::Error;
use serde_json::json;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Helpers
// ============================================================================

fn meta(namespace: &str, name: &str, pairs: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        ..Default::default()
    }
}

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

const REQUIRED_ENV: [(&str, &str); 2] = [
    ("PGO_OPERATOR_NAMESPACE", "pgo"),
    ("PGO_INSTALLATION_NAME", "devtest"),
];

fn config_with(extra: &[(&str, &str)]) -> pgo_operator::Result<OperatorConfig> {
    let mut pairs = REQUIRED_ENV.to_vec();
    pairs.extend_from_slice(extra);
    OperatorConfig::from_lookup(env(&pairs))
}

// ============================================================================
// Patch Builder Tests
// ============================================================================

#[test]
fn test_pointer_escapes_tokens() {
    assert_eq!(escape_token("a/b~c"), "a~1b~0c");
    assert_eq!(
        pointer(&["metadata", "labels", "crunchydata.com/role"]),
        "/metadata/labels/crunchydata.com~1role"
    );
}

#[test]
fn test_json_patch_operations() {
    let mut patch = Json6902::new();
    assert!(patch.is_empty());
    patch
        .add(&["metadata", "labels", labels::LABEL_PGHA_ROLE], "master")
        .replace(&["spec", "replicas"], 0)
        .remove(&["metadata", "annotations", labels::ANNOTATION_BACKREST_RESTORE]);

    assert_eq!(patch.len(), 3);
    assert_eq!(
        patch.to_value(),
        json!([
            {"op": "add", "path": "/metadata/labels/role", "value": "master"},
            {"op": "replace", "path": "/spec/replicas", "value": 0},
            {"op": "remove", "path": "/metadata/annotations/pgo-backrest-restore"},
        ])
    );
    assert!(patch.to_patch().is_ok());
}

#[test]
fn test_merge_patch_nests_and_removes() {
    let mut patch = Merge7386::new();
    patch
        .add(&["metadata", "labels", labels::LABEL_AUTOFAIL], "true")
        .add(&["metadata", "labels", labels::LABEL_PGO_VERSION], "4.7.0")
        .remove(&["metadata", "annotations", labels::ANNOTATION_IS_UPGRADED]);

    assert_eq!(
        patch.to_value(),
        json!({
            "metadata": {
                "labels": {"autofail": "true", "pgo-version": "4.7.0"},
                "annotations": {"is-upgraded": null},
            }
        })
    );
}

#[test]
fn test_merge_patch_replaces_scalar_parent() {
    let mut patch = Merge7386::new();
    patch.add(&["spec"], "flat").add(&["spec", "shutdown"], true);
    assert_eq!(patch.to_value(), json!({"spec": {"shutdown": true}}));
}

// ============================================================================
// Poll Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_poll_succeeds_after_several_checks() {
    let cancel = CancellationToken::new();
    let checks = AtomicU32::new(0);
    let result = Poll::new(Duration::from_secs(1), Duration::from_secs(30))
        .until(&cancel, "pods to terminate", || {
            let n = checks.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n >= 3) }
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(checks.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_poll_times_out() {
    let cancel = CancellationToken::new();
    let err = Poll::new(Duration::from_secs(1), Duration::from_secs(5))
        .until(&cancel, "job deletion", || async { Ok(false) })
        .await
        .unwrap_err();
    match err {
        Error::Timeout { message, timeout } => {
            assert_eq!(message, "job deletion");
            assert_eq!(timeout, Duration::from_secs(5));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_poll_stops_when_cancelled() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = Poll::new(Duration::from_secs(1), Duration::from_secs(60))
        .until(&cancel, "primary ready", || async { Ok(false) })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(what) if what == "primary ready"));
}

#[tokio::test(start_paused = true)]
async fn test_poll_returns_check_error() {
    let cancel = CancellationToken::new();
    let err = Poll::new(Duration::from_secs(1), Duration::from_secs(60))
        .until(&cancel, "configmap", || async {
            Err::<bool, _>(Error::not_found("configmap hippo-pgha-config"))
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(start_paused = true)]
async fn test_delayed_poll_waits_before_first_check() {
    let cancel = CancellationToken::new();
    let start = tokio::time::Instant::now();
    Poll::new(Duration::from_secs(2), Duration::from_secs(10))
        .delayed()
        .until(&cancel, "anything", || async { Ok(true) })
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[test]
fn test_poll_tries_budget() {
    let poll = Poll::tries(Duration::from_secs(5), 10);
    assert_eq!(poll.timeout, Duration::from_secs(50));
    assert!(poll.immediate);
    assert!(!poll.delayed().immediate);
}

// ============================================================================
// Work Queue Tests
// ============================================================================

#[tokio::test]
async fn test_queue_deduplicates_waiting_keys() {
    let queue = WorkQueue::new("test", "pgo");
    queue.add("pgo/a");
    queue.add("pgo/a");
    queue.add("pgo/b");
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.get().await.as_deref(), Some("pgo/a"));
    assert_eq!(queue.get().await.as_deref(), Some("pgo/b"));
}

#[tokio::test]
async fn test_key_added_while_processing_is_requeued_on_done() {
    let queue = WorkQueue::new("test", "pgo");
    queue.add("pgo/a");
    let key = queue.get().await.unwrap();

    queue.add("pgo/a");
    assert!(queue.is_empty());

    queue.done(&key);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await.as_deref(), Some("pgo/a"));
}

#[tokio::test]
async fn test_shut_down_drains_then_ends() {
    let queue = WorkQueue::new("test", "pgo");
    queue.add("pgo/a");
    queue.shut_down();
    queue.add("pgo/b");

    assert!(queue.is_shutting_down());
    assert_eq!(queue.get().await.as_deref(), Some("pgo/a"));
    assert_eq!(queue.get().await, None);
}

#[tokio::test]
async fn test_shut_down_wakes_waiting_worker() {
    let queue = WorkQueue::new("test", "pgo");
    let worker = tokio::spawn({
        let queue = queue.clone();
        async move { queue.get().await }
    });
    tokio::task::yield_now().await;
    queue.shut_down();
    assert_eq!(worker.await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_requeue_counts_failures() {
    let queue = WorkQueue::new("test", "pgo");
    queue.add_rate_limited("pgo/a");
    assert_eq!(queue.num_requeues("pgo/a"), 1);
    assert_eq!(queue.get().await.as_deref(), Some("pgo/a"));
    queue.done("pgo/a");

    queue.add_rate_limited("pgo/a");
    assert_eq!(queue.num_requeues("pgo/a"), 2);

    queue.forget("pgo/a");
    assert_eq!(queue.num_requeues("pgo/a"), 0);
}

#[test]
fn test_object_key_needs_namespace() {
    let mut pod = Pod {
        metadata: meta("pgo", "hippo-abc", &[]),
        ..Default::default()
    };
    assert_eq!(object_key(&pod).as_deref(), Some("pgo/hippo-abc"));
    pod.metadata.namespace = None;
    assert_eq!(object_key(&pod), None);
}

// ============================================================================
// Label Index Tests
// ============================================================================

#[test]
fn test_index_lookup_and_select() {
    let index = LabelIndex::new();
    index.upsert(&meta("pgo", "hippo-1", &[("pg-cluster", "hippo"), ("role", "master")]));
    index.upsert(&meta("pgo", "hippo-2", &[("pg-cluster", "hippo"), ("role", "replica")]));
    index.upsert(&meta("other", "hippo-3", &[("pg-cluster", "hippo")]));

    assert_eq!(index.len(), 3);
    assert_eq!(index.lookup("pgo", "pg-cluster", "hippo"), vec!["hippo-1", "hippo-2"]);
    assert_eq!(
        index.select("pgo", &[("pg-cluster", "hippo"), ("role", "master")]),
        vec!["hippo-1"]
    );
    assert!(index.select("pgo", &[]).is_empty());
}

#[test]
fn test_index_follows_relabel_and_delete() {
    let index = LabelIndex::new();
    index.upsert(&meta("pgo", "hippo-1", &[("role", "promoted")]));
    index.upsert(&meta("pgo", "hippo-1", &[("role", "master")]));

    assert!(index.lookup("pgo", "role", "promoted").is_empty());
    assert_eq!(index.lookup("pgo", "role", "master"), vec!["hippo-1"]);

    index.remove(&meta("pgo", "hippo-1", &[]));
    assert!(index.lookup("pgo", "role", "master").is_empty());
    assert!(index.is_empty());
}

#[test]
fn test_index_applies_watch_events() {
    let index = LabelIndex::new();
    let pod = Pod {
        metadata: meta("pgo", "hippo-1", &[("pg-cluster", "hippo")]),
        ..Default::default()
    };
    index.apply_event(&watcher::Event::Apply(pod.clone()));
    assert_eq!(index.len(), 1);

    index.apply_event(&watcher::Event::Delete(pod.clone()));
    assert!(index.is_empty());

    index.apply_event(&watcher::Event::<Pod>::Init);
    index.apply_event(&watcher::Event::InitApply(pod));
    index.apply_event(&watcher::Event::<Pod>::InitDone);
    assert_eq!(index.lookup("pgo", "pg-cluster", "hippo"), vec!["hippo-1"]);
}

#[test]
fn test_index_keeps_answering_during_relist() {
    let index = LabelIndex::new();
    let repo = |name: &str| Pod {
        metadata: meta(
            "pgo",
            name,
            &[("pg-cluster", "hippo"), ("pgo-backrest-repo", "true")],
        ),
        ..Default::default()
    };
    let selector = [("pg-cluster", "hippo"), ("pgo-backrest-repo", "true")];
    index.apply_event(&watcher::Event::Apply(repo("hippo-backrest-shared-repo-abc")));

    index.apply_event(&watcher::Event::<Pod>::Init);
    assert_eq!(index.select("pgo", &selector), vec!["hippo-backrest-shared-repo-abc"]);

    // the repository pod was replaced while the watch was down
    index.apply_event(&watcher::Event::InitApply(repo("hippo-backrest-shared-repo-xyz")));
    assert_eq!(index.select("pgo", &selector), vec!["hippo-backrest-shared-repo-abc"]);

    index.apply_event(&watcher::Event::<Pod>::InitDone);
    assert_eq!(index.select("pgo", &selector), vec!["hippo-backrest-shared-repo-xyz"]);
    assert_eq!(index.len(), 1);
}

// ============================================================================
// Namespace Helper Tests
// ============================================================================

#[test]
fn test_dns1123_labels() {
    assert!(is_dns1123_label("pgo"));
    assert!(is_dns1123_label("team-a1"));
    assert!(!is_dns1123_label(""));
    assert!(!is_dns1123_label("-pgo"));
    assert!(!is_dns1123_label("Pgo"));
    assert!(!is_dns1123_label("pgo_ns"));
    assert!(!is_dns1123_label(&"a".repeat(64)));
}

#[test]
fn test_validate_namespace_names_reports_invalid() {
    assert!(validate_namespace_names(&["pgo".to_string(), "team-a".to_string()]).is_ok());
    let err = validate_namespace_names(&["pgo".to_string(), "Bad_Name".to_string()]).unwrap_err();
    assert!(err.to_string().contains("Bad_Name"));
}

#[test]
fn test_merge_namespace_lists_keeps_order() {
    let merged = merge_namespace_lists(
        vec!["pgo".to_string(), "team-a".to_string()],
        vec!["team-b".to_string(), "pgo".to_string()],
    );
    assert_eq!(merged, vec!["pgo", "team-a", "team-b"]);
}

#[test]
fn test_owned_namespace_labels() {
    assert_eq!(
        owned_namespace_selector("devtest"),
        "vendor=crunchydata,pgo-installation-name=devtest"
    );

    let mut ns = Namespace {
        metadata: ObjectMeta {
            name: Some("team-a".to_string()),
            labels: Some(owned_labels("devtest")),
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(is_owned_namespace(&ns, "devtest"));
    assert!(!is_owned_namespace(&ns, "prod"));

    ns.labels_mut().remove(labels::LABEL_VENDOR);
    assert!(!is_owned_namespace(&ns, "devtest"));
}

#[test]
fn test_operating_mode_from_privileges() {
    assert_eq!(mode_from_privileges(true, true), NamespaceOperatingMode::Dynamic);
    assert_eq!(mode_from_privileges(false, true), NamespaceOperatingMode::ReadOnly);
    assert_eq!(mode_from_privileges(false, false), NamespaceOperatingMode::Disabled);
}

#[test]
fn test_operating_mode_names() {
    for mode in [
        NamespaceOperatingMode::Dynamic,
        NamespaceOperatingMode::ReadOnly,
        NamespaceOperatingMode::Disabled,
    ] {
        assert_eq!(mode.as_str().parse::<NamespaceOperatingMode>().unwrap(), mode);
    }
    assert!("static".parse::<NamespaceOperatingMode>().is_err());
    assert!(NamespaceOperatingMode::ReadOnly.watches_namespaces());
    assert!(!NamespaceOperatingMode::Disabled.watches_namespaces());
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_config_defaults() {
    let config = config_with(&[("PGO_VERSION", "4.7.0")]).unwrap();
    assert_eq!(config.operator_namespace, "pgo");
    assert_eq!(config.installation_name, "devtest");
    assert!(config.target_namespaces.is_empty());
    assert_eq!(config.pgtask_worker_count, 1);
    assert_eq!(config.configmap_worker_count, 2);
    assert_eq!(config.controller_group_refresh_interval, Duration::from_secs(60));
    assert_eq!(config.metrics_port, 8080);
    assert!(!config.disable_reconcile_rbac);
    assert!(config.event_addr.is_none());
    assert_eq!(config.pgo_image_tag, "4.7.0");
}

#[test]
fn test_config_requires_operator_namespace() {
    let err = OperatorConfig::from_lookup(env(&[("PGO_INSTALLATION_NAME", "devtest")])).unwrap_err();
    assert!(matches!(err, Error::Config(msg) if msg.contains("PGO_OPERATOR_NAMESPACE")));
}

#[test]
fn test_config_reads_overrides() {
    let config = config_with(&[
        ("NAMESPACE", "team-a, team-b,team-a"),
        ("PGO_TASK_WORKER_COUNT", "4"),
        ("CONTROLLER_GROUP_REFRESH_INTERVAL", "30"),
        ("DISABLE_RECONCILE_RBAC", "true"),
        ("EVENT_ADDR", "localhost:4151"),
    ])
    .unwrap();
    assert_eq!(config.target_namespaces, vec!["team-a", "team-b"]);
    assert_eq!(config.pgtask_worker_count, 4);
    assert_eq!(config.controller_group_refresh_interval, Duration::from_secs(30));
    assert!(config.disable_reconcile_rbac);
    assert_eq!(config.event_addr.as_deref(), Some("localhost:4151"));
}

#[test]
fn test_config_rejects_bad_numbers() {
    assert!(config_with(&[("CONFIGMAP_WORKER_COUNT", "two")]).is_err());
    assert!(config_with(&[("DISABLE_RECONCILE_RBAC", "sometimes")]).is_err());
}

#[test]
fn test_parse_helpers() {
    assert_eq!(parse_namespace_csv(" , pgo,,"), vec!["pgo"]);
    assert_eq!(parse_bool("TRUE"), Some(true));
    assert_eq!(parse_bool("f"), Some(false));
    assert_eq!(parse_bool("maybe"), None);
}

// ============================================================================
// Event Tests
// ============================================================================

#[test]
fn test_event_serialization() {
    let event = Event::new(
        "pgo",
        EventKind::CreateClusterCompleted {
            cluster: "hippo".to_string(),
            workflow_id: "abc-123".to_string(),
        },
    );
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["eventType"], "CreateClusterCompleted");
    assert_eq!(value["clustername"], "hippo");
    assert_eq!(value["workflowid"], "abc-123");
    assert_eq!(value["EventHeader"]["namespace"], "pgo");
    assert_eq!(value["EventHeader"]["topic"], json!(["alltopic", "clustertopic"]));
}

#[test]
fn test_event_topics() {
    let backup = EventKind::CreateBackupCompleted {
        cluster: "hippo".to_string(),
        backup_type: "pgbackrest".to_string(),
        path: String::new(),
    };
    assert_eq!(backup.topics(), vec!["alltopic", "backuptopic"]);
    let policy = EventKind::CreatePolicy {
        policy: "p1".to_string(),
    };
    assert_eq!(policy.topics(), vec!["alltopic", "policytopic"]);
}

#[test]
fn test_disabled_publisher_drops_events() {
    let publisher = EventPublisher::new(None).unwrap();
    assert!(!publisher.is_enabled());
    tokio_test::block_on(publisher.publish(
        "pgo",
        EventKind::UpgradeCluster {
            cluster: "hippo".to_string(),
        },
    ));
}

// ============================================================================
// RBAC and Controller Group Tests
// ============================================================================

#[test]
fn test_rbac_objects_live_in_target_namespace() {
    let names: Vec<String> = roles("team-a").iter().map(|r| r.name_any()).collect();
    assert_eq!(names, vec!["pgo-target-role", "pgo-backrest-role", "pgo-pg-role"]);
    assert!(roles("team-a")
        .iter()
        .all(|r| r.metadata.namespace.as_deref() == Some("team-a")));

    let bindings = role_bindings("pgo", "team-a");
    assert_eq!(bindings.len(), 3);
    for binding in &bindings {
        assert_eq!(binding.role_ref.kind, "Role");
        assert_eq!(
            binding.labels().get(labels::LABEL_VENDOR).map(String::as_str),
            Some(labels::LABEL_CRUNCHY)
        );
    }
    assert_eq!(service_account_names().len(), 4);
}

#[test]
fn test_group_actions() {
    assert_eq!(group_action(true, true), GroupAction::KeepRunning);
    assert_eq!(group_action(true, false), GroupAction::Revoke);
    assert_eq!(group_action(false, false), GroupAction::Deny);
    assert_eq!(group_action(false, true), GroupAction::Start);
}

#[test]
fn test_owned_labels_shape() {
    let expected = BTreeMap::from([
        ("vendor".to_string(), "crunchydata".to_string()),
        ("pgo-installation-name".to_string(), "devtest".to_string()),
    ]);
    assert_eq!(owned_labels("devtest"), expected);
}
