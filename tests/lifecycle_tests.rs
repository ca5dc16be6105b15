//! Integration tests for cluster lifecycle rules
//!
//! These tests cover the state transition table, the version gate and the cluster level
//! decisions taken by the Pgcluster handler.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use pgo_operator::config::labels;
use pgo_operator::controllers::pgcluster::{autofail_change, power_change, PowerChange};
use pgo_operator::crd::{ClusterLifecycle, Pgcluster, PgclusterSpec, PgclusterStatus, Pgreplica, PgreplicaSpec};
use pgo_operator::operator::cluster::{add_action, AddAction};
use pgo_operator::lifecycle::{can_transition, next_states, transition, validate, TRANSITIONS};
use pgo_operator::operator::upgrade::needs_upgrade;
use pgo_operator::Error;

use ClusterLifecycle::*;

// ============================================================================
// Test Helpers
// ============================================================================

fn cluster(name: &str) -> Pgcluster {
    let mut cluster = Pgcluster::new(name, PgclusterSpec::default());
    cluster.metadata.namespace = Some("pgo".to_string());
    cluster
}

fn with_state(mut cluster: Pgcluster, state: ClusterLifecycle) -> Pgcluster {
    cluster.status = Some(PgclusterStatus {
        state: Some(state),
        message: String::new(),
    });
    cluster
}

fn with_labels(mut cluster: Pgcluster, pairs: &[(&str, &str)]) -> Pgcluster {
    let labels = cluster.metadata.labels.get_or_insert_with(BTreeMap::new);
    for (k, v) in pairs {
        labels.insert(k.to_string(), v.to_string());
    }
    cluster
}

fn with_annotations(mut cluster: Pgcluster, pairs: &[(&str, &str)]) -> Pgcluster {
    let annotations = cluster.metadata.annotations.get_or_insert_with(BTreeMap::new);
    for (k, v) in pairs {
        annotations.insert(k.to_string(), v.to_string());
    }
    cluster
}

// ============================================================================
// Transition Table Tests
// ============================================================================

#[test]
fn test_cluster_without_status_is_creating() {
    assert_eq!(cluster("hippo").lifecycle(), Creating);
}

#[test]
fn test_every_state_may_be_reasserted() {
    for state in ClusterLifecycle::ALL {
        assert!(can_transition(state, state), "{state} -> {state}");
    }
}

#[test]
fn test_bootstrap_path_is_allowed() {
    assert!(can_transition(Creating, Bootstrapping));
    assert!(can_transition(Bootstrapping, Bootstrapped));
    assert!(can_transition(Bootstrapped, Initialized));
}

#[test]
fn test_startup_after_shutdown_is_allowed() {
    assert!(can_transition(Initialized, Shutdown));
    assert!(can_transition(Shutdown, Initialized));
}

#[test]
fn test_initialized_cannot_go_back_to_creating() {
    assert!(!can_transition(Initialized, Creating));
    assert!(!can_transition(Initialized, Bootstrapping));
    assert!(transition(Initialized, Creating).is_none());
}

#[test]
fn test_bootstrapping_only_leads_to_bootstrapped() {
    assert_eq!(next_states(Bootstrapping), vec![Bootstrapped]);
}

#[test]
fn test_validate_rejects_illegal_transition() {
    let err = validate("hippo", Initialized, Creating).unwrap_err();
    match err {
        Error::InvalidTransition { cluster, from, to } => {
            assert_eq!(cluster, "hippo");
            assert_eq!(from, "Initialized");
            assert_eq!(to, "Creating");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_transition_table_has_no_duplicates() {
    for (i, a) in TRANSITIONS.iter().enumerate() {
        for b in &TRANSITIONS[i + 1..] {
            assert!(!(a.from == b.from && a.to == b.to), "{} -> {} listed twice", a.from, a.to);
        }
    }
}

#[test]
fn test_lifecycle_parses_from_display_form() {
    for state in ClusterLifecycle::ALL {
        assert_eq!(state.to_string().parse::<ClusterLifecycle>().unwrap(), state);
    }
    assert!("Running".parse::<ClusterLifecycle>().is_err());
}

#[test]
fn test_status_accepts_earlier_state_spellings() {
    let status: PgclusterStatus =
        serde_json::from_value(serde_json::json!({ "state": "pgcluster Initialized" })).unwrap();
    assert_eq!(status.state, Some(Initialized));

    let status: PgclusterStatus =
        serde_json::from_value(serde_json::json!({ "state": "pgcluster Restoring" })).unwrap();
    assert_eq!(status.state, Some(Restore));

    let status: PgclusterStatus =
        serde_json::from_value(serde_json::json!({ "state": "pgcluster Processed" })).unwrap();
    assert_eq!(status.state, Some(Creating));
}

#[test]
fn test_unrecognised_state_does_not_fail_a_cluster_list() {
    let list: Vec<Pgcluster> = serde_json::from_value(serde_json::json!([
        {
            "apiVersion": "crunchydata.com/v1",
            "kind": "Pgcluster",
            "metadata": { "name": "hippo", "namespace": "pgo" },
            "spec": {},
            "status": { "state": "" }
        },
        {
            "apiVersion": "crunchydata.com/v1",
            "kind": "Pgcluster",
            "metadata": { "name": "rhino", "namespace": "pgo" },
            "spec": {},
            "status": { "state": "Initialized" }
        }
    ]))
    .unwrap();

    assert_eq!(list[0].lifecycle(), Unknown);
    assert!(list[0].reconcile_paused());
    assert_eq!(list[1].lifecycle(), Initialized);
    assert!(!list[1].reconcile_paused());
}

#[test]
fn test_unknown_state_never_advances() {
    for state in ClusterLifecycle::ALL {
        assert!(!can_transition(Unknown, state), "Unknown -> {state}");
    }
    assert!(next_states(Unknown).is_empty());
    assert!(!ClusterLifecycle::ALL.contains(&Unknown));
}

// ============================================================================
// Version Gate Tests
// ============================================================================

#[test]
fn test_missing_version_label_needs_upgrade() {
    assert!(needs_upgrade(&cluster("hippo"), "4.7.0"));
}

#[test]
fn test_matching_version_label_does_not_need_upgrade() {
    let c = with_labels(cluster("hippo"), &[(labels::LABEL_PGO_VERSION, "4.7.0")]);
    assert!(!needs_upgrade(&c, "4.7.0"));
    assert!(needs_upgrade(&c, "4.8.0"));
}

#[test]
fn test_replica_version_gate() {
    let mut replica = Pgreplica::new("hippo-abcd", PgreplicaSpec::default());
    replica.metadata = ObjectMeta {
        name: Some("hippo-abcd".to_string()),
        labels: Some(BTreeMap::from([(
            labels::LABEL_PGO_VERSION.to_string(),
            "4.6.2".to_string(),
        )])),
        ..Default::default()
    };
    assert!(needs_upgrade(&replica, "4.7.0"));
}

#[test]
fn test_awaiting_upgrade_reads_annotation() {
    let paused = with_annotations(cluster("hippo"), &[(labels::ANNOTATION_IS_UPGRADED, "false")]);
    assert!(paused.awaiting_upgrade());

    let upgraded = with_annotations(cluster("hippo"), &[(labels::ANNOTATION_IS_UPGRADED, "true")]);
    assert!(!upgraded.awaiting_upgrade());
    assert!(!cluster("hippo").awaiting_upgrade());
}

// ============================================================================
// Cluster Accessor Tests
// ============================================================================

#[test]
fn test_scope_and_primary_default_to_cluster_name() {
    let c = cluster("hippo");
    assert_eq!(c.pgha_scope(), "hippo");
    assert_eq!(c.current_primary(), "hippo");

    let c = with_annotations(
        with_labels(c, &[(labels::LABEL_PGHA_SCOPE, "hippo-ha")]),
        &[(labels::ANNOTATION_CURRENT_PRIMARY, "hippo-xyzw")],
    );
    assert_eq!(c.pgha_scope(), "hippo-ha");
    assert_eq!(c.current_primary(), "hippo-xyzw");
}

#[test]
fn test_bootstrap_namespace_defaults_to_own_namespace() {
    let mut c = cluster("hippo");
    assert_eq!(c.bootstrap_namespace(), "pgo");
    c.spec.pg_data_source.namespace = "other".to_string();
    assert_eq!(c.bootstrap_namespace(), "other");
}

#[test]
fn test_s3_only_repository() {
    let mut c = cluster("hippo");
    c.spec
        .user_labels
        .insert(labels::LABEL_BACKREST_STORAGE_TYPE.to_string(), "s3".to_string());
    assert!(c.backrest_s3_only());
    c.spec
        .user_labels
        .insert(labels::LABEL_BACKREST_STORAGE_TYPE.to_string(), "local,s3".to_string());
    assert!(!c.backrest_s3_only());
}

// ============================================================================
// Pgcluster Update Decision Tests
// ============================================================================

#[test]
fn test_shutdown_requested_on_running_cluster() {
    let mut c = with_state(cluster("hippo"), Initialized);
    c.spec.shutdown = true;
    assert_eq!(power_change(&c), Some(PowerChange::Shutdown));
}

#[test]
fn test_startup_requested_on_shut_down_cluster() {
    let c = with_state(cluster("hippo"), Shutdown);
    assert_eq!(power_change(&c), Some(PowerChange::Startup));
}

#[test]
fn test_no_power_change_when_state_matches() {
    let mut c = with_state(cluster("hippo"), Shutdown);
    c.spec.shutdown = true;
    assert_eq!(power_change(&c), None);
    assert_eq!(power_change(&with_state(cluster("hippo"), Initialized)), None);
}

#[test]
fn test_autofail_change_detects_toggle() {
    let on = with_labels(cluster("hippo"), &[(labels::LABEL_AUTOFAIL, "true")]);
    let off = with_labels(cluster("hippo"), &[(labels::LABEL_AUTOFAIL, "false")]);
    assert_eq!(autofail_change(&on, &off), Some(false));
    assert_eq!(autofail_change(&off, &on), Some(true));
    assert_eq!(autofail_change(&on, &on), None);
}

#[test]
fn test_autofail_change_ignores_missing_label() {
    let on = with_labels(cluster("hippo"), &[(labels::LABEL_AUTOFAIL, "true")]);
    assert_eq!(autofail_change(&cluster("hippo"), &on), None);
}

// ============================================================================
// Cluster Add Tests
// ============================================================================

fn restored_from(mut cluster: Pgcluster, source: &str) -> Pgcluster {
    cluster.spec.pg_data_source.restore_from = source.to_string();
    cluster
}

#[test]
fn test_new_cluster_is_created() {
    assert_eq!(add_action(&cluster("hippo")), AddAction::Create);
}

#[test]
fn test_restore_from_bootstraps() {
    let c = restored_from(cluster("rhino"), "hippo");
    assert_eq!(add_action(&c), AddAction::Bootstrap("hippo".to_string()));
}

#[test]
fn test_set_up_clusters_are_not_added_again() {
    for state in [Bootstrapping, Bootstrapped, Initialized, Shutdown, Restore] {
        let c = with_state(restored_from(cluster("rhino"), "hippo"), state);
        assert_eq!(add_action(&c), AddAction::Skip, "{state}");
    }
}

#[test]
fn test_paused_clusters_are_not_added() {
    let awaiting = with_annotations(cluster("hippo"), &[(labels::ANNOTATION_IS_UPGRADED, "false")]);
    assert_eq!(add_action(&awaiting), AddAction::Skip);
    assert_eq!(add_action(&with_state(cluster("hippo"), Unknown)), AddAction::Skip);
}
