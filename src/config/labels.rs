//! Label, annotation and naming vocabulary shared with the database and repository images.
//!
//! These keys are the only linkage between custom resources and the native objects that
//! back them, so the strings must stay byte-for-byte stable.

/// API group of the operator's custom resources
pub const API_GROUP: &str = "crunchydata.com";

pub const LABEL_VENDOR: &str = "vendor";
pub const LABEL_CRUNCHY: &str = "crunchydata";
pub const LABEL_PGO_INSTALLATION_NAME: &str = "pgo-installation-name";
pub const LABEL_PGO_VERSION: &str = "pgo-version";

pub const LABEL_PG_CLUSTER: &str = "pg-cluster";
pub const LABEL_PG_DATABASE: &str = "pgo-pg-database";
pub const LABEL_PGTASK: &str = "pg-task";
pub const LABEL_AUTOFAIL: &str = "autofail";
pub const LABEL_RMDATA: &str = "pgrmdata";
pub const LABEL_REPLICA_NAME: &str = "replica-name";
pub const LABEL_DEPLOYMENT_NAME: &str = "deployment-name";
pub const LABEL_SERVICE_NAME: &str = "service-name";
pub const LABEL_JOB_NAME: &str = "job-name";
pub const LABEL_WORKFLOW_ID: &str = "workflowid";
pub const LABEL_PGBOUNCER: &str = "crunchy-pgbouncer";
pub const LABEL_PGADMIN: &str = "crunchy-pgadmin";
pub const LABEL_PGPOLICY: &str = "pgpolicy";

pub const LABEL_BACKREST: &str = "pgo-backrest";
pub const LABEL_BACKREST_JOB: &str = "pgo-backrest-job";
pub const LABEL_BACKREST_RESTORE: &str = "pgo-backrest-restore";
pub const LABEL_BACKREST_COMMAND: &str = "backrest-command";
pub const LABEL_BACKREST_OPTS: &str = "backrest-opts";
pub const LABEL_BACKREST_STORAGE_TYPE: &str = "backrest-storage-type";
pub const LABEL_BACKREST_RESTORE_FROM_CLUSTER: &str = "backrest-restore-from-cluster";
pub const LABEL_BACKREST_RESTORE_OPTS: &str = "backrest-restore-opts";
pub const LABEL_BACKREST_PITR_TARGET: &str = "backrest-pitr-target";
pub const LABEL_PGO_BACKREST_REPO: &str = "pgo-backrest-repo";
pub const LABEL_CONTAINER_NAME: &str = "containername";
pub const LABEL_POD_NAME: &str = "podname";

pub const LABEL_PGDUMP_COMMAND: &str = "pgdump";
pub const LABEL_PGDUMP_OPTS: &str = "pgdump-opts";
pub const LABEL_PGDUMP_DB: &str = "pgdump-db";
pub const LABEL_PGDUMP_PVC: &str = "pgdump-pvc";
pub const LABEL_PGRESTORE_COMMAND: &str = "pgrestore";
pub const LABEL_PGRESTORE_DB: &str = "pgrestore-db";
pub const LABEL_PGRESTORE_FROM_PVC: &str = "pgrestore-from-pvc";
pub const LABEL_PGRESTORE_OPTS: &str = "pgrestore-opts";

pub const LABEL_DELETE_DATA: &str = "delete-data";
pub const LABEL_DELETE_DATA_STARTED: &str = "delete-data-started";
pub const LABEL_DELETE_BACKUPS: &str = "delete-backups";
pub const LABEL_IS_REPLICA: &str = "is-replica";
pub const LABEL_IS_BACKUP: &str = "is-backup";

pub const LABEL_PGHA_SCOPE: &str = "crunchy-pgha-scope";
pub const LABEL_PGHA_CONFIGMAP: &str = "pgha-config";
pub const LABEL_PGHA_BACKUP_TYPE: &str = "pgha-backup-type";
pub const LABEL_PGHA_ROLE: &str = "role";
pub const LABEL_PGHA_ROLE_PRIMARY: &str = "master";
pub const LABEL_PGHA_ROLE_REPLICA: &str = "replica";
pub const LABEL_PGHA_ROLE_PROMOTED: &str = "promoted";
pub const LABEL_PGHA_BOOTSTRAP: &str = "pgha-bootstrap";
pub const LABEL_PGHA_BOOTSTRAP_NAMESPACE: &str = "pgha-bootstrap-namespace";

pub const LABEL_TRUE: &str = "true";
pub const LABEL_FALSE: &str = "false";

pub const ANNOTATION_IS_UPGRADED: &str = "is-upgraded";
pub const ANNOTATION_CURRENT_PRIMARY: &str = "current-primary";
pub const ANNOTATION_BACKREST_RESTORE: &str = "pgo-backrest-restore";
pub const ANNOTATION_PGHA_BOOTSTRAP_REPLICA: &str = "pgo-pgha-bootstrap-replica";
pub const ANNOTATION_PRIMARY_DEPLOYMENT: &str = "primary-deployment";
pub const ANNOTATION_KEEP_DATA: &str = "keep-data";
pub const ANNOTATION_KEEP_BACKUPS: &str = "keep-backups";
pub const ANNOTATION_DO_NOT_RESIZE: &str = "do-not-resize";

/// Patroni writes its member status as JSON into this pod annotation
pub const ANNOTATION_PATRONI_STATUS: &str = "status";

/// Values of the `pgha-backup-type` label
pub const BACKUP_TYPE_BOOTSTRAP: &str = "bootstrap";
pub const BACKUP_TYPE_FAILOVER: &str = "failover";

/// Values of the `backrest-command` label
pub const BACKREST_COMMAND_BACKUP: &str = "backup";
pub const BACKREST_COMMAND_STANZA_CREATE: &str = "stanza-create";
pub const BACKREST_COMMAND_RESTORE: &str = "restore";

/// Container names inside database and repository pods
pub const CONTAINER_DATABASE: &str = "database";
pub const CONTAINER_BACKREST_REPO: &str = "pgo-backrest-repo";

/// Environment variable that carries the repository pod name in backrest jobs
pub const ENV_PODNAME: &str = "PODNAME";

/// Finalizer placed on objects deleted with foreground propagation
pub const FOREGROUND_DELETION_FINALIZER: &str = "foregroundDeletion";

/// Patroni REST API port inside database pods
pub const PATRONI_PORT: u16 = 8009;

/// `<cluster>-backrest-shared-repo`
pub fn backrest_repo_name(cluster: &str) -> String {
    format!("{cluster}-backrest-shared-repo")
}

/// `<cluster>-backrest-repo-config`
pub fn backrest_repo_secret_name(cluster: &str) -> String {
    format!("{cluster}-backrest-repo-config")
}

/// `<cluster>-bootstrap-backrest-repo-config`
pub fn bootstrap_repo_secret_name(cluster: &str) -> String {
    format!("{cluster}-bootstrap-backrest-repo-config")
}

/// `<cluster>-stanza-create`
pub fn stanza_create_name(cluster: &str) -> String {
    format!("{cluster}-{BACKREST_COMMAND_STANZA_CREATE}")
}

/// `backrest-backup-<cluster>`
pub fn backrest_backup_name(cluster: &str) -> String {
    format!("backrest-backup-{cluster}")
}

/// `<cluster>-pgha-config`
pub fn pgha_configmap_name(cluster: &str) -> String {
    format!("{cluster}-pgha-config")
}

/// `<cluster>-config`, the Patroni DCS configMap
pub fn dcs_configmap_name(cluster: &str) -> String {
    format!("{cluster}-config")
}

/// `<cluster>-dcs-config`, the DCS entry inside the PGHA configMap
pub fn dcs_config_key(cluster: &str) -> String {
    format!("{cluster}-dcs-config")
}

/// `<cluster>-wal`
pub fn wal_pvc_name(cluster: &str) -> String {
    format!("{cluster}-wal")
}

/// `<cluster>-pgbr-repo`
pub fn backrest_repo_pvc_name(cluster: &str) -> String {
    format!("{cluster}-pgbr-repo")
}

/// `backup-<cluster>-pgdump`, prefix of pgdump PVC names
pub fn pgdump_pvc_prefix(cluster: &str) -> String {
    format!("backup-{cluster}-pgdump")
}

/// `<cluster>-pgbouncer`
pub fn pgbouncer_name(cluster: &str) -> String {
    format!("{cluster}-pgbouncer")
}

/// `<cluster>-replica`
pub fn replica_service_name(cluster: &str) -> String {
    format!("{cluster}-replica")
}

/// Selector string `k1=v1,k2=v2` from pairs
pub fn selector(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
