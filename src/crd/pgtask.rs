//! Pgtask Custom Resource Definition
//!
//! A Pgtask is a one-shot work order. Its `tasktype` selects the operation and
//! `parameters` carry every operation specific argument.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::labels;
use crate::error::{Error, Result};

/// Pgtask resource specification
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "crunchydata.com",
    version = "v1",
    kind = "Pgtask",
    plural = "pgtasks",
    singular = "pgtask",
    namespaced,
    status = "PgtaskStatus",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.tasktype"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
pub struct PgtaskSpec {
    #[serde(default)]
    pub name: String,

    /// Operation to perform, see [`TaskKind`]
    #[serde(rename = "tasktype", default)]
    pub task_type: String,

    /// Operation arguments
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    /// Free form status maintained by workflows
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
}

/// Pgtask status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct PgtaskStatus {
    #[serde(default)]
    pub state: PgtaskState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Processing state of a Pgtask
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgtaskState {
    #[default]
    Created,
    Processed,
    Completed,
}

pub const TASK_TYPE_PGADMIN_ADD: &str = "add-pgadmin";
pub const TASK_TYPE_PGADMIN_DELETE: &str = "delete-pgadmin";
pub const TASK_TYPE_UPGRADE: &str = "clusterupgrade";
pub const TASK_TYPE_ROLLING_UPDATE: &str = "rolling-update";
pub const TASK_TYPE_DELETE_DATA: &str = "delete-data";
pub const TASK_TYPE_BACKREST: &str = "backrest";
pub const TASK_TYPE_BACKREST_RESTORE: &str = "restore";
pub const TASK_TYPE_PGDUMP: &str = "pgdump";
pub const TASK_TYPE_PGRESTORE: &str = "pgrestore";
pub const TASK_TYPE_WORKFLOW: &str = "workflow";

/// Workflow type created alongside a new cluster
pub const WORKFLOW_CREATE_CLUSTER: &str = "createcluster";
/// Workflow type created alongside a restore
pub const WORKFLOW_BACKREST_RESTORE: &str = "pgbackrestrestore";
/// Parameter recording workflow completion time
pub const WORKFLOW_COMPLETED_STATUS: &str = "task completed";
/// Parameter recording that the restored primary has been created
pub const WORKFLOW_RESTORE_PRIMARY_CREATED: &str = "restored Primary created";

/// pgBackRest command carried by a `backrest` task
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackrestCommand {
    Backup,
    StanzaCreate,
    /// Any other pgBackRest command (`info`, `expire`, ...)
    Other(String),
}

impl BackrestCommand {
    pub fn parse(command: &str) -> Self {
        match command {
            labels::BACKREST_COMMAND_BACKUP => BackrestCommand::Backup,
            labels::BACKREST_COMMAND_STANZA_CREATE => BackrestCommand::StanzaCreate,
            other => BackrestCommand::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BackrestCommand::Backup => labels::BACKREST_COMMAND_BACKUP,
            BackrestCommand::StanzaCreate => labels::BACKREST_COMMAND_STANZA_CREATE,
            BackrestCommand::Other(command) => command,
        }
    }
}

/// Every operation a Pgtask can request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskKind {
    PgAdminAdd,
    PgAdminDelete,
    Upgrade,
    RollingUpdate,
    DeleteData,
    Backrest(BackrestCommand),
    BackrestRestore,
    PgDump,
    PgRestore,
    Workflow,
}

impl TaskKind {
    /// Resolve the task kind of a Pgtask, reading the backrest command parameter when needed
    pub fn of(task: &Pgtask) -> Result<Self> {
        let kind: TaskKind = task.spec.task_type.parse()?;
        Ok(match kind {
            TaskKind::Backrest(_) => TaskKind::Backrest(BackrestCommand::parse(
                task.parameter(labels::LABEL_BACKREST_COMMAND).unwrap_or_default(),
            )),
            other => other,
        })
    }

    /// Name used for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::PgAdminAdd => TASK_TYPE_PGADMIN_ADD,
            TaskKind::PgAdminDelete => TASK_TYPE_PGADMIN_DELETE,
            TaskKind::Upgrade => TASK_TYPE_UPGRADE,
            TaskKind::RollingUpdate => TASK_TYPE_ROLLING_UPDATE,
            TaskKind::DeleteData => TASK_TYPE_DELETE_DATA,
            TaskKind::Backrest(_) => TASK_TYPE_BACKREST,
            TaskKind::BackrestRestore => TASK_TYPE_BACKREST_RESTORE,
            TaskKind::PgDump => TASK_TYPE_PGDUMP,
            TaskKind::PgRestore => TASK_TYPE_PGRESTORE,
            TaskKind::Workflow => TASK_TYPE_WORKFLOW,
        }
    }
}

impl FromStr for TaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            TASK_TYPE_PGADMIN_ADD => Ok(TaskKind::PgAdminAdd),
            TASK_TYPE_PGADMIN_DELETE => Ok(TaskKind::PgAdminDelete),
            TASK_TYPE_UPGRADE => Ok(TaskKind::Upgrade),
            TASK_TYPE_ROLLING_UPDATE => Ok(TaskKind::RollingUpdate),
            TASK_TYPE_DELETE_DATA => Ok(TaskKind::DeleteData),
            TASK_TYPE_BACKREST => Ok(TaskKind::Backrest(BackrestCommand::Other(String::new()))),
            TASK_TYPE_BACKREST_RESTORE => Ok(TaskKind::BackrestRestore),
            TASK_TYPE_PGDUMP => Ok(TaskKind::PgDump),
            TASK_TYPE_PGRESTORE => Ok(TaskKind::PgRestore),
            TASK_TYPE_WORKFLOW => Ok(TaskKind::Workflow),
            other => Err(Error::UnknownTaskType(other.to_string())),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Backrest(command) => write!(f, "{}/{}", self.name(), command.as_str()),
            other => f.write_str(other.name()),
        }
    }
}

impl Pgtask {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.spec.parameters.get(key).map(String::as_str)
    }

    pub fn state(&self) -> PgtaskState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Whether the task has already been handed to its operation
    pub fn is_processed(&self) -> bool {
        matches!(self.state(), PgtaskState::Processed | PgtaskState::Completed)
    }

    /// Whether a delete-data task has already launched its removal job
    pub fn delete_data_started(&self) -> bool {
        self.parameter(labels::LABEL_DELETE_DATA_STARTED).is_some()
    }
}
