//! Lifecycle event publishing
//!
//! Events are published to an NSQ daemon through its HTTP `/pub` endpoint. Publishing is
//! best effort: when `EVENT_ADDR` is not configured the publisher is a no-op, and failures
//! are logged without affecting the caller.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const TOPIC_ALL: &str = "alltopic";
pub const TOPIC_CLUSTER: &str = "clustertopic";
pub const TOPIC_BACKUP: &str = "backuptopic";
pub const TOPIC_POLICY: &str = "policytopic";
pub const TOPIC_UPGRADE: &str = "upgradetopic";

/// User recorded on events raised by the operator itself
const OPERATOR_USER: &str = "pgo-operator";

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Event payloads
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "eventType")]
pub enum EventKind {
    CreateClusterCompleted {
        #[serde(rename = "clustername")]
        cluster: String,
        #[serde(rename = "workflowid")]
        workflow_id: String,
    },
    CreateClusterFailure {
        #[serde(rename = "clustername")]
        cluster: String,
        #[serde(rename = "errormessage")]
        error: String,
        #[serde(rename = "workflowid")]
        workflow_id: String,
    },
    CreateBackupCompleted {
        #[serde(rename = "clustername")]
        cluster: String,
        #[serde(rename = "backuptype")]
        backup_type: String,
        #[serde(rename = "path")]
        path: String,
    },
    RestoreClusterCompleted {
        #[serde(rename = "clustername")]
        cluster: String,
    },
    CreatePolicy {
        #[serde(rename = "policyname")]
        policy: String,
    },
    UpgradeCluster {
        #[serde(rename = "clustername")]
        cluster: String,
    },
}

impl EventKind {
    /// Name of the event type
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::CreateClusterCompleted { .. } => "CreateClusterCompleted",
            EventKind::CreateClusterFailure { .. } => "CreateClusterFailure",
            EventKind::CreateBackupCompleted { .. } => "CreateBackupCompleted",
            EventKind::RestoreClusterCompleted { .. } => "RestoreClusterCompleted",
            EventKind::CreatePolicy { .. } => "CreatePolicy",
            EventKind::UpgradeCluster { .. } => "UpgradeCluster",
        }
    }

    /// Topics the event is published on
    pub fn topics(&self) -> Vec<&'static str> {
        let specific = match self {
            EventKind::CreateClusterCompleted { .. }
            | EventKind::CreateClusterFailure { .. }
            | EventKind::RestoreClusterCompleted { .. } => TOPIC_CLUSTER,
            EventKind::CreateBackupCompleted { .. } => TOPIC_BACKUP,
            EventKind::CreatePolicy { .. } => TOPIC_POLICY,
            EventKind::UpgradeCluster { .. } => TOPIC_UPGRADE,
        };
        vec![TOPIC_ALL, specific]
    }
}

/// Common header of every event
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EventHeader {
    pub namespace: String,
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub topic: Vec<String>,
}

/// Full event as written to the bus
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Event {
    #[serde(rename = "EventHeader")]
    pub header: EventHeader,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(namespace: &str, kind: EventKind) -> Self {
        Self {
            header: EventHeader {
                namespace: namespace.to_string(),
                username: OPERATOR_USER.to_string(),
                timestamp: Utc::now(),
                topic: kind.topics().into_iter().map(str::to_string).collect(),
            },
            kind,
        }
    }
}

/// Publishes events to the bus when one is configured
#[derive(Clone, Debug)]
pub struct EventPublisher {
    target: Option<(reqwest::Client, String)>,
}

impl EventPublisher {
    /// Publisher for `addr` (`host:port` of the NSQ HTTP interface), disabled when `None`
    pub fn new(addr: Option<String>) -> Result<Self> {
        let target = match addr {
            Some(addr) => {
                let client = reqwest::Client::builder()
                    .timeout(PUBLISH_TIMEOUT)
                    .build()
                    .map_err(|e| Error::Event(e.to_string()))?;
                Some((client, addr))
            }
            None => None,
        };
        Ok(Self { target })
    }

    /// Publisher that drops every event
    pub fn disabled() -> Self {
        Self { target: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Publish an event, logging rather than returning any failure
    pub async fn publish(&self, namespace: &str, kind: EventKind) {
        let event = Event::new(namespace, kind);
        if let Err(e) = self.try_publish(&event).await {
            warn!(
                error = %e,
                event = event.kind.name(),
                namespace = %namespace,
                "Failed to publish event"
            );
        }
    }

    async fn try_publish(&self, event: &Event) -> Result<()> {
        let Some((client, addr)) = &self.target else {
            debug!(event = event.kind.name(), "Eventing disabled, dropping event");
            return Ok(());
        };

        for topic in &event.header.topic {
            let url = format!("http://{addr}/pub?topic={topic}");
            let response = client
                .post(&url)
                .json(event)
                .send()
                .await
                .map_err(|e| Error::Event(e.to_string()))?;
            if !response.status().is_success() {
                return Err(Error::Event(format!(
                    "publishing to topic {topic} returned {}",
                    response.status()
                )));
            }
        }
        debug!(event = event.kind.name(), "Published event");
        Ok(())
    }
}
