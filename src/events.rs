use crate::error::Result;
use crate::ids::*;
use crate::store::{Store, Tx};
use crate::types::WorkflowStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    BuildStatusChanged,
    JobStatusChanged,
    StepStatusChanged,
}

/// Per-kind payload data. One encoder/decoder per kind; the shared base
/// lives on [`Event`] itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    StatusChanged {
        status: WorkflowStatus,
        #[serde(default)]
        error: Option<String>,
    },
}

/// One entry in a build's append-only event log. Sequence numbers are
/// allocated from an atomically incremented per-build counter, so they
/// are gap-free and strictly increasing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub build_id: BuildId,
    pub seq: u64,
    pub kind: EventKind,
    /// Rendered id of the resource the event concerns.
    pub resource_id: String,
    pub workflow: String,
    pub job_name: String,
    pub resource_name: String,
    pub payload: EventPayload,
    pub created_at: DateTime<Utc>,
}

/// Append a status-changed event inside the caller's transaction:
/// increment the build's event counter, then create the event at the
/// returned sequence number. Returns the sequence number.
pub async fn append_status_event(
    store: &dyn Store,
    tx: &mut Tx,
    build_id: BuildId,
    kind: EventKind,
    resource_id: String,
    workflow: &str,
    job_name: &str,
    resource_name: &str,
    status: WorkflowStatus,
    error: Option<String>,
) -> Result<u64> {
    let seq = store.increment_event_counter(tx, build_id).await?;
    let event = Event {
        build_id,
        seq,
        kind,
        resource_id,
        workflow: workflow.to_string(),
        job_name: job_name.to_string(),
        resource_name: resource_name.to_string(),
        payload: EventPayload::StatusChanged { status, error },
        created_at: now(),
    };
    store.create_event(tx, &event).await?;
    Ok(seq)
}
