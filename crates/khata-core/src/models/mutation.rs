//! Client mutation and per-record outcome models

use serde::{Deserialize, Serialize};

use super::entry::{EntryId, EntryPayload, LogEntry};

/// What a mutation does to its record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// One client mutation inside a push batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMutation {
    /// Client-chosen handle used to correlate the outcome in the response
    pub client_tag: String,
    pub kind: MutationKind,
    pub id: EntryId,
    /// Version the client last observed; 0 means "no prior version" (create)
    pub base_version: i64,
    /// Required for create/update; absent for delete
    pub payload: Option<EntryPayload>,
}

/// Per-record outcome of a committed (or rejected) mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MutationOutcome {
    /// Mutation applied (or recognized as an idempotent retry)
    Accepted { new_version: i64 },
    /// Claimed base version is stale; the authoritative record is attached
    Conflict { server_record: LogEntry },
    /// Validation or authorization failure; not retryable
    Rejected { reason: String },
    /// Storage kept failing after bounded retries; safe to resubmit
    TransientError,
}

/// Outcome paired with the client's correlation tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub client_tag: String,
    #[serde(flatten)]
    pub outcome: MutationOutcome,
}
