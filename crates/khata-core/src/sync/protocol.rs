//! Wire types shared by the server and the CLI client

use serde::{Deserialize, Serialize};

use crate::models::{EntryMutation, LogEntry, MutationResult};
use crate::store::Cursor;

/// Client-to-server mutation upload. The owner is never part of the
/// body; it comes from the verified auth context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub mutations: Vec<EntryMutation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<MutationResult>,
}

/// Server-to-client delta download. A `None` cursor requests a full
/// initial sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub cursor: Option<Cursor>,
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub entries: Vec<LogEntry>,
    pub next_cursor: Option<Cursor>,
    pub has_more: bool,
}
