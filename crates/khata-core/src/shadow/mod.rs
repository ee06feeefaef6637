//! Client-side shadow store
//!
//! The shadow database is the device-local copy of one farmer's logbook.
//! Entries edited offline are marked dirty and turned into mutations at
//! push time; pulled pages overwrite clean rows and advance the stored
//! cursor. A dirty row is never overwritten by a pull; the push phase
//! settles it first.

pub mod sqlite;

pub use sqlite::SqliteShadowStore;

use crate::error::Result;
use crate::models::{EntryId, EntryMutation, EntryPayload, LogEntry, MutationResult};
use crate::store::Cursor;

/// One locally-held record and its sync bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowRecord {
    pub id: EntryId,
    pub payload: EntryPayload,
    /// Last server version this row was based on; 0 for a local-only
    /// create that has never been pushed
    pub base_version: i64,
    pub deleted: bool,
    /// Local edits not yet acknowledged by the server
    pub dirty: bool,
    /// Server commit stamp of the base; 0 until first synced
    pub last_modified: i64,
}

impl ShadowRecord {
    /// Derive the mutation this dirty row wants to push
    #[must_use]
    pub fn to_mutation(&self) -> EntryMutation {
        let kind = if self.base_version == 0 {
            crate::models::MutationKind::Create
        } else if self.deleted {
            crate::models::MutationKind::Delete
        } else {
            crate::models::MutationKind::Update
        };
        let payload = match kind {
            crate::models::MutationKind::Delete => None,
            crate::models::MutationKind::Create | crate::models::MutationKind::Update => {
                Some(self.payload.clone())
            }
        };
        EntryMutation {
            // The entry id doubles as the client tag; one dirty row
            // produces at most one mutation per push
            client_tag: self.id.as_str(),
            kind,
            id: self.id,
            base_version: self.base_version,
            payload,
        }
    }
}

/// Local persistence consumed by the sync session
pub trait ShadowStore {
    /// Mutations for every dirty row, in a stable order
    fn pending_mutations(&self) -> Result<Vec<EntryMutation>>;

    /// Fold one push outcome back into the local row
    fn apply_push_result(&self, result: &MutationResult) -> Result<()>;

    /// Apply one pulled page and persist `next_cursor` atomically
    fn apply_page(&self, entries: &[LogEntry], next_cursor: Option<&Cursor>) -> Result<()>;

    /// Watermark of the last durably applied page
    fn cursor(&self) -> Result<Option<Cursor>>;
}
