//! Record store contract
//!
//! The sync engine only requires durable keyed storage with an atomic
//! per-record compare-and-set on the version counter. The contract is a
//! trait so the Conflict Resolver and Mutation Committer can be tested
//! against any implementation.

pub mod db;
pub mod migrations;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{EntryId, EntryPayload, LogEntry, MutationKind, OwnerId};

pub use db::Database;
pub use sqlite::SqliteRecordStore;

/// Watermark marking a client's progress through the delta feed.
///
/// Ordered by `(last_modified, last_id)`; the id component breaks ties so
/// pagination never skips or duplicates a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_modified: i64,
    pub last_id: EntryId,
}

/// Digest of a mutation's content, retained per committed version so a
/// retried mutation can be recognized and answered with the existing
/// version instead of committing twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest over `(kind, base_version, payload)`. Two mutations are
    /// considered identical retries iff their fingerprints match.
    pub fn compute(
        kind: MutationKind,
        base_version: i64,
        payload: Option<&EntryPayload>,
    ) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update([match kind {
            MutationKind::Create => 0u8,
            MutationKind::Update => 1,
            MutationKind::Delete => 2,
        }]);
        hasher.update(base_version.to_be_bytes());
        if let Some(payload) = payload {
            hasher.update(serde_json::to_vec(payload)?);
        }
        Ok(Self(hasher.finalize().into()))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 64 {
            return Err(Error::Database(format!(
                "invalid fingerprint length: {}",
                hex.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (index, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let text = std::str::from_utf8(chunk)
                .map_err(|_| Error::Database("invalid fingerprint encoding".into()))?;
            bytes[index] = u8::from_str_radix(text, 16)
                .map_err(|_| Error::Database("invalid fingerprint encoding".into()))?;
        }
        Ok(Self(bytes))
    }
}

/// Result of a single atomic committed write against one record
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Write applied; the stamped, committed record
    Committed(LogEntry),
    /// Version guard failed; the current authoritative record
    VersionMismatch(LogEntry),
}

/// Durable keyed storage with per-record optimistic concurrency.
///
/// `last_modified` stamping is the store's responsibility: the committed
/// stamp is `max(now_ms, high_watermark + 1)`, issued inside the same
/// atomic operation as the version bump, so the feed ordering key is
/// strictly monotonic even if the host clock regresses.
pub trait RecordStore {
    /// Fetch a record by id, tombstones included
    fn get(&self, id: &EntryId) -> Result<Option<LogEntry>>;

    /// Insert a brand-new record at version 1 iff `id` does not exist;
    /// otherwise `VersionMismatch` with the existing record
    fn try_create(
        &self,
        id: &EntryId,
        owner: &OwnerId,
        payload: &EntryPayload,
        fingerprint: &Fingerprint,
        now_ms: i64,
    ) -> Result<CommitOutcome>;

    /// Compare-and-set: apply the change iff the stored version still
    /// equals `expected_version`. A `None` payload keeps the stored
    /// payload (used by delete, which only flips the tombstone).
    fn try_commit(
        &self,
        id: &EntryId,
        expected_version: i64,
        payload: Option<&EntryPayload>,
        deleted: bool,
        fingerprint: &Fingerprint,
        now_ms: i64,
    ) -> Result<CommitOutcome>;

    /// Fingerprint recorded for `(id, version)`, if that version exists
    fn fingerprint_at(&self, id: &EntryId, version: i64) -> Result<Option<Fingerprint>>;

    /// Records owned by `owner` strictly after `cursor`, ascending by
    /// `(last_modified, id)`, tombstones included
    fn scan_after(
        &self,
        owner: &OwnerId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<LogEntry>>;
}
