//! Conflict resolution for a single incoming mutation
//!
//! Accept/reject is decided purely from the claimed base version, the
//! current stored record, and the recorded mutation fingerprints; no
//! field-level merge is ever attempted.

use crate::error::Result;
use crate::models::{EntryMutation, LogEntry, MutationKind, OwnerId};
use crate::store::{Fingerprint, RecordStore};

/// Decision for one mutation given its claimed base version
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Mutation may commit and will produce `new_version`
    Accepted { new_version: i64 },
    /// Identical mutation already committed at this position; answer with
    /// the recorded version and do not commit again
    AlreadyApplied { version: i64 },
    /// Claimed base version is stale; the caller must refetch and retry
    Conflict { current: LogEntry },
    /// Target id does not exist and the operation is not a create
    NotFound,
    /// Caller is not the record's owner
    Unauthorized,
}

/// Resolve a mutation against the authoritative store.
///
/// The idempotence rule makes exactly-once semantics achievable over an
/// at-least-once transport: a retry whose fingerprint matches the one
/// recorded at `base_version + 1` is answered `AlreadyApplied` instead of
/// re-incrementing the version.
pub fn resolve(
    store: &dyn RecordStore,
    caller: &OwnerId,
    mutation: &EntryMutation,
    fingerprint: &Fingerprint,
) -> Result<Resolution> {
    let Some(current) = store.get(&mutation.id)? else {
        return Ok(match mutation.kind {
            MutationKind::Create => Resolution::Accepted { new_version: 1 },
            MutationKind::Update | MutationKind::Delete => Resolution::NotFound,
        });
    };

    if current.owner != *caller {
        return Ok(Resolution::Unauthorized);
    }

    // Idempotent retry: the committed mutation at base_version + 1 is
    // byte-identical to this one
    let retried_version = mutation.base_version + 1;
    if let Some(recorded) = store.fingerprint_at(&mutation.id, retried_version)? {
        if recorded == *fingerprint {
            return Ok(Resolution::AlreadyApplied {
                version: retried_version,
            });
        }
    }

    // A tombstone is terminal; anything that is not a retry of the
    // delete itself conflicts
    if current.deleted {
        return Ok(Resolution::Conflict { current });
    }

    if mutation.base_version == current.version && mutation.kind != MutationKind::Create {
        return Ok(Resolution::Accepted {
            new_version: current.version + 1,
        });
    }

    Ok(Resolution::Conflict { current })
}
