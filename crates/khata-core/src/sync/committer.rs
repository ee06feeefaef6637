//! Mutation committer (push side)
//!
//! Applies a batch of client mutations, one independent atomic operation
//! per record. A failure on one mutation never blocks or rolls back its
//! siblings; every per-record error is returned inline in the batch
//! response.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::{
    EntryMutation, MutationKind, MutationOutcome, MutationResult, OwnerId,
};
use crate::store::{CommitOutcome, Fingerprint, RecordStore};

use super::resolver::{resolve, Resolution};

/// Transient-failure retries before giving up on a mutation
const MAX_TRANSIENT_ATTEMPTS: u32 = 3;
/// Resolve/commit rounds before conceding a CAS race as a conflict
const MAX_CAS_ROUNDS: u32 = 3;
/// Base backoff delay; doubles per attempt
const BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Request-scoped inputs: the authenticated owner and the commit instant.
///
/// Both are passed in explicitly rather than read from ambient state so
/// the committer stays pure and unit-testable.
#[derive(Debug, Clone)]
pub struct CommitContext {
    pub owner: OwnerId,
    pub now_ms: i64,
}

/// Commit a batch of mutations for one owner.
///
/// Processing order within the batch is unspecified; the only ordering
/// guarantee is per-record atomicity.
pub fn commit_batch(
    store: &dyn RecordStore,
    ctx: &CommitContext,
    mutations: &[EntryMutation],
) -> Vec<MutationResult> {
    mutations
        .iter()
        .map(|mutation| MutationResult {
            client_tag: mutation.client_tag.clone(),
            outcome: commit_one(store, ctx, mutation),
        })
        .collect()
}

fn commit_one(
    store: &dyn RecordStore,
    ctx: &CommitContext,
    mutation: &EntryMutation,
) -> MutationOutcome {
    if let Err(error) = validate_shape(mutation) {
        return MutationOutcome::Rejected {
            reason: error.to_string(),
        };
    }

    let fingerprint =
        match Fingerprint::compute(mutation.kind, mutation.base_version, mutation.payload.as_ref())
        {
            Ok(fingerprint) => fingerprint,
            Err(error) => {
                return MutationOutcome::Rejected {
                    reason: error.to_string(),
                }
            }
        };

    let mut attempt = 0;
    loop {
        match commit_with_cas(store, ctx, mutation, &fingerprint) {
            Ok(outcome) => return outcome,
            Err(Error::TransientStorage(reason)) => {
                attempt += 1;
                if attempt >= MAX_TRANSIENT_ATTEMPTS {
                    tracing::warn!(
                        id = %mutation.id,
                        attempts = attempt,
                        "giving up on transient storage failure: {reason}"
                    );
                    return MutationOutcome::TransientError;
                }
                std::thread::sleep(BACKOFF_BASE * 2u32.pow(attempt - 1));
            }
            Err(error) => return error_outcome(ctx, mutation, &error),
        }
    }
}

/// One resolve-then-commit pass, re-resolving when the compare-and-set
/// loses a race with a concurrent writer
fn commit_with_cas(
    store: &dyn RecordStore,
    ctx: &CommitContext,
    mutation: &EntryMutation,
    fingerprint: &Fingerprint,
) -> Result<MutationOutcome> {
    for _ in 0..MAX_CAS_ROUNDS {
        let resolution = resolve(store, &ctx.owner, mutation, fingerprint)?;
        let new_version = match resolution {
            Resolution::Accepted { new_version } => new_version,
            Resolution::AlreadyApplied { version } => {
                return Ok(MutationOutcome::Accepted {
                    new_version: version,
                })
            }
            Resolution::Conflict { current } => {
                return Ok(MutationOutcome::Conflict {
                    server_record: current,
                })
            }
            Resolution::NotFound => {
                return Ok(MutationOutcome::Rejected {
                    reason: format!("record not found: {}", mutation.id),
                })
            }
            Resolution::Unauthorized => {
                tracing::warn!(
                    id = %mutation.id,
                    owner = owner_fingerprint(&ctx.owner),
                    "rejected mutation on foreign record"
                );
                return Ok(MutationOutcome::Rejected {
                    reason: "not the record owner".to_string(),
                });
            }
        };

        let outcome = match mutation.kind {
            MutationKind::Create => {
                let payload = mutation
                    .payload
                    .as_ref()
                    .ok_or_else(|| Error::Validation("create requires a payload".into()))?;
                store.try_create(&mutation.id, &ctx.owner, payload, fingerprint, ctx.now_ms)?
            }
            MutationKind::Update => {
                let payload = mutation
                    .payload
                    .as_ref()
                    .ok_or_else(|| Error::Validation("update requires a payload".into()))?;
                store.try_commit(
                    &mutation.id,
                    mutation.base_version,
                    Some(payload),
                    false,
                    fingerprint,
                    ctx.now_ms,
                )?
            }
            MutationKind::Delete => store.try_commit(
                &mutation.id,
                mutation.base_version,
                None,
                true,
                fingerprint,
                ctx.now_ms,
            )?,
        };

        match outcome {
            CommitOutcome::Committed(entry) => {
                debug_assert_eq!(entry.version, new_version);
                return Ok(MutationOutcome::Accepted {
                    new_version: entry.version,
                });
            }
            // Lost the race between resolve and commit; re-resolve, which
            // will normally surface a conflict (or an idempotent retry)
            CommitOutcome::VersionMismatch(_) => {}
        }
    }

    let current = store
        .get(&mutation.id)?
        .ok_or_else(|| Error::NotFound(mutation.id.to_string()))?;
    Ok(MutationOutcome::Conflict {
        server_record: current,
    })
}

/// Structural checks that precede any store access
fn validate_shape(mutation: &EntryMutation) -> Result<()> {
    if mutation.client_tag.trim().is_empty() {
        return Err(Error::Validation("client_tag must not be empty".into()));
    }
    match mutation.kind {
        MutationKind::Create => {
            if mutation.base_version != 0 {
                return Err(Error::Validation(
                    "create must claim base_version 0".into(),
                ));
            }
        }
        MutationKind::Update | MutationKind::Delete => {
            if mutation.base_version < 1 {
                return Err(Error::Validation(
                    "update/delete must claim a positive base_version".into(),
                ));
            }
        }
    }
    match mutation.kind {
        MutationKind::Create | MutationKind::Update => match &mutation.payload {
            Some(payload) => payload.validate()?,
            None => return Err(Error::Validation("payload is required".into())),
        },
        MutationKind::Delete => {}
    }
    Ok(())
}

fn error_outcome(ctx: &CommitContext, mutation: &EntryMutation, error: &Error) -> MutationOutcome {
    match error {
        Error::Validation(reason) => MutationOutcome::Rejected {
            reason: reason.clone(),
        },
        Error::Authorization(reason) => {
            tracing::warn!(
                id = %mutation.id,
                owner = owner_fingerprint(&ctx.owner),
                "authorization failure: {reason}"
            );
            MutationOutcome::Rejected {
                reason: reason.clone(),
            }
        }
        Error::NotFound(id) => MutationOutcome::Rejected {
            reason: format!("record not found: {id}"),
        },
        other => {
            tracing::error!(id = %mutation.id, "mutation failed: {other}");
            MutationOutcome::TransientError
        }
    }
}

/// Hash for log fields; raw owner ids never hit the logs
fn owner_fingerprint(owner: &OwnerId) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    owner.as_str().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryId, EntryPayload};
    use crate::store::{Database, SqliteRecordStore};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn ctx(owner: &str, now_ms: i64) -> CommitContext {
        CommitContext {
            owner: OwnerId::new(owner),
            now_ms,
        }
    }

    fn payload(activity: &str) -> EntryPayload {
        EntryPayload {
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            activity: activity.to_string(),
            description: None,
            cost: 100,
            income: 0,
            images: vec![],
        }
    }

    fn create(tag: &str, id: EntryId, activity: &str) -> EntryMutation {
        EntryMutation {
            client_tag: tag.to_string(),
            kind: MutationKind::Create,
            id,
            base_version: 0,
            payload: Some(payload(activity)),
        }
    }

    fn update(tag: &str, id: EntryId, base: i64, activity: &str) -> EntryMutation {
        EntryMutation {
            client_tag: tag.to_string(),
            kind: MutationKind::Update,
            id,
            base_version: base,
            payload: Some(payload(activity)),
        }
    }

    fn delete(tag: &str, id: EntryId, base: i64) -> EntryMutation {
        EntryMutation {
            client_tag: tag.to_string(),
            kind: MutationKind::Delete,
            id,
            base_version: base,
            payload: None,
        }
    }

    #[test]
    fn test_create_then_update_then_delete_versions() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordStore::new(db.connection());
        let id = EntryId::new();

        let results = commit_batch(&store, &ctx("farmer-1", 1000), &[create("c", id, "sowing")]);
        assert_eq!(results[0].outcome, MutationOutcome::Accepted { new_version: 1 });

        let results = commit_batch(
            &store,
            &ctx("farmer-1", 2000),
            &[update("u", id, 1, "irrigation")],
        );
        assert_eq!(results[0].outcome, MutationOutcome::Accepted { new_version: 2 });

        let results = commit_batch(&store, &ctx("farmer-1", 3000), &[delete("d", id, 2)]);
        assert_eq!(results[0].outcome, MutationOutcome::Accepted { new_version: 3 });

        let entry = store.get(&id).unwrap().unwrap();
        assert!(entry.deleted);
        assert_eq!(entry.version, 3);
    }

    #[test]
    fn test_idempotent_retry_returns_same_version() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordStore::new(db.connection());
        let id = EntryId::new();
        let mutation = create("c", id, "sowing");

        let first = commit_batch(&store, &ctx("farmer-1", 1000), std::slice::from_ref(&mutation));
        let second = commit_batch(&store, &ctx("farmer-1", 9000), &[mutation]);

        assert_eq!(first[0].outcome, MutationOutcome::Accepted { new_version: 1 });
        assert_eq!(second[0].outcome, MutationOutcome::Accepted { new_version: 1 });
        assert_eq!(store.get(&id).unwrap().unwrap().version, 1);
    }

    #[test]
    fn test_two_writers_same_base_exactly_one_wins() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordStore::new(db.connection());
        let id = EntryId::new();
        commit_batch(&store, &ctx("farmer-1", 1000), &[create("c", id, "sowing")]);

        let a = commit_batch(
            &store,
            &ctx("farmer-1", 2000),
            &[update("a", id, 1, "from-device-a")],
        );
        let b = commit_batch(
            &store,
            &ctx("farmer-1", 3000),
            &[update("b", id, 1, "from-device-b")],
        );

        assert_eq!(a[0].outcome, MutationOutcome::Accepted { new_version: 2 });
        let MutationOutcome::Conflict { server_record } = &b[0].outcome else {
            panic!("expected conflict");
        };
        assert_eq!(server_record.version, 2);
        assert_eq!(server_record.payload.activity, "from-device-a");
    }

    #[test]
    fn test_conflicted_writer_recovers_by_rebasing() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordStore::new(db.connection());
        let id = EntryId::new();
        commit_batch(&store, &ctx("farmer-1", 1000), &[create("c", id, "sowing")]);
        commit_batch(&store, &ctx("farmer-1", 2000), &[update("a", id, 1, "winner")]);

        // Loser pulls, observes version 2, resubmits on the new base
        let retry = commit_batch(
            &store,
            &ctx("farmer-1", 4000),
            &[update("b2", id, 2, "rebased")],
        );
        assert_eq!(retry[0].outcome, MutationOutcome::Accepted { new_version: 3 });
    }

    #[test]
    fn test_batch_failures_are_independent() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordStore::new(db.connection());
        let good = EntryId::new();
        let missing = EntryId::new();

        let mut invalid = create("bad", EntryId::new(), "sowing");
        invalid.payload.as_mut().unwrap().activity = String::new();

        let results = commit_batch(
            &store,
            &ctx("farmer-1", 1000),
            &[
                invalid,
                update("gone", missing, 1, "x"),
                create("ok", good, "harvest"),
            ],
        );

        assert!(matches!(results[0].outcome, MutationOutcome::Rejected { .. }));
        assert!(matches!(results[1].outcome, MutationOutcome::Rejected { .. }));
        assert_eq!(results[2].outcome, MutationOutcome::Accepted { new_version: 1 });
        assert_eq!(results[2].client_tag, "ok");
    }

    #[test]
    fn test_foreign_record_rejected_not_leaked() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordStore::new(db.connection());
        let id = EntryId::new();
        commit_batch(&store, &ctx("farmer-1", 1000), &[create("c", id, "sowing")]);

        let results = commit_batch(
            &store,
            &ctx("farmer-2", 2000),
            &[update("u", id, 1, "steal")],
        );
        let MutationOutcome::Rejected { reason } = &results[0].outcome else {
            panic!("expected rejection");
        };
        assert!(reason.contains("owner"));
    }

    #[test]
    fn test_create_with_nonzero_base_rejected() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordStore::new(db.connection());
        let mut mutation = create("c", EntryId::new(), "sowing");
        mutation.base_version = 3;

        let results = commit_batch(&store, &ctx("farmer-1", 1000), &[mutation]);
        assert!(matches!(results[0].outcome, MutationOutcome::Rejected { .. }));
    }

    #[test]
    fn test_last_modified_non_decreasing_across_commits() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteRecordStore::new(db.connection());
        let id = EntryId::new();

        commit_batch(&store, &ctx("farmer-1", 5000), &[create("c", id, "sowing")]);
        let first = store.get(&id).unwrap().unwrap().last_modified;

        // Clock regression between commits
        commit_batch(&store, &ctx("farmer-1", 100), &[update("u", id, 1, "later")]);
        let second = store.get(&id).unwrap().unwrap().last_modified;

        assert!(second > first);
    }
}
