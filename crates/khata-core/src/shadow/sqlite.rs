//! `SQLite` shadow store used by the CLI

use std::path::Path;

use chrono::NaiveDate;
use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::models::{
    EntryId, EntryMutation, EntryPayload, LogEntry, MutationOutcome, MutationResult,
};
use crate::store::Cursor;

use super::{ShadowRecord, ShadowStore};

const SHADOW_COLUMNS: &str =
    "id, date, activity, description, cost, income, images, base_version, deleted, dirty, last_modified";

const SHADOW_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    );
    INSERT OR IGNORE INTO schema_version (version) VALUES (1);

    CREATE TABLE IF NOT EXISTS shadow_entries (
        id TEXT PRIMARY KEY,
        date TEXT NOT NULL,
        activity TEXT NOT NULL,
        description TEXT,
        cost INTEGER NOT NULL DEFAULT 0,
        income INTEGER NOT NULL DEFAULT 0,
        images TEXT NOT NULL DEFAULT '[]',
        base_version INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        dirty INTEGER NOT NULL DEFAULT 1,
        last_modified INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_shadow_dirty ON shadow_entries (dirty);

    CREATE TABLE IF NOT EXISTS sync_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        cursor_last_modified INTEGER,
        cursor_last_id TEXT
    );

    INSERT OR IGNORE INTO sync_state (id, cursor_last_modified, cursor_last_id)
    VALUES (1, NULL, NULL);
";

/// Device-local shadow database
pub struct SqliteShadowStore {
    conn: Connection,
}

impl SqliteShadowStore {
    /// Open (or create) the shadow database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory shadow database (tests)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SHADOW_SCHEMA)?;
        Ok(Self { conn })
    }

    fn parse_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ShadowRecord> {
        let id: String = row.get(0)?;
        let date: String = row.get(1)?;
        let images: String = row.get(6)?;
        Ok(ShadowRecord {
            id: id.parse().map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(error),
                )
            })?,
            payload: EntryPayload {
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|error| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        Box::new(error),
                    )
                })?,
                activity: row.get(2)?,
                description: row.get(3)?,
                cost: row.get(4)?,
                income: row.get(5)?,
                images: serde_json::from_str(&images).map_err(|error| {
                    rusqlite::Error::FromSqlConversionFailure(
                        6,
                        rusqlite::types::Type::Text,
                        Box::new(error),
                    )
                })?,
            },
            base_version: row.get(7)?,
            deleted: row.get::<_, i32>(8)? != 0,
            dirty: row.get::<_, i32>(9)? != 0,
            last_modified: row.get(10)?,
        })
    }

    /// Record a brand-new local entry; it becomes a create mutation at
    /// the next push
    pub fn insert_local(&self, payload: &EntryPayload) -> Result<ShadowRecord> {
        payload.validate()?;
        let id = EntryId::new();
        self.conn.execute(
            "INSERT INTO shadow_entries
                 (id, date, activity, description, cost, income, images,
                  base_version, deleted, dirty, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, 1, 0)",
            params![
                id.as_str(),
                payload.date.format("%Y-%m-%d").to_string(),
                payload.activity,
                payload.description,
                payload.cost,
                payload.income,
                serde_json::to_string(&payload.images)?,
            ],
        )?;
        Ok(ShadowRecord {
            id,
            payload: payload.clone(),
            base_version: 0,
            deleted: false,
            dirty: true,
            last_modified: 0,
        })
    }

    /// Replace the payload of a local entry and mark it dirty
    pub fn update_local(&self, id: &EntryId, payload: &EntryPayload) -> Result<()> {
        payload.validate()?;
        let rows = self.conn.execute(
            "UPDATE shadow_entries
             SET date = ?1, activity = ?2, description = ?3, cost = ?4,
                 income = ?5, images = ?6, dirty = 1
             WHERE id = ?7 AND deleted = 0",
            params![
                payload.date.format("%Y-%m-%d").to_string(),
                payload.activity,
                payload.description,
                payload.cost,
                payload.income,
                serde_json::to_string(&payload.images)?,
                id.as_str(),
            ],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a local entry.
    ///
    /// An entry the server has never seen is simply removed; a synced
    /// one becomes a dirty tombstone pushed as a delete mutation.
    pub fn delete_local(&self, id: &EntryId) -> Result<()> {
        let Some(record) = self.get(id)? else {
            return Err(Error::NotFound(id.to_string()));
        };
        if record.base_version == 0 {
            self.conn.execute(
                "DELETE FROM shadow_entries WHERE id = ?1",
                params![id.as_str()],
            )?;
        } else {
            self.conn.execute(
                "UPDATE shadow_entries SET deleted = 1, dirty = 1 WHERE id = ?1",
                params![id.as_str()],
            )?;
        }
        Ok(())
    }

    pub fn get(&self, id: &EntryId) -> Result<Option<ShadowRecord>> {
        let result = self.conn.query_row(
            &format!("SELECT {SHADOW_COLUMNS} FROM shadow_entries WHERE id = ?1"),
            params![id.as_str()],
            Self::parse_record,
        );
        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Live entries, newest activity date first
    pub fn list(&self) -> Result<Vec<ShadowRecord>> {
        self.list_entries(false)
    }

    /// All entries including local tombstones awaiting push
    pub fn list_all(&self) -> Result<Vec<ShadowRecord>> {
        self.list_entries(true)
    }

    fn list_entries(&self, include_deleted: bool) -> Result<Vec<ShadowRecord>> {
        let filter = if include_deleted { "" } else { "WHERE deleted = 0" };
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SHADOW_COLUMNS} FROM shadow_entries
             {filter}
             ORDER BY date DESC, id DESC"
        ))?;
        let records = stmt
            .query_map([], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Resolve an id prefix typed by the user to matching live entries
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ShadowRecord>> {
        let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SHADOW_COLUMNS} FROM shadow_entries
             WHERE deleted = 0 AND id LIKE ?1
             ORDER BY id"
        ))?;
        let records = stmt
            .query_map(params![pattern], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Count of rows waiting to be pushed
    pub fn dirty_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM shadow_entries WHERE dirty = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn adopt_server_record(&self, entry: &LogEntry) -> Result<()> {
        if entry.deleted {
            self.conn.execute(
                "DELETE FROM shadow_entries WHERE id = ?1",
                params![entry.id.as_str()],
            )?;
            return Ok(());
        }
        self.conn.execute(
            "INSERT OR REPLACE INTO shadow_entries
                 (id, date, activity, description, cost, income, images,
                  base_version, deleted, dirty, last_modified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9)",
            params![
                entry.id.as_str(),
                entry.payload.date.format("%Y-%m-%d").to_string(),
                entry.payload.activity,
                entry.payload.description,
                entry.payload.cost,
                entry.payload.income,
                serde_json::to_string(&entry.payload.images)?,
                entry.version,
                entry.last_modified,
            ],
        )?;
        Ok(())
    }
}

impl ShadowStore for SqliteShadowStore {
    fn pending_mutations(&self) -> Result<Vec<EntryMutation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SHADOW_COLUMNS} FROM shadow_entries WHERE dirty = 1 ORDER BY id"
        ))?;
        let records = stmt
            .query_map([], Self::parse_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records.iter().map(ShadowRecord::to_mutation).collect())
    }

    fn apply_push_result(&self, result: &MutationResult) -> Result<()> {
        let Ok(id) = result.client_tag.parse::<EntryId>() else {
            tracing::warn!(tag = %result.client_tag, "push result for unknown tag");
            return Ok(());
        };

        match &result.outcome {
            MutationOutcome::Accepted { new_version } => {
                let Some(record) = self.get(&id)? else {
                    return Ok(());
                };
                if record.deleted {
                    // Tombstone acknowledged; the local copy can go
                    self.conn.execute(
                        "DELETE FROM shadow_entries WHERE id = ?1",
                        params![id.as_str()],
                    )?;
                } else {
                    self.conn.execute(
                        "UPDATE shadow_entries SET base_version = ?1, dirty = 0 WHERE id = ?2",
                        params![new_version, id.as_str()],
                    )?;
                }
            }
            MutationOutcome::Conflict { server_record } => {
                // The server copy wins; local edits are discarded
                tracing::warn!(id = %id, "conflict, adopting server copy");
                self.adopt_server_record(server_record)?;
            }
            MutationOutcome::Rejected { reason } => {
                // Stays dirty; the user has to fix or delete it
                tracing::warn!(id = %id, reason = %reason, "mutation rejected");
            }
            MutationOutcome::TransientError => {
                // Stays dirty; the next session retries it
            }
        }
        Ok(())
    }

    fn apply_page(&self, entries: &[LogEntry], next_cursor: Option<&Cursor>) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for entry in entries {
            let dirty: Option<i32> = tx
                .query_row(
                    "SELECT dirty FROM shadow_entries WHERE id = ?1",
                    params![entry.id.as_str()],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|error| match error {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            // A dirty row holds unpushed edits; the next push settles it
            if dirty == Some(1) {
                continue;
            }

            if entry.deleted {
                tx.execute(
                    "DELETE FROM shadow_entries WHERE id = ?1",
                    params![entry.id.as_str()],
                )?;
            } else {
                tx.execute(
                    "INSERT OR REPLACE INTO shadow_entries
                         (id, date, activity, description, cost, income, images,
                          base_version, deleted, dirty, last_modified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, 0, ?9)",
                    params![
                        entry.id.as_str(),
                        entry.payload.date.format("%Y-%m-%d").to_string(),
                        entry.payload.activity,
                        entry.payload.description,
                        entry.payload.cost,
                        entry.payload.income,
                        serde_json::to_string(&entry.payload.images)?,
                        entry.version,
                        entry.last_modified,
                    ],
                )?;
            }
        }

        if let Some(cursor) = next_cursor {
            tx.execute(
                "UPDATE sync_state SET cursor_last_modified = ?1, cursor_last_id = ?2 WHERE id = 1",
                params![cursor.last_modified, cursor.last_id.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn cursor(&self) -> Result<Option<Cursor>> {
        let row: (Option<i64>, Option<String>) = self.conn.query_row(
            "SELECT cursor_last_modified, cursor_last_id FROM sync_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        match row {
            (Some(last_modified), Some(last_id)) => Ok(Some(Cursor {
                last_modified,
                last_id: last_id
                    .parse()
                    .map_err(|_| Error::Database(format!("corrupt cursor id {last_id}")))?,
            })),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MutationKind, OwnerId};
    use pretty_assertions::assert_eq;

    fn payload(activity: &str) -> EntryPayload {
        EntryPayload {
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            activity: activity.to_string(),
            description: None,
            cost: 0,
            income: 0,
            images: vec![],
        }
    }

    fn server_entry(id: EntryId, version: i64, last_modified: i64, deleted: bool) -> LogEntry {
        LogEntry {
            id,
            owner: OwnerId::new("farmer-1"),
            payload: payload("sowing"),
            version,
            deleted,
            last_modified,
        }
    }

    #[test]
    fn test_new_entry_becomes_create_mutation() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("sowing")).unwrap();

        let pending = store.pending_mutations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, MutationKind::Create);
        assert_eq!(pending[0].id, record.id);
        assert_eq!(pending[0].base_version, 0);
        assert_eq!(pending[0].client_tag, record.id.as_str());
    }

    #[test]
    fn test_synced_edit_becomes_update_mutation() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("sowing")).unwrap();
        store
            .apply_push_result(&MutationResult {
                client_tag: record.id.as_str(),
                outcome: MutationOutcome::Accepted { new_version: 1 },
            })
            .unwrap();
        assert_eq!(store.dirty_count().unwrap(), 0);

        store.update_local(&record.id, &payload("irrigation")).unwrap();
        let pending = store.pending_mutations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, MutationKind::Update);
        assert_eq!(pending[0].base_version, 1);
    }

    #[test]
    fn test_delete_of_synced_entry_becomes_delete_mutation() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("sowing")).unwrap();
        store
            .apply_push_result(&MutationResult {
                client_tag: record.id.as_str(),
                outcome: MutationOutcome::Accepted { new_version: 1 },
            })
            .unwrap();

        store.delete_local(&record.id).unwrap();
        let pending = store.pending_mutations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, MutationKind::Delete);
        assert_eq!(pending[0].payload, None);
        // Gone from the user-visible listing already
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_delete_of_unsynced_entry_just_removes_it() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("sowing")).unwrap();

        store.delete_local(&record.id).unwrap();
        assert!(store.pending_mutations().unwrap().is_empty());
        assert_eq!(store.get(&record.id).unwrap(), None);
    }

    #[test]
    fn test_accepted_delete_purges_tombstone() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("sowing")).unwrap();
        store
            .apply_push_result(&MutationResult {
                client_tag: record.id.as_str(),
                outcome: MutationOutcome::Accepted { new_version: 1 },
            })
            .unwrap();
        store.delete_local(&record.id).unwrap();

        store
            .apply_push_result(&MutationResult {
                client_tag: record.id.as_str(),
                outcome: MutationOutcome::Accepted { new_version: 2 },
            })
            .unwrap();
        assert_eq!(store.get(&record.id).unwrap(), None);
    }

    #[test]
    fn test_conflict_adopts_server_copy() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("my version")).unwrap();

        let server = server_entry(record.id, 3, 9000, false);
        store
            .apply_push_result(&MutationResult {
                client_tag: record.id.as_str(),
                outcome: MutationOutcome::Conflict {
                    server_record: server,
                },
            })
            .unwrap();

        let adopted = store.get(&record.id).unwrap().unwrap();
        assert_eq!(adopted.payload.activity, "sowing");
        assert_eq!(adopted.base_version, 3);
        assert!(!adopted.dirty);
    }

    #[test]
    fn test_rejected_entry_stays_dirty() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("sowing")).unwrap();

        store
            .apply_push_result(&MutationResult {
                client_tag: record.id.as_str(),
                outcome: MutationOutcome::Rejected {
                    reason: "activity too long".to_string(),
                },
            })
            .unwrap();
        assert_eq!(store.dirty_count().unwrap(), 1);
    }

    #[test]
    fn test_apply_page_upserts_and_stores_cursor() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let id = EntryId::new();
        let cursor = Cursor {
            last_modified: 500,
            last_id: id,
        };

        store
            .apply_page(&[server_entry(id, 1, 500, false)], Some(&cursor))
            .unwrap();

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.base_version, 1);
        assert!(!record.dirty);
        assert_eq!(store.cursor().unwrap(), Some(cursor));
    }

    #[test]
    fn test_apply_page_never_overwrites_dirty_row() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("local edit")).unwrap();

        store
            .apply_page(&[server_entry(record.id, 2, 500, false)], None)
            .unwrap();

        let kept = store.get(&record.id).unwrap().unwrap();
        assert_eq!(kept.payload.activity, "local edit");
        assert!(kept.dirty);
    }

    #[test]
    fn test_apply_page_purges_pulled_tombstone() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let id = EntryId::new();
        store
            .apply_page(&[server_entry(id, 1, 500, false)], None)
            .unwrap();
        assert!(store.get(&id).unwrap().is_some());

        store
            .apply_page(&[server_entry(id, 2, 600, true)], None)
            .unwrap();
        assert_eq!(store.get(&id).unwrap(), None);
    }

    #[test]
    fn test_cursor_empty_until_first_page() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        assert_eq!(store.cursor().unwrap(), None);
    }

    #[test]
    fn test_corrupt_id_column_surfaces_error() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO shadow_entries (id, date, activity, last_modified)
                 VALUES ('not-a-uuid', '2025-06-01', 'sowing', 0)",
                [],
            )
            .unwrap();

        assert!(matches!(store.list().unwrap_err(), Error::Sqlite(_)));
    }

    #[test]
    fn test_find_by_prefix() {
        let store = SqliteShadowStore::open_in_memory().unwrap();
        let record = store.insert_local(&payload("sowing")).unwrap();
        store.insert_local(&payload("irrigation")).unwrap();

        let prefix = &record.id.as_str()[..8];
        let matches = store.find_by_prefix(prefix).unwrap();
        assert!(matches.iter().any(|r| r.id == record.id));
    }
}
