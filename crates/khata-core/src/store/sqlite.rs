//! `SQLite` implementation of the record store

use chrono::NaiveDate;
use rusqlite::{params, Connection, ErrorCode, Transaction};

use crate::error::{Error, Result};
use crate::models::{EntryId, EntryPayload, LogEntry, OwnerId};

use super::{CommitOutcome, Cursor, Fingerprint, RecordStore};

const ENTRY_COLUMNS: &str =
    "id, owner, date, activity, description, cost, income, images, version, deleted, last_modified";

/// `SQLite` implementation of `RecordStore`
pub struct SqliteRecordStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordStore<'a> {
    /// Create a new store with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Parse an entry from a database row
    fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
        let id: String = row.get(0)?;
        let date: String = row.get(2)?;
        let images: String = row.get(7)?;
        Ok(LogEntry {
            id: id.parse().map_err(|error| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(error),
                )
            })?,
            owner: OwnerId::new(row.get::<_, String>(1)?),
            payload: EntryPayload {
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|error| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(error),
                    )
                })?,
                activity: row.get(3)?,
                description: row.get(4)?,
                cost: row.get(5)?,
                income: row.get(6)?,
                images: serde_json::from_str(&images).map_err(|error| {
                    rusqlite::Error::FromSqlConversionFailure(
                        7,
                        rusqlite::types::Type::Text,
                        Box::new(error),
                    )
                })?,
            },
            version: row.get(8)?,
            deleted: row.get::<_, i32>(9)? != 0,
            last_modified: row.get(10)?,
        })
    }
}

fn get_with(conn: &Connection, id: &EntryId) -> Result<Option<LogEntry>> {
    let result = conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = ?"),
        params![id.as_str()],
        SqliteRecordStore::parse_entry,
    );

    match result {
        Ok(entry) => Ok(Some(entry)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(error) => Err(map_storage_error(error)),
    }
}

/// Issue the next commit stamp: `max(now_ms, high_watermark + 1)`.
///
/// Runs inside the commit transaction so the stamp and the version bump
/// are atomic; the persisted watermark keeps the stamp strictly
/// monotonic across restarts and host clock regression.
fn issue_stamp(tx: &Transaction<'_>, now_ms: i64) -> Result<i64> {
    tx.execute(
        "UPDATE sync_clock SET high_watermark = MAX(high_watermark + 1, ?1) WHERE id = 1",
        params![now_ms],
    )
    .map_err(map_storage_error)?;
    let stamp = tx
        .query_row("SELECT high_watermark FROM sync_clock WHERE id = 1", [], |row| {
            row.get(0)
        })
        .map_err(map_storage_error)?;
    Ok(stamp)
}

fn record_fingerprint(
    tx: &Transaction<'_>,
    id: &EntryId,
    version: i64,
    fingerprint: &Fingerprint,
) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO mutation_fingerprints (entry_id, version, fingerprint)
         VALUES (?1, ?2, ?3)",
        params![id.as_str(), version, fingerprint.to_hex()],
    )
    .map_err(map_storage_error)?;
    Ok(())
}

/// Busy/locked failures are retryable; everything else is not
fn map_storage_error(error: rusqlite::Error) -> Error {
    match &error {
        rusqlite::Error::SqliteFailure(inner, _)
            if matches!(
                inner.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            Error::TransientStorage(error.to_string())
        }
        _ => Error::Sqlite(error),
    }
}

impl RecordStore for SqliteRecordStore<'_> {
    fn get(&self, id: &EntryId) -> Result<Option<LogEntry>> {
        get_with(self.conn, id)
    }

    fn try_create(
        &self,
        id: &EntryId,
        owner: &OwnerId,
        payload: &EntryPayload,
        fingerprint: &Fingerprint,
        now_ms: i64,
    ) -> Result<CommitOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(map_storage_error)?;

        let stamp = issue_stamp(&tx, now_ms)?;
        let entry = LogEntry::created(*id, owner.clone(), payload.clone(), stamp);

        let rows = tx
            .execute(
                "INSERT OR IGNORE INTO entries
                     (id, owner, date, activity, description, cost, income, images,
                      version, deleted, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 0, ?9)",
                params![
                    id.as_str(),
                    owner.as_str(),
                    payload.date.format("%Y-%m-%d").to_string(),
                    payload.activity,
                    payload.description,
                    payload.cost,
                    payload.income,
                    serde_json::to_string(&payload.images)?,
                    stamp,
                ],
            )
            .map_err(map_storage_error)?;

        if rows == 0 {
            // Id already taken; surface the existing record
            let existing = get_with(&tx, id)?
                .ok_or_else(|| Error::Database(format!("phantom entry {id}")))?;
            return Ok(CommitOutcome::VersionMismatch(existing));
        }

        record_fingerprint(&tx, id, 1, fingerprint)?;
        tx.commit().map_err(map_storage_error)?;
        Ok(CommitOutcome::Committed(entry))
    }

    fn try_commit(
        &self,
        id: &EntryId,
        expected_version: i64,
        payload: Option<&EntryPayload>,
        deleted: bool,
        fingerprint: &Fingerprint,
        now_ms: i64,
    ) -> Result<CommitOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(map_storage_error)?;

        let Some(current) = get_with(&tx, id)? else {
            return Err(Error::NotFound(id.to_string()));
        };
        if current.version != expected_version {
            return Ok(CommitOutcome::VersionMismatch(current));
        }

        let stamp = issue_stamp(&tx, now_ms)?;
        let mut updated = current;
        updated.version += 1;
        updated.deleted = deleted;
        updated.last_modified = stamp;
        if let Some(payload) = payload {
            updated.payload = payload.clone();
        }

        // Version guard in the WHERE clause keeps the bump atomic even if
        // another connection committed since our read
        let rows = tx
            .execute(
                "UPDATE entries
                 SET date = ?1, activity = ?2, description = ?3, cost = ?4, income = ?5,
                     images = ?6, version = ?7, deleted = ?8, last_modified = ?9
                 WHERE id = ?10 AND version = ?11",
                params![
                    updated.payload.date.format("%Y-%m-%d").to_string(),
                    updated.payload.activity,
                    updated.payload.description,
                    updated.payload.cost,
                    updated.payload.income,
                    serde_json::to_string(&updated.payload.images)?,
                    updated.version,
                    i32::from(updated.deleted),
                    stamp,
                    id.as_str(),
                    expected_version,
                ],
            )
            .map_err(map_storage_error)?;

        if rows == 0 {
            let current = get_with(&tx, id)?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            return Ok(CommitOutcome::VersionMismatch(current));
        }

        record_fingerprint(&tx, id, updated.version, fingerprint)?;
        tx.commit().map_err(map_storage_error)?;
        Ok(CommitOutcome::Committed(updated))
    }

    fn fingerprint_at(&self, id: &EntryId, version: i64) -> Result<Option<Fingerprint>> {
        let result = self.conn.query_row(
            "SELECT fingerprint FROM mutation_fingerprints WHERE entry_id = ?1 AND version = ?2",
            params![id.as_str(), version],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(hex) => Ok(Some(Fingerprint::from_hex(&hex)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(error) => Err(map_storage_error(error)),
        }
    }

    #[allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT
    fn scan_after(
        &self,
        owner: &OwnerId,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let entries = if let Some(cursor) = cursor {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 WHERE owner = ?1
                   AND (last_modified > ?2 OR (last_modified = ?2 AND id > ?3))
                 ORDER BY last_modified ASC, id ASC
                 LIMIT ?4"
            ))?;
            let rows = stmt
                .query_map(
                    params![
                        owner.as_str(),
                        cursor.last_modified,
                        cursor.last_id.as_str(),
                        limit as i64
                    ],
                    Self::parse_entry,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        } else {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 WHERE owner = ?1
                 ORDER BY last_modified ASC, id ASC
                 LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(params![owner.as_str(), limit as i64], Self::parse_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        Ok(entries)
    }
}
