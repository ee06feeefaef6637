//! Server store migrations

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 1;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get::<_, i32>(0).map(|flag| flag != 0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    Ok(version)
}

/// Migration to version 1: entries, fingerprints, and the commit clock
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "BEGIN;
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            date TEXT NOT NULL,
            activity TEXT NOT NULL,
            description TEXT,
            cost INTEGER NOT NULL DEFAULT 0,
            income INTEGER NOT NULL DEFAULT 0,
            images TEXT NOT NULL DEFAULT '[]',
            version INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            last_modified INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_owner_feed
            ON entries(owner, last_modified, id);
        CREATE TABLE IF NOT EXISTS mutation_fingerprints (
            entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            version INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            PRIMARY KEY (entry_id, version)
        );
        CREATE TABLE IF NOT EXISTS sync_clock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            high_watermark INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO sync_clock (id, high_watermark) VALUES (1, 0);
        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;",
    )?;

    tracing::info!("Migrated store to version {CURRENT_VERSION}");
    Ok(())
}
