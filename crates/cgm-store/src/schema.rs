//! Database schema and migrations.

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
pub fn initialize(conn: &Connection) -> Result<()> {
    let version = get_schema_version(conn)?;

    if version == 0 {
        create_schema_v1(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    }

    Ok(())
}

/// Get the current schema version.
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version: i32 =
        conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?;

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

/// Create the initial schema (version 1).
fn create_schema_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        -- The paired sensor; at most one row
        CREATE TABLE IF NOT EXISTS sensor (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            serial TEXT NOT NULL,
            data TEXT NOT NULL,
            unlock_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS glucose (
            id TEXT PRIMARY KEY,
            glucose_type TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            value INTEGER,
            raw_value REAL,
            minute_change REAL,
            trend TEXT NOT NULL,
            quality INTEGER NOT NULL,
            UNIQUE(glucose_type, timestamp)
        );
        CREATE INDEX IF NOT EXISTS idx_glucose_time
            ON glucose(timestamp);
        "#,
    )?;

    Ok(())
}

/// Run migrations from old_version to current.
fn migrate(conn: &Connection, old_version: i32) -> Result<()> {
    tracing::info!(from = old_version, to = SCHEMA_VERSION, "Migrating schema");
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}
