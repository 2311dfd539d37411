use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

fn apply_pragmas(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    Ok(())
}

/// Tables of the primary (structured) local tier.
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    apply_pragmas(conn)?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// The fallback tier is a single key-value table in its own database file,
/// so damage to the structured database does not reach it.
pub fn init_flat_schema(conn: &Connection) -> Result<(), StorageError> {
    apply_pragmas(conn)?;
    conn.execute_batch(FLAT_SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS stored_data (
    id TEXT PRIMARY KEY,
    tool TEXT NOT NULL,
    user_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    checksum BLOB NOT NULL CHECK (length(checksum) = 32),
    synced INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_stored_data_tool ON stored_data (tool);
CREATE INDEX IF NOT EXISTS idx_stored_data_timestamp ON stored_data (timestamp);
CREATE INDEX IF NOT EXISTS idx_stored_data_synced ON stored_data (synced);

CREATE TABLE IF NOT EXISTS user_preferences (
    id TEXT PRIMARY KEY,
    tool TEXT NOT NULL,
    user_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_preferences_tool ON user_preferences (tool);

CREATE TABLE IF NOT EXISTS export_history (
    export_id BLOB PRIMARY KEY CHECK (length(export_id) = 16),
    tool TEXT NOT NULL,
    user_id TEXT NOT NULL,
    exported_at INTEGER NOT NULL,
    byte_len INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_export_history_owner ON export_history (tool, user_id, exported_at);
";

const FLAT_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS flat_kv (
    key TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    value TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);
";
