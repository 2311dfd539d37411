use std::collections::BTreeMap;

use rusqlite::Connection;
use serde_json::Value;
use tracing::warn;

use toolsync_core::{Checksum, ExportId, RecordId, Timestamp, ToolName, UserId};

use crate::error::StorageError;
use crate::traits::{ExportHistoryEntry, PreferenceRecord, StoredRecord, StructuredStore};

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, key: &str, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into().map_err(|_| StorageError::Corrupt {
        key: key.to_string(),
        reason: format!("invalid {label} length"),
    })
}

pub struct SqliteStructuredStore {
    conn: Connection,
}

impl SqliteStructuredStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Raw connection, for diagnostics and tests.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

type StoredRow = (String, String, String, String, i64, Vec<u8>, bool);

const STORED_COLUMNS: &str = "id, tool, user_id, payload, timestamp, checksum, synced";

fn read_stored_row(row: &rusqlite::Row) -> rusqlite::Result<StoredRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

/// Decode a `stored_data` row and check its payload against the stored
/// checksum. A mismatch is only logged: the payload is still returned.
/// A key that disagrees with the `tool` and `user_id` columns is corrupt.
fn decode_stored(row: StoredRow) -> Result<StoredRecord, StorageError> {
    let (key, tool, user_id, payload_text, timestamp, checksum_bytes, synced) = row;
    let id = RecordId::parse(&key).map_err(|e| StorageError::Corrupt {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    if id.tool.as_str() != tool || id.user.as_str() != user_id {
        return Err(StorageError::Corrupt {
            key,
            reason: format!("key does not match owner columns {tool}:{user_id}"),
        });
    }
    let payload: Value = serde_json::from_str(&payload_text).map_err(|e| StorageError::Corrupt {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    let checksum = Checksum::from_bytes(to_array::<32>(checksum_bytes, &key, "checksum")?);

    if let Err(mismatch) = checksum.verify(&payload) {
        warn!(record = %key, %mismatch, "stored payload failed integrity check");
    }

    Ok(StoredRecord {
        id,
        payload,
        timestamp: Timestamp::from_millis(timestamp.max(0) as u64),
        checksum,
        synced,
    })
}

impl StructuredStore for SqliteStructuredStore {
    fn put(
        &self,
        tool: &ToolName,
        user: &UserId,
        payload: &Value,
        timestamp: Timestamp,
    ) -> Result<StoredRecord, StorageError> {
        let record = StoredRecord::new(
            RecordId::new(tool.clone(), user.clone()),
            payload.clone(),
            timestamp,
            false,
        )?;
        self.adopt(&record)?;
        Ok(record)
    }

    fn adopt(&self, record: &StoredRecord) -> Result<(), StorageError> {
        let payload_text = serde_json::to_string(&record.payload)?;
        self.conn.execute(
            "INSERT INTO stored_data (id, tool, user_id, payload, timestamp, checksum, synced) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, timestamp = excluded.timestamp, checksum = excluded.checksum, synced = excluded.synced",
            rusqlite::params![
                record.id.key(),
                record.id.tool.as_str(),
                record.id.user.as_str(),
                payload_text,
                record.timestamp.as_millis() as i64,
                record.checksum.as_bytes().as_slice(),
                record.synced,
            ],
        )?;
        Ok(())
    }

    fn mark_synced(
        &self,
        tool: &ToolName,
        user: &UserId,
        checksum: &Checksum,
    ) -> Result<bool, StorageError> {
        let id = RecordId::new(tool.clone(), user.clone());
        let changed = self.conn.execute(
            "UPDATE stored_data SET synced = 1 WHERE id = ?1 AND checksum = ?2",
            rusqlite::params![id.key(), checksum.as_bytes().as_slice()],
        )?;
        Ok(changed > 0)
    }

    fn get(&self, tool: &ToolName, user: &UserId) -> Result<Option<StoredRecord>, StorageError> {
        let id = RecordId::new(tool.clone(), user.clone());
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STORED_COLUMNS} FROM stored_data WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(rusqlite::params![id.key()], read_stored_row)?;

        match rows.next() {
            Some(Ok(row)) => Ok(Some(decode_stored(row)?)),
            Some(Err(e)) => Err(StorageError::Sqlite(e)),
            None => Ok(None),
        }
    }

    fn delete(&self, tool: &ToolName, user: &UserId) -> Result<bool, StorageError> {
        let id = RecordId::new(tool.clone(), user.clone());
        let removed = self
            .conn
            .execute("DELETE FROM stored_data WHERE id = ?1", rusqlite::params![id.key()])?;
        Ok(removed > 0)
    }

    fn list_all(&self) -> Result<BTreeMap<RecordId, Value>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STORED_COLUMNS} FROM stored_data"))?;
        let rows = stmt.query_map([], read_stored_row)?;

        let mut result = BTreeMap::new();
        for row in rows {
            let record = decode_stored(row?)?;
            result.insert(record.id, record.payload);
        }
        Ok(result)
    }

    fn list_by_tool(&self, tool: &ToolName) -> Result<Vec<StoredRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STORED_COLUMNS} FROM stored_data WHERE tool = ?1 ORDER BY user_id"
        ))?;
        let rows = stmt.query_map(rusqlite::params![tool.as_str()], read_stored_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(decode_stored(row?)?);
        }
        Ok(result)
    }

    fn list_unsynced(&self) -> Result<Vec<StoredRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STORED_COLUMNS} FROM stored_data WHERE synced = 0 ORDER BY timestamp"
        ))?;
        let rows = stmt.query_map([], read_stored_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(decode_stored(row?)?);
        }
        Ok(result)
    }

    fn put_preferences(
        &self,
        tool: &ToolName,
        user: &UserId,
        payload: &Value,
        updated_at: Timestamp,
    ) -> Result<(), StorageError> {
        let id = RecordId::new(tool.clone(), user.clone());
        let payload_text = serde_json::to_string(payload)?;
        self.conn.execute(
            "INSERT INTO user_preferences (id, tool, user_id, payload, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            rusqlite::params![
                id.key(),
                tool.as_str(),
                user.as_str(),
                payload_text,
                updated_at.as_millis() as i64,
            ],
        )?;
        Ok(())
    }

    fn get_preferences(
        &self,
        tool: &ToolName,
        user: &UserId,
    ) -> Result<Option<PreferenceRecord>, StorageError> {
        let id = RecordId::new(tool.clone(), user.clone());
        let mut stmt = self
            .conn
            .prepare("SELECT payload, updated_at FROM user_preferences WHERE id = ?1")?;
        let mut rows = stmt.query_map(rusqlite::params![id.key()], |row| {
            let payload_text: String = row.get(0)?;
            let updated_at: i64 = row.get(1)?;
            Ok((payload_text, updated_at))
        })?;

        match rows.next() {
            Some(Ok((payload_text, updated_at))) => {
                let payload: Value =
                    serde_json::from_str(&payload_text).map_err(|e| StorageError::Corrupt {
                        key: id.key(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(PreferenceRecord {
                    id,
                    payload,
                    updated_at: Timestamp::from_millis(updated_at.max(0) as u64),
                }))
            }
            Some(Err(e)) => Err(StorageError::Sqlite(e)),
            None => Ok(None),
        }
    }

    fn record_export(&self, entry: &ExportHistoryEntry) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT INTO export_history (export_id, tool, user_id, exported_at, byte_len) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                entry.export_id.as_bytes().as_slice(),
                entry.id.tool.as_str(),
                entry.id.user.as_str(),
                entry.exported_at.as_millis() as i64,
                entry.byte_len as i64,
            ],
        )?;
        Ok(())
    }

    fn export_history(
        &self,
        tool: &ToolName,
        user: &UserId,
    ) -> Result<Vec<ExportHistoryEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT export_id, exported_at, byte_len FROM export_history WHERE tool = ?1 AND user_id = ?2 ORDER BY exported_at, export_id",
        )?;
        let rows = stmt.query_map(rusqlite::params![tool.as_str(), user.as_str()], |row| {
            let export_id: Vec<u8> = row.get(0)?;
            let exported_at: i64 = row.get(1)?;
            let byte_len: i64 = row.get(2)?;
            Ok((export_id, exported_at, byte_len))
        })?;

        let id = RecordId::new(tool.clone(), user.clone());
        let mut result = Vec::new();
        for row in rows {
            let (export_id, exported_at, byte_len) = row?;
            let export_id =
                ExportId::from_bytes(to_array::<16>(export_id, &id.key(), "export_id")?);
            result.push(ExportHistoryEntry {
                export_id,
                id: id.clone(),
                exported_at: Timestamp::from_millis(exported_at.max(0) as u64),
                byte_len: byte_len.max(0) as u64,
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids() -> (ToolName, UserId) {
        (
            ToolName::new("password-generator").unwrap(),
            UserId::new("user-1").unwrap(),
        )
    }

    #[test]
    fn put_then_get_roundtrip() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        let payload = json!({"length": 20, "history": ["a", "b"]});

        let written = store.put(&tool, &user, &payload, Timestamp::from_millis(10))?;
        assert!(!written.synced);

        let read = store.get(&tool, &user)?.expect("record should exist");
        assert_eq!(read, written);
        assert_eq!(read.payload, payload);
        Ok(())
    }

    #[test]
    fn put_is_an_upsert() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        store.put(&tool, &user, &json!(1), Timestamp::from_millis(1))?;
        store.put(&tool, &user, &json!(2), Timestamp::from_millis(2))?;

        let rows: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM stored_data", [], |row| row.get(0))?;
        assert_eq!(rows, 1);

        let read = store.get(&tool, &user)?.unwrap();
        assert_eq!(read.payload, json!(2));
        assert_eq!(read.timestamp, Timestamp::from_millis(2));
        Ok(())
    }

    #[test]
    fn mark_synced_requires_matching_checksum() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        let first = store.put(&tool, &user, &json!("first"), Timestamp::from_millis(1))?;
        store.put(&tool, &user, &json!("second"), Timestamp::from_millis(2))?;

        assert!(!store.mark_synced(&tool, &user, &first.checksum)?);
        assert!(!store.get(&tool, &user)?.unwrap().synced);

        let current = store.get(&tool, &user)?.unwrap();
        assert!(store.mark_synced(&tool, &user, &current.checksum)?);
        assert!(store.get(&tool, &user)?.unwrap().synced);

        // A new write clears the flag again.
        store.put(&tool, &user, &json!("third"), Timestamp::from_millis(3))?;
        assert!(!store.get(&tool, &user)?.unwrap().synced);
        Ok(())
    }

    #[test]
    fn get_returns_payload_despite_checksum_mismatch() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        store.put(&tool, &user, &json!({"a": 1}), Timestamp::from_millis(1))?;
        store.conn().execute(
            "UPDATE stored_data SET payload = ?1",
            rusqlite::params![r#"{"a":2}"#],
        )?;

        let read = store.get(&tool, &user)?.unwrap();
        assert_eq!(read.payload, json!({"a": 2}));
        assert!(read.checksum.verify(&read.payload).is_err());
        Ok(())
    }

    #[test]
    fn unparseable_payload_is_corrupt() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        store.put(&tool, &user, &json!([]), Timestamp::from_millis(1))?;
        store
            .conn()
            .execute("UPDATE stored_data SET payload = 'not json'", [])?;

        assert!(matches!(
            store.get(&tool, &user),
            Err(StorageError::Corrupt { .. })
        ));
        Ok(())
    }

    #[test]
    fn row_key_must_agree_with_owner_columns() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        store.put(&tool, &user, &json!([]), Timestamp::from_millis(1))?;

        store
            .conn()
            .execute("UPDATE stored_data SET user_id = 'mallory'", [])?;
        assert!(matches!(
            store.get(&tool, &user),
            Err(StorageError::Corrupt { .. })
        ));

        store
            .conn()
            .execute("UPDATE stored_data SET id = 'no-separator'", [])?;
        assert!(matches!(
            store.list_by_tool(&tool),
            Err(StorageError::Corrupt { .. })
        ));
        Ok(())
    }

    #[test]
    fn list_queries_by_tool_and_sync_state() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let pw = ToolName::new("password-generator").unwrap();
        let color = ToolName::new("color-palette").unwrap();
        let alice = UserId::new("alice").unwrap();
        let bob = UserId::new("bob").unwrap();

        store.put(&pw, &alice, &json!("pw-a"), Timestamp::from_millis(1))?;
        store.put(&pw, &bob, &json!("pw-b"), Timestamp::from_millis(2))?;
        let synced = store.put(&color, &alice, &json!("c-a"), Timestamp::from_millis(3))?;
        store.mark_synced(&color, &alice, &synced.checksum)?;

        let by_tool = store.list_by_tool(&pw)?;
        assert_eq!(by_tool.len(), 2);
        assert_eq!(by_tool[0].id.user, alice);
        assert_eq!(by_tool[1].id.user, bob);

        let unsynced = store.list_unsynced()?;
        assert_eq!(unsynced.len(), 2);
        assert!(unsynced.iter().all(|r| r.id.tool == pw));

        let all = store.list_all()?;
        assert_eq!(all.len(), 3);
        assert_eq!(
            all.get(&RecordId::new(color.clone(), alice.clone())),
            Some(&json!("c-a"))
        );
        Ok(())
    }

    #[test]
    fn delete_removes_row() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        store.put(&tool, &user, &json!(null), Timestamp::from_millis(1))?;
        assert!(store.delete(&tool, &user)?);
        assert!(!store.delete(&tool, &user)?);
        assert!(store.get(&tool, &user)?.is_none());
        Ok(())
    }

    #[test]
    fn preferences_are_separate_from_data() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        store.put(&tool, &user, &json!({"data": true}), Timestamp::from_millis(1))?;
        store.put_preferences(&tool, &user, &json!({"theme": "dark"}), Timestamp::from_millis(5))?;
        store.put_preferences(&tool, &user, &json!({"theme": "light"}), Timestamp::from_millis(6))?;

        let prefs = store.get_preferences(&tool, &user)?.unwrap();
        assert_eq!(prefs.payload, json!({"theme": "light"}));
        assert_eq!(prefs.updated_at, Timestamp::from_millis(6));
        assert_eq!(store.get(&tool, &user)?.unwrap().payload, json!({"data": true}));
        Ok(())
    }

    #[test]
    fn export_history_is_ordered_per_owner() -> Result<(), StorageError> {
        let store = SqliteStructuredStore::open_in_memory()?;
        let (tool, user) = ids();
        let other = UserId::new("someone-else").unwrap();
        let id = RecordId::new(tool.clone(), user.clone());

        for (at, len) in [(20, 200), (10, 100)] {
            store.record_export(&ExportHistoryEntry {
                export_id: ExportId::new(),
                id: id.clone(),
                exported_at: Timestamp::from_millis(at),
                byte_len: len,
            })?;
        }
        store.record_export(&ExportHistoryEntry {
            export_id: ExportId::new(),
            id: RecordId::new(tool.clone(), other),
            exported_at: Timestamp::from_millis(15),
            byte_len: 1,
        })?;

        let history = store.export_history(&tool, &user)?;
        let lens: Vec<u64> = history.iter().map(|e| e.byte_len).collect();
        assert_eq!(lens, vec![100, 200]);
        Ok(())
    }

    #[test]
    fn reopen_from_disk_keeps_records() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("toolsync.db");
        let path = path.to_str().ok_or("non-utf8 temp path")?;
        let (tool, user) = ids();

        {
            let store = SqliteStructuredStore::open(path)?;
            store.put(&tool, &user, &json!({"kept": true}), Timestamp::from_millis(42))?;
        }

        let store = SqliteStructuredStore::open(path)?;
        let read = store.get(&tool, &user)?.unwrap();
        assert_eq!(read.payload, json!({"kept": true}));
        assert_eq!(read.timestamp, Timestamp::from_millis(42));
        Ok(())
    }
}
