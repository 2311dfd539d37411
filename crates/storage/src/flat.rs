use rusqlite::Connection;
use serde_json::Value;

use toolsync_core::{Timestamp, UserId};

use crate::error::StorageError;
use crate::traits::{FlatEntry, FlatKey, FlatStore};

/// Fallback tier backed by a single `flat_kv` table.
///
/// Lives in its own database so that it stays usable when the structured
/// database is locked, full or damaged.
pub struct SqliteFlatStore {
    conn: Connection,
}

impl SqliteFlatStore {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_flat_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_flat_schema(&conn)?;
        Ok(Self { conn })
    }
}

impl FlatStore for SqliteFlatStore {
    fn put(&self, key: &FlatKey, entry: &FlatEntry) -> Result<(), StorageError> {
        let value_text = serde_json::to_string(&entry.payload)?;
        self.conn.execute(
            "INSERT INTO flat_kv (key, owner, value, timestamp) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET owner = excluded.owner, value = excluded.value, timestamp = excluded.timestamp",
            rusqlite::params![
                key.as_str(),
                entry.owner.as_str(),
                value_text,
                entry.timestamp.as_millis() as i64,
            ],
        )?;
        Ok(())
    }

    fn get(&self, key: &FlatKey) -> Result<Option<FlatEntry>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT owner, value, timestamp FROM flat_kv WHERE key = ?1")?;
        let mut rows = stmt.query_map(rusqlite::params![key.as_str()], |row| {
            let owner: String = row.get(0)?;
            let value: String = row.get(1)?;
            let timestamp: i64 = row.get(2)?;
            Ok((owner, value, timestamp))
        })?;

        match rows.next() {
            Some(Ok((owner, value, timestamp))) => {
                let payload: Value =
                    serde_json::from_str(&value).map_err(|e| StorageError::Corrupt {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(FlatEntry {
                    owner: UserId::new(owner)?,
                    payload,
                    timestamp: Timestamp::from_millis(timestamp.max(0) as u64),
                }))
            }
            Some(Err(e)) => Err(StorageError::Sqlite(e)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &FlatKey) -> Result<bool, StorageError> {
        let removed = self
            .conn
            .execute("DELETE FROM flat_kv WHERE key = ?1", rusqlite::params![key.as_str()])?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolsync_core::ToolName;

    fn entry(owner: &str, payload: Value, ts: u64) -> FlatEntry {
        FlatEntry {
            owner: UserId::new(owner).unwrap(),
            payload,
            timestamp: Timestamp::from_millis(ts),
        }
    }

    #[test]
    fn key_is_derived_from_tool() {
        let key = FlatKey::for_tool(&ToolName::new("date-calculator").unwrap());
        assert_eq!(key.as_str(), "fallback:date-calculator");
    }

    #[test]
    fn put_get_delete() -> Result<(), StorageError> {
        let store = SqliteFlatStore::open_in_memory()?;
        let key = FlatKey::for_tool(&ToolName::new("pattern-maker").unwrap());

        assert!(store.get(&key)?.is_none());
        store.put(&key, &entry("u1", json!({"tiles": 4}), 7))?;
        assert_eq!(store.get(&key)?, Some(entry("u1", json!({"tiles": 4}), 7)));

        store.put(&key, &entry("u2", json!({"tiles": 9}), 8))?;
        assert_eq!(store.get(&key)?, Some(entry("u2", json!({"tiles": 9}), 8)));

        assert!(store.delete(&key)?);
        assert!(store.get(&key)?.is_none());
        Ok(())
    }
}
