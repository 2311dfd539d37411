use std::cell::Cell;
use std::collections::BTreeMap;

use serde_json::Value;
use toolsync_core::{Checksum, RecordId, Timestamp, ToolName, UserId};
use toolsync_storage::{
    ExportHistoryEntry, FlatEntry, FlatKey, FlatStore, PreferenceRecord, SqliteFlatStore,
    SqliteStructuredStore, StorageError, StoredRecord, StructuredStore,
};

fn simulated(kind: &str) -> StorageError {
    StorageError::Unavailable(format!("simulated {kind} error"))
}

/// Structured store over in-memory SQLite whose reads and writes can be
/// made to fail on demand.
pub struct FaultyStructuredStore {
    inner: SqliteStructuredStore,
    simulate_write_error: Cell<bool>,
    simulate_read_error: Cell<bool>,
    puts: Cell<usize>,
}

impl FaultyStructuredStore {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            inner: SqliteStructuredStore::open_in_memory()?,
            simulate_write_error: Cell::new(false),
            simulate_read_error: Cell::new(false),
            puts: Cell::new(0),
        })
    }

    pub fn set_simulate_write_error(&self, simulate: bool) {
        self.simulate_write_error.set(simulate);
    }

    pub fn set_simulate_read_error(&self, simulate: bool) {
        self.simulate_read_error.set(simulate);
    }

    /// Successful `put` calls so far.
    pub fn puts(&self) -> usize {
        self.puts.get()
    }

    /// The backing store, bypassing fault injection.
    pub fn inner(&self) -> &SqliteStructuredStore {
        &self.inner
    }

    fn check_write(&self) -> Result<(), StorageError> {
        if self.simulate_write_error.get() {
            return Err(simulated("write"));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<(), StorageError> {
        if self.simulate_read_error.get() {
            return Err(simulated("read"));
        }
        Ok(())
    }
}

impl StructuredStore for FaultyStructuredStore {
    fn put(
        &self,
        tool: &ToolName,
        user: &UserId,
        payload: &Value,
        timestamp: Timestamp,
    ) -> Result<StoredRecord, StorageError> {
        self.check_write()?;
        let record = self.inner.put(tool, user, payload, timestamp)?;
        self.puts.set(self.puts.get() + 1);
        Ok(record)
    }

    fn adopt(&self, record: &StoredRecord) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.adopt(record)
    }

    fn mark_synced(
        &self,
        tool: &ToolName,
        user: &UserId,
        checksum: &Checksum,
    ) -> Result<bool, StorageError> {
        self.check_write()?;
        self.inner.mark_synced(tool, user, checksum)
    }

    fn get(&self, tool: &ToolName, user: &UserId) -> Result<Option<StoredRecord>, StorageError> {
        self.check_read()?;
        self.inner.get(tool, user)
    }

    fn delete(&self, tool: &ToolName, user: &UserId) -> Result<bool, StorageError> {
        self.check_write()?;
        self.inner.delete(tool, user)
    }

    fn list_all(&self) -> Result<BTreeMap<RecordId, Value>, StorageError> {
        self.check_read()?;
        self.inner.list_all()
    }

    fn list_by_tool(&self, tool: &ToolName) -> Result<Vec<StoredRecord>, StorageError> {
        self.check_read()?;
        self.inner.list_by_tool(tool)
    }

    fn list_unsynced(&self) -> Result<Vec<StoredRecord>, StorageError> {
        self.check_read()?;
        self.inner.list_unsynced()
    }

    fn put_preferences(
        &self,
        tool: &ToolName,
        user: &UserId,
        payload: &Value,
        updated_at: Timestamp,
    ) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.put_preferences(tool, user, payload, updated_at)
    }

    fn get_preferences(
        &self,
        tool: &ToolName,
        user: &UserId,
    ) -> Result<Option<PreferenceRecord>, StorageError> {
        self.check_read()?;
        self.inner.get_preferences(tool, user)
    }

    fn record_export(&self, entry: &ExportHistoryEntry) -> Result<(), StorageError> {
        self.check_write()?;
        self.inner.record_export(entry)
    }

    fn export_history(
        &self,
        tool: &ToolName,
        user: &UserId,
    ) -> Result<Vec<ExportHistoryEntry>, StorageError> {
        self.check_read()?;
        self.inner.export_history(tool, user)
    }
}

/// Flat store whose every call can be made to fail.
pub struct FaultyFlatStore {
    inner: SqliteFlatStore,
    simulate_error: Cell<bool>,
}

impl FaultyFlatStore {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            inner: SqliteFlatStore::open_in_memory()?,
            simulate_error: Cell::new(false),
        })
    }

    pub fn set_simulate_error(&self, simulate: bool) {
        self.simulate_error.set(simulate);
    }

    pub fn inner(&self) -> &SqliteFlatStore {
        &self.inner
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.simulate_error.get() {
            return Err(simulated("fallback"));
        }
        Ok(())
    }
}

impl FlatStore for FaultyFlatStore {
    fn put(&self, key: &FlatKey, entry: &FlatEntry) -> Result<(), StorageError> {
        self.check()?;
        self.inner.put(key, entry)
    }

    fn get(&self, key: &FlatKey) -> Result<Option<FlatEntry>, StorageError> {
        self.check()?;
        self.inner.get(key)
    }

    fn delete(&self, key: &FlatKey) -> Result<bool, StorageError> {
        self.check()?;
        self.inner.delete(key)
    }
}
