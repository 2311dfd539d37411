use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use toolsync_core::{Checksum, ExportId, RecordId, Timestamp, ToolName, UserId};

use crate::error::StorageError;

/// One tool's payload for one user in the structured tier.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub payload: Value,
    pub timestamp: Timestamp,
    pub checksum: Checksum,
    pub synced: bool,
}

impl StoredRecord {
    /// Build a record for `payload`, computing its checksum.
    pub fn new(
        id: RecordId,
        payload: Value,
        timestamp: Timestamp,
        synced: bool,
    ) -> Result<Self, StorageError> {
        let checksum = Checksum::of(&payload)?;
        Ok(Self {
            id,
            payload,
            timestamp,
            checksum,
            synced,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceRecord {
    pub id: RecordId,
    pub payload: Value,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportHistoryEntry {
    pub export_id: ExportId,
    pub id: RecordId,
    pub exported_at: Timestamp,
    pub byte_len: u64,
}

/// The primary local tier: named tables keyed by `(tool, user)`.
///
/// Every method returns a typed error instead of panicking or logging and
/// carrying on, so the caller can decide whether to fall back.
pub trait StructuredStore {
    /// Upsert the payload for `(tool, user)`, stamping `timestamp`, a fresh
    /// checksum and `synced = false`.
    fn put(
        &self,
        tool: &ToolName,
        user: &UserId,
        payload: &Value,
        timestamp: Timestamp,
    ) -> Result<StoredRecord, StorageError>;

    /// Upsert a record exactly as given (timestamp and synced flag included).
    /// Used to seed the local tier from a reconciled winner.
    fn adopt(&self, record: &StoredRecord) -> Result<(), StorageError>;

    /// Mark the row synced if it still holds the payload with `checksum`.
    /// Returns false when the row changed (or vanished) since the push.
    fn mark_synced(
        &self,
        tool: &ToolName,
        user: &UserId,
        checksum: &Checksum,
    ) -> Result<bool, StorageError>;

    /// The stored payload, verbatim. A checksum mismatch is logged, not
    /// returned as an error.
    fn get(&self, tool: &ToolName, user: &UserId) -> Result<Option<StoredRecord>, StorageError>;

    fn delete(&self, tool: &ToolName, user: &UserId) -> Result<bool, StorageError>;

    /// Every stored payload, keyed by record. Diagnostics and migration only.
    fn list_all(&self) -> Result<BTreeMap<RecordId, Value>, StorageError>;

    fn list_by_tool(&self, tool: &ToolName) -> Result<Vec<StoredRecord>, StorageError>;

    fn list_unsynced(&self) -> Result<Vec<StoredRecord>, StorageError>;

    fn put_preferences(
        &self,
        tool: &ToolName,
        user: &UserId,
        payload: &Value,
        updated_at: Timestamp,
    ) -> Result<(), StorageError>;

    fn get_preferences(
        &self,
        tool: &ToolName,
        user: &UserId,
    ) -> Result<Option<PreferenceRecord>, StorageError>;

    fn record_export(&self, entry: &ExportHistoryEntry) -> Result<(), StorageError>;

    /// Exports for `(tool, user)`, oldest first.
    fn export_history(
        &self,
        tool: &ToolName,
        user: &UserId,
    ) -> Result<Vec<ExportHistoryEntry>, StorageError>;
}

/// Key into the flat fallback namespace: `fallback:{tool}`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlatKey(String);

impl FlatKey {
    pub fn for_tool(tool: &ToolName) -> Self {
        Self(format!("fallback:{tool}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FlatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlatKey({})", self.0)
    }
}

impl fmt::Display for FlatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value in the flat tier. The key only names the tool, so the owning
/// user travels with the value and readers must check it.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatEntry {
    pub owner: UserId,
    pub payload: Value,
    pub timestamp: Timestamp,
}

/// The fallback local tier: one schemaless key-value namespace.
pub trait FlatStore {
    fn put(&self, key: &FlatKey, entry: &FlatEntry) -> Result<(), StorageError>;

    fn get(&self, key: &FlatKey) -> Result<Option<FlatEntry>, StorageError>;

    fn delete(&self, key: &FlatKey) -> Result<bool, StorageError>;
}
