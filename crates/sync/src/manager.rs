use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, warn};

use toolsync_core::{ExportEnvelope, ExportId, RecordId, Timestamp, ToolName, UserId};
use toolsync_storage::ExportHistoryEntry;

use crate::context::StorageContext;
use crate::coordinator::{ReconcileOutcome, Tier, TickReport, WriteReport};
use crate::error::SyncError;

/// What a tool declares about itself: its name and the payload it starts
/// from when nothing has been saved yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: ToolName,
    pub default_payload: Value,
}

impl ToolDescriptor {
    pub fn new(name: ToolName, default_payload: Value) -> Self {
        Self {
            name,
            default_payload,
        }
    }
}

/// Snapshot of a session's sync state for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub is_loading: bool,
    pub is_online: bool,
    pub is_syncing: bool,
    pub has_pending_write: bool,
    pub last_sync_time: Option<Timestamp>,
}

/// One tool's data for one user. The only surface a tool UI talks to.
///
/// Edits land in memory immediately; persistence follows the debounce.
pub struct DataManager {
    context: Rc<StorageContext>,
    tool: ToolDescriptor,
    id: RecordId,
    data: Value,
    loading: bool,
}

impl DataManager {
    pub fn new(context: Rc<StorageContext>, tool: ToolDescriptor, user: UserId) -> Self {
        let id = RecordId::new(tool.name.clone(), user);
        let data = tool.default_payload.clone();
        context.coordinator().track(&id);
        Self {
            context,
            tool,
            id,
            data,
            loading: true,
        }
    }

    pub fn tool(&self) -> &ToolDescriptor {
        &self.tool
    }

    pub fn record_id(&self) -> &RecordId {
        &self.id
    }

    /// Reconcile and take the authoritative payload, or the tool default when
    /// no tier holds anything.
    pub fn load(&mut self) -> Result<Value, SyncError> {
        self.loading = true;
        let coordinator = self.context.coordinator();
        if coordinator.has_pending_write(&self.id) {
            coordinator.flush(&self.id)?;
        }

        let outcome = coordinator.reconcile(&self.id);
        self.loading = false;
        self.data = match outcome? {
            ReconcileOutcome::Resolved { payload, source } => {
                debug!(record = %self.id, ?source, "loaded");
                payload
            }
            ReconcileOutcome::Coalesced {
                payload: Some(payload),
            } => payload,
            ReconcileOutcome::Absent | ReconcileOutcome::Coalesced { payload: None } => {
                debug!(record = %self.id, "nothing stored; using default");
                self.tool.default_payload.clone()
            }
        };
        Ok(self.data.clone())
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Replace the payload in memory and queue a debounced write.
    pub fn save(&mut self, payload: Value) {
        self.data = payload.clone();
        self.context.coordinator().schedule_write(&self.id, payload);
    }

    /// Write the current payload through now, skipping the debounce.
    pub fn manual_save(&mut self) -> Result<WriteReport, SyncError> {
        self.context.coordinator().write_through(&self.id, &self.data)
    }

    pub fn export(&self) -> Result<ExportEnvelope, SyncError> {
        let now = self.context.now();
        Ok(ExportEnvelope::new(
            self.tool.name.clone(),
            now.to_datetime(),
            self.data.clone(),
        ))
    }

    /// The downloadable export file. Recorded in the export history when the
    /// structured tier is available.
    pub fn export_json(&self) -> Result<String, SyncError> {
        let envelope = self.export()?;
        let text = envelope.to_json_pretty()?;

        let entry = ExportHistoryEntry {
            export_id: ExportId::new(),
            id: self.id.clone(),
            exported_at: Timestamp::from_datetime(envelope.export_date),
            byte_len: text.len() as u64,
        };
        if let Err(e) = self.context.structured().record_export(&entry) {
            warn!(record = %self.id, error = %e, "export history not recorded");
        }
        Ok(text)
    }

    /// Replace the payload with the `data` of an export file. A malformed
    /// file or one from another tool is rejected and nothing changes.
    pub fn import(&mut self, text: &str) -> Result<(), SyncError> {
        let payload = ExportEnvelope::parse_for(&self.tool.name, text)?;
        self.save(payload);
        Ok(())
    }

    /// Back to the tool default. Persisted like any other save.
    pub fn reset(&mut self) {
        self.save(self.tool.default_payload.clone());
    }

    pub fn export_history(&self) -> Result<Vec<ExportHistoryEntry>, SyncError> {
        Ok(self
            .context
            .structured()
            .export_history(&self.id.tool, &self.id.user)?)
    }

    pub fn preferences(&self) -> Result<Option<Value>, SyncError> {
        let prefs = self
            .context
            .structured()
            .get_preferences(&self.id.tool, &self.id.user)?;
        Ok(prefs.map(|p| p.payload))
    }

    pub fn set_preferences(&self, payload: &Value) -> Result<(), SyncError> {
        let now = self.context.now();
        self.context
            .structured()
            .put_preferences(&self.id.tool, &self.id.user, payload, now)?;
        Ok(())
    }

    /// Run due timers. If a background reconcile brought in a newer remote
    /// copy and no local edit is waiting, the in-memory payload follows it.
    pub fn tick(&mut self) -> TickReport {
        let report = self.context.tick();
        self.follow(&report);
        report
    }

    /// Feed a network event, picking up any remote copy the restore pulls in.
    pub fn set_online(&mut self, online: bool) -> TickReport {
        let report = self.context.set_online(online);
        self.follow(&report);
        report
    }

    fn follow(&mut self, report: &TickReport) {
        if self.context.coordinator().has_pending_write(&self.id) {
            return;
        }
        if let Some(ReconcileOutcome::Resolved {
            payload,
            source: Tier::Remote,
        }) = report.outcome_for(&self.id)
        {
            self.data = payload.clone();
        }
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_online(&self) -> bool {
        self.context.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.context.coordinator().is_syncing(&self.id)
    }

    pub fn last_sync_time(&self) -> Option<Timestamp> {
        self.context.coordinator().last_sync_time()
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_loading: self.loading,
            is_online: self.is_online(),
            is_syncing: self.is_syncing(),
            has_pending_write: self.context.coordinator().has_pending_write(&self.id),
            last_sync_time: self.last_sync_time(),
        }
    }

    // Names the UI layer binds to.

    pub fn set_data(&mut self, payload: Value) {
        self.save(payload);
    }

    pub fn export_data(&self) -> Result<String, SyncError> {
        self.export_json()
    }

    pub fn import_data(&mut self, text: &str) -> Result<(), SyncError> {
        self.import(text)
    }

    pub fn reset_data(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolsync_core::ImportFormatError;

    fn manager() -> Result<DataManager, Box<dyn std::error::Error>> {
        let ctx = StorageContext::builder().offline().build()?;
        let tool = ToolDescriptor::new(ToolName::new("password-generator")?, json!({"length": 16}));
        Ok(DataManager::new(ctx, tool, UserId::new("u-1")?))
    }

    #[test]
    fn load_without_data_gives_default() -> Result<(), Box<dyn std::error::Error>> {
        let mut m = manager()?;
        assert!(m.is_loading());
        assert_eq!(m.load()?, json!({"length": 16}));
        assert!(!m.is_loading());
        Ok(())
    }

    #[test]
    fn save_is_visible_before_it_persists() -> Result<(), Box<dyn std::error::Error>> {
        let mut m = manager()?;
        m.save(json!({"length": 24}));
        assert_eq!(m.data(), &json!({"length": 24}));
        assert!(m.status().has_pending_write);
        Ok(())
    }

    #[test]
    fn load_flushes_pending_save_first() -> Result<(), Box<dyn std::error::Error>> {
        let mut m = manager()?;
        m.save(json!({"length": 32}));
        assert_eq!(m.load()?, json!({"length": 32}));
        assert!(!m.status().has_pending_write);
        Ok(())
    }

    #[test]
    fn import_from_other_tool_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let mut m = manager()?;
        m.load()?;
        let foreign = r#"{"tool":"goal-planner","exportDate":"2024-01-01T00:00:00.000Z","version":"1.0","data":{"goals":[]}}"#;
        let err = m.import(foreign).unwrap_err();
        assert!(matches!(
            err,
            SyncError::ImportFormat(ImportFormatError::ToolMismatch { .. })
        ));
        assert_eq!(m.data(), &json!({"length": 16}));
        assert!(!m.status().has_pending_write);
        Ok(())
    }

    #[test]
    fn export_then_import_restores_payload() -> Result<(), Box<dyn std::error::Error>> {
        let mut m = manager()?;
        m.save(json!({"length": 40, "symbols": true}));
        let file = m.export_json()?;
        m.reset();
        assert_eq!(m.data(), &json!({"length": 16}));
        m.import(&file)?;
        assert_eq!(m.data(), &json!({"length": 40, "symbols": true}));
        assert_eq!(m.export_history()?.len(), 1);
        Ok(())
    }

    #[test]
    fn preferences_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let m = manager()?;
        assert_eq!(m.preferences()?, None);
        m.set_preferences(&json!({"theme": "dark"}))?;
        assert_eq!(m.preferences()?, Some(json!({"theme": "dark"})));
        Ok(())
    }
}
