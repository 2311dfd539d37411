use std::rc::Rc;
use std::time::Duration;

use serde_json::Value;
use toolsync_core::{ManualClock, RecordId, Timestamp, ToolName, UserId};
use toolsync_sync::{DataManager, StorageContext, SyncConfig, SyncError, TickReport, ToolDescriptor};

use crate::faulty::{FaultyFlatStore, FaultyStructuredStore};
use crate::remote::SimulatedRemote;

/// Wall-clock start of every simulated run: 2023-11-14T22:13:20Z.
pub const START: Timestamp = Timestamp::from_millis(1_700_000_000_000);

/// One simulated installation: its own local tiers, a manual clock, and a
/// remote it may share with other devices.
pub struct TestDevice {
    pub clock: ManualClock,
    pub remote: Rc<SimulatedRemote>,
    pub structured: Rc<FaultyStructuredStore>,
    pub flat: Rc<FaultyFlatStore>,
    pub context: Rc<StorageContext>,
    pub user: UserId,
}

impl TestDevice {
    /// A device with a private remote, default config, online.
    pub fn new() -> Result<Self, SyncError> {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Result<Self, SyncError> {
        let clock = ManualClock::new(START);
        let remote = Rc::new(SimulatedRemote::new(Rc::new(clock.clone())));
        Self::attached(clock, remote, config, UserId::new("user-1")?)
    }

    /// A device sharing `clock` and `remote` with others.
    pub fn attached(
        clock: ManualClock,
        remote: Rc<SimulatedRemote>,
        config: SyncConfig,
        user: UserId,
    ) -> Result<Self, SyncError> {
        crate::init_tracing();
        let structured = Rc::new(FaultyStructuredStore::new()?);
        let flat = Rc::new(FaultyFlatStore::new()?);
        let context = StorageContext::builder()
            .config(config)
            .structured(structured.clone())
            .flat(flat.clone())
            .remote(remote.clone())
            .clock(Rc::new(clock.clone()))
            .build()?;
        Ok(Self {
            clock,
            remote,
            structured,
            flat,
            context,
            user,
        })
    }

    pub fn tool(name: &str) -> Result<ToolName, SyncError> {
        Ok(ToolName::new(name)?)
    }

    pub fn record_id(&self, tool: &str) -> Result<RecordId, SyncError> {
        Ok(RecordId::new(Self::tool(tool)?, self.user.clone()))
    }

    pub fn manager(&self, tool: &str, default_payload: Value) -> Result<DataManager, SyncError> {
        let descriptor = ToolDescriptor::new(Self::tool(tool)?, default_payload);
        Ok(DataManager::new(self.context.clone(), descriptor, self.user.clone()))
    }

    /// Move the clock forward and run whatever became due.
    pub fn advance(&self, by: Duration) -> TickReport {
        self.clock.advance(by);
        self.context.coordinator().run_until_idle()
    }

    /// Advance past the debounce so pending saves are written through.
    pub fn settle(&self) -> TickReport {
        self.advance(self.context.config().debounce())
    }

    pub fn set_online(&self, online: bool) -> TickReport {
        self.context.set_online(online)
    }

    /// Simulate an app restart: a new context over the same local tiers,
    /// remote and clock. Nothing held in memory survives.
    pub fn restart(&mut self) -> Result<(), SyncError> {
        let mut builder = StorageContext::builder()
            .config(self.context.config().clone())
            .structured(self.structured.clone())
            .flat(self.flat.clone())
            .remote(self.remote.clone())
            .clock(Rc::new(self.clock.clone()));
        if !self.context.is_online() {
            builder = builder.offline();
        }
        self.context = builder.build()?;
        Ok(())
    }
}
