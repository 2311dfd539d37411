use std::rc::Rc;
use std::time::Duration;

use toolsync_core::{ManualClock, UserId};
use toolsync_sync::{SyncConfig, SyncError, TickReport};

use crate::device::{TestDevice, START};
use crate::remote::SimulatedRemote;

/// Several devices of one user sharing a remote and a clock.
pub struct TestNetwork {
    clock: ManualClock,
    remote: Rc<SimulatedRemote>,
    config: SyncConfig,
    devices: Vec<TestDevice>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    pub fn with_config(config: SyncConfig) -> Self {
        let clock = ManualClock::new(START);
        let remote = Rc::new(SimulatedRemote::new(Rc::new(clock.clone())));
        Self {
            clock,
            remote,
            config,
            devices: Vec::new(),
        }
    }

    pub fn add_device(&mut self, user: &str) -> Result<usize, SyncError> {
        let device = TestDevice::attached(
            self.clock.clone(),
            self.remote.clone(),
            self.config.clone(),
            UserId::new(user)?,
        )?;
        let index = self.devices.len();
        self.devices.push(device);
        Ok(index)
    }

    pub fn device(&self, index: usize) -> &TestDevice {
        &self.devices[index]
    }

    pub fn remote(&self) -> &SimulatedRemote {
        &self.remote
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Move the shared clock forward and tick every device.
    pub fn advance(&self, by: Duration) -> Vec<TickReport> {
        self.clock.advance(by);
        self.devices
            .iter()
            .map(|d| d.context.coordinator().run_until_idle())
            .collect()
    }
}
