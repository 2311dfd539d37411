use std::cell::Cell;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Edge reported by [`ConnectivityMonitor::set_online`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Restored,
    Lost,
}

/// Two-state online/offline tracker fed by the host's network events.
///
/// Every offline -> online edge bumps a generation counter. Consumers remember
/// the last generation they handled, which turns the edge into a one-shot
/// "connectivity restored" signal per consumer.
pub struct ConnectivityMonitor {
    state: Cell<Connectivity>,
    restored: Cell<u64>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        Self {
            state: Cell::new(initial),
            restored: Cell::new(0),
        }
    }

    pub fn state(&self) -> Connectivity {
        self.state.get()
    }

    pub fn is_online(&self) -> bool {
        self.state.get() == Connectivity::Online
    }

    /// Feed a network event. Returns the edge it caused, if any; repeated
    /// events for the current state are ignored.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let next = if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        if next == self.state.get() {
            return None;
        }
        self.state.set(next);
        match next {
            Connectivity::Online => {
                self.restored.set(self.restored.get() + 1);
                info!("connectivity restored");
                Some(ConnectivityEvent::Restored)
            }
            Connectivity::Offline => {
                info!("connectivity lost");
                Some(ConnectivityEvent::Lost)
            }
        }
    }

    /// Number of offline -> online edges seen so far.
    pub fn restored_generation(&self) -> u64 {
        self.restored.get()
    }

    /// Returns the new generation if a restore happened after `seen`.
    pub fn take_restored(&self, seen: u64) -> Option<u64> {
        let current = self.restored.get();
        (current > seen).then_some(current)
    }
}
