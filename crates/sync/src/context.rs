use std::path::Path;
use std::rc::Rc;

use tracing::{info, warn};

use toolsync_core::{Clock, SystemClock, Timestamp};
use toolsync_storage::{
    FlatStore, SqliteFlatStore, SqliteStructuredStore, StorageError, StructuredStore,
};

use crate::config::SyncConfig;
use crate::connectivity::{Connectivity, ConnectivityEvent, ConnectivityMonitor};
use crate::coordinator::{SyncCoordinator, TickReport};
use crate::error::SyncError;
use crate::remote::{NoRemote, RemoteStore};

pub const STRUCTURED_DB_FILE: &str = "toolsync.db";
pub const FLAT_DB_FILE: &str = "toolsync-fallback.db";

/// Everything the data managers of one application share: the local tiers,
/// the remote, the connectivity monitor and the coordinator.
///
/// Built once at startup and handed out as `Rc<StorageContext>`.
pub struct StorageContext {
    structured: Rc<dyn StructuredStore>,
    connectivity: Rc<ConnectivityMonitor>,
    coordinator: SyncCoordinator,
}

impl StorageContext {
    pub fn builder() -> StorageContextBuilder {
        StorageContextBuilder::default()
    }

    /// Open (or create) both local databases under `dir`.
    pub fn open(
        dir: &Path,
        config: SyncConfig,
        remote: Rc<dyn RemoteStore>,
    ) -> Result<Rc<Self>, SyncError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StorageError::Unavailable(format!("{}: {e}", dir.display())))?;
        let structured = SqliteStructuredStore::open(&db_path(dir, STRUCTURED_DB_FILE)?)?;
        let flat = SqliteFlatStore::open(&db_path(dir, FLAT_DB_FILE)?)?;
        info!(dir = %dir.display(), "opened local storage");

        Self::builder()
            .config(config)
            .structured(Rc::new(structured))
            .flat(Rc::new(flat))
            .remote(remote)
            .build()
    }

    pub fn in_memory(
        config: SyncConfig,
        remote: Rc<dyn RemoteStore>,
    ) -> Result<Rc<Self>, SyncError> {
        Self::builder().config(config).remote(remote).build()
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    pub fn structured(&self) -> &dyn StructuredStore {
        self.structured.as_ref()
    }

    pub fn config(&self) -> &SyncConfig {
        self.coordinator.config()
    }

    pub fn now(&self) -> Timestamp {
        self.coordinator.now()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Feed a network event from the host. An offline -> online edge
    /// reconciles every tracked record right away.
    pub fn set_online(&self, online: bool) -> TickReport {
        match self.connectivity.set_online(online) {
            Some(ConnectivityEvent::Restored) => self.coordinator.poll_connectivity(),
            _ => TickReport::default(),
        }
    }

    /// Run due timers. Hosts call this from their event loop.
    pub fn tick(&self) -> TickReport {
        self.coordinator.tick()
    }

    /// Write every pending debounced save. Returns the first failure after
    /// attempting all of them.
    pub fn shutdown(&self) -> Result<(), SyncError> {
        let mut errors = self.coordinator.flush_all();
        for (id, e) in &errors {
            warn!(record = %id, error = %e, "pending write lost at shutdown");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.swap_remove(0).1)
        }
    }
}

fn db_path(dir: &Path, file: &str) -> Result<String, SyncError> {
    let path = dir.join(file);
    path.to_str()
        .map(str::to_owned)
        .ok_or_else(|| SyncError::Config(format!("storage path is not UTF-8: {}", path.display())))
}

/// Assembles a [`StorageContext`]. Anything not supplied gets an in-memory
/// SQLite store, the system clock, [`NoRemote`], and starts online.
#[derive(Default)]
pub struct StorageContextBuilder {
    config: SyncConfig,
    structured: Option<Rc<dyn StructuredStore>>,
    flat: Option<Rc<dyn FlatStore>>,
    remote: Option<Rc<dyn RemoteStore>>,
    clock: Option<Rc<dyn Clock>>,
    offline: bool,
}

impl StorageContextBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn structured(mut self, store: Rc<dyn StructuredStore>) -> Self {
        self.structured = Some(store);
        self
    }

    pub fn flat(mut self, store: Rc<dyn FlatStore>) -> Self {
        self.flat = Some(store);
        self
    }

    pub fn remote(mut self, remote: Rc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    pub fn build(self) -> Result<Rc<StorageContext>, SyncError> {
        self.config.validate()?;

        let structured: Rc<dyn StructuredStore> = match self.structured {
            Some(store) => store,
            None => Rc::new(SqliteStructuredStore::open_in_memory()?),
        };
        let flat: Rc<dyn FlatStore> = match self.flat {
            Some(store) => store,
            None => Rc::new(SqliteFlatStore::open_in_memory()?),
        };
        let remote = self.remote.unwrap_or_else(|| Rc::new(NoRemote));
        let clock = self.clock.unwrap_or_else(|| Rc::new(SystemClock));
        let initial = if self.offline {
            Connectivity::Offline
        } else {
            Connectivity::Online
        };
        let connectivity = Rc::new(ConnectivityMonitor::new(initial));

        let coordinator = SyncCoordinator::new(
            structured.clone(),
            flat,
            remote,
            connectivity.clone(),
            clock,
            self.config,
        );

        Ok(Rc::new(StorageContext {
            structured,
            connectivity,
            coordinator,
        }))
    }
}
