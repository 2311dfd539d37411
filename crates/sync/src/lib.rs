pub mod config;
pub mod connectivity;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod remote;
pub mod scheduler;

pub use config::{SyncConfig, TieBreak};
pub use connectivity::{Connectivity, ConnectivityEvent, ConnectivityMonitor};
pub use context::{StorageContext, StorageContextBuilder};
pub use coordinator::{
    resolve, LocalRecord, ReconcileOutcome, SyncCoordinator, Tier, TickReport, Winner, WriteReport,
};
pub use error::SyncError;
pub use manager::{DataManager, SyncStatus, ToolDescriptor};
pub use remote::{NoRemote, PullOutcome, PushOutcome, RemoteRecord, RemoteStore, RemoteTier};
pub use scheduler::Scheduler;
