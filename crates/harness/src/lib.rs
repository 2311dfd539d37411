mod device;
mod faulty;
mod network;
mod remote;

pub use device::{TestDevice, START};
pub use faulty::{FaultyFlatStore, FaultyStructuredStore};
pub use network::TestNetwork;
pub use remote::SimulatedRemote;

use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once per test binary. `RUST_LOG`
/// overrides the default `warn` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
