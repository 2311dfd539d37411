pub mod checksum;
pub mod clock;
pub mod envelope;
pub mod error;
pub mod ids;

pub use checksum::{Checksum, ChecksumMismatch};
pub use clock::{Clock, LocalClock, ManualClock, SystemClock, Timestamp};
pub use envelope::{ExportEnvelope, ImportFormatError};
pub use error::CoreError;
pub use ids::*;
