pub mod error;
pub mod flat;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::StorageError;
pub use flat::SqliteFlatStore;
pub use sqlite::SqliteStructuredStore;
pub use traits::*;
