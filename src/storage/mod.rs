pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ColumnRef, IdWindow, SecretStore, StaleFilter, StoredRow};
