pub mod duckdb;
pub mod traits;

pub use self::duckdb::DuckDbStorage;
pub use traits::{LocationStore, StorageError, StoredLocation};
