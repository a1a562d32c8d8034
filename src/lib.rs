pub mod config;
pub mod error;
pub mod migration;
pub mod store;

pub use error::{MigrationError, Result, StoreError};
pub use migration::{
    DirectorySource, Migration, MigrationRunner, MigrationSource, RunReport, StaticSource, bundled,
};
pub use store::{Dialect, PostgresStore, SqliteStore, Store, Value};
