use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a [`Store`](crate::store::Store) driver.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Value conversion error: {0}")]
    Conversion(String),
}

/// Everything that can abort a migration run.
///
/// None of these are recovered inside the runner. The caller is expected to
/// treat any of them as fatal to startup.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("migrations directory {} is unreachable: {source}", path.display())]
    Discovery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid migration filename format: {filename} (version must be numeric)")]
    InvalidFilename { filename: String },

    #[error("duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: u32,
        first: String,
        second: String,
    },

    #[error("failed to read migration file {}: {source}", path.display())]
    ReadScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "checksum mismatch for migration {version} ({name}): stored={stored}, \
         calculated (stripped)={stripped}, calculated (original)={original}"
    )]
    ChecksumMismatch {
        version: u32,
        name: String,
        stored: String,
        stripped: String,
        original: String,
    },

    #[error("failed to begin transaction for migration {version} ({name}): {source}")]
    Begin {
        version: u32,
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to execute migration {version} ({name}) statement {statement}: {source}")]
    Apply {
        version: u32,
        name: String,
        statement: usize,
        #[source]
        source: StoreError,
    },

    #[error("failed to record migration {version} ({name}): {source}")]
    Record {
        version: u32,
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to commit migration {version} ({name}): {source}")]
    Commit {
        version: u32,
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("migration ledger unavailable: {source}")]
    LedgerUnavailable {
        #[source]
        source: StoreError,
    },

    #[error("migration lock held by {holder}; gave up after {waited_secs}s")]
    LockHeld { holder: String, waited_secs: u64 },

    #[error("migration lock lost to {holder} during the run")]
    LockLost { holder: String },

    #[error("failed to acquire migration lock: {source}")]
    Lock {
        #[source]
        source: StoreError,
    },

    #[error("migration run cancelled after {applied} migration(s)")]
    Cancelled { applied: usize },
}

impl MigrationError {
    /// Short name of the run stage that failed, for operator diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            MigrationError::Discovery { .. }
            | MigrationError::InvalidFilename { .. }
            | MigrationError::DuplicateVersion { .. }
            | MigrationError::ReadScript { .. } => "scan",
            MigrationError::ChecksumMismatch { .. } => "validate",
            MigrationError::Begin { .. }
            | MigrationError::Apply { .. }
            | MigrationError::Record { .. } => "apply",
            MigrationError::Commit { .. } => "commit",
            MigrationError::LedgerUnavailable { .. } => "ledger",
            MigrationError::LockHeld { .. }
            | MigrationError::LockLost { .. }
            | MigrationError::Lock { .. } => "lock",
            MigrationError::Cancelled { .. } => "cancel",
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
