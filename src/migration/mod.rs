pub mod bundled;
pub mod checksum;
pub mod ledger;
pub mod lock;
pub mod runner;
pub mod scanner;
pub mod splitter;
pub mod status;

use chrono::{DateTime, Utc};

use checksum::ChecksumPolicy;

/// One versioned schema change, as read from its source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    /// Raw script text, exactly as authored.
    pub script: String,
    /// Source entry the migration was read from.
    pub filename: String,
}

impl Migration {
    /// The text that is actually executed: the script without its own
    /// BEGIN/COMMIT lines.
    pub fn effective_script(&self) -> String {
        splitter::strip_transaction_statements(&self.script)
    }

    /// Checksum recorded in the ledger when this migration is applied.
    pub fn checksum(&self) -> String {
        checksum::checksum(&self.effective_script())
    }

    /// Checksum of the untouched script, accepted for ledger rows written
    /// before transaction-control stripping existed.
    pub fn legacy_checksum(&self) -> String {
        checksum::checksum(&self.script)
    }

    /// Which hashing policy, if any, reproduces `stored`.
    pub fn verify(&self, stored: &str) -> Option<ChecksumPolicy> {
        checksum::verify(&self.script, &self.effective_script(), stored)
    }
}

/// A row of the migration ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub version: u32,
    pub name: String,
    pub applied_at: DateTime<Utc>,
    pub checksum: String,
}

pub use bundled::bundled;
pub use runner::{AppliedMigration, MigrationRunner, RunReport};
pub use scanner::{DirectorySource, MigrationSource, SourceEntry, StaticSource};
pub use status::{MigrationState, MigrationStatus};
