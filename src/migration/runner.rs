use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::checksum::{self, ChecksumPolicy};
use super::lock::MigrationLock;
use super::scanner::{self, MigrationSource};
use super::splitter::split_statements;
use super::status::{self, MigrationStatus};
use super::{LedgerEntry, Migration, ledger};
use crate::error::{MigrationError, Result};
use crate::store::Store;

/// A migration committed during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
    pub checksum: String,
    pub statements: usize,
    pub elapsed: Duration,
}

/// Outcome of [`MigrationRunner::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub applied: Vec<AppliedMigration>,
    pub already_present: usize,
}

impl RunReport {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.applied.is_empty() {
            write!(f, "0 pending")?;
        } else {
            write!(f, "{} applied", self.applied.len())?;
        }
        if self.already_present > 0 {
            write!(f, ", {} already present", self.already_present)?;
        }
        Ok(())
    }
}

/// Applies pending migrations from a source to a store, one transaction
/// per migration, fail-fast.
pub struct MigrationRunner<'a, S: Store + ?Sized> {
    store: &'a mut S,
    source: Box<dyn MigrationSource + 'a>,
    lock: MigrationLock,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, S: Store + ?Sized> MigrationRunner<'a, S> {
    pub fn new(store: &'a mut S, source: impl MigrationSource + 'a) -> Self {
        Self {
            store,
            source: Box::new(source),
            lock: MigrationLock::default(),
            cancel: None,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock = MigrationLock::new(timeout);
        self
    }

    pub fn with_lock(mut self, lock: MigrationLock) -> Self {
        self.lock = lock;
        self
    }

    /// Observe `flag` between migrations; a set flag stops the run before
    /// the next migration begins.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Apply every pending migration in ascending version order.
    pub fn run(&mut self) -> Result<RunReport> {
        info!(
            "Running migrations from {} against {}",
            self.source.location().display(),
            self.store.dialect()
        );

        self.lock.acquire(&mut *self.store)?;
        let result = self.run_locked();
        if let Err(e) = self.lock.release(&mut *self.store) {
            warn!("Failed to release migration lock: {}", e);
        }
        result
    }

    /// Check every recorded migration against its source without applying
    /// anything. Returns how many ledger entries were verified.
    ///
    /// Read-only: a database without a ledger counts as having none applied.
    pub fn validate(&mut self) -> Result<usize> {
        let migrations = scanner::scan(self.source.as_ref())?;
        let applied = self.recorded()?;
        self.validate_applied(&migrations, &applied)?;
        let verified = migrations
            .iter()
            .filter(|m| applied.contains_key(&m.version))
            .count();
        info!("Validated {} applied migration(s)", verified);
        Ok(verified)
    }

    /// Per-migration state, ledger-only entries included. Read-only, like
    /// [`validate`](Self::validate).
    pub fn status(&mut self) -> Result<Vec<MigrationStatus>> {
        let migrations = scanner::scan(self.source.as_ref())?;
        let applied = self.recorded()?;
        Ok(status::compute(&migrations, &applied))
    }

    fn run_locked(&mut self) -> Result<RunReport> {
        let migrations = self.prepare()?;
        let mut report = RunReport::default();

        if migrations.is_empty() {
            info!("No migration files found in {}", self.source.location().display());
            return Ok(report);
        }
        info!("Found {} migration file(s)", migrations.len());

        let applied = self.applied()?;
        self.validate_applied(&migrations, &applied)?;

        for migration in &migrations {
            if applied.contains_key(&migration.version) {
                info!(
                    version = migration.version,
                    "Migration {:04}_{} already applied, skipping",
                    migration.version,
                    migration.name
                );
                report.already_present += 1;
                continue;
            }

            if self.is_cancelled() {
                warn!(
                    "Cancellation requested, stopping before migration {:04}_{}",
                    migration.version, migration.name
                );
                return Err(MigrationError::Cancelled {
                    applied: report.applied.len(),
                });
            }

            self.lock.renew(&mut *self.store)?;
            report.applied.push(self.apply_migration(migration)?);
        }

        info!("Migrations complete: {}", report);
        Ok(report)
    }

    /// Ensure the ledger exists, then discover the source's migrations.
    fn prepare(&mut self) -> Result<Vec<Migration>> {
        ledger::ensure_exists(&mut *self.store)
            .map_err(|source| MigrationError::LedgerUnavailable { source })?;
        scanner::scan(self.source.as_ref())
    }

    fn applied(&mut self) -> Result<BTreeMap<u32, LedgerEntry>> {
        ledger::applied(&mut *self.store).map_err(|source| MigrationError::LedgerUnavailable { source })
    }

    /// Like [`applied`](Self::applied), but never creates the ledger.
    fn recorded(&mut self) -> Result<BTreeMap<u32, LedgerEntry>> {
        let exists = ledger::exists(&mut *self.store)
            .map_err(|source| MigrationError::LedgerUnavailable { source })?;
        if !exists {
            debug!("No migration ledger yet, treating every migration as pending");
            return Ok(BTreeMap::new());
        }
        self.applied()
    }

    fn validate_applied(
        &self,
        migrations: &[Migration],
        applied: &BTreeMap<u32, LedgerEntry>,
    ) -> Result<()> {
        for migration in migrations {
            let Some(entry) = applied.get(&migration.version) else {
                continue;
            };

            match migration.verify(&entry.checksum) {
                Some(ChecksumPolicy::Stripped) => {}
                Some(ChecksumPolicy::Original) => {
                    debug!(
                        "Migration {:04}_{} matches its pre-stripping checksum",
                        migration.version, migration.name
                    );
                }
                None => {
                    return Err(MigrationError::ChecksumMismatch {
                        version: migration.version,
                        name: migration.name.clone(),
                        stored: entry.checksum.clone(),
                        stripped: migration.checksum(),
                        original: migration.legacy_checksum(),
                    });
                }
            }

            if entry.name != migration.name {
                warn!(
                    "Migration {} is recorded as {} but the source names it {}",
                    migration.version, entry.name, migration.name
                );
            }
        }

        for entry in applied.values() {
            if !migrations.iter().any(|m| m.version == entry.version) {
                warn!(
                    "Applied migration {:04}_{} has no source file",
                    entry.version, entry.name
                );
            }
        }

        Ok(())
    }

    fn apply_migration(&mut self, migration: &Migration) -> Result<AppliedMigration> {
        let version = migration.version;
        info!(version, name = %migration.name, "Applying migration {:04}_{}", version, migration.name);
        let started = Instant::now();

        self.store.begin().map_err(|source| MigrationError::Begin {
            version,
            name: migration.name.clone(),
            source,
        })?;

        let script = migration.effective_script();
        let statements = split_statements(&script);

        for (idx, statement) in statements.iter().enumerate() {
            debug!("Executing statement {}/{} of migration {}", idx + 1, statements.len(), version);
            if let Err(source) = self.store.execute(statement, &[]) {
                self.rollback_quietly(version);
                return Err(MigrationError::Apply {
                    version,
                    name: migration.name.clone(),
                    statement: idx + 1,
                    source,
                });
            }
        }

        let checksum = checksum::checksum(&script);
        if let Err(source) = ledger::record(&mut *self.store, version, &migration.name, &checksum) {
            self.rollback_quietly(version);
            return Err(MigrationError::Record {
                version,
                name: migration.name.clone(),
                source,
            });
        }

        if let Err(source) = self.store.commit() {
            self.rollback_quietly(version);
            return Err(MigrationError::Commit {
                version,
                name: migration.name.clone(),
                source,
            });
        }

        let elapsed = started.elapsed();
        info!(
            version,
            statements = statements.len(),
            "Migration {:04}_{} applied in {}ms",
            version,
            migration.name,
            elapsed.as_millis()
        );

        Ok(AppliedMigration {
            version,
            name: migration.name.clone(),
            checksum,
            statements: statements.len(),
            elapsed,
        })
    }

    fn rollback_quietly(&mut self, version: u32) {
        if let Err(e) = self.store.rollback() {
            warn!("Rollback of migration {} failed: {}", version, e);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}
