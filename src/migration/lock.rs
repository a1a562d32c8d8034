//! Run-wide migration lock, so two processes never apply migrations to
//! the same database at once.
//!
//! PostgreSQL uses a session-level advisory lock. SQLite has none, so a
//! single-row lock table with an expiry stands in for it; a holder that
//! died without releasing is taken over once its lease runs out.

use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{MigrationError, Result, StoreError};
use crate::store::{Dialect, Store, Value};

/// Advisory lock key shared by every migrating process ("hard75").
pub const ADVISORY_LOCK_KEY: i64 = 0x6861_7264_3735;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a SQLite lease stays valid without being renewed. The runner
/// renews it before each migration, so only a single migration running
/// longer than this can lose the lease to another process.
pub const LOCK_TTL: Duration = Duration::from_secs(300);

const POLL_INTERVAL: Duration = Duration::from_millis(250);

const SQLITE_LOCK_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migration_locks (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        locked_by TEXT NOT NULL,
        locked_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL
    );
"#;

#[derive(Debug, Clone)]
pub struct MigrationLock {
    holder: String,
    timeout: Duration,
    ttl: Duration,
}

impl Default for MigrationLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl MigrationLock {
    pub fn new(timeout: Duration) -> Self {
        Self {
            holder: format!("{}:{}", std::process::id(), Uuid::new_v4()),
            timeout,
            ttl: LOCK_TTL,
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until the lock is ours or the timeout elapses.
    pub fn acquire<S: Store + ?Sized>(&self, store: &mut S) -> Result<()> {
        let started = Instant::now();
        let mut announced = false;

        loop {
            match self.try_acquire(store).map_err(|source| MigrationError::Lock { source })? {
                None => {
                    debug!("Acquired migration lock as {}", self.holder);
                    return Ok(());
                }
                Some(current) => {
                    if started.elapsed() >= self.timeout {
                        return Err(MigrationError::LockHeld {
                            holder: current,
                            waited_secs: started.elapsed().as_secs(),
                        });
                    }
                    if !announced {
                        info!("Waiting for migration lock held by {}", current);
                        announced = true;
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    /// One attempt. Returns the current holder when somebody else has it.
    fn try_acquire<S: Store + ?Sized>(&self, store: &mut S) -> std::result::Result<Option<String>, StoreError> {
        match store.dialect() {
            Dialect::Postgres => {
                let rows = store.query(
                    "SELECT pg_try_advisory_lock($1)",
                    &[Value::Integer(ADVISORY_LOCK_KEY)],
                )?;
                let granted = rows
                    .first()
                    .and_then(|row| row.first())
                    .and_then(Value::as_i64)
                    .is_some_and(|v| v != 0);
                if granted {
                    Ok(None)
                } else {
                    Ok(Some("another session".to_string()))
                }
            }
            Dialect::Sqlite => {
                store.execute(SQLITE_LOCK_DDL, &[])?;

                let now = Utc::now().timestamp();
                let expires = now + self.ttl.as_secs() as i64;
                let inserted = store.execute(
                    "INSERT OR IGNORE INTO schema_migration_locks (id, locked_by, locked_at, expires_at) \
                     VALUES (1, ?1, ?2, ?3)",
                    &[Value::from(self.holder.as_str()), Value::Integer(now), Value::Integer(expires)],
                )?;
                if inserted > 0 {
                    return Ok(None);
                }

                let taken_over = store.execute(
                    "UPDATE schema_migration_locks SET locked_by = ?1, locked_at = ?2, expires_at = ?3 \
                     WHERE id = 1 AND expires_at < ?2",
                    &[Value::from(self.holder.as_str()), Value::Integer(now), Value::Integer(expires)],
                )?;
                if taken_over > 0 {
                    warn!("Took over expired migration lock");
                    return Ok(None);
                }

                let rows = store.query(
                    "SELECT locked_by FROM schema_migration_locks WHERE id = 1",
                    &[],
                )?;
                let current = rows
                    .first()
                    .and_then(|row| row.first())
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                // The holder may have released between the two statements.
                if current == self.holder {
                    Ok(None)
                } else {
                    Ok(Some(current))
                }
            }
        }
    }

    /// Extend the SQLite lease by another TTL. Fails with
    /// [`MigrationError::LockLost`] when another holder has taken it over.
    /// Advisory locks live as long as the session, so PostgreSQL has
    /// nothing to renew.
    pub fn renew<S: Store + ?Sized>(&self, store: &mut S) -> Result<()> {
        if store.dialect() == Dialect::Postgres {
            return Ok(());
        }

        let expires = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        let renewed = store
            .execute(
                "UPDATE schema_migration_locks SET expires_at = ?1 WHERE id = 1 AND locked_by = ?2",
                &[Value::Integer(expires), Value::from(self.holder.as_str())],
            )
            .map_err(|source| MigrationError::Lock { source })?;
        if renewed > 0 {
            return Ok(());
        }

        let rows = store
            .query("SELECT locked_by FROM schema_migration_locks WHERE id = 1", &[])
            .map_err(|source| MigrationError::Lock { source })?;
        let holder = rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_str)
            .unwrap_or("nobody")
            .to_string();
        Err(MigrationError::LockLost { holder })
    }

    pub fn release<S: Store + ?Sized>(&self, store: &mut S) -> std::result::Result<(), StoreError> {
        match store.dialect() {
            Dialect::Postgres => {
                store.query(
                    "SELECT pg_advisory_unlock($1)",
                    &[Value::Integer(ADVISORY_LOCK_KEY)],
                )?;
            }
            Dialect::Sqlite => {
                store.execute(
                    "DELETE FROM schema_migration_locks WHERE id = 1 AND locked_by = ?1",
                    &[Value::from(self.holder.as_str())],
                )?;
            }
        }
        debug!("Released migration lock");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let lock = MigrationLock::new(Duration::ZERO);
        lock.acquire(&mut store).unwrap();
        // Re-entrant for the same holder.
        lock.acquire(&mut store).unwrap();
        lock.release(&mut store).unwrap();

        let rows = store
            .query("SELECT COUNT(*) FROM schema_migration_locks", &[])
            .unwrap();
        assert_eq!(rows[0][0], Value::Integer(0));
    }

    #[test]
    fn test_second_holder_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lock.db");
        let mut first = SqliteStore::open(&path).unwrap();
        let mut second = SqliteStore::open(&path).unwrap();

        let owner = MigrationLock::new(Duration::ZERO).with_holder("owner");
        owner.acquire(&mut first).unwrap();

        let contender = MigrationLock::new(Duration::ZERO).with_holder("contender");
        match contender.acquire(&mut second).unwrap_err() {
            MigrationError::LockHeld { holder, .. } => assert_eq!(holder, "owner"),
            other => panic!("unexpected error: {other}"),
        }

        owner.release(&mut first).unwrap();
        contender.acquire(&mut second).unwrap();
    }

    #[test]
    fn test_expired_lease_is_taken_over() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.execute(SQLITE_LOCK_DDL, &[]).unwrap();
        store
            .execute(
                "INSERT INTO schema_migration_locks VALUES (1, 'crashed', 0, 1)",
                &[],
            )
            .unwrap();

        let lock = MigrationLock::new(Duration::ZERO).with_holder("fresh");
        lock.acquire(&mut store).unwrap();

        let rows = store
            .query("SELECT locked_by FROM schema_migration_locks", &[])
            .unwrap();
        assert_eq!(rows[0][0], Value::from("fresh"));
    }

    #[test]
    fn test_renew_extends_lease() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let lock = MigrationLock::default().with_holder("owner");
        lock.acquire(&mut store).unwrap();
        store
            .execute("UPDATE schema_migration_locks SET expires_at = 1", &[])
            .unwrap();

        lock.renew(&mut store).unwrap();

        let rows = store
            .query("SELECT expires_at FROM schema_migration_locks", &[])
            .unwrap();
        let expires_at = rows[0][0].as_i64().unwrap();
        assert!(expires_at > Utc::now().timestamp());
    }

    #[test]
    fn test_renew_after_takeover_fails() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let first = MigrationLock::new(Duration::ZERO).with_holder("slow");
        first.acquire(&mut store).unwrap();
        store
            .execute("UPDATE schema_migration_locks SET expires_at = 1", &[])
            .unwrap();

        let second = MigrationLock::new(Duration::ZERO).with_holder("fast");
        second.acquire(&mut store).unwrap();

        match first.renew(&mut store).unwrap_err() {
            MigrationError::LockLost { holder } => assert_eq!(holder, "fast"),
            other => panic!("unexpected error: {other}"),
        }
        second.renew(&mut store).unwrap();
    }

    #[test]
    fn test_release_leaves_foreign_lease() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let owner = MigrationLock::default().with_holder("owner");
        owner.acquire(&mut store).unwrap();

        MigrationLock::default()
            .with_holder("other")
            .release(&mut store)
            .unwrap();

        let rows = store
            .query("SELECT locked_by FROM schema_migration_locks", &[])
            .unwrap();
        assert_eq!(rows[0][0], Value::from("owner"));
    }
}
