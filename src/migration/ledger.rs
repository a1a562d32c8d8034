//! The `schema_migrations` table: which versions were applied, when, and
//! under which checksum. Rows are only ever appended.

use std::collections::BTreeMap;

use super::LedgerEntry;
use crate::error::StoreError;
use crate::store::{Dialect, Row, Store, Value};

const POSTGRES_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER NOT NULL,
        name VARCHAR(255) NOT NULL,
        applied_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        checksum VARCHAR(64) NOT NULL,
        PRIMARY KEY (version, name)
    );

    CREATE INDEX IF NOT EXISTS idx_schema_migrations_version
        ON schema_migrations(version);
"#;

const SQLITE_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER NOT NULL,
        name TEXT NOT NULL,
        applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        checksum TEXT NOT NULL CHECK (length(checksum) = 64),
        PRIMARY KEY (version, name)
    );

    CREATE INDEX IF NOT EXISTS idx_schema_migrations_version
        ON schema_migrations(version);
"#;

const POSTGRES_EXISTS: &str = "SELECT to_regclass('schema_migrations') IS NOT NULL";

const SQLITE_EXISTS: &str =
    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_migrations'";

const SELECT_APPLIED: &str =
    "SELECT version, name, applied_at, checksum FROM schema_migrations ORDER BY version";

/// Create the ledger table and its index if they do not exist yet.
pub fn ensure_exists<S: Store + ?Sized>(store: &mut S) -> Result<(), StoreError> {
    let ddl = match store.dialect() {
        Dialect::Postgres => POSTGRES_DDL,
        Dialect::Sqlite => SQLITE_DDL,
    };
    store.execute(ddl, &[])?;
    Ok(())
}

/// Whether the ledger table has been created. Read-only.
pub fn exists<S: Store + ?Sized>(store: &mut S) -> Result<bool, StoreError> {
    let sql = match store.dialect() {
        Dialect::Postgres => POSTGRES_EXISTS,
        Dialect::Sqlite => SQLITE_EXISTS,
    };
    let rows = store.query(sql, &[])?;
    Ok(rows
        .first()
        .and_then(|row| row.first())
        .and_then(Value::as_i64)
        .is_some_and(|v| v != 0))
}

/// Every recorded entry, keyed by version.
pub fn applied<S: Store + ?Sized>(store: &mut S) -> Result<BTreeMap<u32, LedgerEntry>, StoreError> {
    let rows = store.query(SELECT_APPLIED, &[])?;
    let mut applied = BTreeMap::new();
    for row in rows {
        let entry = parse_row(&row)?;
        applied.insert(entry.version, entry);
    }
    Ok(applied)
}

/// Append an entry. Must run inside the transaction that executed the
/// migration's statements.
pub fn record<S: Store + ?Sized>(
    store: &mut S,
    version: u32,
    name: &str,
    checksum: &str,
) -> Result<(), StoreError> {
    let sql = match store.dialect() {
        Dialect::Postgres => {
            "INSERT INTO schema_migrations (version, name, checksum) VALUES ($1, $2, $3)"
        }
        Dialect::Sqlite => {
            "INSERT INTO schema_migrations (version, name, checksum) VALUES (?1, ?2, ?3)"
        }
    };
    store.execute(
        sql,
        &[Value::from(version), Value::from(name), Value::from(checksum)],
    )?;
    Ok(())
}

fn parse_row(row: &Row) -> Result<LedgerEntry, StoreError> {
    let column = |idx: usize| {
        row.get(idx)
            .ok_or_else(|| StoreError::Conversion(format!("ledger row is missing column {idx}")))
    };

    let version = column(0)?
        .as_i64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| StoreError::Conversion(format!("invalid ledger version: {:?}", row[0])))?;
    let name = column(1)?
        .as_str()
        .ok_or_else(|| StoreError::Conversion(format!("invalid ledger name: {:?}", row[1])))?
        .to_string();
    let applied_at = column(2)?.as_timestamp().ok_or_else(|| {
        StoreError::Conversion(format!("invalid ledger timestamp: {:?}", row[2]))
    })?;
    let checksum = column(3)?
        .as_str()
        .ok_or_else(|| StoreError::Conversion(format!("invalid ledger checksum: {:?}", row[3])))?
        .to_string();

    Ok(LedgerEntry {
        version,
        name,
        applied_at,
        checksum,
    })
}
