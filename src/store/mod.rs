//! Storage boundary used by the migration engine.
//!
//! The runner only ever talks to a [`Store`]: a single transactional
//! connection offering ping, begin, execute, query, commit and rollback.
//! Parameters and column values travel as [`Value`] so the same ledger code
//! runs against both drivers.

pub mod postgres;
pub mod sqlite;
pub mod tls;

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::StoreError;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Format SQLite uses for `CURRENT_TIMESTAMP`.
pub const SQLITE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQL flavour spoken by a store. Drives the ledger DDL and lock strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
        }
    }
}

/// A positional parameter or a column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Timestamps come back typed from PostgreSQL and as text from SQLite.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(v) => Some(*v),
            Value::Text(v) => NaiveDateTime::parse_from_str(v, SQLITE_TIMESTAMP_FORMAT)
                .map(|naive| naive.and_utc())
                .ok()
                .or_else(|| {
                    DateTime::parse_from_rfc3339(v)
                        .map(|dt| dt.with_timezone(&Utc))
                        .ok()
                }),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

pub type Row = Vec<Value>;

/// A live, transactional connection to a relational store.
///
/// Every call blocks until the store answers. `execute` without parameters
/// may run arbitrary DDL; with parameters it runs exactly one statement.
pub trait Store {
    fn dialect(&self) -> Dialect;

    fn ping(&mut self) -> Result<(), StoreError>;

    /// Returns the number of affected rows where the driver reports one.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, StoreError>;

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError>;

    fn begin(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;
}

impl<S: Store + ?Sized> Store for Box<S> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn ping(&mut self) -> Result<(), StoreError> {
        (**self).ping()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, StoreError> {
        (**self).execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        (**self).query(sql, params)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        (**self).rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sqlite_timestamp_text() {
        let value = Value::Text("2024-03-01 07:30:00".to_string());
        assert_eq!(
            value.as_timestamp(),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 7, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_rfc3339_timestamp_text() {
        let value = Value::Text("2024-03-01T07:30:00+02:00".to_string());
        assert_eq!(
            value.as_timestamp(),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 5, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_accessors_reject_other_variants() {
        assert_eq!(Value::Text("7".to_string()).as_i64(), None);
        assert_eq!(Value::Integer(7).as_str(), None);
        assert_eq!(Value::Null.as_timestamp(), None);
        assert_eq!(Value::from(7u32).as_i64(), Some(7));
    }
}
