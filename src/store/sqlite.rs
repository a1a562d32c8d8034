use std::path::Path;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, ToSql, params_from_iter};
use tracing::debug;

use super::{Dialect, Row, SQLITE_TIMESTAMP_FORMAT, Store, Value};
use crate::error::StoreError;

/// [`Store`] over a single rusqlite connection.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!("Opening SQLite database at {}", path.display());
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

impl Store for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn ping(&mut self) -> Result<(), StoreError> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, StoreError> {
        if params.is_empty() {
            // execute_batch tolerates statements that return rows
            self.conn.execute_batch(sql)?;
            return Ok(self.conn.changes());
        }
        let changed = self.conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let column_count = stmt.column_count();
        let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
            (0..column_count)
                .map(|idx| row.get::<_, Value>(idx))
                .collect::<rusqlite::Result<Row>>()
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN EXCLUSIVE TRANSACTION")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Integer(v) => ToSqlOutput::from(*v),
            Value::Real(v) => ToSqlOutput::from(*v),
            Value::Text(v) => ToSqlOutput::from(v.as_str()),
            Value::Timestamp(v) => ToSqlOutput::from(v.format(SQLITE_TIMESTAMP_FORMAT).to_string()),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Value::Null),
            ValueRef::Integer(v) => Ok(Value::Integer(v)),
            ValueRef::Real(v) => Ok(Value::Real(v)),
            ValueRef::Text(bytes) => std::str::from_utf8(bytes)
                .map(|s| Value::Text(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            ValueRef::Blob(_) => Err(FromSqlError::InvalidType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_maps_column_types() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store
            .execute("CREATE TABLE t (i INTEGER, r REAL, s TEXT, n TEXT)", &[])
            .unwrap();
        let changed = store
            .execute(
                "INSERT INTO t VALUES (?1, ?2, ?3, ?4)",
                &[Value::Integer(3), Value::Real(1.5), Value::from("x"), Value::Null],
            )
            .unwrap();
        assert_eq!(changed, 1);

        let rows = store.query("SELECT i, r, s, n FROM t", &[]).unwrap();
        assert_eq!(
            rows,
            vec![vec![
                Value::Integer(3),
                Value::Real(1.5),
                Value::Text("x".to_string()),
                Value::Null
            ]]
        );
    }

    #[test]
    fn test_rollback_discards_changes() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.execute("CREATE TABLE t (i INTEGER)", &[]).unwrap();

        store.begin().unwrap();
        store.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        store.rollback().unwrap();

        let rows = store.query("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(rows[0][0], Value::Integer(0));
    }

    #[test]
    fn test_ping() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        assert!(store.ping().is_ok());
        assert_eq!(store.dialect(), Dialect::Sqlite);
    }
}
