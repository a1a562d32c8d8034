use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::runtime::Runtime;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, Config};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error};

use super::{Dialect, Row, Store, Value};
use crate::error::StoreError;

type BoxError = Box<dyn Error + Sync + Send>;

/// [`Store`] over tokio-postgres.
///
/// The driver is async, the runner is not: every call is driven to completion
/// on a private current-thread runtime, which also polls the connection task.
pub struct PostgresStore {
    runtime: Runtime,
    client: Client,
}

impl PostgresStore {
    /// Connect with `tls`; whether it is used follows the config's SSL mode.
    pub fn connect(config: &Config, tls: MakeRustlsConnect) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (client, connection) = runtime.block_on(config.connect(tls))?;
        runtime.spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Connected to PostgreSQL (sslmode {:?})", config.get_ssl_mode());
        Ok(Self { runtime, client })
    }
}

fn sql_params(params: &[Value]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

impl Store for PostgresStore {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn ping(&mut self) -> Result<(), StoreError> {
        self.runtime.block_on(self.client.simple_query("SELECT 1"))?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, StoreError> {
        if params.is_empty() {
            // Simple protocol: no implicit prepare, any statement kind.
            self.runtime.block_on(self.client.batch_execute(sql))?;
            return Ok(0);
        }
        let params = sql_params(params);
        Ok(self.runtime.block_on(self.client.execute(sql, &params))?)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, StoreError> {
        let params = sql_params(params);
        let rows = self.runtime.block_on(self.client.query(sql, &params))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let values = (0..row.len())
                .map(|idx| row.try_get::<_, Value>(idx))
                .collect::<Result<Row, _>>()?;
            out.push(values);
        }
        Ok(out)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.runtime.block_on(self.client.batch_execute("BEGIN"))?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.runtime.block_on(self.client.batch_execute("COMMIT"))?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.runtime.block_on(self.client.batch_execute("ROLLBACK"))?;
        Ok(())
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Integer(v) => {
                if *ty == Type::INT2 {
                    i16::try_from(*v)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*v)?.to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Real(v) => {
                if *ty == Type::FLOAT4 {
                    (*v as f32).to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
            Value::Text(v) => v.to_sql(ty, out),
            Value::Timestamp(v) => {
                if *ty == Type::TIMESTAMP {
                    v.naive_utc().to_sql(ty, out)
                } else {
                    v.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for Value {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        if *ty == Type::INT2 {
            Ok(Value::Integer(i16::from_sql(ty, raw)?.into()))
        } else if *ty == Type::INT4 {
            Ok(Value::Integer(i32::from_sql(ty, raw)?.into()))
        } else if *ty == Type::INT8 {
            Ok(Value::Integer(i64::from_sql(ty, raw)?))
        } else if *ty == Type::BOOL {
            Ok(Value::Integer(bool::from_sql(ty, raw)?.into()))
        } else if *ty == Type::FLOAT4 {
            Ok(Value::Real(f32::from_sql(ty, raw)?.into()))
        } else if *ty == Type::FLOAT8 {
            Ok(Value::Real(f64::from_sql(ty, raw)?))
        } else if *ty == Type::TIMESTAMPTZ {
            Ok(Value::Timestamp(DateTime::<Utc>::from_sql(ty, raw)?))
        } else if *ty == Type::TIMESTAMP {
            Ok(Value::Timestamp(NaiveDateTime::from_sql(ty, raw)?.and_utc()))
        } else if <String as FromSql>::accepts(ty) {
            Ok(Value::Text(String::from_sql(ty, raw)?))
        } else {
            Err(format!("unsupported column type {ty}").into())
        }
    }

    fn from_sql_null(_ty: &Type) -> Result<Self, BoxError> {
        Ok(Value::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}
