//! PostgreSQL adapter over `tokio-postgres`.

use super::config::ConnectionConfig;
use super::{Connector, DbConnection};
use crate::core::{DbError, Result, Row, Value};
use crate::result::QueryResult;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

const REPLICATION_LAG_SQL: &str = "SELECT COALESCE(EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())), 0)::float8";

/// Opens plain-TCP sessions against PostgreSQL instances
#[derive(Debug, Default, Clone)]
pub struct PostgresConnector;

impl PostgresConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DbConnection>> {
        let (client, connection) = tokio_postgres::connect(&config.to_pg_config(), NoTls)
            .await
            .map_err(|e| {
                DbError::Connectivity(format!("could not connect to {}: {}", config.address(), e))
            })?;

        let address = config.address();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(address = %address, error = %e, "postgres connection terminated");
            }
        });

        debug!(address = %config.address(), "postgres session opened");
        Ok(Box::new(PostgresConnection {
            client,
            in_transaction: false,
        }))
    }
}

pub struct PostgresConnection {
    client: Client,
    in_transaction: bool,
}

impl PostgresConnection {
    fn map_error(&self, err: tokio_postgres::Error) -> DbError {
        if self.client.is_closed() || err.is_closed() {
            DbError::Connectivity(err.to_string())
        } else {
            DbError::Query(err.to_string())
        }
    }

    async fn bind(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<(tokio_postgres::Statement, Vec<Box<dyn ToSql + Sync + Send>>)> {
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| self.map_error(e))?;

        if statement.params().len() != params.len() {
            return Err(DbError::Query(format!(
                "statement expects {} parameters, got {}",
                statement.params().len(),
                params.len()
            )));
        }

        let bound = statement
            .params()
            .iter()
            .zip(params)
            .map(|(ty, value)| to_sql_param(value, ty))
            .collect::<Result<Vec<_>>>()?;

        Ok((statement, bound))
    }

    async fn batch(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| self.map_error(e))
    }
}

#[async_trait]
impl DbConnection for PostgresConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let (statement, bound) = self.bind(sql, params).await?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        let rows = self
            .client
            .query(&statement, &refs)
            .await
            .map_err(|e| self.map_error(e))?;

        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        let rows = rows
            .iter()
            .map(decode_row)
            .collect::<Vec<Row>>();

        Ok(QueryResult::new(columns, rows))
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let (statement, bound) = self.bind(sql, params).await?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound
            .iter()
            .map(|p| p.as_ref() as &(dyn ToSql + Sync))
            .collect();

        self.client
            .execute(&statement, &refs)
            .await
            .map_err(|e| self.map_error(e))
    }

    async fn begin(&mut self) -> Result<()> {
        self.batch("BEGIN").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        // A failed COMMIT ends the transaction server-side as well
        self.in_transaction = false;
        self.batch("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.in_transaction = false;
        self.batch("ROLLBACK").await
    }

    async fn ping(&mut self) -> Result<()> {
        self.batch("SELECT 1").await
    }

    async fn replication_lag(&mut self) -> Result<f64> {
        let row = self
            .client
            .query_one(REPLICATION_LAG_SQL, &[])
            .await
            .map_err(|e| self.map_error(e))?;
        row.try_get::<_, Option<f64>>(0)
            .map(|lag| lag.unwrap_or(0.0).max(0.0))
            .map_err(|e| DbError::Query(e.to_string()))
    }

    fn is_in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

fn mismatch(value: &Value, ty: &Type) -> DbError {
    DbError::Query(format!(
        "cannot bind {} value to parameter of type {}",
        value.type_name(),
        ty
    ))
}

/// Converts a [`Value`] into a driver parameter matching the server-inferred type
fn to_sql_param(value: &Value, ty: &Type) -> Result<Box<dyn ToSql + Sync + Send>> {
    let null = value.is_null();
    let param: Box<dyn ToSql + Sync + Send> = if *ty == Type::BOOL {
        match value.as_bool() {
            Some(v) => Box::new(Some(v)),
            None if null => Box::new(None::<bool>),
            None => return Err(mismatch(value, ty)),
        }
    } else if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 {
        let v = match value.as_i64() {
            Some(v) => Some(v),
            None if null => None,
            None => return Err(mismatch(value, ty)),
        };
        if *ty == Type::INT2 {
            let v = v
                .map(i16::try_from)
                .transpose()
                .map_err(|_| mismatch(value, ty))?;
            Box::new(v)
        } else if *ty == Type::INT4 {
            let v = v
                .map(i32::try_from)
                .transpose()
                .map_err(|_| mismatch(value, ty))?;
            Box::new(v)
        } else {
            Box::new(v)
        }
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
        let v = match value.as_f64() {
            Some(v) => Some(v),
            None if null => None,
            None => return Err(mismatch(value, ty)),
        };
        if *ty == Type::FLOAT4 {
            Box::new(v.map(|v| v as f32))
        } else {
            Box::new(v)
        }
    } else if *ty == Type::TIMESTAMPTZ {
        match value.as_timestamp() {
            Some(v) => Box::new(Some(v)),
            None if null => Box::new(None::<DateTime<Utc>>),
            None => return Err(mismatch(value, ty)),
        }
    } else if *ty == Type::TIMESTAMP {
        match value.as_timestamp() {
            Some(v) => Box::new(Some(v.naive_utc())),
            None if null => Box::new(None::<NaiveDateTime>),
            None => return Err(mismatch(value, ty)),
        }
    } else {
        match value {
            Value::Null => Box::new(None::<String>),
            other => Box::new(Some(other.to_string())),
        }
    };
    Ok(param)
}

fn decode_row(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| decode_value(row, idx, column.type_()))
        .collect()
}

fn decode_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    let decoded = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx).map(Value::from)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)
            .map(|v| Value::from(v.map(i64::from)))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)
            .map(|v| Value::from(v.map(i64::from)))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).map(Value::from)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .map(|v| Value::from(v.map(f64::from)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx).map(Value::from)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx).map(Value::from)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)
            .map(|v| Value::from(v.map(|ts| ts.and_utc())))
    } else {
        row.try_get::<_, Option<String>>(idx).map(Value::from)
    };

    decoded.unwrap_or(Value::Null)
}
