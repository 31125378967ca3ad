//! Descriptor persistence in the non-sharded control database.
//!
//! One row per shard or replica in `plane_descriptors`, and one JSON metadata
//! row per descriptor in `plane_descriptor_metadata`, removed with its
//! descriptor. Passwords are never written.

use crate::connection::config::ConnectionConfig;
use crate::connection::pool::{ConnectionPool, PoolGuard, run_in_transaction};
use crate::core::{DbError, Result, Row, ShardId, Value};
use crate::registry::ShardDescriptor;
use crate::replica::ReplicaDescriptor;
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const DESCRIPTORS_DDL: &str = "CREATE TABLE IF NOT EXISTS plane_descriptors (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    shard_id BIGINT,
    host TEXT NOT NULL,
    port BIGINT NOT NULL,
    database TEXT NOT NULL,
    username TEXT NOT NULL,
    active BOOLEAN NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)";

const METADATA_DDL: &str = "CREATE TABLE IF NOT EXISTS plane_descriptor_metadata (
    descriptor_name TEXT NOT NULL,
    metadata TEXT NOT NULL,
    PRIMARY KEY (descriptor_name),
    FOREIGN KEY (descriptor_name) REFERENCES plane_descriptors (name) ON DELETE CASCADE
)";

const INSERT_DESCRIPTOR: &str = "INSERT INTO plane_descriptors \
    (name, kind, shard_id, host, port, database, username, active, updated_at) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)";

const INSERT_METADATA: &str =
    "INSERT INTO plane_descriptor_metadata (descriptor_name, metadata) VALUES ($1, $2)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorKind {
    Shard,
    Replica,
}

impl DescriptorKind {
    fn as_str(&self) -> &'static str {
        match self {
            DescriptorKind::Shard => "shard",
            DescriptorKind::Replica => "replica",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "shard" => Ok(DescriptorKind::Shard),
            "replica" => Ok(DescriptorKind::Replica),
            other => Err(DbError::ParseError(format!(
                "unknown descriptor kind '{}'",
                other
            ))),
        }
    }
}

/// A descriptor as read back from the control database
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDescriptor {
    pub name: String,
    pub kind: DescriptorKind,
    pub shard_id: Option<ShardId>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub active: bool,
    pub metadata: serde_json::Value,
}

pub struct ControlStore {
    pool: Arc<ConnectionPool>,
}

impl ControlStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.pool.get_connection().await?;
        conn.execute(DESCRIPTORS_DDL, &[]).await?;
        conn.execute(METADATA_DDL, &[]).await?;
        conn.close().await?;
        info!(pool = self.pool.name(), "control schema ready");
        Ok(())
    }

    pub async fn save_shard(&self, descriptor: &ShardDescriptor) -> Result<()> {
        let metadata = serde_json::to_string(&descriptor.attributes)
            .map_err(|e| DbError::ParseError(e.to_string()))?;
        self.save(
            descriptor.pool_name(),
            DescriptorKind::Shard,
            Some(descriptor.id),
            &descriptor.connection,
            descriptor.active,
            metadata,
        )
        .await
    }

    pub async fn save_replica(&self, descriptor: &ReplicaDescriptor, active: bool) -> Result<()> {
        let metadata = serde_json::json!({ "weight": descriptor.weight }).to_string();
        self.save(
            format!("replica-{}", descriptor.id),
            DescriptorKind::Replica,
            None,
            &descriptor.connection,
            active,
            metadata,
        )
        .await
    }

    /// Replaces the descriptor row and its metadata in one transaction
    async fn save(
        &self,
        name: String,
        kind: DescriptorKind,
        shard_id: Option<ShardId>,
        connection: &ConnectionConfig,
        active: bool,
        metadata: String,
    ) -> Result<()> {
        let descriptor_row: Row = vec![
            Value::Text(name.clone()),
            Value::Text(kind.as_str().to_string()),
            shard_id.map(|id| Value::Integer(i64::from(id))).unwrap_or(Value::Null),
            Value::Text(connection.host.clone()),
            Value::Integer(i64::from(connection.port)),
            Value::Text(connection.database.clone()),
            Value::Text(connection.username.clone()),
            Value::Boolean(active),
            Value::Timestamp(Utc::now()),
        ];
        let metadata_row: Row = vec![Value::Text(name.clone()), Value::Text(metadata)];

        run_in_transaction(&self.pool, move |conn| {
            async move {
                remove(conn, &descriptor_row[0]).await?;
                conn.execute(INSERT_DESCRIPTOR, &descriptor_row).await?;
                conn.execute(INSERT_METADATA, &metadata_row).await?;
                Ok(())
            }
            .boxed()
        })
        .await?;

        info!(descriptor = %name, kind = kind.as_str(), "descriptor saved");
        Ok(())
    }

    /// Every stored descriptor, ordered by name
    pub async fn list(&self) -> Result<Vec<StoredDescriptor>> {
        let mut conn = self.pool.get_connection().await?;
        let descriptors = conn
            .query(
                "SELECT name, kind, shard_id, host, port, database, username, active \
                 FROM plane_descriptors ORDER BY name",
                &[],
            )
            .await?;
        let metadata = conn
            .query(
                "SELECT descriptor_name, metadata FROM plane_descriptor_metadata",
                &[],
            )
            .await?;
        conn.close().await?;

        let mut blobs: HashMap<String, serde_json::Value> = HashMap::new();
        for row in &metadata.rows {
            let name = text(row, 0, "descriptor_name")?;
            let raw = text(row, 1, "metadata")?;
            let parsed =
                serde_json::from_str(&raw).map_err(|e| DbError::ParseError(e.to_string()))?;
            blobs.insert(name, parsed);
        }

        descriptors
            .rows
            .iter()
            .map(|row| {
                let name = text(row, 0, "name")?;
                let shard_id = match row.get(2) {
                    Some(Value::Null) | None => None,
                    Some(value) => Some(
                        value
                            .as_i64()
                            .and_then(|id| ShardId::try_from(id).ok())
                            .ok_or_else(|| DbError::ParseError(format!("bad shard id for {}", name)))?,
                    ),
                };
                let port = integer(row, 4, "port")?;
                Ok(StoredDescriptor {
                    kind: DescriptorKind::parse(&text(row, 1, "kind")?)?,
                    shard_id,
                    host: text(row, 3, "host")?,
                    port: u16::try_from(port)
                        .map_err(|_| DbError::ParseError(format!("port {} out of range", port)))?,
                    database: text(row, 5, "database")?,
                    username: text(row, 6, "username")?,
                    active: row.get(7).and_then(Value::as_bool).unwrap_or(false),
                    metadata: blobs.remove(&name).unwrap_or(serde_json::Value::Null),
                    name,
                })
            })
            .collect()
    }

    /// Removes a descriptor and its metadata; returns whether it existed
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let key = Value::Text(name.to_string());
        let removed = run_in_transaction(&self.pool, move |conn| {
            async move { remove(conn, &key).await }.boxed()
        })
        .await?;
        if removed {
            info!(descriptor = name, "descriptor deleted");
        }
        Ok(removed)
    }
}

/// Metadata goes first so the delete also works without the cascade
async fn remove(conn: &mut PoolGuard, name: &Value) -> Result<bool> {
    conn.execute(
        "DELETE FROM plane_descriptor_metadata WHERE descriptor_name = $1",
        std::slice::from_ref(name),
    )
    .await?;
    let removed = conn
        .execute(
            "DELETE FROM plane_descriptors WHERE name = $1",
            std::slice::from_ref(name),
        )
        .await?;
    Ok(removed > 0)
}

fn text(row: &Row, idx: usize, column: &str) -> Result<String> {
    row.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DbError::ParseError(format!("column {} is not text", column)))
}

fn integer(row: &Row, idx: usize, column: &str) -> Result<i64> {
    row.get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| DbError::ParseError(format!("column {} is not an integer", column)))
}
