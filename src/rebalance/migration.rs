//! Moves primary entities and their child rows between shards.
//!
//! Work is split into batches. Each batch opens one transaction on the
//! source and one on the destination, copies the entities (inserting at the
//! destination, deleting at the source) and commits the destination first.
//! A failed batch rolls back on both sides; batches already committed stay
//! moved. If the destination commits and the source commit then fails, the
//! batch's entities exist on both shards: their ids are kept on the
//! [`MigrationRecord`] and [`Migrator::reconcile`] deletes them from the source.

use crate::config::MigrationSchema;
use crate::connection::pool::PoolGuard;
use crate::core::{DbError, Result, Row, ShardId, Value};
use crate::registry::ShardRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Running,
    Completed,
    Failed,
    /// Some entities were committed at the destination but not deleted at the source
    NeedsReconciliation,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub id: Uuid,
    pub source: ShardId,
    pub destination: ShardId,
    /// Entities requested; `None` drains the source
    pub planned: Option<u64>,
    pub moved: u64,
    pub state: MigrationState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(skip)]
    pending_source_deletes: Vec<Value>,
}

impl MigrationRecord {
    fn new(source: ShardId, destination: ShardId, planned: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            destination,
            planned,
            moved: 0,
            state: MigrationState::Running,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            pending_source_deletes: Vec::new(),
        }
    }

    pub fn pending_source_deletes(&self) -> usize {
        self.pending_source_deletes.len()
    }

    fn finish(&mut self, state: MigrationState, error: Option<String>) {
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

enum BatchOutcome {
    Moved(usize),
    SourceCommitFailed { ids: Vec<Value>, error: DbError },
}

pub struct Migrator {
    registry: Arc<ShardRegistry>,
    schema: MigrationSchema,
    batch_size: usize,
    timeout: Duration,
    ledger_limit: usize,
    ledger: Mutex<Vec<MigrationRecord>>,
}

impl Migrator {
    pub fn new(
        registry: Arc<ShardRegistry>,
        schema: MigrationSchema,
        batch_size: usize,
        timeout: Duration,
        ledger_limit: usize,
    ) -> Self {
        Self {
            registry,
            schema,
            batch_size: batch_size.max(1),
            timeout,
            ledger_limit: ledger_limit.max(1),
            ledger: Mutex::new(Vec::new()),
        }
    }

    pub fn schema(&self) -> &MigrationSchema {
        &self.schema
    }

    /// Moves up to `limit` entities (all of them when `None`) from `source` to `destination`
    pub async fn migrate(
        &self,
        source: ShardId,
        destination: ShardId,
        limit: Option<u64>,
    ) -> Result<MigrationRecord> {
        if source == destination {
            return Err(DbError::Migration(format!(
                "source and destination are both shard {}",
                source
            )));
        }

        let mut record = MigrationRecord::new(source, destination, limit);
        let span = info_span!("migration", id = %record.id, source, destination);

        let outcome = self.run(&mut record).instrument(span).await;
        match &outcome {
            Ok(()) if record.pending_source_deletes.is_empty() => {
                record.finish(MigrationState::Completed, None);
                info!(id = %record.id, source, destination, moved = record.moved, "migration finished");
            }
            Ok(()) => {}
            Err(err) => {
                if record.pending_source_deletes.is_empty() {
                    record.finish(MigrationState::Failed, Some(err.to_string()));
                } else {
                    record.finish(MigrationState::NeedsReconciliation, Some(err.to_string()));
                }
                error!(id = %record.id, source, destination, moved = record.moved, error = %err, "migration failed");
            }
        }

        self.store(record.clone())?;
        outcome.map(|()| record)
    }

    async fn run(&self, record: &mut MigrationRecord) -> Result<()> {
        info!(planned = ?record.planned, "migration started");

        loop {
            let remaining = record.planned.map(|p| p.saturating_sub(record.moved));
            if remaining == Some(0) {
                return Ok(());
            }
            let batch = remaining.map_or(self.batch_size, |r| r.min(self.batch_size as u64) as usize);

            let attempt =
                tokio::time::timeout(self.timeout, self.move_batch(record.source, record.destination, batch))
                    .await;
            match attempt {
                Err(_) => {
                    return Err(DbError::Timeout(format!(
                        "migration batch exceeded {:?}",
                        self.timeout
                    )));
                }
                Ok(Err(err)) => return Err(DbError::Migration(err.to_string())),
                Ok(Ok(BatchOutcome::Moved(0))) => return Ok(()),
                Ok(Ok(BatchOutcome::Moved(moved))) => {
                    record.moved += moved as u64;
                    if moved < batch {
                        return Ok(());
                    }
                }
                Ok(Ok(BatchOutcome::SourceCommitFailed { ids, error })) => {
                    warn!(entities = ids.len(), error = %error, "source commit failed after destination commit");
                    record.moved += ids.len() as u64;
                    record.pending_source_deletes.extend(ids);
                    return Err(DbError::Migration(format!(
                        "source commit failed, {} entities left on both shards: {}",
                        record.pending_source_deletes.len(),
                        error
                    )));
                }
            }
        }
    }

    async fn move_batch(&self, source: ShardId, destination: ShardId, limit: usize) -> Result<BatchOutcome> {
        let mut src = self.registry.admin_pool(source)?.get_connection().await?;
        let mut dst = self.registry.admin_pool(destination)?.get_connection().await?;
        src.set_query_timeout(Some(self.timeout));
        dst.set_query_timeout(Some(self.timeout));

        src.begin().await?;
        if let Err(err) = dst.begin().await {
            rollback(&mut src, "source").await;
            return Err(err);
        }

        let ids = match self.copy_entities(&mut src, &mut dst, limit).await {
            Ok(ids) => ids,
            Err(err) => {
                rollback(&mut dst, "destination").await;
                rollback(&mut src, "source").await;
                return Err(err);
            }
        };

        if ids.is_empty() {
            rollback(&mut dst, "destination").await;
            rollback(&mut src, "source").await;
            return Ok(BatchOutcome::Moved(0));
        }

        if let Err(err) = dst.commit().await {
            rollback(&mut src, "source").await;
            return Err(err);
        }

        match src.commit().await {
            Ok(()) => Ok(BatchOutcome::Moved(ids.len())),
            Err(error) => Ok(BatchOutcome::SourceCommitFailed { ids, error }),
        }
    }

    async fn copy_entities(
        &self,
        src: &mut PoolGuard,
        dst: &mut PoolGuard,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let schema = &self.schema;
        let entities = src
            .query(
                &format!(
                    "SELECT * FROM {} ORDER BY {} LIMIT $1",
                    schema.table, schema.id_column
                ),
                &[Value::Integer(limit as i64)],
            )
            .await?;
        let id_idx = entities.column_index(&schema.id_column).ok_or_else(|| {
            DbError::Migration(format!(
                "{} has no column {}",
                schema.table, schema.id_column
            ))
        })?;

        let mut ids = Vec::with_capacity(entities.rows.len());
        for row in &entities.rows {
            let id = row.get(id_idx).cloned().unwrap_or(Value::Null);
            insert_row(dst, &schema.table, &entities.columns, row).await?;

            for child in &schema.children {
                let children = src
                    .query(
                        &format!("SELECT * FROM {} WHERE {} = $1", child.table, child.foreign_key),
                        &[id.clone()],
                    )
                    .await?;
                for child_row in &children.rows {
                    insert_row(dst, &child.table, &children.columns, child_row).await?;
                }
            }

            delete_entity(src, schema, &id).await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Deletes source copies of entities left behind by a failed source commit.
    ///
    /// Returns the number of entities cleaned up.
    pub async fn reconcile(&self) -> Result<usize> {
        let pending: Vec<(Uuid, ShardId, Vec<Value>)> = self
            .ledger
            .lock()?
            .iter()
            .filter(|r| r.state == MigrationState::NeedsReconciliation)
            .map(|r| (r.id, r.source, r.pending_source_deletes.clone()))
            .collect();

        let mut cleaned = 0;
        for (id, source, entities) in pending {
            let pool = self.registry.admin_pool(source)?;
            let mut conn = pool.get_connection().await?;
            conn.begin().await?;
            let mut failed = None;
            for entity in &entities {
                if let Err(err) = delete_entity(&mut conn, &self.schema, entity).await {
                    failed = Some(err);
                    break;
                }
            }
            if let Some(err) = failed {
                rollback(&mut conn, "source").await;
                return Err(err);
            }
            conn.commit().await?;
            conn.close().await?;

            cleaned += entities.len();
            let mut ledger = self.ledger.lock()?;
            if let Some(record) = ledger.iter_mut().find(|r| r.id == id) {
                record.pending_source_deletes.clear();
                record.finish(MigrationState::Completed, None);
            }
            info!(migration = %id, source, entities = entities.len(), "migration reconciled");
        }
        Ok(cleaned)
    }

    fn store(&self, record: MigrationRecord) -> Result<()> {
        let mut ledger = self.ledger.lock()?;
        ledger.push(record);

        // Drop the oldest settled records; unreconciled ones are kept
        while ledger.len() > self.ledger_limit {
            match ledger
                .iter()
                .position(|r| r.state != MigrationState::NeedsReconciliation)
            {
                Some(idx) => {
                    ledger.remove(idx);
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Ledger entries, oldest first
    pub fn records(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.ledger.lock()?.clone())
    }
}

async fn rollback(conn: &mut PoolGuard, side: &str) {
    if let Err(err) = conn.rollback().await {
        warn!(side, error = %err, "migration rollback failed");
    }
}

async fn insert_row(conn: &mut PoolGuard, table: &str, columns: &[String], row: &Row) -> Result<u64> {
    let placeholders = (1..=columns.len())
        .map(|n| format!("${}", n))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        placeholders
    );
    conn.execute(&sql, row).await
}

async fn delete_entity(conn: &mut PoolGuard, schema: &MigrationSchema, id: &Value) -> Result<()> {
    for child in &schema.children {
        conn.execute(
            &format!("DELETE FROM {} WHERE {} = $1", child.table, child.foreign_key),
            std::slice::from_ref(id),
        )
        .await?;
    }
    conn.execute(
        &format!("DELETE FROM {} WHERE {} = $1", schema.table, schema.id_column),
        std::slice::from_ref(id),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::ConnectionConfig;
    use crate::connection::memory::{MemoryConnector, MemoryDatabase};
    use crate::registry::ShardDescriptor;

    fn shard_config(id: ShardId) -> ConnectionConfig {
        ConnectionConfig::new("app", "pw")
            .host(&format!("shard-{}", id))
            .min_connections(0)
    }

    async fn setup(entities: i64, batch_size: usize) -> (Migrator, MemoryDatabase, MemoryDatabase) {
        let connector = Arc::new(MemoryConnector::new());
        let registry = Arc::new(ShardRegistry::new(connector.clone()));
        let mut dbs = Vec::new();
        for id in 0..2 {
            let db = connector.add_database(&shard_config(id));
            db.create_table("tenants", &["id", "name"]).unwrap();
            db.create_table("invoices", &["id", "tenant_id"]).unwrap();
            registry
                .register_shard(ShardDescriptor::new(id, shard_config(id)))
                .await
                .unwrap();
            dbs.push(db);
        }
        for n in 0..entities {
            dbs[0]
                .insert_row("tenants", vec![Value::Integer(n), Value::Text(format!("t{}", n))])
                .unwrap();
            dbs[0]
                .insert_row("invoices", vec![Value::Integer(100 + n), Value::Integer(n)])
                .unwrap();
        }

        let schema = MigrationSchema::new("tenants", "id").with_child("invoices", "tenant_id");
        let migrator = Migrator::new(registry, schema, batch_size, Duration::from_secs(5), 10);
        let dst = dbs.pop().unwrap();
        let src = dbs.pop().unwrap();
        (migrator, src, dst)
    }

    #[tokio::test]
    async fn test_moves_entities_with_children() {
        let (migrator, src, dst) = setup(10, 3).await;

        let record = migrator.migrate(0, 1, Some(4)).await.unwrap();
        assert_eq!(record.moved, 4);
        assert_eq!(record.state, MigrationState::Completed);
        assert_eq!(src.row_count("tenants"), 6);
        assert_eq!(src.row_count("invoices"), 6);
        assert_eq!(dst.row_count("tenants"), 4);
        assert_eq!(dst.row_count("invoices"), 4);
    }

    #[tokio::test]
    async fn test_drain_moves_everything() {
        let (migrator, src, dst) = setup(7, 3).await;

        let record = migrator.migrate(0, 1, None).await.unwrap();
        assert_eq!(record.moved, 7);
        assert_eq!(src.row_count("tenants"), 0);
        assert_eq!(dst.row_count("tenants"), 7);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back_but_earlier_batches_stay() {
        let (migrator, src, dst) = setup(6, 2).await;
        let first = migrator.migrate(0, 1, Some(2)).await.unwrap();
        assert_eq!(first.moved, 2);

        src.fail_next_statements(3);
        let err = migrator.migrate(0, 1, Some(4)).await.unwrap_err();
        assert!(matches!(err, DbError::Migration(_)));

        assert_eq!(src.row_count("tenants") + dst.row_count("tenants"), 6);
        assert_eq!(dst.row_count("tenants"), 2);

        let records = migrator.records().unwrap();
        assert_eq!(records.last().unwrap().state, MigrationState::Failed);
    }

    #[tokio::test]
    async fn test_source_commit_failure_needs_reconciliation() {
        let (migrator, src, dst) = setup(3, 5).await;
        src.fail_next_commits(1);

        let err = migrator.migrate(0, 1, None).await.unwrap_err();
        assert!(matches!(err, DbError::Migration(_)));
        // Entities now live on both shards
        assert_eq!(src.row_count("tenants"), 3);
        assert_eq!(dst.row_count("tenants"), 3);

        let record = migrator.records().unwrap().pop().unwrap();
        assert_eq!(record.state, MigrationState::NeedsReconciliation);
        assert_eq!(record.pending_source_deletes(), 3);

        assert_eq!(migrator.reconcile().await.unwrap(), 3);
        assert_eq!(src.row_count("tenants"), 0);
        assert_eq!(src.row_count("invoices"), 0);
        assert_eq!(migrator.records().unwrap().pop().unwrap().state, MigrationState::Completed);
    }

    #[tokio::test]
    async fn test_same_shard_rejected() {
        let (migrator, _src, _dst) = setup(1, 1).await;
        assert!(migrator.migrate(1, 1, None).await.is_err());
    }
}
