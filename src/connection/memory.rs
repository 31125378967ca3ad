//! In-process relational database used as a stand-in for real instances.
//!
//! Every [`MemoryDatabase`] keeps its own tables, a log of the statements it
//! received and a set of injectable faults, so tests can assert where traffic
//! went and how routers react when an instance misbehaves. Only the statement
//! shapes this crate issues itself are interpreted; anything else is logged
//! and answered with an empty result.

use super::config::ConnectionConfig;
use super::{Connector, DbConnection};
use crate::core::{DbError, Result, Row, Value};
use crate::result::QueryResult;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

lazy_static! {
    static ref PROBE: Regex = Regex::new(r"(?i)^\s*SELECT\s+1\s*;?\s*$").unwrap();
    static ref COUNT: Regex = Regex::new(
        r"(?i)^\s*SELECT\s+COUNT\(\*\)(?:\s+AS\s+\w+)?\s+FROM\s+(\w+)(?:\s+WHERE\s+(\w+)\s*=\s*\$(\d+))?\s*;?\s*$"
    )
    .unwrap();
    static ref SELECT: Regex = Regex::new(
        r"(?i)^\s*SELECT\s+(.+?)\s+FROM\s+(\w+)(?:\s+WHERE\s+(\w+)\s*=\s*\$(\d+))?(?:\s+ORDER\s+BY\s+(\w+)(?:\s+(ASC|DESC))?)?(?:\s+LIMIT\s+(?:\$(\d+)|(\d+)))?\s*;?\s*$"
    )
    .unwrap();
    static ref INSERT: Regex = Regex::new(
        r"(?is)^\s*INSERT\s+INTO\s+(\w+)\s*\(([^)]*)\)\s*VALUES\s*\((.*)\)\s*;?\s*$"
    )
    .unwrap();
    static ref DELETE: Regex = Regex::new(
        r"(?i)^\s*DELETE\s+FROM\s+(\w+)(?:\s+WHERE\s+(\w+)\s*=\s*\$(\d+))?\s*;?\s*$"
    )
    .unwrap();
    static ref UPDATE: Regex = Regex::new(
        r"(?i)^\s*UPDATE\s+(\w+)\s+SET\s+(\w+)\s*=\s*\$(\d+)\s+WHERE\s+(\w+)\s*=\s*\$(\d+)\s*;?\s*$"
    )
    .unwrap();
    static ref CREATE_TABLE: Regex = Regex::new(
        r"(?is)^\s*CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?(\w+)\s*\((.*)\)\s*;?\s*$"
    )
    .unwrap();
    static ref DROP_TABLE: Regex =
        Regex::new(r"(?i)^\s*DROP\s+TABLE\s+(IF\s+EXISTS\s+)?(\w+)\s*;?\s*$").unwrap();
}

const CONSTRAINT_KEYWORDS: [&str; 6] = ["PRIMARY", "FOREIGN", "UNIQUE", "CONSTRAINT", "CHECK", "EXCLUDE"];

#[derive(Debug, Clone, Default)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl MemoryTable {
    fn column_index(&self, table: &str, column: &str) -> Result<usize> {
        let column = column.to_ascii_lowercase();
        self.columns
            .iter()
            .position(|c| *c == column)
            .ok_or_else(|| {
                DbError::Query(format!(
                    "column \"{}\" of relation \"{}\" does not exist",
                    column, table
                ))
            })
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    unreachable: bool,
    failing_statements: usize,
    failing_commits: usize,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    statement_log: Vec<String>,
    faults: FaultPlan,
    replication_lag: f64,
    connections_opened: u64,
}

/// Handle to one in-memory database instance; clones share state
#[derive(Clone, Debug)]
pub struct MemoryDatabase {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        Ok(self.state.lock()?)
    }

    /// Creates (or replaces) a table with the given column names
    pub fn create_table(&self, table: &str, columns: &[&str]) -> Result<()> {
        let mut state = self.lock()?;
        state.tables.insert(
            table.to_ascii_lowercase(),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_ascii_lowercase()).collect(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    /// Appends a row directly, bypassing the statement log
    pub fn insert_row(&self, table: &str, row: Row) -> Result<()> {
        let mut state = self.lock()?;
        let table_name = table.to_ascii_lowercase();
        let entry = state
            .tables
            .get_mut(&table_name)
            .ok_or_else(|| DbError::Query(format!("relation \"{}\" does not exist", table_name)))?;
        if row.len() != entry.columns.len() {
            return Err(DbError::Query(format!(
                "table \"{}\" has {} columns, row has {}",
                table_name,
                entry.columns.len(),
                row.len()
            )));
        }
        entry.rows.push(row);
        Ok(())
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .ok()
            .and_then(|state| {
                state
                    .tables
                    .get(&table.to_ascii_lowercase())
                    .map(|t| t.rows.clone())
            })
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows(table).len()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock()
            .map(|state| state.tables.contains_key(&table.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Every statement received, in arrival order, including failed ones
    pub fn statement_log(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.statement_log.clone())
            .unwrap_or_default()
    }

    /// True if any received statement contains `needle`
    pub fn received(&self, needle: &str) -> bool {
        self.statement_log().iter().any(|sql| sql.contains(needle))
    }

    pub fn clear_log(&self) {
        if let Ok(mut state) = self.lock() {
            state.statement_log.clear();
        }
    }

    pub fn connections_opened(&self) -> u64 {
        self.lock().map(|s| s.connections_opened).unwrap_or(0)
    }

    /// Refuses new connections and fails statements on open ones
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut state) = self.lock() {
            state.faults.unreachable = unreachable;
        }
    }

    /// Fails the next `count` statements with a query error
    pub fn fail_next_statements(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.faults.failing_statements = count;
        }
    }

    /// Fails the next `count` commits; the transaction is discarded
    pub fn fail_next_commits(&self, count: usize) {
        if let Ok(mut state) = self.lock() {
            state.faults.failing_commits = count;
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut state) = self.lock() {
            state.faults.latency = latency;
        }
    }

    pub fn set_replication_lag(&self, seconds: f64) {
        if let Ok(mut state) = self.lock() {
            state.replication_lag = seconds;
        }
    }

    fn latency(&self) -> Option<Duration> {
        self.lock().ok().and_then(|s| s.faults.latency)
    }
}

/// Connector resolving `host:port/database` addresses to registered [`MemoryDatabase`]s
#[derive(Default)]
pub struct MemoryConnector {
    databases: RwLock<HashMap<String, MemoryDatabase>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh database reachable at the config's address
    pub fn add_database(&self, config: &ConnectionConfig) -> MemoryDatabase {
        let address = config.address();
        let db = MemoryDatabase::new(address.clone());
        if let Ok(mut databases) = self.databases.write() {
            databases.insert(address, db.clone());
        }
        db
    }

    pub fn database(&self, address: &str) -> Option<MemoryDatabase> {
        self.databases
            .read()
            .ok()
            .and_then(|databases| databases.get(address).cloned())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DbConnection>> {
        let address = config.address();
        let db = self.database(&address).ok_or_else(|| {
            DbError::Connectivity(format!("could not connect to server at {}", address))
        })?;

        let latency = db.latency();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        {
            let mut state = db.lock()?;
            if state.faults.unreachable {
                return Err(DbError::Connectivity(format!(
                    "connection refused by {}",
                    address
                )));
            }
            state.connections_opened += 1;
        }

        Ok(Box::new(MemoryConnection {
            db,
            transaction: None,
            closed: false,
        }))
    }
}

struct PendingTransaction {
    tables: BTreeMap<String, MemoryTable>,
    touched: BTreeSet<String>,
    dropped: BTreeSet<String>,
}

/// Session on a [`MemoryDatabase`]; a transaction works on a private copy of the tables
pub struct MemoryConnection {
    db: MemoryDatabase,
    transaction: Option<PendingTransaction>,
    closed: bool,
}

impl MemoryConnection {
    async fn run(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        if self.closed {
            return Err(DbError::Connectivity("connection is closed".into()));
        }
        if let Some(latency) = self.db.latency() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.db.lock()?;
        state.statement_log.push(sql.to_string());

        if state.faults.unreachable {
            self.closed = true;
            return Err(DbError::Connectivity(format!(
                "server {} closed the connection unexpectedly",
                self.db.name
            )));
        }
        if state.faults.failing_statements > 0 {
            state.faults.failing_statements -= 1;
            return Err(DbError::Query(format!(
                "injected statement failure on {}",
                self.db.name
            )));
        }

        match self.transaction.as_mut() {
            Some(tx) => {
                let outcome = apply(&mut tx.tables, sql, params)?;
                if let Some(table) = outcome.touched {
                    if outcome.dropped {
                        tx.dropped.insert(table.clone());
                    }
                    tx.touched.insert(table);
                }
                Ok(outcome.result)
            }
            None => Ok(apply(&mut state.tables, sql, params)?.result),
        }
    }

    fn log(&self, sql: &str) -> Result<()> {
        let mut state = self.db.lock()?;
        state.statement_log.push(sql.to_string());
        if state.faults.unreachable {
            return Err(DbError::Connectivity(format!(
                "server {} closed the connection unexpectedly",
                self.db.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DbConnection for MemoryConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.run(sql, params).await
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let result = self.run(sql, params).await?;
        if result.columns.is_empty() {
            Ok(result.rows_affected)
        } else {
            Ok(result.row_count() as u64)
        }
    }

    async fn begin(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(DbError::Query("transaction already in progress".into()));
        }
        self.log("BEGIN")?;
        let tables = self.db.lock()?.tables.clone();
        self.transaction = Some(PendingTransaction {
            tables,
            touched: BTreeSet::new(),
            dropped: BTreeSet::new(),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .transaction
            .take()
            .ok_or_else(|| DbError::Query("no transaction in progress".into()))?;
        self.log("COMMIT")?;

        let mut state = self.db.lock()?;
        if state.faults.failing_commits > 0 {
            state.faults.failing_commits -= 1;
            return Err(DbError::Query(format!(
                "injected commit failure on {}",
                self.db.name
            )));
        }
        for table in tx.touched {
            if tx.dropped.contains(&table) && !tx.tables.contains_key(&table) {
                state.tables.remove(&table);
            } else if let Some(data) = tx.tables.get(&table) {
                state.tables.insert(table, data.clone());
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.transaction = None;
        self.log("ROLLBACK")
    }

    async fn replication_lag(&mut self) -> Result<f64> {
        self.run("SELECT 1", &[]).await?;
        Ok(self.db.lock()?.replication_lag)
    }

    fn is_in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

struct Applied {
    result: QueryResult,
    touched: Option<String>,
    dropped: bool,
}

impl Applied {
    fn read(result: QueryResult) -> Self {
        Self {
            result,
            touched: None,
            dropped: false,
        }
    }

    fn write(table: String, rows_affected: u64) -> Self {
        Self {
            result: QueryResult::affected(rows_affected),
            touched: Some(table),
            dropped: false,
        }
    }
}

fn param(params: &[Value], index: &str) -> Result<Value> {
    let position: usize = index
        .parse()
        .map_err(|_| DbError::Query(format!("invalid parameter reference ${}", index)))?;
    params
        .get(position.wrapping_sub(1))
        .cloned()
        .ok_or_else(|| DbError::Query(format!("there is no parameter ${}", position)))
}

fn table<'a>(tables: &'a BTreeMap<String, MemoryTable>, name: &str) -> Result<&'a MemoryTable> {
    tables
        .get(name)
        .ok_or_else(|| DbError::Query(format!("relation \"{}\" does not exist", name)))
}

fn table_mut<'a>(
    tables: &'a mut BTreeMap<String, MemoryTable>,
    name: &str,
) -> Result<&'a mut MemoryTable> {
    tables
        .get_mut(name)
        .ok_or_else(|| DbError::Query(format!("relation \"{}\" does not exist", name)))
}

/// Row predicate for `WHERE column = $n`
fn filter(
    data: &MemoryTable,
    table_name: &str,
    caps: &Captures<'_>,
    column_group: usize,
    params: &[Value],
) -> Result<Option<(usize, Value)>> {
    match (caps.get(column_group), caps.get(column_group + 1)) {
        (Some(column), Some(index)) => {
            let idx = data.column_index(table_name, column.as_str())?;
            Ok(Some((idx, param(params, index.as_str())?)))
        }
        _ => Ok(None),
    }
}

fn row_matches(row: &Row, predicate: &Option<(usize, Value)>) -> bool {
    match predicate {
        Some((idx, expected)) => row.get(*idx).is_some_and(|v| v == expected),
        None => true,
    }
}

fn apply(
    tables: &mut BTreeMap<String, MemoryTable>,
    sql: &str,
    params: &[Value],
) -> Result<Applied> {
    if PROBE.is_match(sql) {
        return Ok(Applied::read(QueryResult::new(
            vec!["?column?".into()],
            vec![vec![Value::Integer(1)]],
        )));
    }

    if let Some(caps) = COUNT.captures(sql) {
        let name = caps[1].to_ascii_lowercase();
        let data = table(tables, &name)?;
        let predicate = filter(data, &name, &caps, 2, params)?;
        let count = data.rows.iter().filter(|row| row_matches(row, &predicate)).count();
        return Ok(Applied::read(QueryResult::new(
            vec!["count".into()],
            vec![vec![Value::Integer(count as i64)]],
        )));
    }

    if let Some(caps) = SELECT.captures(sql) {
        return select(tables, &caps, params).map(Applied::read);
    }

    if let Some(caps) = INSERT.captures(sql) {
        let name = caps[1].to_ascii_lowercase();
        let data = table_mut(tables, &name)?;
        let columns: Vec<&str> = caps[2].split(',').map(str::trim).collect();
        let values = split_top_level(&caps[3]);
        if columns.len() != values.len() {
            return Err(DbError::Query(
                "INSERT has more target columns than expressions".into(),
            ));
        }
        let mut row = vec![Value::Null; data.columns.len()];
        for (column, expr) in columns.iter().zip(values.iter()) {
            let idx = data.column_index(&name, column)?;
            row[idx] = literal(expr, params)?;
        }
        data.rows.push(row);
        return Ok(Applied::write(name, 1));
    }

    if let Some(caps) = DELETE.captures(sql) {
        let name = caps[1].to_ascii_lowercase();
        let data = table_mut(tables, &name)?;
        let predicate = filter(data, &name, &caps, 2, params)?;
        let before = data.rows.len();
        data.rows.retain(|row| !row_matches(row, &predicate));
        let removed = (before - data.rows.len()) as u64;
        return Ok(Applied::write(name, removed));
    }

    if let Some(caps) = UPDATE.captures(sql) {
        let name = caps[1].to_ascii_lowercase();
        let data = table_mut(tables, &name)?;
        let target = data.column_index(&name, &caps[2])?;
        let value = param(params, &caps[3])?;
        let key = data.column_index(&name, &caps[4])?;
        let expected = param(params, &caps[5])?;
        let mut changed = 0u64;
        for row in data.rows.iter_mut() {
            if row.get(key).is_some_and(|v| *v == expected) {
                row[target] = value.clone();
                changed += 1;
            }
        }
        return Ok(Applied::write(name, changed));
    }

    if let Some(caps) = CREATE_TABLE.captures(sql) {
        let name = caps[2].to_ascii_lowercase();
        if tables.contains_key(&name) {
            if caps.get(1).is_some() {
                return Ok(Applied::read(QueryResult::empty()));
            }
            return Err(DbError::Query(format!("relation \"{}\" already exists", name)));
        }
        let columns = split_top_level(&caps[3])
            .into_iter()
            .filter_map(|definition| {
                let first = definition.split_whitespace().next()?.to_string();
                if CONSTRAINT_KEYWORDS.contains(&first.to_ascii_uppercase().as_str()) {
                    None
                } else {
                    Some(first.to_ascii_lowercase())
                }
            })
            .collect();
        tables.insert(
            name.clone(),
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
        return Ok(Applied::write(name, 0));
    }

    if let Some(caps) = DROP_TABLE.captures(sql) {
        let name = caps[2].to_ascii_lowercase();
        if tables.remove(&name).is_none() && caps.get(1).is_none() {
            return Err(DbError::Query(format!("table \"{}\" does not exist", name)));
        }
        return Ok(Applied {
            result: QueryResult::affected(0),
            touched: Some(name),
            dropped: true,
        });
    }

    Ok(Applied::read(QueryResult::empty()))
}

fn select(
    tables: &BTreeMap<String, MemoryTable>,
    caps: &Captures<'_>,
    params: &[Value],
) -> Result<QueryResult> {
    let name = caps[2].to_ascii_lowercase();
    let data = table(tables, &name)?;
    let predicate = filter(data, &name, caps, 3, params)?;

    let mut rows: Vec<Row> = data
        .rows
        .iter()
        .filter(|row| row_matches(row, &predicate))
        .cloned()
        .collect();

    if let Some(order_column) = caps.get(5) {
        let idx = data.column_index(&name, order_column.as_str())?;
        let descending = caps
            .get(6)
            .is_some_and(|dir| dir.as_str().eq_ignore_ascii_case("DESC"));
        rows.sort_by(|a, b| {
            let ordering = a[idx].compare(&b[idx]).unwrap_or(Ordering::Equal);
            if descending { ordering.reverse() } else { ordering }
        });
    }

    let limit = match (caps.get(7), caps.get(8)) {
        (Some(index), _) => param(params, index.as_str())?.as_i64(),
        (None, Some(literal)) => literal.as_str().parse::<i64>().ok(),
        (None, None) => None,
    };
    if let Some(limit) = limit {
        rows.truncate(limit.max(0) as usize);
    }

    let projection = caps[1].trim();
    if projection == "*" {
        return Ok(QueryResult::new(data.columns.clone(), rows));
    }

    let mut columns = Vec::new();
    let mut indexes = Vec::new();
    for column in projection.split(',').map(str::trim) {
        indexes.push(data.column_index(&name, column)?);
        columns.push(column.to_ascii_lowercase());
    }
    let rows = rows
        .into_iter()
        .map(|row| indexes.iter().map(|idx| row[*idx].clone()).collect())
        .collect();
    Ok(QueryResult::new(columns, rows))
}

/// Splits on commas that are not nested inside parentheses or quotes
fn split_top_level(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut quoted = false;
    for ch in input.chars() {
        match ch {
            '\'' => {
                quoted = !quoted;
                current.push(ch);
            }
            '(' if !quoted => {
                depth += 1;
                current.push(ch);
            }
            ')' if !quoted => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if !quoted && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn literal(expr: &str, params: &[Value]) -> Result<Value> {
    let expr = expr.trim();
    if let Some(index) = expr.strip_prefix('$') {
        return param(params, index);
    }
    if expr.eq_ignore_ascii_case("NULL") {
        return Ok(Value::Null);
    }
    if expr.eq_ignore_ascii_case("TRUE") {
        return Ok(Value::Boolean(true));
    }
    if expr.eq_ignore_ascii_case("FALSE") {
        return Ok(Value::Boolean(false));
    }
    if let Some(text) = expr.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Ok(Value::Text(text.replace("''", "'")));
    }
    if let Ok(i) = expr.parse::<i64>() {
        return Ok(Value::Integer(i));
    }
    if let Ok(f) = expr.parse::<f64>() {
        return Ok(Value::Float(f));
    }
    Err(DbError::UnsupportedOperation(format!(
        "unsupported value expression: {}",
        expr
    )))
}
