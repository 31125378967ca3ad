use super::Value;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Row = Vec<Value>;

/// Identity of a shard. Modulo placement treats the sorted active ids as its ordinal space.
pub type ShardId = u32;

/// Identity of a read replica.
pub type ReplicaId = String;

lazy_static! {
    static ref WRITE_PREFIX: Regex =
        Regex::new(r"(?i)^[\s(]*(INSERT|UPDATE|DELETE|CREATE|DROP|ALTER|TRUNCATE)\b").unwrap();
    static ref CTE_PREFIX: Regex = Regex::new(r"(?i)^[\s(]*WITH\b").unwrap();
    static ref MODIFYING_KEYWORD: Regex =
        Regex::new(r"(?i)\b(INSERT|UPDATE|DELETE|TRUNCATE)\b").unwrap();
}

/// Whether a statement only reads data or may change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementIntent {
    Read,
    Write,
}

impl StatementIntent {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write)
    }
}

impl fmt::Display for StatementIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// SQL text paired with the caller's declared intent.
///
/// Prefer [`Statement::read`] and [`Statement::write`]. [`Statement::classify`]
/// (and the `From<&str>` conversion) infer the intent from the statement's
/// leading keyword, which cannot see writes hidden deeper in the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    intent: StatementIntent,
}

impl Statement {
    pub fn read(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            intent: StatementIntent::Read,
        }
    }

    pub fn write(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            intent: StatementIntent::Write,
        }
    }

    /// Infers intent lexically.
    ///
    /// A statement starting with `INSERT`, `UPDATE`, `DELETE`, `CREATE`, `DROP`,
    /// `ALTER` or `TRUNCATE` (case-insensitive) is a write. A `WITH` statement
    /// carrying a data-modifying keyword anywhere in its body is also a write.
    pub fn classify(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let intent = classify_sql(&sql);
        Self { sql, intent }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn intent(&self) -> StatementIntent {
        self.intent
    }

    pub fn is_write(&self) -> bool {
        self.intent.is_write()
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Self::classify(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Self::classify(sql)
    }
}

pub fn classify_sql(sql: &str) -> StatementIntent {
    if WRITE_PREFIX.is_match(sql) {
        return StatementIntent::Write;
    }
    if CTE_PREFIX.is_match(sql) && MODIFYING_KEYWORD.is_match(sql) {
        return StatementIntent::Write;
    }
    StatementIntent::Read
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_prefixes() {
        for sql in [
            "INSERT INTO t VALUES (1)",
            "update t set a = 1",
            "  Delete from t",
            "CREATE TABLE t (id BIGINT)",
            "drop table t",
            "ALTER TABLE t ADD COLUMN x TEXT",
            "truncate t",
        ] {
            assert_eq!(classify_sql(sql), StatementIntent::Write, "{}", sql);
        }
    }

    #[test]
    fn test_reads() {
        assert_eq!(classify_sql("SELECT * FROM users"), StatementIntent::Read);
        assert_eq!(classify_sql("select 1"), StatementIntent::Read);
        assert_eq!(classify_sql("EXPLAIN SELECT 1"), StatementIntent::Read);
        // Keyword must be a whole word
        assert_eq!(classify_sql("INSERTED_ROWS"), StatementIntent::Read);
    }

    #[test]
    fn test_cte_with_modifying_body_is_write() {
        let sql = "WITH gone AS (DELETE FROM t WHERE id = 1 RETURNING *) SELECT * FROM gone";
        assert_eq!(classify_sql(sql), StatementIntent::Write);

        let plain = "WITH recent AS (SELECT * FROM t) SELECT * FROM recent";
        assert_eq!(classify_sql(plain), StatementIntent::Read);
    }

    #[test]
    fn test_explicit_intent_wins() {
        let stmt = Statement::read("INSERT INTO audit VALUES (1)");
        assert_eq!(stmt.intent(), StatementIntent::Read);

        let stmt = Statement::write("SELECT nextval('seq')");
        assert!(stmt.is_write());
    }
}
