pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, Result};
pub use types::{ReplicaId, Row, ShardId, Statement, StatementIntent, classify_sql};
pub use value::Value;
