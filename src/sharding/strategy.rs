use crate::core::DbError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a [`ShardKey`](super::ShardKey) is mapped onto a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardingStrategy {
    /// Numeric key modulo the number of active shards
    #[default]
    Modulo,
    /// First configured `[start, end)` interval containing the key
    Range,
    /// Region name looked up in the region map
    Geographic,
    /// First registered composite key compatible with the query
    Composite,
    /// Least-loaded active shard; placement for new data only
    Dynamic,
}

impl ShardingStrategy {
    pub const ALL: [ShardingStrategy; 5] = [
        Self::Modulo,
        Self::Range,
        Self::Geographic,
        Self::Composite,
        Self::Dynamic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modulo => "modulo",
            Self::Range => "range",
            Self::Geographic => "geographic",
            Self::Composite => "composite",
            Self::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for ShardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShardingStrategy {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modulo" | "hash" => Ok(Self::Modulo),
            "range" => Ok(Self::Range),
            "geographic" | "geo" => Ok(Self::Geographic),
            "composite" => Ok(Self::Composite),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(DbError::Configuration(format!(
                "unknown sharding strategy '{}'",
                other
            ))),
        }
    }
}
