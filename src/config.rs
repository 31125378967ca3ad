//! Plane configuration loaded from TOML.
//!
//! A file is either one flat document or a set of `[environments.<name>]`
//! tables, one per deployment environment:
//!
//! ```toml
//! [environments.production.primary]
//! host = "db-primary.internal"
//! database = "tenants"
//! username = "plane"
//!
//! [[environments.production.shards]]
//! id = 0
//! host = "shard-0.internal"
//! database = "tenants"
//! username = "plane"
//! region = "eu-west"
//!
//! [environments.production.rebalance]
//! load_threshold = 0.8
//! max_shard_count = 16
//! ```
//!
//! Passwords are best supplied through `SHARDPLANE_PRIMARY_PASSWORD` and
//! `SHARDPLANE_PASSWORD` rather than written into the file.

use crate::connection::config::ConnectionConfig;
use crate::core::{DbError, Result, ShardId, Value};
use crate::registry::{KeyRange, ShardAttributes, ShardDescriptor};
use crate::replica::{HealthThresholds, ReplicaDescriptor, SelectionStrategy};
use crate::sharding::{GeoPoint, KeyComponent, RangeRule, ResolverTable, ShardingStrategy, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

pub const ENV_VAR: &str = "SHARDPLANE_ENV";
pub const PRIMARY_PASSWORD_VAR: &str = "SHARDPLANE_PRIMARY_PASSWORD";
pub const PASSWORD_VAR: &str = "SHARDPLANE_PASSWORD";
pub const DEFAULT_ENVIRONMENT: &str = "development";

fn default_port() -> u16 {
    5432
}

fn default_max_connections() -> usize {
    10
}

fn default_min_connections() -> usize {
    1
}

fn default_weight() -> u32 {
    1
}

/// Connection parameters of one physical instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
}

impl InstanceConfig {
    /// Pool configuration with the plane-wide timeouts applied
    pub fn connection_config(&self, health: &HealthSettings) -> ConnectionConfig {
        ConnectionConfig::new(&self.username, &self.password)
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .connect_timeout(health.connect_timeout())
            .query_timeout(health.query_timeout())
    }

    pub fn address(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: ShardId,
    #[serde(flatten)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub range_start: Option<i64>,
    #[serde(default)]
    pub range_end: Option<i64>,
    #[serde(default)]
    pub time_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub time_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
    /// Preconfigured idle shard, activated only by scale-up
    #[serde(default)]
    pub standby: bool,
}

impl ShardConfig {
    pub fn attributes(&self) -> ShardAttributes {
        ShardAttributes {
            region: self.region.clone(),
            range: match (self.range_start, self.range_end) {
                (Some(start), Some(end)) => Some(KeyRange { start, end }),
                _ => None,
            },
            time_range: match (self.time_start, self.time_end) {
                (Some(start), Some(end)) => Some(TimeRange::new(start, end)),
                _ => None,
            },
            location: match (self.latitude, self.longitude) {
                (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)),
                _ => None,
            },
            tags: self.tags.clone(),
        }
    }

    pub fn descriptor(&self, health: &HealthSettings) -> ShardDescriptor {
        ShardDescriptor::new(self.id, self.instance.connection_config(health))
            .with_attributes(self.attributes())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub id: String,
    #[serde(flatten)]
    pub instance: InstanceConfig,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl ReplicaConfig {
    pub fn descriptor(&self, health: &HealthSettings) -> ReplicaDescriptor {
        ReplicaDescriptor::new(self.id.clone(), self.instance.connection_config(health))
            .with_weight(self.weight)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingSettings {
    pub strategy: ShardingStrategy,
    pub default_shard: ShardId,
    /// Extra range rules, consulted after the per-shard `range_start`/`range_end`
    pub ranges: Vec<RangeRule>,
    pub regions: BTreeMap<String, Vec<ShardId>>,
    pub weighted_key: Vec<KeyComponent>,
}

impl Default for ShardingSettings {
    fn default() -> Self {
        Self {
            strategy: ShardingStrategy::Modulo,
            default_shard: 0,
            ranges: Vec::new(),
            regions: BTreeMap::new(),
            weighted_key: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub check_interval_secs: u64,
    pub response_time_threshold_ms: u64,
    pub error_count_threshold: u64,
    pub lag_threshold_secs: f64,
    pub selection_strategy: SelectionStrategy,
    pub failover_timeout_ms: u64,
    pub query_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            response_time_threshold_ms: 1000,
            error_count_threshold: 5,
            lag_threshold_secs: 30.0,
            selection_strategy: SelectionStrategy::RoundRobin,
            failover_timeout_ms: 5000,
            query_timeout_ms: 30_000,
            connect_timeout_ms: 5000,
        }
    }
}

impl HealthSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            error_count: self.error_count_threshold,
            lag_secs: self.lag_threshold_secs,
            response_time: Duration::from_millis(self.response_time_threshold_ms),
            failover_timeout: Duration::from_millis(self.failover_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceSettings {
    pub check_interval_secs: u64,
    pub metrics_interval_secs: u64,
    pub rebalance_threshold: f64,
    pub load_threshold: f64,
    pub min_shard_count: usize,
    pub max_shard_count: usize,
    pub max_rows: u64,
    pub max_queries: u64,
    pub metrics_retention_secs: u64,
    pub migration_batch_size: usize,
    pub migration_timeout_secs: u64,
    /// Rebalance/scale events kept for admin reads
    pub history_limit: usize,
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            metrics_interval_secs: 60,
            rebalance_threshold: 0.2,
            load_threshold: 0.8,
            min_shard_count: 1,
            max_shard_count: 16,
            max_rows: 1_000_000,
            max_queries: 10_000,
            metrics_retention_secs: 86_400,
            migration_batch_size: 500,
            migration_timeout_secs: 600,
            history_limit: 100,
        }
    }
}

impl RebalanceSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_secs)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_secs(self.migration_timeout_secs)
    }
}

/// Table whose rows reference the primary entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTable {
    pub table: String,
    pub foreign_key: String,
}

/// Tables moved together when entities migrate between shards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSchema {
    pub table: String,
    pub id_column: String,
    pub children: Vec<ChildTable>,
}

impl Default for MigrationSchema {
    fn default() -> Self {
        Self {
            table: "entities".to_string(),
            id_column: "id".to_string(),
            children: Vec::new(),
        }
    }
}

impl MigrationSchema {
    pub fn new(table: impl Into<String>, id_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id_column: id_column.into(),
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        self.children.push(ChildTable {
            table: table.into(),
            foreign_key: foreign_key.into(),
        });
        self
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.table.as_str()).chain(self.children.iter().map(|c| c.table.as_str()))
    }
}

/// Complete configuration of one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaneConfig {
    pub primary: InstanceConfig,
    /// Non-sharded database holding descriptor metadata; the primary when absent
    #[serde(default)]
    pub control: Option<InstanceConfig>,
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,
    #[serde(default)]
    pub sharding: ShardingSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub rebalance: RebalanceSettings,
    #[serde(default)]
    pub migration: MigrationSchema,
}

impl PlaneConfig {
    /// Environment selected by `SHARDPLANE_ENV`, or `development`
    pub fn environment_from_env() -> String {
        std::env::var(ENV_VAR).unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string())
    }

    /// Parses a TOML document.
    ///
    /// When the document has an `environments` table the named environment is
    /// selected (`development` if `environment` is `None`); otherwise the whole
    /// document is the configuration.
    pub fn from_toml_str(content: &str, environment: Option<&str>) -> Result<Self> {
        let document: toml::Table =
            toml::from_str(content).map_err(|e| DbError::ParseError(e.to_string()))?;

        let selected = match document.get("environments") {
            Some(toml::Value::Table(environments)) => {
                let name = environment.unwrap_or(DEFAULT_ENVIRONMENT);
                environments.get(name).cloned().ok_or_else(|| {
                    DbError::Configuration(format!(
                        "environment '{}' not found (available: {})",
                        name,
                        environments.keys().cloned().collect::<Vec<_>>().join(", ")
                    ))
                })?
            }
            Some(_) => {
                return Err(DbError::Configuration(
                    "'environments' must be a table".to_string(),
                ));
            }
            None => toml::Value::Table(document),
        };

        selected
            .try_into::<PlaneConfig>()
            .map_err(|e| DbError::ParseError(e.to_string()))
    }

    /// Reads, parses, applies environment overrides and validates
    pub fn load(path: impl AsRef<Path>, environment: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DbError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;

        let mut config = Self::from_toml_str(&content, environment)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// `SHARDPLANE_PRIMARY_PASSWORD` replaces the primary's password;
    /// `SHARDPLANE_PASSWORD` fills every other instance left without one.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(PRIMARY_PASSWORD_VAR) {
            self.primary.password = password;
        }

        if let Some(password) = lookup(PASSWORD_VAR) {
            let instances = self
                .shards
                .iter_mut()
                .map(|s| &mut s.instance)
                .chain(self.replicas.iter_mut().map(|r| &mut r.instance))
                .chain(self.control.iter_mut())
                .chain(std::iter::once(&mut self.primary));
            for instance in instances {
                if instance.password.is_empty() {
                    instance.password = password.clone();
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards.is_empty() {
            return Err(DbError::Configuration(
                "at least one shard must be configured".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for shard in &self.shards {
            if !ids.insert(shard.id) {
                return Err(DbError::Configuration(format!(
                    "shard id {} appears more than once",
                    shard.id
                )));
            }
            if let (Some(start), Some(end)) = (shard.range_start, shard.range_end) {
                if start >= end {
                    return Err(DbError::Configuration(format!(
                        "shard {} has empty range [{}, {})",
                        shard.id, start, end
                    )));
                }
            }
            if shard.range_start.is_some() != shard.range_end.is_some() {
                return Err(DbError::Configuration(format!(
                    "shard {} must set both range_start and range_end",
                    shard.id
                )));
            }
            if let (Some(start), Some(end)) = (shard.time_start, shard.time_end) {
                if start >= end {
                    return Err(DbError::Configuration(format!(
                        "shard {} has empty time range",
                        shard.id
                    )));
                }
            }
        }

        if !self.shards.iter().any(|s| !s.standby) {
            return Err(DbError::Configuration(
                "at least one shard must not be standby".to_string(),
            ));
        }

        let mut replica_ids = HashSet::new();
        for replica in &self.replicas {
            if !replica_ids.insert(replica.id.as_str()) {
                return Err(DbError::Configuration(format!(
                    "replica id '{}' appears more than once",
                    replica.id
                )));
            }
            if replica.weight == 0 {
                return Err(DbError::Configuration(format!(
                    "replica '{}' weight must be >= 1",
                    replica.id
                )));
            }
        }

        for rule in &self.sharding.ranges {
            if rule.start >= rule.end {
                return Err(DbError::Configuration(format!(
                    "range [{}, {}) for shard {} is empty",
                    rule.start, rule.end, rule.shard_id
                )));
            }
        }

        let rebalance = &self.rebalance;
        if rebalance.min_shard_count > rebalance.max_shard_count {
            return Err(DbError::Configuration(
                "min_shard_count cannot exceed max_shard_count".to_string(),
            ));
        }
        if rebalance.min_shard_count == 0 {
            return Err(DbError::Configuration(
                "min_shard_count must be >= 1".to_string(),
            ));
        }
        let positive = [
            ("rebalance_threshold", rebalance.rebalance_threshold),
            ("load_threshold", rebalance.load_threshold),
            ("lag_threshold_secs", self.health.lag_threshold_secs),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(DbError::Configuration(format!("{} must be > 0", name)));
            }
        }
        let positive_counts = [
            ("max_rows", rebalance.max_rows),
            ("max_queries", rebalance.max_queries),
            ("migration_batch_size", rebalance.migration_batch_size as u64),
            ("error_count_threshold", self.health.error_count_threshold),
            ("check_interval_secs", self.health.check_interval_secs),
            ("rebalance.check_interval_secs", rebalance.check_interval_secs),
            ("metrics_interval_secs", rebalance.metrics_interval_secs),
        ];
        for (name, value) in positive_counts {
            if value == 0 {
                return Err(DbError::Configuration(format!("{} must be > 0", name)));
            }
        }

        for component in &self.sharding.weighted_key {
            if component.field.trim().is_empty() {
                return Err(DbError::Configuration(
                    "weighted key component needs a field name".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Shards registered at startup
    pub fn active_shards(&self) -> impl Iterator<Item = &ShardConfig> {
        self.shards.iter().filter(|s| !s.standby)
    }

    pub fn standby_shards(&self) -> impl Iterator<Item = &ShardConfig> {
        self.shards.iter().filter(|s| s.standby)
    }

    pub fn control_instance(&self) -> &InstanceConfig {
        self.control.as_ref().unwrap_or(&self.primary)
    }

    /// Resolver state implied by the configured shards and sharding settings.
    ///
    /// Per-shard ranges come first, ordered by shard id, followed by the
    /// explicit `sharding.ranges` in file order.
    pub fn resolver_table(&self) -> Result<ResolverTable> {
        let mut table = ResolverTable::new(self.sharding.default_shard);
        table.set_active_shards(self.active_shards().map(|s| s.id));

        let mut shards: Vec<&ShardConfig> = self.active_shards().collect();
        shards.sort_by_key(|s| s.id);

        for shard in &shards {
            let attributes = shard.attributes();
            if let Some(range) = attributes.range {
                table.add_range(range.start, range.end, shard.id)?;
            }
            if let Some(key) = attributes.composite_key() {
                table.register_composite(shard.id, key);
            }
        }
        for rule in &self.sharding.ranges {
            table.add_range(rule.start, rule.end, rule.shard_id)?;
        }

        let mut regions: BTreeMap<String, Vec<ShardId>> = BTreeMap::new();
        for shard in &shards {
            if let Some(region) = &shard.region {
                regions.entry(region.to_ascii_lowercase()).or_default().push(shard.id);
            }
        }
        for (region, ids) in &self.sharding.regions {
            regions.insert(region.to_ascii_lowercase(), ids.clone());
        }
        for (region, ids) in regions {
            table.map_region(region, ids);
        }

        Ok(table)
    }
}
