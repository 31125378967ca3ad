use super::key::{CompositeKey, ShardKey};
use super::strategy::ShardingStrategy;
use crate::core::{DbError, Result, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use tracing::debug;

/// `[start, end)` interval of numeric keys owned by one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeRule {
    pub start: i64,
    pub end: i64,
    pub shard_id: ShardId,
}

impl RangeRule {
    pub fn contains(&self, key: i64) -> bool {
        self.start <= key && key < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeRegistration {
    pub shard_id: ShardId,
    pub key: CompositeKey,
}

/// Shard-table state the resolver reads.
///
/// Resolution is a pure function of this table and the key. Ranges and
/// composite registrations keep insertion order: the first match wins.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolverTable {
    active: Vec<ShardId>,
    ranges: Vec<RangeRule>,
    regions: BTreeMap<String, Vec<ShardId>>,
    composites: Vec<CompositeRegistration>,
    default_shard: ShardId,
    load_hints: BTreeMap<ShardId, f64>,
}

impl ResolverTable {
    pub fn new(default_shard: ShardId) -> Self {
        Self {
            default_shard,
            ..Self::default()
        }
    }

    /// Replaces the active shard set; stored sorted and deduplicated
    pub fn set_active_shards(&mut self, shards: impl IntoIterator<Item = ShardId>) {
        let unique: BTreeSet<ShardId> = shards.into_iter().collect();
        self.active = unique.into_iter().collect();
        self.load_hints.retain(|id, _| self.active.binary_search(id).is_ok());
    }

    pub fn active_shards(&self) -> &[ShardId] {
        &self.active
    }

    pub fn default_shard(&self) -> ShardId {
        self.default_shard
    }

    pub fn set_default_shard(&mut self, shard_id: ShardId) {
        self.default_shard = shard_id;
    }

    /// Appends a range rule. Earlier rules take precedence on overlap.
    pub fn add_range(&mut self, start: i64, end: i64, shard_id: ShardId) -> Result<()> {
        if start >= end {
            return Err(DbError::Configuration(format!(
                "range [{}, {}) for shard {} is empty",
                start, end, shard_id
            )));
        }
        self.ranges.push(RangeRule {
            start,
            end,
            shard_id,
        });
        Ok(())
    }

    pub fn ranges(&self) -> &[RangeRule] {
        &self.ranges
    }

    /// Maps a region to its shards; the first id is the one resolved
    pub fn map_region(&mut self, region: impl Into<String>, shards: Vec<ShardId>) {
        self.regions.insert(region.into().to_ascii_lowercase(), shards);
    }

    pub fn regions(&self) -> &BTreeMap<String, Vec<ShardId>> {
        &self.regions
    }

    pub fn register_composite(&mut self, shard_id: ShardId, key: CompositeKey) {
        self.composites.push(CompositeRegistration { shard_id, key });
    }

    /// Drops every range, region entry and composite registration naming `shard_id`
    pub fn forget_shard(&mut self, shard_id: ShardId) {
        self.ranges.retain(|rule| rule.shard_id != shard_id);
        self.composites.retain(|reg| reg.shard_id != shard_id);
        for shards in self.regions.values_mut() {
            shards.retain(|id| *id != shard_id);
        }
        self.load_hints.remove(&shard_id);
    }

    /// Replaces the per-shard load figures the dynamic strategy places by
    pub fn update_load_hints(&mut self, hints: BTreeMap<ShardId, f64>) {
        self.load_hints = hints;
    }

    pub fn load_hints(&self) -> &BTreeMap<ShardId, f64> {
        &self.load_hints
    }

    pub fn resolve(&self, strategy: ShardingStrategy, key: &ShardKey) -> Result<ShardId> {
        match strategy {
            ShardingStrategy::Modulo => self.resolve_modulo(numeric(strategy, key)?),
            ShardingStrategy::Range => Ok(self.resolve_range(numeric(strategy, key)?)),
            ShardingStrategy::Geographic => match key {
                ShardKey::Region(region) => self.resolve_region(region),
                other => Err(wrong_key(strategy, other)),
            },
            ShardingStrategy::Composite => match key {
                ShardKey::Composite(composite) => self.resolve_composite(composite),
                other => Err(wrong_key(strategy, other)),
            },
            ShardingStrategy::Dynamic => self.resolve_dynamic(key),
        }
    }

    fn resolve_modulo(&self, key: i64) -> Result<ShardId> {
        if self.active.is_empty() {
            return Err(DbError::NoShardFound(format!(
                "{} (no active shards)",
                key
            )));
        }
        let ordinal = key.rem_euclid(self.active.len() as i64) as usize;
        Ok(self.active[ordinal])
    }

    fn resolve_range(&self, key: i64) -> ShardId {
        self.ranges
            .iter()
            .find(|rule| rule.contains(key))
            .map(|rule| rule.shard_id)
            .unwrap_or(self.default_shard)
    }

    fn resolve_region(&self, region: &str) -> Result<ShardId> {
        let region = region.trim();
        if region.is_empty() {
            return Err(DbError::InvalidKey(
                "geographic strategy requires a region".to_string(),
            ));
        }
        Ok(self
            .regions
            .get(&region.to_ascii_lowercase())
            .and_then(|shards| shards.first().copied())
            .unwrap_or(self.default_shard))
    }

    fn resolve_composite(&self, key: &CompositeKey) -> Result<ShardId> {
        if key.is_empty() {
            return Err(DbError::InvalidKey(
                "composite key needs at least one discriminant".to_string(),
            ));
        }
        self.composites
            .iter()
            .find(|reg| key.matches(&reg.key))
            .map(|reg| reg.shard_id)
            .ok_or_else(|| DbError::NoShardFound(ShardKey::Composite(key.clone()).to_string()))
    }

    fn resolve_dynamic(&self, key: &ShardKey) -> Result<ShardId> {
        if self.load_hints.is_empty() {
            return self.resolve_modulo(numeric(ShardingStrategy::Dynamic, key)?);
        }

        let mut best: Option<(ShardId, f64)> = None;
        for id in &self.active {
            // A shard without a published figure has not taken load yet
            let load = self.load_hints.get(id).copied().unwrap_or(0.0);
            if best.is_none_or(|(_, best_load)| load < best_load) {
                best = Some((*id, load));
            }
        }

        best.map(|(id, _)| id)
            .ok_or_else(|| DbError::NoShardFound(format!("{} (no active shards)", key)))
    }
}

fn numeric(strategy: ShardingStrategy, key: &ShardKey) -> Result<i64> {
    key.as_numeric().ok_or_else(|| wrong_key(strategy, key))
}

fn wrong_key(strategy: ShardingStrategy, key: &ShardKey) -> DbError {
    DbError::InvalidKey(format!(
        "{} strategy cannot resolve a {} key",
        strategy,
        key.kind()
    ))
}

/// Thread-safe resolver shared by the routers, the collector and the rebalancer
#[derive(Debug)]
pub struct ShardResolver {
    strategy: RwLock<ShardingStrategy>,
    table: RwLock<ResolverTable>,
}

impl ShardResolver {
    pub fn new(strategy: ShardingStrategy, table: ResolverTable) -> Self {
        Self {
            strategy: RwLock::new(strategy),
            table: RwLock::new(table),
        }
    }

    pub fn strategy(&self) -> Result<ShardingStrategy> {
        Ok(*self.strategy.read()?)
    }

    pub fn set_strategy(&self, strategy: ShardingStrategy) -> Result<()> {
        *self.strategy.write()? = strategy;
        Ok(())
    }

    /// Resolve with the configured strategy
    pub fn resolve(&self, key: &ShardKey) -> Result<ShardId> {
        let strategy = self.strategy()?;
        self.resolve_with(strategy, key)
    }

    pub fn resolve_with(&self, strategy: ShardingStrategy, key: &ShardKey) -> Result<ShardId> {
        let shard_id = self.table.read()?.resolve(strategy, key)?;
        debug!(%strategy, key = %key, shard_id, "resolved shard key");
        Ok(shard_id)
    }

    /// Copy of the current table
    pub fn snapshot(&self) -> Result<ResolverTable> {
        Ok(self.table.read()?.clone())
    }

    /// Applies `mutate` to the table under the write lock
    pub fn update<T>(&self, mutate: impl FnOnce(&mut ResolverTable) -> T) -> Result<T> {
        let mut table = self.table.write()?;
        Ok(mutate(&mut table))
    }

    pub fn set_active_shards(&self, shards: impl IntoIterator<Item = ShardId>) -> Result<()> {
        self.update(|table| table.set_active_shards(shards))
    }

    pub fn update_load_hints(&self, hints: BTreeMap<ShardId, f64>) -> Result<()> {
        self.update(|table| table.update_load_hints(hints))
    }
}
