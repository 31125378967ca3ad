use crate::core::{DbError, Result, ShardId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// One field contributing to an entity's weighted shard key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyComponent {
    pub field: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl KeyComponent {
    pub fn new(field: impl Into<String>, weight: f64) -> Self {
        Self {
            field: field.into(),
            weight,
        }
    }
}

/// 32-bit polynomial rolling hash over UTF-16 code units (`h = h * 31 + unit`)
pub fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Assigns arbitrary application entities to shards from a weighted sum of their fields.
///
/// Numbers contribute their value, strings their [`string_hash`], timestamps
/// their epoch milliseconds. Other types are skipped. The sum is truncated and
/// reduced with a sign-preserving remainder by the number of active shards;
/// the result indexes the sorted active ids. A negative or non-finite result,
/// or an empty active set, falls back to the default shard.
#[derive(Debug, Clone)]
pub struct WeightedKeyBuilder {
    components: Vec<KeyComponent>,
    default_shard: ShardId,
}

impl WeightedKeyBuilder {
    pub fn new(components: Vec<KeyComponent>, default_shard: ShardId) -> Result<Self> {
        if components.is_empty() {
            return Err(DbError::Configuration(
                "weighted key needs at least one component".to_string(),
            ));
        }
        Ok(Self {
            components,
            default_shard,
        })
    }

    pub fn components(&self) -> &[KeyComponent] {
        &self.components
    }

    fn contribution(field: &str, value: &Value) -> Option<f64> {
        match value {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => Some(string_hash(s) as f64),
            Value::Timestamp(ts) => Some(ts.timestamp_millis() as f64),
            Value::Boolean(_) | Value::Null => {
                warn!(field, kind = value.type_name(), "skipping unsupported key component");
                None
            }
        }
    }

    /// Weighted sum over the configured components present on the entity
    pub fn weighted_sum(&self, entity: &BTreeMap<String, Value>) -> f64 {
        self.components
            .iter()
            .filter_map(|component| {
                let value = entity.get(&component.field)?;
                Self::contribution(&component.field, value).map(|c| c * component.weight)
            })
            .sum()
    }

    /// Shard for `entity` among `active`, which must be sorted by id
    pub fn shard_for(&self, entity: &BTreeMap<String, Value>, active: &[ShardId]) -> ShardId {
        let sum = self.weighted_sum(entity);
        if !sum.is_finite() || active.is_empty() {
            return self.default_shard;
        }

        let reduced = (sum.trunc() as i64) % active.len() as i64;
        usize::try_from(reduced)
            .ok()
            .and_then(|ordinal| active.get(ordinal).copied())
            .unwrap_or(self.default_shard)
    }

    /// Same as [`shard_for`](Self::shard_for) for a JSON object
    pub fn shard_for_json(&self, entity: &serde_json::Value, active: &[ShardId]) -> Result<ShardId> {
        let object = entity.as_object().ok_or_else(|| {
            DbError::InvalidKey("weighted key expects a JSON object".to_string())
        })?;

        let fields = object
            .iter()
            .map(|(name, value)| (name.clone(), json_to_value(value)))
            .collect();
        Ok(self.shard_for(&fields, active))
    }
}

fn json_to_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(Value::Integer)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|ts| Value::Timestamp(ts.with_timezone(&chrono::Utc)))
            .unwrap_or_else(|_| Value::Text(s.clone())),
        // Nested values have no numeric contribution
        other => Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entity(fields: &[(&str, Value)]) -> BTreeMap<String, Value> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_string_hash() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("a"), 97);
        assert_eq!(string_hash("ab"), 97 * 31 + 98);
        // Wraps instead of overflowing
        assert_eq!(string_hash("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn test_weighted_sum_and_reduction() {
        let builder = WeightedKeyBuilder::new(
            vec![KeyComponent::new("tenant", 2.0), KeyComponent::new("bucket", 1.0)],
            0,
        )
        .unwrap();

        let fields = entity(&[("tenant", Value::Integer(5)), ("bucket", Value::Integer(1))]);
        assert_eq!(builder.weighted_sum(&fields), 11.0);
        assert_eq!(builder.shard_for(&fields, &[0, 1, 2, 3]), 3);
    }

    #[test]
    fn test_ordinal_maps_onto_sparse_ids() {
        let builder = WeightedKeyBuilder::new(vec![KeyComponent::new("tenant_id", 1.0)], 10).unwrap();
        let fields = entity(&[("tenant_id", Value::Integer(3))]);

        assert_eq!(builder.shard_for(&fields, &[10, 20]), 20);
        // The active set is read per call, so a new shard is reachable at once
        assert_eq!(builder.shard_for(&fields, &[10, 20, 30]), 10);
        assert_eq!(builder.shard_for(&fields, &[]), 10);
    }

    #[test]
    fn test_dates_and_skipped_types() {
        let ts = Utc.timestamp_millis_opt(1_000_003).unwrap();
        let builder = WeightedKeyBuilder::new(
            vec![KeyComponent::new("created", 1.0), KeyComponent::new("flag", 10.0)],
            0,
        )
        .unwrap();

        let fields = entity(&[("created", Value::Timestamp(ts)), ("flag", Value::Boolean(true))]);
        assert_eq!(builder.shard_for(&fields, &[0, 1, 2, 3, 4]), 3);
    }

    #[test]
    fn test_negative_sum_falls_back_to_default() {
        let builder =
            WeightedKeyBuilder::new(vec![KeyComponent::new("delta", 1.0)], 2).unwrap();
        let fields = entity(&[("delta", Value::Integer(-5))]);
        assert_eq!(builder.shard_for(&fields, &[0, 1, 2, 3]), 2);
    }

    #[test]
    fn test_json_entity() {
        let builder =
            WeightedKeyBuilder::new(vec![KeyComponent::new("region", 1.0)], 0).unwrap();
        let expected = (string_hash("eu") as i64 % 3) as ShardId;
        let shard = builder
            .shard_for_json(&serde_json::json!({ "region": "eu", "extra": [1, 2] }), &[0, 1, 2])
            .unwrap();
        assert_eq!(shard, expected);
        assert!(builder.shard_for_json(&serde_json::json!([1]), &[0, 1, 2]).is_err());
    }

    #[test]
    fn test_rejects_empty_configuration() {
        assert!(WeightedKeyBuilder::new(vec![], 0).is_err());
    }
}
