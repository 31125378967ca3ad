use chrono::{TimeZone, Utc};
use serde_json::json;
use shardplane::sharding::KeyComponent;
use shardplane::{
    CompositeKey, DbError, ResolverTable, ShardKey, ShardResolver, ShardingStrategy, Value,
    WeightedKeyBuilder,
};
use std::collections::BTreeMap;

fn modulo_table(shard_count: u32) -> ResolverTable {
    let mut table = ResolverTable::new(0);
    table.set_active_shards(0..shard_count);
    table
}

#[test]
fn test_modulo_is_stable_and_in_bounds() {
    for shard_count in 1..=7u32 {
        let table = modulo_table(shard_count);
        for user_id in -1_000i64..1_000 {
            let key = ShardKey::Numeric(user_id);
            let first = table.resolve(ShardingStrategy::Modulo, &key).unwrap();
            let second = table.resolve(ShardingStrategy::Modulo, &key).unwrap();
            assert_eq!(first, second);
            assert!(first < shard_count, "{} resolved to {}", user_id, first);
        }
    }
}

#[test]
fn test_modulo_user_ten_of_four_shards() {
    let resolver = ShardResolver::new(ShardingStrategy::Modulo, modulo_table(4));
    assert_eq!(resolver.resolve(&10.into()).unwrap(), 2);
}

#[test]
fn test_modulo_maps_onto_sparse_active_ids() {
    let mut table = ResolverTable::new(0);
    table.set_active_shards([10, 30, 20]);
    assert_eq!(table.resolve(ShardingStrategy::Modulo, &4.into()).unwrap(), 20);
    assert_eq!(table.resolve(ShardingStrategy::Modulo, &(-1).into()).unwrap(), 30);
}

#[test]
fn test_overlapping_ranges_first_inserted_wins() {
    let mut table = ResolverTable::new(9);
    table.add_range(500, 1_500, 2).unwrap();
    table.add_range(0, 1_000, 1).unwrap();
    table.add_range(900, 2_000, 3).unwrap();

    let resolve = |key: i64| table.resolve(ShardingStrategy::Range, &key.into()).unwrap();
    assert_eq!(resolve(100), 1);
    assert_eq!(resolve(700), 2);
    assert_eq!(resolve(950), 2);
    assert_eq!(resolve(1_600), 3);
    // Half-open: the end of the last range is outside it
    assert_eq!(resolve(2_000), 9);
    assert_eq!(resolve(-5), 9);
}

#[test]
fn test_empty_range_rejected() {
    let mut table = ResolverTable::new(0);
    assert!(matches!(
        table.add_range(10, 10, 1),
        Err(DbError::Configuration(_))
    ));
}

#[test]
fn test_geographic_resolution() {
    let mut table = ResolverTable::new(0);
    table.map_region("EU-West", vec![2, 3]);
    table.map_region("us-east", vec![1]);

    let resolve = |region: &str| table.resolve(ShardingStrategy::Geographic, &region.into());
    assert_eq!(resolve("eu-west").unwrap(), 2);
    assert_eq!(resolve("US-EAST").unwrap(), 1);
    assert_eq!(resolve("ap-south").unwrap(), 0);
    assert!(matches!(resolve("  "), Err(DbError::InvalidKey(_))));
}

#[test]
fn test_composite_ignores_missing_discriminants() {
    let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let mar = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

    let mut table = ResolverTable::new(0);
    table.register_composite(
        1,
        CompositeKey::new()
            .with_time_range(jan, feb)
            .with_attribute("tier", "gold"),
    );
    table.register_composite(2, CompositeKey::new().with_location(40.7128, -74.0060));
    table.register_composite(3, CompositeKey::new().with_time_range(feb, mar));

    let resolve = |key: CompositeKey| {
        table.resolve(ShardingStrategy::Composite, &ShardKey::Composite(key))
    };

    // Time range only: shard 1 has no location to compare, tier is absent from the query
    let key = CompositeKey::new().with_time_range(
        Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap(),
    );
    assert_eq!(resolve(key).unwrap(), 1);

    // Attribute mismatch on shard 1; shard 2 has no time range or tier, so it matches
    let key = CompositeKey::new()
        .with_time_range(jan, feb)
        .with_attribute("tier", "silver");
    assert_eq!(resolve(key).unwrap(), 2);

    // Location ~15 km away from shard 2
    let key = CompositeKey::new()
        .with_time_range(feb, mar)
        .with_location(40.73, -73.85);
    assert_eq!(resolve(key).unwrap(), 2);

    // Far away and outside every time range
    let key = CompositeKey::new()
        .with_time_range(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
        )
        .with_location(51.5, -0.12);
    assert!(matches!(resolve(key), Err(DbError::NoShardFound(_))));
}

#[test]
fn test_composite_requires_a_discriminant() {
    let mut table = ResolverTable::new(0);
    table.register_composite(7, CompositeKey::new().with_location(52.5, 13.4));

    let empty = ShardKey::Composite(CompositeKey::new());
    assert!(matches!(
        table.resolve(ShardingStrategy::Composite, &empty),
        Err(DbError::InvalidKey(_))
    ));

    let located = ShardKey::Composite(CompositeKey::new().with_location(52.52, 13.40));
    assert_eq!(
        table.resolve(ShardingStrategy::Composite, &located).unwrap(),
        7
    );
}

#[test]
fn test_dynamic_places_on_least_loaded() {
    let mut table = modulo_table(3);
    // No hints yet: modulo
    assert_eq!(table.resolve(ShardingStrategy::Dynamic, &5.into()).unwrap(), 2);

    table.update_load_hints(BTreeMap::from([(0, 0.7), (1, 0.2), (2, 0.2)]));
    assert_eq!(table.resolve(ShardingStrategy::Dynamic, &5.into()).unwrap(), 1);
    assert_eq!(table.resolve(ShardingStrategy::Dynamic, &"any".into()).unwrap(), 1);
}

#[test]
fn test_strategy_key_mismatch() {
    let table = modulo_table(2);
    assert!(matches!(
        table.resolve(ShardingStrategy::Modulo, &"eu".into()),
        Err(DbError::InvalidKey(_))
    ));
    assert!(matches!(
        table.resolve(ShardingStrategy::Geographic, &1.into()),
        Err(DbError::InvalidKey(_))
    ));
}

#[test]
fn test_strategy_names() {
    assert_eq!("hash".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::Modulo);
    assert_eq!("geo".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::Geographic);
    assert_eq!("Range".parse::<ShardingStrategy>().unwrap(), ShardingStrategy::Range);
    assert!("consistent".parse::<ShardingStrategy>().is_err());
}

#[test]
fn test_weighted_key_assignment() {
    let builder = WeightedKeyBuilder::new(
        vec![
            KeyComponent::new("tenant_id", 1.0),
            KeyComponent::new("priority", 2.0),
        ],
        0,
    )
    .unwrap();
    let active = [0, 1, 2, 3];

    let entity = BTreeMap::from([
        ("tenant_id".to_string(), Value::Integer(7)),
        ("priority".to_string(), Value::Integer(3)),
    ]);
    // 7 + 2 * 3 = 13 -> 13 % 4
    assert_eq!(builder.shard_for(&entity, &active), 1);

    // A negative sum keeps its sign and falls back to the default shard
    let negative = BTreeMap::from([("tenant_id".to_string(), Value::Integer(-9))]);
    assert_eq!(builder.shard_for(&negative, &active), 0);

    // Booleans contribute nothing
    let flagged = json!({ "tenant_id": 6, "priority": true });
    assert_eq!(builder.shard_for_json(&flagged, &active).unwrap(), 2);
    assert!(builder.shard_for_json(&json!([1, 2]), &active).is_err());
}
