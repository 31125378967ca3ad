pub mod key;
pub mod resolver;
pub mod strategy;
pub mod weighted;

pub use key::{CompositeKey, GEO_MATCH_RADIUS_KM, GeoPoint, ShardKey, TimeRange};
pub use resolver::{CompositeRegistration, RangeRule, ResolverTable, ShardResolver};
pub use strategy::ShardingStrategy;
pub use weighted::{KeyComponent, WeightedKeyBuilder, string_hash};
