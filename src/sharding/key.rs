use crate::core::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Two points closer than this are considered the same location.
pub const GEO_MATCH_RADIUS_KM: f64 = 100.0;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Half-open time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres (haversine)
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.latitude.to_radians().cos()
                * other.latitude.to_radians().cos()
                * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_KM * c
    }

    pub fn is_near(&self, other: &GeoPoint) -> bool {
        self.distance_km(other) <= GEO_MATCH_RADIUS_KM
    }
}

/// Multi-dimensional key for the composite strategy.
///
/// Every part is optional. Two keys match when each part present on *both*
/// sides is compatible; a part missing on either side is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some(TimeRange::new(start, end));
        self
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.location = Some(GeoPoint::new(latitude, longitude));
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.time_range.is_none() && self.location.is_none() && self.attributes.is_empty()
    }

    /// Conjunction over the discriminants both keys carry.
    pub fn matches(&self, stored: &CompositeKey) -> bool {
        if let (Some(query), Some(shard)) = (&self.time_range, &stored.time_range) {
            if !query.overlaps(shard) {
                return false;
            }
        }

        if let (Some(query), Some(shard)) = (&self.location, &stored.location) {
            if !query.is_near(shard) {
                return false;
            }
        }

        self.attributes.iter().all(|(name, value)| {
            stored
                .attributes
                .get(name)
                .is_none_or(|stored_value| stored_value == value)
        })
    }
}

/// Logical key handed to the resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardKey {
    Numeric(i64),
    Region(String),
    Composite(CompositeKey),
}

impl ShardKey {
    pub fn as_numeric(&self) -> Option<i64> {
        match self {
            Self::Numeric(n) => Some(*n),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Numeric(_) => "numeric",
            Self::Region(_) => "region",
            Self::Composite(_) => "composite",
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(n) => write!(f, "{}", n),
            Self::Region(region) => write!(f, "region '{}'", region),
            Self::Composite(key) => {
                let mut parts = Vec::new();
                if let Some(range) = &key.time_range {
                    parts.push(format!(
                        "time [{}, {})",
                        range.start.to_rfc3339(),
                        range.end.to_rfc3339()
                    ));
                }
                if let Some(point) = &key.location {
                    parts.push(format!("geo ({}, {})", point.latitude, point.longitude));
                }
                for (name, value) in &key.attributes {
                    parts.push(format!("{}={}", name, value));
                }
                write!(f, "composite {{{}}}", parts.join(", "))
            }
        }
    }
}

impl From<i64> for ShardKey {
    fn from(n: i64) -> Self {
        Self::Numeric(n)
    }
}

impl From<i32> for ShardKey {
    fn from(n: i32) -> Self {
        Self::Numeric(n as i64)
    }
}

impl From<u32> for ShardKey {
    fn from(n: u32) -> Self {
        Self::Numeric(n as i64)
    }
}

impl From<&str> for ShardKey {
    fn from(region: &str) -> Self {
        Self::Region(region.to_string())
    }
}

impl From<String> for ShardKey {
    fn from(region: String) -> Self {
        Self::Region(region)
    }
}

impl From<CompositeKey> for ShardKey {
    fn from(key: CompositeKey) -> Self {
        Self::Composite(key)
    }
}
