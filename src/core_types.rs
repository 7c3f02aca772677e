//! Core types used throughout the system
//!
//! Fundamental type aliases and small value types shared by all modules.
//! They provide semantic meaning and enable future type evolution.

use serde::{Deserialize, Serialize};

/// User ID - globally unique, immutable after assignment.
pub type UserId = u64;

/// Venue ID - globally unique identifier for a venue.
pub type VenueId = u64;

/// Order ID - unique within the system
pub type OrderId = u64;

/// Monetary amount in minor units (e.g. cents).
///
/// All internal arithmetic is on minor units; formatting for display is a
/// client concern and happens outside this crate.
pub type Amount = u64;

/// Millisecond UNIX timestamp.
pub type TimestampMs = i64;

/// Current time in milliseconds since the UNIX epoch.
#[inline]
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

/// A single metadata value.
///
/// Deliberately a closed scalar set so serialization and equality stay
/// well-defined. Anything richer belongs in a typed field, not metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

impl From<bool> for MetaValue {
    fn from(v: bool) -> Self {
        MetaValue::Bool(v)
    }
}

/// Ordered string-to-scalar mapping attached to intents and order history.
///
/// Insertion order is preserved; duplicate keys are not deduplicated, the
/// first entry wins on lookup.
pub type Metadata = Vec<(String, MetaValue)>;

/// Look up the first value for `key` in a metadata list.
pub fn meta_get<'a>(meta: &'a Metadata, key: &str) -> Option<&'a MetaValue> {
    meta.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_get_first_wins() {
        let meta: Metadata = vec![
            ("venue".to_string(), MetaValue::Int(7)),
            ("venue".to_string(), MetaValue::Int(8)),
        ];
        assert_eq!(meta_get(&meta, "venue"), Some(&MetaValue::Int(7)));
        assert_eq!(meta_get(&meta, "missing"), None);
    }

    #[test]
    fn test_meta_value_from() {
        assert_eq!(MetaValue::from("abc"), MetaValue::Str("abc".to_string()));
        assert_eq!(MetaValue::from(42i64), MetaValue::Int(42));
        assert_eq!(MetaValue::from(true), MetaValue::Bool(true));
    }
}
