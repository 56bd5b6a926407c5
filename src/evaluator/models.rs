use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

/// Value type of a flag, decided at parse time from the server `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
    Bool,
    String,
    Int,
    Float,
    Json,
    #[serde(other)]
    Unknown,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Bool => "bool",
            FlagType::String => "string",
            FlagType::Int => "int",
            FlagType::Float => "float",
            FlagType::Json => "json",
            FlagType::Unknown => "unknown",
        }
    }
}

/// A flag value with its payload, tagged by [FlagType].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    String(String),
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl FlagValue {
    /// Parses the raw server value according to the declared flag type.
    /// The server sends values as strings; native JSON scalars are accepted
    /// too. Returns None when the payload cannot represent the type.
    pub fn parse(flag_type: FlagType, raw: &serde_json::Value) -> Option<Self> {
        match flag_type {
            FlagType::Bool => match raw {
                serde_json::Value::Bool(b) => Some(FlagValue::Bool(*b)),
                serde_json::Value::String(s) => Some(FlagValue::Bool(matches!(
                    s.to_ascii_lowercase().as_str(),
                    "true" | "1" | "yes" | "on"
                ))),
                _ => None,
            },
            FlagType::String => match raw {
                serde_json::Value::String(s) => Some(FlagValue::String(s.clone())),
                serde_json::Value::Number(n) => Some(FlagValue::String(n.to_string())),
                serde_json::Value::Bool(b) => Some(FlagValue::String(b.to_string())),
                _ => None,
            },
            FlagType::Int => match raw {
                serde_json::Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .map(FlagValue::Int),
                serde_json::Value::String(s) => s
                    .parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
                    .map(FlagValue::Int),
                _ => None,
            },
            FlagType::Float => match raw {
                serde_json::Value::Number(n) => n.as_f64().map(FlagValue::Float),
                serde_json::Value::String(s) => s.parse::<f64>().ok().map(FlagValue::Float),
                _ => None,
            },
            FlagType::Json => match raw {
                serde_json::Value::String(s) => serde_json::from_str(s).ok().map(FlagValue::Json),
                v @ (serde_json::Value::Object(_) | serde_json::Value::Array(_)) => {
                    Some(FlagValue::Json(v.clone()))
                }
                _ => None,
            },
            FlagType::Unknown => None,
        }
    }

    /// The zero value for a flag type, used when the configured payload
    /// cannot be parsed.
    pub fn default_for(flag_type: FlagType) -> Self {
        match flag_type {
            FlagType::Bool => FlagValue::Bool(false),
            FlagType::Int => FlagValue::Int(0),
            FlagType::Float => FlagValue::Float(0.0),
            FlagType::Json => FlagValue::Json(serde_json::json!({})),
            FlagType::String | FlagType::Unknown => FlagValue::String("".to_string()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FlagValue::Bool(b) => Some(*b),
            FlagValue::String(s) => Some(matches!(
                s.to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            )),
            FlagValue::Int(i) => Some(*i != 0),
            FlagValue::Float(f) => Some(*f != 0.0),
            FlagValue::Json(_) => None,
        }
    }

    pub fn as_string(&self) -> Option<String> {
        match self {
            FlagValue::String(s) => Some(s.clone()),
            FlagValue::Bool(b) => Some(b.to_string()),
            FlagValue::Int(i) => Some(i.to_string()),
            FlagValue::Float(f) => Some(f.to_string()),
            FlagValue::Json(v) => Some(v.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FlagValue::Int(i) => Some(*i),
            FlagValue::Float(f) => Some(*f as i64),
            FlagValue::String(s) => s
                .parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64)),
            FlagValue::Bool(b) => Some(*b as i64),
            FlagValue::Json(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FlagValue::Float(f) => Some(*f),
            FlagValue::Int(i) => Some(*i as f64),
            FlagValue::String(s) => s.parse::<f64>().ok(),
            FlagValue::Bool(_) | FlagValue::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> serde_json::Value {
        match self {
            FlagValue::Bool(b) => serde_json::json!(b),
            FlagValue::String(s) => serde_json::json!(s),
            FlagValue::Int(i) => serde_json::json!(i),
            FlagValue::Float(f) => serde_json::json!(f),
            FlagValue::Json(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    StartsWith,
    EndsWith,
    In,
    #[serde(other)]
    Unknown,
}

/// A single attribute-comparator-value predicate.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmentRule {
    pub attribute: String,
    pub comparator: Comparator,
    pub value: serde_json::Value,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Rules within a group are AND-ed; groups on a flag are OR-ed.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SegmentGroup {
    pub rules: Vec<SegmentRule>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rollout {
    pub percentage: u8,
    #[serde(default = "default_true")]
    pub sticky: bool,
}

impl Default for Rollout {
    fn default() -> Self {
        Self {
            percentage: 100,
            sticky: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_version() -> u64 {
    1
}

/// Wire shape of a flag definition. Parsed into [FlagDefinition] so the
/// value payload is typed exactly once, at refresh time.
#[derive(Debug, Clone, Deserialize)]
struct RawFlag {
    key: String,
    r#type: FlagType,
    value: serde_json::Value,
    #[serde(default = "default_true")]
    is_active: bool,
    #[serde(default)]
    segments: Option<Vec<SegmentGroup>>,
    #[serde(default)]
    rollout: Rollout,
    #[serde(default = "default_version")]
    version: u64,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// An immutable flag definition, discarded wholesale when a newer snapshot
/// replaces it.
#[derive(Debug, Clone)]
pub struct FlagDefinition {
    pub key: String,
    pub flag_type: FlagType,
    pub value: FlagValue,
    pub is_active: bool,
    pub segments: Option<Vec<SegmentGroup>>,
    pub rollout: Rollout,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FlagDefinition {
    /// Parses a single server record. Returns None for structurally
    /// malformed records so one bad definition never poisons a refresh.
    pub fn from_record(record: &serde_json::Value) -> Option<Self> {
        let raw: RawFlag = match serde_json::from_value(record.clone()) {
            Ok(raw) => raw,
            Err(e) => {
                event!(Level::ERROR, "invalid flag definition, skipping: {}", e);
                return None;
            }
        };
        let value = FlagValue::parse(raw.r#type, &raw.value).unwrap_or_else(|| {
            event!(
                Level::WARN,
                "flag {} value {} does not parse as {}, using type default",
                raw.key,
                raw.value,
                raw.r#type.as_str()
            );
            FlagValue::default_for(raw.r#type)
        });
        Some(Self {
            key: raw.key,
            flag_type: raw.r#type,
            value,
            is_active: raw.is_active,
            segments: raw.segments,
            rollout: raw.rollout,
            version: raw.version,
            updated_at: raw.updated_at,
        })
    }

    /// Structural comparison used by the change-notification hook. Rollout
    /// internals beyond the percentage are not part of the comparison.
    pub fn differs_from(&self, other: &FlagDefinition) -> bool {
        self.value != other.value
            || self.is_active != other.is_active
            || self.flag_type != other.flag_type
            || self.rollout.percentage != other.rollout.percentage
    }
}

/// An immutable point-in-time view of all cached flag definitions. The
/// evaluator holds exactly one current snapshot and swaps it whole.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub flags: HashMap<String, FlagDefinition>,
    pub fetched_at: DateTime<Utc>,
}

impl CacheSnapshot {
    pub fn empty() -> Self {
        Self {
            flags: HashMap::new(),
            fetched_at: Utc::now(),
        }
    }

    /// Builds a snapshot from raw server records, skipping malformed ones.
    pub fn from_records(records: &[serde_json::Value]) -> Self {
        let flags = records
            .iter()
            .filter_map(FlagDefinition::from_record)
            .map(|f| (f.key.clone(), f))
            .collect();
        Self {
            flags,
            fetched_at: Utc::now(),
        }
    }
}

/// Why an evaluation resolved the way it did. Recorded in access logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalReason {
    FlagNotFound,
    FlagInactive,
    SegmentsNotMatched,
    RolloutNotQualified,
    RolloutQualified,
    FullRollout,
    RateLimited,
    InvalidInput,
}

impl EvalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalReason::FlagNotFound => "flag_not_found",
            EvalReason::FlagInactive => "flag_inactive",
            EvalReason::SegmentsNotMatched => "segments_not_matched",
            EvalReason::RolloutNotQualified => "rollout_not_qualified",
            EvalReason::RolloutQualified => "rollout_qualified",
            EvalReason::FullRollout => "full_rollout",
            EvalReason::RateLimited => "rate_limited",
            EvalReason::InvalidInput => "invalid_input",
        }
    }
}

/// Result of evaluating one flag for one user.
#[derive(Debug, Clone)]
pub struct EvalResult {
    /// The configured flag value when the user matched, None otherwise.
    pub value: Option<FlagValue>,
    pub matched: bool,
    pub reason: EvalReason,
    pub flag_type: FlagType,
    /// Rollout bucket for the user, when a partial rollout was consulted.
    pub bucket: Option<u32>,
    pub segment_matched: bool,
}

impl EvalResult {
    pub fn miss(reason: EvalReason) -> Self {
        Self {
            value: None,
            matched: false,
            reason,
            flag_type: FlagType::Unknown,
            bucket: None,
            segment_matched: false,
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_typed_values() {
        assert_eq!(
            FlagValue::parse(FlagType::Bool, &json!("true")),
            Some(FlagValue::Bool(true))
        );
        assert_eq!(
            FlagValue::parse(FlagType::Bool, &json!("off")),
            Some(FlagValue::Bool(false))
        );
        assert_eq!(
            FlagValue::parse(FlagType::Int, &json!("42")),
            Some(FlagValue::Int(42))
        );
        assert_eq!(
            FlagValue::parse(FlagType::Int, &json!("3.9")),
            Some(FlagValue::Int(3))
        );
        assert_eq!(
            FlagValue::parse(FlagType::Float, &json!("0.5")),
            Some(FlagValue::Float(0.5))
        );
        assert_eq!(
            FlagValue::parse(FlagType::Json, &json!(r#"{"a":1}"#)),
            Some(FlagValue::Json(json!({"a": 1})))
        );
        assert_eq!(FlagValue::parse(FlagType::Int, &json!("nope")), None);
        assert_eq!(FlagValue::parse(FlagType::Json, &json!("not json")), None);
    }

    #[test]
    fn test_from_record_skips_malformed() {
        assert!(FlagDefinition::from_record(&json!({"key": "x"})).is_none());
        assert!(FlagDefinition::from_record(&json!("not an object")).is_none());

        let flag = FlagDefinition::from_record(&json!({
            "key": "beta",
            "type": "bool",
            "value": "true",
            "is_active": true,
            "rollout": {"percentage": 50},
        }))
        .expect("valid record");
        assert_eq!(flag.value, FlagValue::Bool(true));
        assert_eq!(flag.rollout.percentage, 50);
        assert!(flag.rollout.sticky);
        assert_eq!(flag.version, 1);
    }

    #[test]
    fn test_unparseable_value_falls_to_type_default() {
        let flag = FlagDefinition::from_record(&json!({
            "key": "count",
            "type": "int",
            "value": "not-a-number",
        }))
        .expect("structurally valid");
        assert_eq!(flag.value, FlagValue::Int(0));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let records = vec![
            json!({"key": "a", "type": "string", "value": "hello"}),
            json!({"key": "b", "type": "int", "value": 7}),
            json!({"bogus": true}),
        ];
        let snapshot = CacheSnapshot::from_records(&records);
        assert_eq!(snapshot.flags.len(), 2);
        assert_eq!(
            snapshot.flags.get("a").map(|f| f.value.clone()),
            Some(FlagValue::String("hello".to_string()))
        );
        assert_eq!(
            snapshot.flags.get("b").map(|f| f.value.clone()),
            Some(FlagValue::Int(7))
        );
    }

    #[test]
    fn test_differs_from() {
        let base = FlagDefinition::from_record(&json!({
            "key": "a", "type": "bool", "value": "true",
        }))
        .unwrap();
        let mut changed = base.clone();
        assert!(!base.differs_from(&changed));
        changed.value = FlagValue::Bool(false);
        assert!(base.differs_from(&changed));
        let mut inactive = base.clone();
        inactive.is_active = false;
        assert!(base.differs_from(&inactive));
    }
}
