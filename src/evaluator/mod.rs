use std::{collections::HashMap, sync::Arc};

use crossbeam::sync::ShardedLock;

use self::getters::{bucket_for, get_numeric_value, get_string_value};
use self::models::{
    CacheSnapshot, Comparator, EvalReason, EvalResult, FlagDefinition, SegmentGroup, SegmentRule,
};

pub mod getters;
pub mod models;

/// Attribute map supplied by the caller for segment targeting.
pub type SegmentMap = HashMap<String, serde_json::Value>;

fn compare_numbers(v1: &serde_json::Value, v2: &serde_json::Value, f: fn(f64, f64) -> bool) -> bool {
    match (get_numeric_value(v1), get_numeric_value(v2)) {
        (Some(n1), Some(n2)) => f(n1, n2),
        _ => false,
    }
}

/// Type-aware equality: numeric against numeric (with numeric-string
/// coercion), otherwise string against string. None means the operands are
/// not comparable, which both `eq` and `ne` treat as a non-match.
fn values_equal(v1: &serde_json::Value, v2: &serde_json::Value) -> Option<bool> {
    if let (Some(n1), Some(n2)) = (get_numeric_value(v1), get_numeric_value(v2)) {
        return Some(n1 == n2);
    }
    match (get_string_value(v1), get_string_value(v2)) {
        (Some(s1), Some(s2)) => Some(s1 == s2),
        _ => None,
    }
}

fn rule_matches(rule: &SegmentRule, attrs: &SegmentMap) -> bool {
    let actual = match attrs.get(&rule.attribute) {
        Some(v) => v,
        None => return false,
    };
    let target = &rule.value;
    match rule.comparator {
        Comparator::Eq => values_equal(actual, target) == Some(true),
        Comparator::Ne => values_equal(actual, target) == Some(false),
        Comparator::Gt => compare_numbers(actual, target, |n1, n2| n1 > n2),
        Comparator::Ge => compare_numbers(actual, target, |n1, n2| n1 >= n2),
        Comparator::Lt => compare_numbers(actual, target, |n1, n2| n1 < n2),
        Comparator::Le => compare_numbers(actual, target, |n1, n2| n1 <= n2),
        // Substring comparators only apply to string operands.
        Comparator::Contains => match (actual.as_str(), target.as_str()) {
            (Some(a), Some(t)) => a.contains(t),
            _ => false,
        },
        Comparator::StartsWith => match (actual.as_str(), target.as_str()) {
            (Some(a), Some(t)) => a.starts_with(t),
            _ => false,
        },
        Comparator::EndsWith => match (actual.as_str(), target.as_str()) {
            (Some(a), Some(t)) => a.ends_with(t),
            _ => false,
        },
        Comparator::In => match (get_string_value(actual), target.as_str()) {
            (Some(a), Some(t)) => t.split(',').any(|v| v.trim() == a),
            _ => false,
        },
        Comparator::Unknown => false,
    }
}

/// A group matches when every active rule in it matches. A group with no
/// active rules never matches.
fn group_matches(group: &SegmentGroup, attrs: &SegmentMap) -> bool {
    let mut any_active = false;
    for rule in &group.rules {
        if !rule.is_active {
            continue;
        }
        any_active = true;
        if !rule_matches(rule, attrs) {
            return false;
        }
    }
    any_active
}

/// Holds the current [CacheSnapshot] and resolves flags against it. The
/// snapshot slot is the only state shared between the background refresher
/// and foreground readers; it is replaced whole, never mutated in place.
pub struct Evaluator {
    snapshot: ShardedLock<Option<Arc<CacheSnapshot>>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self {
            snapshot: ShardedLock::new(None),
        }
    }

    /// Current snapshot, O(1) and free of I/O. None until the first
    /// successful refresh, in which case every evaluation serves the
    /// caller-supplied default.
    pub fn snapshot(&self) -> Option<Arc<CacheSnapshot>> {
        self.snapshot
            .read()
            .expect("should always be able to acquire read lock")
            .clone()
    }

    /// Atomically installs a new snapshot, returning the one it replaced.
    /// Readers observe either the old or the new snapshot, never a mix.
    pub fn install(&self, snapshot: CacheSnapshot) -> Option<Arc<CacheSnapshot>> {
        let mut slot = self.snapshot.write().expect("should not be poisoned");
        slot.replace(Arc::new(snapshot))
    }

    pub fn flag_count(&self) -> usize {
        self.snapshot().map_or(0, |s| s.flags.len())
    }

    pub fn evaluate(
        &self,
        user_id: &str,
        flag_key: &str,
        segments: Option<&SegmentMap>,
    ) -> EvalResult {
        let snapshot = match self.snapshot() {
            Some(s) => s,
            None => return EvalResult::miss(EvalReason::FlagNotFound),
        };
        match snapshot.flags.get(flag_key) {
            Some(flag) => Self::eval_flag(flag, user_id, segments),
            None => EvalResult::miss(EvalReason::FlagNotFound),
        }
    }

    /// Resolution order: inactive flag, then segment groups (OR of ANDs),
    /// then the sticky rollout bucket, then the configured value. Rollout
    /// applies after the segment gate, so a segment-failing user is out
    /// regardless of bucket.
    pub fn eval_flag(
        flag: &FlagDefinition,
        user_id: &str,
        segments: Option<&SegmentMap>,
    ) -> EvalResult {
        if !flag.is_active {
            return EvalResult {
                flag_type: flag.flag_type,
                ..EvalResult::miss(EvalReason::FlagInactive)
            };
        }

        let mut segment_matched = false;
        if let Some(groups) = flag.segments.as_deref() {
            if !groups.is_empty() {
                segment_matched = match segments {
                    Some(attrs) => groups.iter().any(|g| group_matches(g, attrs)),
                    None => false,
                };
                if !segment_matched {
                    return EvalResult {
                        flag_type: flag.flag_type,
                        ..EvalResult::miss(EvalReason::SegmentsNotMatched)
                    };
                }
            }
        }

        if flag.rollout.percentage < 100 {
            let bucket = bucket_for(&flag.key, user_id, flag.version);
            if bucket >= flag.rollout.percentage as u32 {
                return EvalResult {
                    flag_type: flag.flag_type,
                    bucket: Some(bucket),
                    segment_matched,
                    ..EvalResult::miss(EvalReason::RolloutNotQualified)
                };
            }
            return EvalResult {
                value: Some(flag.value.clone()),
                matched: true,
                reason: EvalReason::RolloutQualified,
                flag_type: flag.flag_type,
                bucket: Some(bucket),
                segment_matched,
            };
        }

        EvalResult {
            value: Some(flag.value.clone()),
            matched: true,
            reason: EvalReason::FullRollout,
            flag_type: flag.flag_type,
            bucket: None,
            segment_matched,
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}
